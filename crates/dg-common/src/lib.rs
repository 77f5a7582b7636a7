pub mod env;
pub mod error;

pub use env::EnvConfig;
pub use error::AppError;
