use std::path::{Path, PathBuf};
use tracing::debug;

/// Process-level settings read from the environment before the runtime starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    /// Path of the YAML policy file
    pub config_path: PathBuf,
    /// Overrides the listener port from the policy file
    pub port_override: Option<u16>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config.yml"),
            port_override: None,
        }
    }
}

impl EnvConfig {
    /// Build the config from `DNSGATE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("DNSGATE_CONFIG") {
            config.config_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DNSGATE_PORT") {
            if let Ok(port) = v.parse() {
                config.port_override = Some(port);
            }
        }

        config
    }

    /// Load a `.env` file (explicit path, or `./.env` if present), then read the environment.
    pub fn load(env_file: Option<&Path>) -> Self {
        match env_file {
            Some(path) => load_dotenv(path),
            None => {
                let candidate = PathBuf::from(".env");
                if candidate.exists() {
                    load_dotenv(&candidate);
                }
            }
        }

        Self::from_env()
    }
}

/// Basic `.env` loader (KEY=VALUE per line). Existing variables win.
fn load_dotenv(path: &Path) {
    let Ok(content) = std::fs::read_to_string(path) else {
        return;
    };
    debug!("Loading environment from {}", path.display());

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"').trim_matches('\'');
            if std::env::var(key).is_err() {
                // SAFETY: called before the tokio runtime spawns any worker threads
                unsafe { std::env::set_var(key, value) };
            }
        }
    }
}
