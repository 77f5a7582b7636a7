//! Query classification: which policy a question falls under.
//!
//! Order of checks:
//! 1. Unsupported query types (answered empty)
//! 2. Blocklist
//! 3. Redirect rules
//! 4. Constant / client-echo answers (A and AAAA only), on the current name
//! 5. Passthrough to upstream

use std::net::IpAddr;

use crate::answers;
use crate::config::PolicyConfig;
use crate::packet::DnsQuestion;
use crate::records::DnsRecord;

/// Result of classifying one question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Unsupported type: empty reply, nothing forwarded
    Unsupported,
    Blocked,
    /// Resolve as `destination` (FQDN), then restore the client's name
    Redirected { destination: String },
    /// Answer locally; may be empty when no address matches the family
    Const { answers: Vec<DnsRecord> },
    Passthrough,
}

pub fn classify(question: &DnsQuestion, policy: &PolicyConfig, client: IpAddr) -> Outcome {
    if policy.is_unsupported_type(question.qtype.to_u16()) {
        return Outcome::Unsupported;
    }

    if policy.is_blocked(&question.name) {
        return Outcome::Blocked;
    }

    if let Some(destination) = policy.redirect_for(&question.name) {
        return Outcome::Redirected {
            destination: destination.to_string(),
        };
    }

    classify_target(question, policy, client)
}

/// Const-or-passthrough decision. Called again after a redirect rewrote the name,
/// so a redirect destination may carry constant answers of its own.
pub fn classify_target(question: &DnsQuestion, policy: &PolicyConfig, client: IpAddr) -> Outcome {
    if question.qtype.is_address() {
        if let Some(source) = policy.const_for(&question.name) {
            return Outcome::Const {
                answers: answers::build_from_source(&question.name, question.qtype, source, client),
            };
        }
    }

    Outcome::Passthrough
}
