//! Question renaming for redirects, and restoring the client's name in the reply.

use crate::packet::{DnsMessage, DnsQuestion};

/// Point the question at `destination` (an FQDN). Returns the name the client asked for.
pub fn rewrite_forward(question: &mut DnsQuestion, destination: &str) -> String {
    std::mem::replace(&mut question.name, destination.to_string())
}

/// Put `original` back wherever the reply carries `rewritten`: the question section
/// and the owner of answer records. Other records (CNAME targets etc.) stay as sent.
pub fn rewrite_backward(reply: &mut DnsMessage, original: &str, rewritten: &str) {
    for question in &mut reply.questions {
        if question.name.eq_ignore_ascii_case(rewritten) {
            question.name = original.to_string();
        }
    }
    for record in &mut reply.answers {
        if record.name.eq_ignore_ascii_case(rewritten) {
            record.name = original.to_string();
        }
    }
}
