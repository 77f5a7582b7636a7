use std::net::SocketAddr;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

use crate::DnsState;
use crate::logging::{QueryEvent, QueryTag};
use crate::packet::{DnsMessage, DnsQuestion};
use crate::policy::{self, Outcome};
use crate::records::DnsRecord;
use crate::rewrite;
use crate::upstream::UpstreamError;

/// What the listener should do with a resolved query.
#[derive(Debug)]
pub enum Resolution {
    Reply(DnsMessage),
    /// Upstream timed out: send nothing and let the client retry
    Suppressed,
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("expected exactly one question, got {0}")]
    QuestionCount(usize),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// Resolve one client request through the policy chain:
/// 1. Unsupported types → empty reply
/// 2. Blocklist → empty reply
/// 3. Redirect → rename, answer as the destination, restore the client's name
/// 4. Const / echo → authoritative local answer
/// 5. Upstream forward
pub async fn resolve(
    request: &DnsMessage,
    state: &DnsState,
    client: SocketAddr,
) -> Result<Resolution, ResolveError> {
    if request.questions.len() != 1 {
        return Err(ResolveError::QuestionCount(request.questions.len()));
    }

    let start = Instant::now();
    let question = &request.questions[0];

    match policy::classify(question, &state.policy, client.ip()) {
        Outcome::Unsupported => {
            debug!("Answering unsupported type {} for {} with an empty reply", question.qtype, question.name);
            Ok(Resolution::Reply(DnsMessage::reply_to(request)))
        }
        Outcome::Blocked => {
            log_query(state, QueryTag::Blocked, client, question, None, start);
            Ok(Resolution::Reply(DnsMessage::reply_to(request)))
        }
        Outcome::Redirected { destination } => {
            let mut forwarded = request.clone();
            let original = rewrite::rewrite_forward(&mut forwarded.questions[0], &destination);

            let const_answers = match policy::classify_target(&forwarded.questions[0], &state.policy, client.ip()) {
                Outcome::Const { answers } => Some(answers),
                _ => None,
            };

            let Some((mut reply, _)) = answer(&forwarded, const_answers, state).await? else {
                return Ok(Resolution::Suppressed);
            };
            rewrite::rewrite_backward(&mut reply, &original, &destination);

            // The const/passthrough branch does not log a second event
            log_query(state, QueryTag::Redirect, client, question, Some(&destination), start);
            Ok(Resolution::Reply(reply))
        }
        Outcome::Const { answers } => finish(request, Some(answers), state, client, start).await,
        Outcome::Passthrough => finish(request, None, state, client, start).await,
    }
}

async fn finish(
    request: &DnsMessage,
    const_answers: Option<Vec<DnsRecord>>,
    state: &DnsState,
    client: SocketAddr,
    start: Instant,
) -> Result<Resolution, ResolveError> {
    match answer(request, const_answers, state).await? {
        Some((reply, tag)) => {
            log_query(state, tag, client, &request.questions[0], None, start);
            Ok(Resolution::Reply(reply))
        }
        None => Ok(Resolution::Suppressed),
    }
}

/// Local answer when `const_answers` is set, otherwise the upstream reply.
/// `None` when the upstream exchange timed out.
async fn answer(
    request: &DnsMessage,
    const_answers: Option<Vec<DnsRecord>>,
    state: &DnsState,
) -> Result<Option<(DnsMessage, QueryTag)>, ResolveError> {
    if let Some(answers) = const_answers {
        let mut reply = DnsMessage::reply_to(request);
        reply.set_authoritative(true);
        reply.answers = answers;
        return Ok(Some((reply, QueryTag::Const)));
    }

    match state.upstream.forward(request).await {
        Ok(reply) => Ok(Some((reply, QueryTag::Passthrough))),
        Err(e) if e.is_timeout() => {
            warn!("Not critical: {} ({})", e, request.questions[0]);
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn log_query(
    state: &DnsState,
    tag: QueryTag,
    client: SocketAddr,
    question: &DnsQuestion,
    destination: Option<&str>,
    start: Instant,
) {
    state.query_logger.log(&QueryEvent {
        tag,
        client,
        question,
        destination,
        elapsed_ms: start.elapsed().as_millis() as u64,
    });
}
