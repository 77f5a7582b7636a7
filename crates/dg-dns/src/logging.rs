use chrono::Utc;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::packet::DnsQuestion;

/// Terminal classification of a query, one log event each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryTag {
    Blocked,
    Redirect,
    Const,
    Passthrough,
}

impl QueryTag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blocked => "BLOCKED",
            Self::Redirect => "REDIR",
            Self::Const => "CONST",
            Self::Passthrough => "PASS",
        }
    }
}

/// What the query log records about one answered query.
pub struct QueryEvent<'a> {
    pub tag: QueryTag,
    pub client: SocketAddr,
    /// The question as the client asked it
    pub question: &'a DnsQuestion,
    /// Redirect destination, for `Redirect` events
    pub destination: Option<&'a str>,
    pub elapsed_ms: u64,
}

#[derive(Serialize)]
struct QueryLogEntry<'a> {
    ts: String,
    tag: &'static str,
    from: String,
    domain: &'a str,
    #[serde(rename = "type")]
    query_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    destination: Option<&'a str>,
    ms: u64,
}

/// Query event sink: a structured tracing event per query, plus an optional
/// JSON-lines file written by a background task.
pub struct QueryLogger {
    sender: Option<mpsc::UnboundedSender<String>>,
}

impl QueryLogger {
    /// Tracing output only.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Also append JSON lines to `path`, written by a background task.
    pub fn new(path: &str) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<String>();
        let path = PathBuf::from(path);

        tokio::spawn(async move {
            if let Err(e) = write_query_log(&path, receiver).await {
                error!("Query log {} stopped: {}", path.display(), e);
            }
        });

        Self { sender: Some(sender) }
    }

    #[cfg(test)]
    pub(crate) fn with_sender(sender: mpsc::UnboundedSender<String>) -> Self {
        Self { sender: Some(sender) }
    }

    pub fn log(&self, event: &QueryEvent<'_>) {
        match event.destination {
            Some(destination) => info!(
                tag = event.tag.as_str(),
                client = %event.client,
                question = %event.question,
                destination,
                ms = event.elapsed_ms,
                "query"
            ),
            None => info!(
                tag = event.tag.as_str(),
                client = %event.client,
                question = %event.question,
                ms = event.elapsed_ms,
                "query"
            ),
        }

        let Some(sender) = &self.sender else {
            return;
        };

        let entry = QueryLogEntry {
            ts: Utc::now().to_rfc3339(),
            tag: event.tag.as_str(),
            from: event.client.ip().to_string(),
            domain: &event.question.name,
            query_type: event.question.qtype.to_string(),
            destination: event.destination,
            ms: event.elapsed_ms,
        };

        match serde_json::to_string(&entry) {
            Ok(json) => {
                let line = format!("{}\n", json);
                if sender.send(line).is_err() {
                    debug!("Query log channel closed");
                }
            }
            Err(e) => {
                debug!("Failed to serialize query log entry: {}", e);
            }
        }
    }
}

/// Drain `lines` into `path` until every sender is gone.
async fn write_query_log(path: &Path, mut lines: mpsc::UnboundedReceiver<String>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;

    while let Some(line) = lines.recv().await {
        file.write_all(line.as_bytes()).await?;
    }
    Ok(())
}
