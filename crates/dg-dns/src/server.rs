use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::SharedDnsState;
use crate::packet::{self, DnsMessage, RCODE_FORMERR};
use crate::resolver::{self, Resolution, ResolveError};

/// How long a TCP client may stay silent between queries.
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport a query arrived on; decides how the reply is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    Udp,
    Tcp,
}

/// UDP socket and TCP listener for one listen address.
pub struct Listeners {
    pub udp: Arc<UdpSocket>,
    pub tcp: Arc<TcpListener>,
}

/// Bind UDP and TCP on `addr`. Failing here is a startup error, not something to retry.
pub async fn bind(addr: SocketAddr) -> Result<Listeners> {
    let udp = UdpSocket::bind(addr)
        .await
        .with_context(|| format!("failed to bind DNS UDP socket on {}", addr))?;
    let tcp = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind DNS TCP listener on {}", addr))?;
    info!("DNS server listening on {} (UDP+TCP)", addr);

    Ok(Listeners {
        udp: Arc::new(udp),
        tcp: Arc::new(tcp),
    })
}

/// Serve queries on a bound UDP socket.
pub async fn serve_udp(socket: Arc<UdpSocket>, state: SharedDnsState) -> Result<()> {
    let mut buf = [0u8; 4096];

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!("UDP recv error: {}", e);
                continue;
            }
        };

        let packet = buf[..len].to_vec();
        let socket = socket.clone();
        let state = state.clone();

        tokio::spawn(async move {
            let Some(response) = handle_dns_query(&packet, &state, src, Protocol::Udp).await else {
                return;
            };
            if let Err(e) = socket.send_to(&response, src).await {
                debug!("Failed to send UDP response to {}: {}", src, e);
            }
        });
    }
}

/// Accept connections on a bound TCP listener.
pub async fn serve_tcp(listener: Arc<TcpListener>, state: SharedDnsState) -> Result<()> {
    loop {
        let (stream, src) = match listener.accept().await {
            Ok(r) => r,
            Err(e) => {
                warn!("TCP accept error: {}", e);
                continue;
            }
        };

        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_tcp_connection(stream, src, &state, TCP_IDLE_TIMEOUT).await {
                debug!("TCP connection error from {}: {}", src, e);
            }
        });
    }
}

/// Answer length-prefixed queries until the client closes the connection
/// or stays idle for `idle_timeout`.
async fn handle_tcp_connection(
    mut stream: TcpStream,
    src: SocketAddr,
    state: &SharedDnsState,
    idle_timeout: Duration,
) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        match tokio::time::timeout(idle_timeout, stream.read_exact(&mut len_buf)).await {
            Err(_) => {
                debug!("Closing idle TCP connection from {}", src);
                return Ok(());
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Err(e)) => return Err(e.into()),
        }
        let msg_len = u16::from_be_bytes(len_buf) as usize;

        let mut query_buf = vec![0u8; msg_len];
        stream.read_exact(&mut query_buf).await?;

        let Some(response) = handle_dns_query(&query_buf, state, src, Protocol::Tcp).await else {
            continue;
        };

        let mut framed = Vec::with_capacity(response.len() + 2);
        framed.extend_from_slice(&(response.len() as u16).to_be_bytes());
        framed.extend_from_slice(&response);
        stream.write_all(&framed).await?;
    }
}

/// Wire bytes to send back, or `None` when the query gets no reply at all.
async fn handle_dns_query(
    query_bytes: &[u8],
    state: &SharedDnsState,
    src: SocketAddr,
    protocol: Protocol,
) -> Option<Vec<u8>> {
    let query = match DnsMessage::parse(query_bytes) {
        Ok(q) => q,
        Err(e) => {
            debug!("Failed to parse DNS query from {}: {}", src, e);
            return packet::format_error_response(query_bytes);
        }
    };

    if query.is_response() {
        debug!("Ignoring response packet from {}", src);
        return None;
    }

    let reply = match resolver::resolve(&query, state, src).await {
        Ok(Resolution::Reply(reply)) => reply,
        Ok(Resolution::Suppressed) => return None,
        Err(ResolveError::QuestionCount(count)) => {
            debug!("Rejecting query from {} with {} questions", src, count);
            let mut reply = DnsMessage::reply_to(&query);
            reply.set_rcode(RCODE_FORMERR);
            reply
        }
        Err(e) => {
            error!("Dropping query from {}: {}", src, e);
            return None;
        }
    };

    Some(match protocol {
        Protocol::Udp => reply.to_udp_bytes(query.udp_payload_limit()),
        Protocol::Tcp => reply.to_bytes(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DnsState;
    use crate::config::{DnsConfig, PolicyConfig};
    use crate::logging::QueryLogger;
    use crate::packet::DnsQuestion;
    use crate::records::{DnsRecord, RecordType};
    use crate::test_support::{answer_with, spawn_raw_udp_upstream, spawn_udp_upstream, unparsable_reply};

    async fn state_with_upstream<F>(handler: F) -> SharedDnsState
    where
        F: Fn(&DnsMessage) -> Option<DnsMessage> + Send + 'static,
    {
        let (addr, _) = spawn_udp_upstream(handler).await;
        state_at(addr)
    }

    fn state_at(addr: SocketAddr) -> SharedDnsState {
        let yaml = format!("upstream: [\"{addr}\"]\nupstream_timeout_ms: 200\nnxdomain: [ads.example]\n");
        let policy = PolicyConfig::from_config(&DnsConfig::from_yaml(&yaml).unwrap()).unwrap();
        Arc::new(DnsState::new(policy, QueryLogger::disabled()))
    }

    fn src() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_garbage_gets_formerr() {
        let state = state_with_upstream(answer_with("1.1.1.1")).await;
        // Header claims a question that is not there
        let bytes = [0xAB, 0xCD, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        let response = handle_dns_query(&bytes, &state, src(), Protocol::Udp).await.unwrap();
        let reply = DnsMessage::parse(&response).unwrap();
        assert_eq!(reply.id, 0xABCD);
        assert_eq!(reply.rcode(), RCODE_FORMERR);

        assert!(handle_dns_query(&[0x01], &state, src(), Protocol::Udp).await.is_none());
    }

    #[tokio::test]
    async fn test_two_questions_get_formerr() {
        let state = state_with_upstream(answer_with("1.1.1.1")).await;
        let mut query = DnsMessage::query(7, DnsQuestion::new("a.example.", RecordType::A));
        query.questions.push(DnsQuestion::new("b.example.", RecordType::A));

        let response = handle_dns_query(&query.to_bytes(), &state, src(), Protocol::Udp).await.unwrap();
        let reply = DnsMessage::parse(&response).unwrap();
        assert_eq!(reply.id, 7);
        assert_eq!(reply.rcode(), RCODE_FORMERR);
    }

    #[tokio::test]
    async fn test_responses_are_ignored() {
        let state = state_with_upstream(answer_with("1.1.1.1")).await;
        let query = DnsMessage::query(8, DnsQuestion::new("www.example.org.", RecordType::A));
        let reply = DnsMessage::reply_to(&query);
        assert!(handle_dns_query(&reply.to_bytes(), &state, src(), Protocol::Udp).await.is_none());
    }

    #[tokio::test]
    async fn test_timeout_sends_nothing() {
        let state = state_with_upstream(|_: &DnsMessage| None).await;
        let query = DnsMessage::query(9, DnsQuestion::new("slow.example.org.", RecordType::A));
        assert!(handle_dns_query(&query.to_bytes(), &state, src(), Protocol::Udp).await.is_none());
    }

    #[tokio::test]
    async fn test_large_reply_truncated_over_udp_only() {
        let state = state_with_upstream(|q: &DnsMessage| {
            let mut reply = DnsMessage::reply_to(q);
            for i in 0..60u8 {
                reply.answers.push(DnsRecord::a(&q.questions[0].name, [10, 0, 0, i].into(), 60));
            }
            Some(reply)
        })
        .await;
        let query = DnsMessage::query(10, DnsQuestion::new("big.example.org.", RecordType::A));

        let udp = handle_dns_query(&query.to_bytes(), &state, src(), Protocol::Udp).await.unwrap();
        assert!(udp.len() <= 512);
        let udp_reply = DnsMessage::parse(&udp).unwrap();
        assert!(udp_reply.is_truncated());
        assert!(udp_reply.answers.is_empty());

        let tcp = handle_dns_query(&query.to_bytes(), &state, src(), Protocol::Tcp).await.unwrap();
        let tcp_reply = DnsMessage::parse(&tcp).unwrap();
        assert!(!tcp_reply.is_truncated());
        assert_eq!(tcp_reply.answers.len(), 60);
    }

    #[tokio::test]
    async fn test_upstream_failure_drops_only_that_query() {
        let answer = answer_with("192.0.2.1");
        let (addr, _) = spawn_raw_udp_upstream(move |bytes: &[u8]| {
            let query = DnsMessage::parse(bytes).ok()?;
            if query.questions[0].name.starts_with("broken.") {
                Some(unparsable_reply(bytes))
            } else {
                answer(&query).map(|reply| reply.to_bytes())
            }
        })
        .await;
        let state = state_at(addr);

        let broken = DnsMessage::query(11, DnsQuestion::new("broken.example.org.", RecordType::A));
        assert!(handle_dns_query(&broken.to_bytes(), &state, src(), Protocol::Udp).await.is_none());

        let fine = DnsMessage::query(12, DnsQuestion::new("fine.example.org.", RecordType::A));
        let response = handle_dns_query(&fine.to_bytes(), &state, src(), Protocol::Udp).await.unwrap();
        let reply = DnsMessage::parse(&response).unwrap();
        assert_eq!(reply.id, 12);
        assert_eq!(reply.answers[0].ip(), Some("192.0.2.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_idle_tcp_connection_is_closed() {
        let state = state_with_upstream(answer_with("1.1.1.1")).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server_side, peer) = listener.accept().await.unwrap();

        let handle = tokio::spawn(async move {
            handle_tcp_connection(server_side, peer, &state, Duration::from_millis(100)).await
        });

        // Silent client: the server hangs up, the client reads EOF
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf)).await.unwrap();
        assert_eq!(read.unwrap(), 0);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_error() {
        let held = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = held.local_addr().unwrap();

        let err = bind(addr).await.err().unwrap();
        assert!(err.to_string().contains("UDP"));

        let free = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(free.udp.local_addr().is_ok());
    }
}
