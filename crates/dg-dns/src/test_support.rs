//! Fake upstream resolvers for unit tests.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::packet::DnsMessage;
use crate::records::DnsRecord;

/// Bind a UDP resolver on localhost answering with `handler`; `None` stays silent.
/// Returns its address and a counter of queries received.
pub(crate) async fn spawn_udp_upstream<F>(handler: F) -> (SocketAddr, Arc<AtomicUsize>)
where
    F: Fn(&DnsMessage) -> Option<DnsMessage> + Send + 'static,
{
    spawn_raw_udp_upstream(move |bytes| {
        let query = DnsMessage::parse(bytes).ok()?;
        handler(&query).map(|reply| reply.to_bytes())
    })
    .await
}

/// Like `spawn_udp_upstream`, but the handler sees and returns wire bytes,
/// so it can answer with packets the codec would never produce.
pub(crate) async fn spawn_raw_udp_upstream<F>(handler: F) -> (SocketAddr, Arc<AtomicUsize>)
where
    F: Fn(&[u8]) -> Option<Vec<u8>> + Send + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(reply) = handler(&buf[..len]) {
                let _ = socket.send_to(&reply, src).await;
            }
        }
    });

    (addr, hits)
}

/// Reply with the query's TXID and QR set that claims one question but carries none.
pub(crate) fn unparsable_reply(query: &[u8]) -> Vec<u8> {
    vec![query[0], query[1], 0x81, 0x80, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
}

/// Handler answering every question with one A/AAAA record for `ip`, TTL 60.
pub(crate) fn answer_with(ip: &str) -> impl Fn(&DnsMessage) -> Option<DnsMessage> + Send + 'static {
    let ip: IpAddr = ip.parse().unwrap();
    move |query| {
        let mut reply = DnsMessage::reply_to(query);
        for q in &query.questions {
            let record = match ip {
                IpAddr::V4(v4) => DnsRecord::a(&q.name, v4, 60),
                IpAddr::V6(v6) => DnsRecord::aaaa(&q.name, v6, 60),
            };
            reply.answers.push(record);
        }
        Some(reply)
    }
}
