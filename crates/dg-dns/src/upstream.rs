use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::packet::DnsMessage;

/// Upstream replies may be larger than anything we accept from clients.
const MAX_UPSTREAM_MESSAGE_SIZE: usize = 65535;

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("exchange with {0} timed out")]
    Timeout(SocketAddr),
    #[error("exchange with {server} failed: {reason}")]
    Transport { server: SocketAddr, reason: String },
}

impl UpstreamError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Parse `ip`, `ip:port` or `[v6]:port`; the port defaults to 53.
pub fn parse_server_addr(s: &str) -> Option<SocketAddr> {
    let s = s.trim();
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Some(addr);
    }
    s.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, 53))
}

/// Single-server query/response exchange with a bounded wait.
pub struct UpstreamForwarder {
    server: SocketAddr,
    timeout: Duration,
}

impl UpstreamForwarder {
    pub fn new(server: SocketAddr, timeout_ms: u64) -> Self {
        Self {
            server,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Forward a query via UDP and return the upstream reply with the client's TXID.
    /// Randomizes the TXID sent upstream and validates the reply against it.
    /// Retries over TCP if the UDP reply is truncated.
    pub async fn forward(&self, request: &DnsMessage) -> Result<DnsMessage, UpstreamError> {
        let deadline = Instant::now() + self.timeout;

        // Random TXID for the upstream query (RFC 5452)
        let upstream_txid: u16 = rand::rng().random();
        let mut upstream_query = request.clone();
        upstream_query.id = upstream_txid;
        let query_bytes = upstream_query.to_bytes();

        let mut response_bytes = self.forward_udp(&query_bytes, upstream_txid, deadline).await?;

        // TC is read from the raw header: a truncated reply may end mid-record
        if response_bytes[2] & 0x02 != 0 {
            debug!("Response truncated from {}, retrying TCP", self.server);
            let tcp_deadline = Instant::now() + self.timeout;
            match self.forward_tcp(&query_bytes, tcp_deadline).await {
                Ok(bytes) => response_bytes = bytes,
                Err(e) => debug!("TCP retry to {} failed, keeping truncated reply: {}", self.server, e),
            }
        }

        let mut response = self.decode(&response_bytes, upstream_txid)?;
        response.id = request.id;
        Ok(response)
    }

    async fn forward_udp(
        &self,
        query: &[u8],
        expected_txid: u16,
        deadline: Instant,
    ) -> Result<Vec<u8>, UpstreamError> {
        let bind_addr: SocketAddr = if self.server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(bind_addr).await.map_err(|e| self.transport(e))?;
        socket.send_to(query, self.server).await.map_err(|e| self.transport(e))?;

        let mut buf = vec![0u8; MAX_UPSTREAM_MESSAGE_SIZE];
        loop {
            let (len, src) = timeout_at(deadline, socket.recv_from(&mut buf))
                .await
                .map_err(|_| UpstreamError::Timeout(self.server))?
                .map_err(|e| self.transport(e))?;

            // RFC 5452: drop datagrams from other sources, with another TXID, or without QR
            if src.ip() != self.server.ip() {
                debug!("Ignoring reply from unexpected source {} (expected {})", src, self.server);
                continue;
            }
            if len < 12 || u16::from_be_bytes([buf[0], buf[1]]) != expected_txid || buf[2] & 0x80 == 0 {
                debug!("Ignoring mismatched reply from {}", src);
                continue;
            }

            buf.truncate(len);
            return Ok(buf);
        }
    }

    async fn forward_tcp(&self, query: &[u8], deadline: Instant) -> Result<Vec<u8>, UpstreamError> {
        let timed_out = |_| UpstreamError::Timeout(self.server);

        let mut stream = timeout_at(deadline, TcpStream::connect(self.server))
            .await
            .map_err(timed_out)?
            .map_err(|e| self.transport(e))?;

        // TCP DNS: 2-byte length prefix
        let mut framed = Vec::with_capacity(query.len() + 2);
        framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
        framed.extend_from_slice(query);
        stream.write_all(&framed).await.map_err(|e| self.transport(e))?;

        let mut len_buf = [0u8; 2];
        timeout_at(deadline, stream.read_exact(&mut len_buf))
            .await
            .map_err(timed_out)?
            .map_err(|e| self.transport(e))?;
        let response_len = u16::from_be_bytes(len_buf) as usize;

        let mut response = vec![0u8; response_len];
        timeout_at(deadline, stream.read_exact(&mut response))
            .await
            .map_err(timed_out)?
            .map_err(|e| self.transport(e))?;
        Ok(response)
    }

    fn decode(&self, bytes: &[u8], expected_txid: u16) -> Result<DnsMessage, UpstreamError> {
        let response = DnsMessage::parse(bytes).map_err(|e| self.transport(e))?;
        if response.id != expected_txid {
            return Err(self.transport(format!(
                "TXID mismatch: expected {:04x}, got {:04x}",
                expected_txid, response.id
            )));
        }
        Ok(response)
    }

    fn transport(&self, reason: impl fmt::Display) -> UpstreamError {
        UpstreamError::Transport {
            server: self.server,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::DnsQuestion;
    use crate::records::{DnsRecord, RecordType};
    use crate::test_support::{answer_with, spawn_udp_upstream};
    use tokio::net::TcpListener;

    fn query(name: &str) -> DnsMessage {
        DnsMessage::query(0x4242, DnsQuestion::new(name, RecordType::A))
    }

    #[test]
    fn test_parse_server_addr() {
        assert_eq!(parse_server_addr("8.8.8.8"), Some("8.8.8.8:53".parse().unwrap()));
        assert_eq!(parse_server_addr("8.8.8.8:5353"), Some("8.8.8.8:5353".parse().unwrap()));
        assert_eq!(parse_server_addr("2001:db8::1"), Some("[2001:db8::1]:53".parse().unwrap()));
        assert_eq!(parse_server_addr("[2001:db8::1]:5353"), Some("[2001:db8::1]:5353".parse().unwrap()));
        assert_eq!(parse_server_addr("[::1]"), Some("[::1]:53".parse().unwrap()));
        assert_eq!(parse_server_addr("dns.google"), None);
    }

    #[tokio::test]
    async fn test_forward_restores_client_txid() {
        let (addr, hits) = spawn_udp_upstream(answer_with("93.184.216.34")).await;
        let forwarder = UpstreamForwarder::new(addr, 1000);

        let reply = forwarder.forward(&query("example.com.")).await.unwrap();
        assert_eq!(reply.id, 0x4242);
        assert!(reply.is_response());
        assert_eq!(reply.answers.len(), 1);
        assert_eq!(reply.answers[0].name, "example.com.");
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_forward_skips_mismatched_txid() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, src) = socket.recv_from(&mut buf).await.unwrap();
            let query = DnsMessage::parse(&buf[..len]).unwrap();

            let mut spoofed = DnsMessage::reply_to(&query);
            spoofed.id = query.id.wrapping_add(1);
            spoofed.answers.push(DnsRecord::a("example.com.", "6.6.6.6".parse().unwrap(), 60));
            socket.send_to(&spoofed.to_bytes(), src).await.unwrap();

            let mut genuine = DnsMessage::reply_to(&query);
            genuine.answers.push(DnsRecord::a("example.com.", "1.2.3.4".parse().unwrap(), 60));
            socket.send_to(&genuine.to_bytes(), src).await.unwrap();
        });

        let forwarder = UpstreamForwarder::new(addr, 1000);
        let reply = forwarder.forward(&query("example.com.")).await.unwrap();
        assert_eq!(reply.answers[0].ip(), Some("1.2.3.4".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_forward_times_out() {
        // Bound but silent
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let forwarder = UpstreamForwarder::new(socket.local_addr().unwrap(), 100);

        let err = forwarder.forward(&query("slow.example.")).await.unwrap_err();
        assert!(err.is_timeout());
        drop(socket);
    }

    #[tokio::test]
    async fn test_forward_unparsable_reply_is_transport_error() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (_, src) = socket.recv_from(&mut buf).await.unwrap();
            // Right TXID and QR, claims one question but carries none
            let garbage = [buf[0], buf[1], 0x81, 0x80, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
            socket.send_to(&garbage, src).await.unwrap();
        });

        let forwarder = UpstreamForwarder::new(addr, 1000);
        let err = forwarder.forward(&query("broken.example.")).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_truncated_reply_retries_over_tcp() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let listener = TcpListener::bind(addr).await.unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, src) = socket.recv_from(&mut buf).await.unwrap();
            let query = DnsMessage::parse(&buf[..len]).unwrap();
            let reply = DnsMessage::reply_to(&query);
            socket.send_to(&reply.to_udp_bytes(0), src).await.unwrap();
        });
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.unwrap();
            let mut query_buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut query_buf).await.unwrap();
            let query = DnsMessage::parse(&query_buf).unwrap();

            let mut reply = DnsMessage::reply_to(&query);
            reply.answers.push(DnsRecord::a("big.example.", "10.1.1.1".parse().unwrap(), 60));
            let bytes = reply.to_bytes();
            stream.write_all(&(bytes.len() as u16).to_be_bytes()).await.unwrap();
            stream.write_all(&bytes).await.unwrap();
        });

        let forwarder = UpstreamForwarder::new(addr, 1000);
        let reply = forwarder.forward(&query("big.example.")).await.unwrap();
        assert!(!reply.is_truncated());
        assert_eq!(reply.answers.len(), 1);
        assert_eq!(reply.id, 0x4242);
    }

    #[tokio::test]
    async fn test_truncated_reply_cut_mid_record_retries_over_tcp() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let listener = TcpListener::bind(addr).await.unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, src) = socket.recv_from(&mut buf).await.unwrap();
            let query = DnsMessage::parse(&buf[..len]).unwrap();
            let mut reply = DnsMessage::reply_to(&query);
            reply.answers.push(DnsRecord::a("cut.example.", "10.2.2.2".parse().unwrap(), 60));
            let mut bytes = reply.to_bytes();
            // TC set, last three bytes of the A record missing
            bytes[2] |= 0x02;
            bytes.truncate(bytes.len() - 3);
            assert!(DnsMessage::parse(&bytes).is_err());
            socket.send_to(&bytes, src).await.unwrap();
        });
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.unwrap();
            let mut query_buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut query_buf).await.unwrap();
            let query = DnsMessage::parse(&query_buf).unwrap();

            let mut reply = DnsMessage::reply_to(&query);
            reply.answers.push(DnsRecord::a("cut.example.", "10.2.2.2".parse().unwrap(), 60));
            let bytes = reply.to_bytes();
            stream.write_all(&(bytes.len() as u16).to_be_bytes()).await.unwrap();
            stream.write_all(&bytes).await.unwrap();
        });

        let forwarder = UpstreamForwarder::new(addr, 1000);
        let reply = forwarder.forward(&query("cut.example.")).await.unwrap();
        assert!(!reply.is_truncated());
        assert_eq!(reply.answers[0].ip(), Some("10.2.2.2".parse().unwrap()));
        assert_eq!(reply.id, 0x4242);
    }
}
