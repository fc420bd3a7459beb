// dns.rs — DNS Filter: a UDP name service that answers whitelisted names
// by forwarding to an upstream resolver, and NXDOMAINs everything else.
//
// The wire format here is hand-rolled rather than built on a DNS crate
// dependency — a minimal decoder for the header and question section
// (RFC 1035 §4.1) is all the whitelist decision needs; forwarded answers
// are relayed as opaque bytes rather than re-encoded.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aegis_policy::EgressConfig;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::audit::AuditHandle;
use crate::error::MediationError;
use aegis_audit::{AuditEvent, AuditEventKind, Outcome};

const HEADER_LEN: usize = 12;
const MAX_UDP_PACKET: usize = 512;

#[derive(Debug, Clone, Copy)]
struct DnsHeader {
    id: u16,
    flags: u16,
    qdcount: u16,
}

fn parse_header(buf: &[u8]) -> Option<DnsHeader> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    Some(DnsHeader {
        id: u16::from_be_bytes([buf[0], buf[1]]),
        flags: u16::from_be_bytes([buf[2], buf[3]]),
        qdcount: u16::from_be_bytes([buf[4], buf[5]]),
    })
}

/// Decode the first question's QNAME into a dotted string, starting at
/// `HEADER_LEN`. Returns the name and the offset just past QTYPE/QCLASS.
/// Refuses compression pointers in the question section — a well-formed
/// query never needs one there, and accepting one would let a crafted
/// packet point the decoder outside the buffer.
fn parse_question_name(buf: &[u8]) -> Option<(String, usize)> {
    let mut offset = HEADER_LEN;
    let mut labels = Vec::new();
    loop {
        let len = *buf.get(offset)? as usize;
        if len == 0 {
            offset += 1;
            break;
        }
        if len & 0xC0 != 0 {
            return None; // compression pointer — reject as malformed here
        }
        let start = offset + 1;
        let end = start + len;
        let label = buf.get(start..end)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        offset = end;
    }
    // QTYPE (2) + QCLASS (2) must still be present.
    if buf.get(offset..offset + 4).is_none() {
        return None;
    }
    offset += 4;
    Some((labels.join("."), offset))
}

/// Build a DNS response echoing `query`'s header id and (when available)
/// its question section, with QR=1, RA=1, and the given RCODE. `ancount`
/// stays zero for both NXDOMAIN and FORMERR — this filter never fabricates
/// answer records, only the forwarded-unchanged path does.
fn build_empty_response(query: &[u8], header: DnsHeader, question_end: Option<usize>, rcode: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + question_end.unwrap_or(0));
    out.extend_from_slice(&header.id.to_be_bytes());

    // QR=1 (response), opcode/RD copied from the query, RA=1, RCODE set.
    let opcode_and_rd = header.flags & 0x7900; // opcode (bits 11-14) + RD (bit 8)
    let flags: u16 = 0x8000 | opcode_and_rd | 0x0080 | (rcode as u16 & 0x000F);
    out.extend_from_slice(&flags.to_be_bytes());

    let qdcount: u16 = if question_end.is_some() { 1 } else { 0 };
    out.extend_from_slice(&qdcount.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // ancount
    out.extend_from_slice(&0u16.to_be_bytes()); // nscount
    out.extend_from_slice(&0u16.to_be_bytes()); // arcount

    if let Some(end) = question_end {
        out.extend_from_slice(&query[HEADER_LEN..end]);
    }
    out
}

const RCODE_NXDOMAIN: u8 = 3;
const RCODE_FORMERR: u8 = 1;

pub struct DnsFilterConfig {
    pub listen_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
    pub upstream_timeout: Duration,
}

pub struct DnsFilter {
    egress: Arc<RwLock<EgressConfig>>,
    audit: AuditHandle,
    /// When false, a non-whitelisted name is still audited as a would-be
    /// block but forwarded upstream rather than NXDOMAIN'd — mirrors the
    /// Egress Proxy's `enforce` key (spec.md's "logged but never blocked").
    enforce: bool,
}

impl DnsFilter {
    pub fn new(egress: Arc<RwLock<EgressConfig>>, audit: AuditHandle, enforce: bool) -> Self {
        Self { egress, audit, enforce }
    }

    /// Bind the listen socket and run the filter until the socket is
    /// dropped or a fatal bind/send error occurs. One query at a time per
    /// task iteration; each query's upstream forward runs concurrently via
    /// its own spawned task so a slow upstream never head-of-line-blocks
    /// the next inbound query.
    pub async fn run(&self, config: DnsFilterConfig) -> Result<(), MediationError> {
        let socket = UdpSocket::bind(config.listen_addr)
            .await
            .map_err(|e| MediationError::ResourceError(format!("DNS filter bind failed: {e}")))?;
        let socket = Arc::new(socket);

        let mut buf = [0u8; MAX_UDP_PACKET];
        loop {
            let (len, client) = socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| MediationError::NetworkError(format!("DNS recv failed: {e}")))?;
            let query = buf[..len].to_vec();

            let socket = Arc::clone(&socket);
            let egress = Arc::clone(&self.egress);
            let audit = self.audit.clone();
            let upstream_addr = config.upstream_addr;
            let upstream_timeout = config.upstream_timeout;
            let enforce = self.enforce;

            tokio::spawn(async move {
                Self::handle_query(socket, client, query, egress, audit, upstream_addr, upstream_timeout, enforce).await;
            });
        }
    }

    async fn handle_query(
        socket: Arc<UdpSocket>,
        client: SocketAddr,
        query: Vec<u8>,
        egress: Arc<RwLock<EgressConfig>>,
        audit: AuditHandle,
        upstream_addr: SocketAddr,
        upstream_timeout: Duration,
        enforce: bool,
    ) {
        let started = Instant::now();
        let Some(header) = parse_header(&query) else {
            audit.record(
                AuditEvent::new("dns_filter", AuditEventKind::DnsDecision, Outcome::Fail, "malformed query: header too short")
                    .with_rule_matched("dns_formerr"),
            );
            return;
        };

        if header.qdcount == 0 {
            let response = build_empty_response(&query, header, None, RCODE_FORMERR);
            let _ = socket.send_to(&response, client).await;
            audit.record(
                AuditEvent::new("dns_filter", AuditEventKind::DnsDecision, Outcome::Fail, "malformed query: no question")
                    .with_rule_matched("dns_formerr"),
            );
            return;
        }

        let Some((name, question_end)) = parse_question_name(&query) else {
            let response = build_empty_response(&query, header, None, RCODE_FORMERR);
            let _ = socket.send_to(&response, client).await;
            audit.record(
                AuditEvent::new("dns_filter", AuditEventKind::DnsDecision, Outcome::Fail, "malformed query: unparsable question")
                    .with_rule_matched("dns_formerr"),
            );
            return;
        };

        let decision = egress.read().await.decide(name.trim_end_matches('.'));
        if !decision.allowed {
            audit.record(
                AuditEvent::new("dns_filter", AuditEventKind::DnsDecision, Outcome::Fail, format!("'{name}' not in effective whitelist"))
                    .with_subject(name.clone())
                    .with_duration_ms(started.elapsed().as_millis() as u64),
            );
            if enforce {
                let response = build_empty_response(&query, header, Some(question_end), RCODE_NXDOMAIN);
                let _ = socket.send_to(&response, client).await;
                return;
            }
        }

        match Self::forward_to_upstream(&query, upstream_addr, upstream_timeout).await {
            Ok(answer) => {
                let _ = socket.send_to(&answer, client).await;
                audit.record(
                    AuditEvent::new("dns_filter", AuditEventKind::DnsDecision, Outcome::Pass, format!("forwarded '{name}' to upstream"))
                        .with_subject(name)
                        .with_bytes(query.len() as u64, answer.len() as u64)
                        .with_duration_ms(started.elapsed().as_millis() as u64),
                );
            }
            Err(err) => {
                audit.record(
                    AuditEvent::new("dns_filter", AuditEventKind::DnsDecision, Outcome::Fail, format!("upstream error for '{name}': {err}"))
                        .with_subject(name)
                        .with_duration_ms(started.elapsed().as_millis() as u64),
                );
            }
        }
    }

    async fn forward_to_upstream(query: &[u8], upstream_addr: SocketAddr, upstream_timeout: Duration) -> Result<Vec<u8>, MediationError> {
        let bind_addr: SocketAddr = if upstream_addr.is_ipv6() { "[::]:0".parse().unwrap() } else { "0.0.0.0:0".parse().unwrap() };
        let upstream_socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| MediationError::ResourceError(format!("upstream socket bind failed: {e}")))?;
        upstream_socket
            .send_to(query, upstream_addr)
            .await
            .map_err(|e| MediationError::NetworkError(format!("upstream send failed: {e}")))?;

        let mut buf = [0u8; MAX_UDP_PACKET];
        let n = timeout(upstream_timeout, upstream_socket.recv(&mut buf))
            .await
            .map_err(|_| MediationError::NetworkError("upstream resolver timed out".to_string()))?
            .map_err(|e| MediationError::NetworkError(format!("upstream recv failed: {e}")))?;
        Ok(buf[..n].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_query(name: &str, id: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(&0x0100u16.to_be_bytes()); // RD=1
        buf.extend_from_slice(&1u16.to_be_bytes()); // qdcount
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        for label in name.split('.') {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
        buf.extend_from_slice(&1u16.to_be_bytes()); // QTYPE A
        buf.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN
        buf
    }

    #[test]
    fn parses_a_well_formed_question_name() {
        let query = encode_query("api.anthropic.com", 0x1234);
        let header = parse_header(&query).unwrap();
        assert_eq!(header.id, 0x1234);
        assert_eq!(header.qdcount, 1);
        let (name, _) = parse_question_name(&query).unwrap();
        assert_eq!(name, "api.anthropic.com");
    }

    #[test]
    fn truncated_header_is_rejected() {
        assert!(parse_header(&[0u8; 4]).is_none());
    }

    #[test]
    fn nxdomain_response_echoes_the_query_id_and_question() {
        let query = encode_query("evil.example.com", 0xBEEF);
        let header = parse_header(&query).unwrap();
        let (_, end) = parse_question_name(&query).unwrap();
        let response = build_empty_response(&query, header, Some(end), RCODE_NXDOMAIN);
        let response_header = parse_header(&response).unwrap();
        assert_eq!(response_header.id, 0xBEEF);
        assert_eq!(response_header.flags & 0x000F, RCODE_NXDOMAIN as u16);
        assert_eq!(response_header.flags & 0x8000, 0x8000, "QR bit must be set on a response");
    }

    #[test]
    fn formerr_response_has_no_question_when_unparsable() {
        let mut query = vec![0u8; HEADER_LEN];
        query[4] = 0;
        query[5] = 1; // claims a question exists but supplies none
        let header = parse_header(&query).unwrap();
        let response = build_empty_response(&query, header, None, RCODE_FORMERR);
        assert_eq!(response.len(), HEADER_LEN);
        assert_eq!(parse_header(&response).unwrap().flags & 0x000F, RCODE_FORMERR as u16);
    }

    #[test]
    fn compression_pointer_in_question_is_rejected() {
        let mut query = encode_query("example.com", 1);
        query[HEADER_LEN] = 0xC0; // top two bits set = compression pointer
        assert!(parse_question_name(&query).is_none());
    }
}
