// proxy.rs — Egress Proxy: the one network path out of the sandbox.
//
// A minimal HTTP/1.1 forward proxy plus CONNECT tunneling, hand-rolled
// rather than pulling in a full HTTP stack — the proxy never needs to be
// a general-purpose HTTP client, only to read a request line and headers
// well enough to make a domain-rule decision and relay bytes. Built on
// tokio, matching the workspace's ambient async stack.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aegis_audit::{AuditEvent, AuditEventKind, Outcome};
use aegis_policy::{is_llm_domain, inspect, ApprovalQueue, EgressConfig, ExemptionPatterns, Operation, OperationKind, OperationTarget, RateLimitPolicy, RateLimiter};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::audit::AuditHandle;
use crate::error::MediationError;

const GLOBAL_RATE_LIMIT_SUBJECT: &str = "__global__";
const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_REQUEST_BODY_BYTES: usize = 16 * 1024 * 1024;

pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub upstream_timeout: Duration,
    pub idle_tunnel_timeout: Duration,
    pub approval_wait_timeout: Duration,
}

pub struct EgressProxy {
    egress: Arc<RwLock<EgressConfig>>,
    audit: AuditHandle,
    approvals: Arc<ApprovalQueue>,
    domain_limiter: Arc<RateLimiter>,
    global_limiter: Arc<RateLimiter>,
    /// When false, every would-be block is logged rather than enforced —
    /// the egress config's `enforce` key. Rate limiting and
    /// approval submission still run so their audit trail and queue state
    /// stay representative of live traffic; only the closing action (403,
    /// 429, tunnel-reject) is suppressed.
    enforce: bool,
    /// The egress config's `inspect_content` key: gates the Content
    /// Inspector pass over write bodies independent of `enforce`.
    inspect_content: bool,
    /// Paths exempt from content inspection (lockfiles and the like),
    /// consulted before `inspect::inspect` runs over a write body.
    inspection_exemptions: ExemptionPatterns,
}

impl EgressProxy {
    pub fn new(
        egress: Arc<RwLock<EgressConfig>>,
        audit: AuditHandle,
        approvals: Arc<ApprovalQueue>,
        domain_rate_limit: RateLimitPolicy,
        global_rate_limit: RateLimitPolicy,
        enforce: bool,
        inspect_content: bool,
        inspection_exemptions: ExemptionPatterns,
    ) -> Self {
        Self {
            egress,
            audit,
            approvals,
            domain_limiter: Arc::new(RateLimiter::new(domain_rate_limit)),
            global_limiter: Arc::new(RateLimiter::new(global_rate_limit)),
            enforce,
            inspect_content,
            inspection_exemptions,
        }
    }

    pub async fn run(self: Arc<Self>, config: ProxyConfig) -> Result<(), MediationError> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|e| MediationError::ResourceError(format!("egress proxy bind failed: {e}")))?;

        loop {
            let (stream, _peer) = listener
                .accept()
                .await
                .map_err(|e| MediationError::NetworkError(format!("accept failed: {e}")))?;
            let proxy = Arc::clone(&self);
            let upstream_timeout = config.upstream_timeout;
            let idle_tunnel_timeout = config.idle_tunnel_timeout;
            let approval_wait_timeout = config.approval_wait_timeout;
            tokio::spawn(async move {
                if let Err(err) = proxy.handle_connection(stream, upstream_timeout, idle_tunnel_timeout, approval_wait_timeout).await {
                    tracing::debug!(error = %err, "proxy connection ended with an error");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, upstream_timeout: Duration, idle_tunnel_timeout: Duration, approval_wait_timeout: Duration) -> Result<(), MediationError> {
        let mut reader = BufReader::new(stream);
        let request_line = read_line_limited(&mut reader, MAX_HEADER_BYTES).await?;
        let Some(request_line) = request_line else {
            return Ok(()); // client disconnected before sending anything
        };
        let Some((method, target, _version)) = parse_request_line(&request_line) else {
            send_status_line(reader.get_mut(), 400, "Bad Request").await.ok();
            return Ok(());
        };

        let headers = read_headers(&mut reader).await?;

        if method.eq_ignore_ascii_case("CONNECT") {
            self.handle_connect(reader, &target, idle_tunnel_timeout).await
        } else {
            self.handle_http_request(reader, &method, &target, &headers, upstream_timeout, approval_wait_timeout).await
        }
    }

    async fn handle_connect(&self, mut client: BufReader<TcpStream>, target: &str, idle_tunnel_timeout: Duration) -> Result<(), MediationError> {
        let Some((host, port)) = parse_host_port(target, 443) else {
            send_status_line(client.get_mut(), 400, "Bad Request").await.ok();
            return Ok(());
        };

        let started = Instant::now();
        let decision = self.egress.read().await.decide(&host);
        if !decision.allowed {
            self.audit(AuditEventKind::ProxyDecision, Outcome::Fail, format!("CONNECT to '{host}' not in effective whitelist"), Some(host.clone()), None, None, started);
            if self.enforce {
                send_status_line(client.get_mut(), 403, "Forbidden").await.ok();
                return Ok(());
            }
        }

        if !self.check_rate_limits(&host) {
            self.audit(AuditEventKind::ProxyDecision, Outcome::Fail, format!("CONNECT to '{host}' rate limited"), Some(host.clone()), None, None, started);
            if self.enforce {
                send_status_line(client.get_mut(), 429, "Too Many Requests").await.ok();
                return Ok(());
            }
        }

        let Ok(mut origin) = TcpStream::connect((host.as_str(), port)).await else {
            send_status_line(client.get_mut(), 502, "Bad Gateway").await.ok();
            self.audit(AuditEventKind::ProxyDecision, Outcome::Fail, format!("CONNECT to '{host}:{port}' failed to dial origin"), Some(host), None, None, started);
            return Ok(());
        };

        send_status_line(client.get_mut(), 200, "Connection Established").await?;
        self.audit(AuditEventKind::ProxyDecision, Outcome::Pass, format!("tunnel opened to '{host}:{port}'"), Some(host.clone()), None, None, started);

        let (bytes_client_to_origin, bytes_origin_to_client) = tunnel(client.into_inner(), &mut origin, idle_tunnel_timeout).await;
        self.audit(
            AuditEventKind::ProxyDecision,
            Outcome::Info,
            format!("tunnel closed to '{host}:{port}'"),
            Some(host),
            Some((bytes_client_to_origin, bytes_origin_to_client)),
            Some(started.elapsed().as_millis() as u64),
            started,
        );
        Ok(())
    }

    async fn handle_http_request(
        &self,
        mut client: BufReader<TcpStream>,
        method: &str,
        target: &str,
        headers: &[(String, String)],
        upstream_timeout: Duration,
        approval_wait_timeout: Duration,
    ) -> Result<(), MediationError> {
        let started = Instant::now();
        let Some((scheme, host, port, path)) = parse_absolute_or_origin_form(target, headers) else {
            send_status_line(client.get_mut(), 400, "Bad Request").await.ok();
            return Ok(());
        };

        let decision = self.egress.read().await.decide(&host);
        if !decision.allowed {
            self.audit(AuditEventKind::ProxyDecision, Outcome::Fail, format!("'{host}' not in effective whitelist"), Some(host.clone()), None, None, started);
            if self.enforce {
                send_status_line(client.get_mut(), 403, "Forbidden").await.ok();
                return Ok(());
            }
        }

        // Step 2: protocol verification. A plaintext request to an LLM
        // provider domain is always a downgrade attempt — those domains are
        // only ever reached over HTTPS/CONNECT in normal operation.
        if is_llm_domain(&host) && scheme.eq_ignore_ascii_case("http") {
            self.audit(AuditEventKind::ProxyDecision, Outcome::Fail, format!("plaintext HTTP to LLM domain '{host}' rejected"), Some(host.clone()), None, None, started);
            if self.enforce {
                send_status_line(client.get_mut(), 403, "Forbidden").await.ok();
                return Ok(());
            }
        }

        if !self.check_rate_limits(&host) {
            self.audit(AuditEventKind::ProxyDecision, Outcome::Fail, format!("'{host}' rate limited"), Some(host.clone()), None, None, started);
            if self.enforce {
                send_status_line(client.get_mut(), 429, "Too Many Requests").await.ok();
                return Ok(());
            }
        }

        let content_length = content_length_of(headers);
        if content_length > MAX_REQUEST_BODY_BYTES {
            send_status_line(client.get_mut(), 413, "Payload Too Large").await.ok();
            self.audit(AuditEventKind::ProxyDecision, Outcome::Fail, format!("request body to '{host}' exceeds proxy limit"), Some(host), None, None, started);
            return Ok(());
        }
        let mut body = vec![0u8; content_length];
        if content_length > 0 {
            client
                .read_exact(&mut body)
                .await
                .map_err(|e| MediationError::NetworkError(format!("failed reading request body: {e}")))?;
        }

        let is_write_method = matches!(method.to_ascii_uppercase().as_str(), "POST" | "PUT" | "PATCH" | "DELETE");
        let allow_write = decision.matched_rule.as_ref().map(|r| r.allow_write).unwrap_or(false);

        if is_write_method && !allow_write {
            let operation = Operation::new(
                OperationKind::Net,
                OperationTarget::Net {
                    url: format!("{scheme}://{host}:{port}{path}"),
                    method: method.to_string(),
                    body_size: body.len() as u64,
                    body_sample: Some(body[..body.len().min(4096)].to_vec()),
                },
            );
            let approval_id = self
                .approvals
                .submit(&operation, format!("allow {method} to {host}{path}?"), approval_wait_timeout)
                .map_err(|e| MediationError::ApprovalError(e.to_string()))?;

            match self.await_approval(approval_id, approval_wait_timeout).await {
                ApprovalOutcome::Approved => {}
                ApprovalOutcome::Denied | ApprovalOutcome::Expired => {
                    self.audit(AuditEventKind::ProxyDecision, Outcome::Fail, format!("{method} to '{host}' denied by approval queue"), Some(host.clone()), None, None, started);
                    if self.enforce {
                        send_status_line(client.get_mut(), 403, "Forbidden").await.ok();
                        return Ok(());
                    }
                }
            }
        }

        if is_write_method
            && self.inspect_content
            && !is_llm_domain(&host)
            && !body.is_empty()
            && !self.inspection_exemptions.is_exempt(&path)
        {
            let result = inspect::inspect(&body);
            if !result.is_clean() {
                self.audit(AuditEventKind::ProxyDecision, Outcome::Fail, format!("blocked: credential_leak to '{host}'"), Some(host.clone()), None, None, started);
                if self.enforce {
                    send_status_line(client.get_mut(), 403, "Forbidden").await.ok();
                    return Ok(());
                }
            }
        }

        let body_len = body.len();
        match self.forward(&host, port, method, &path, headers, &body, upstream_timeout).await {
            Ok((response, response_len)) => {
                client
                    .get_mut()
                    .write_all(&response)
                    .await
                    .map_err(|e| MediationError::NetworkError(format!("failed writing response to client: {e}")))?;
                self.audit(
                    AuditEventKind::ProxyDecision,
                    Outcome::Pass,
                    format!("forwarded {method} to '{host}'"),
                    Some(host),
                    Some((body_len as u64, response_len as u64)),
                    Some(started.elapsed().as_millis() as u64),
                    started,
                );
            }
            Err(err) => {
                send_status_line(client.get_mut(), 502, "Bad Gateway").await.ok();
                self.audit(AuditEventKind::ProxyDecision, Outcome::Fail, format!("origin request to '{host}' failed: {err}"), Some(host), None, None, started);
            }
        }
        Ok(())
    }

    async fn forward(&self, host: &str, port: u16, method: &str, path: &str, headers: &[(String, String)], body: &[u8], upstream_timeout: Duration) -> Result<(Vec<u8>, usize), MediationError> {
        let mut origin = timeout(upstream_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| MediationError::NetworkError("origin connect timed out".to_string()))?
            .map_err(|e| MediationError::NetworkError(format!("origin connect failed: {e}")))?;

        let mut request = format!("{method} {path} HTTP/1.1\r\n");
        for (name, value) in headers {
            if name.eq_ignore_ascii_case("proxy-connection") {
                continue; // hop-by-hop header, never forwarded to the origin
            }
            request.push_str(name);
            request.push_str(": ");
            request.push_str(value);
            request.push_str("\r\n");
        }
        request.push_str("\r\n");

        origin
            .write_all(request.as_bytes())
            .await
            .map_err(|e| MediationError::NetworkError(format!("failed writing request to origin: {e}")))?;
        if !body.is_empty() {
            origin
                .write_all(body)
                .await
                .map_err(|e| MediationError::NetworkError(format!("failed writing request body to origin: {e}")))?;
        }

        let mut response = Vec::new();
        timeout(upstream_timeout, origin.read_to_end(&mut response))
            .await
            .map_err(|_| MediationError::NetworkError("origin response timed out".to_string()))?
            .map_err(|e| MediationError::NetworkError(format!("failed reading origin response: {e}")))?;
        let len = response.len();
        Ok((response, len))
    }

    fn check_rate_limits(&self, host: &str) -> bool {
        let domain_ok = self.domain_limiter.check(host).allowed;
        let global_ok = self.global_limiter.check(GLOBAL_RATE_LIMIT_SUBJECT).allowed;
        domain_ok && global_ok
    }

    async fn await_approval(&self, id: uuid::Uuid, wait: Duration) -> ApprovalOutcome {
        use aegis_policy::ApprovalState;
        let deadline = Instant::now() + wait;
        loop {
            let Some(request) = self.approvals.get(id) else {
                return ApprovalOutcome::Denied;
            };
            match request.state {
                ApprovalState::Approved { .. } => return ApprovalOutcome::Approved,
                ApprovalState::Denied { .. } => return ApprovalOutcome::Denied,
                ApprovalState::Expired { .. } => return ApprovalOutcome::Expired,
                ApprovalState::Pending => {
                    if Instant::now() >= deadline {
                        let _ = self.approvals.expire_stale();
                        return ApprovalOutcome::Expired;
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }
    }

    fn audit(&self, kind: AuditEventKind, outcome: Outcome, reason: String, subject: Option<String>, bytes: Option<(u64, u64)>, duration_ms: Option<u64>, started: Instant) {
        let mut event = AuditEvent::new("egress_proxy", kind, outcome, reason);
        if let Some(subject) = subject {
            event = event.with_subject(subject);
        }
        if let Some((bytes_in, bytes_out)) = bytes {
            event = event.with_bytes(bytes_in, bytes_out);
        }
        event = event.with_duration_ms(duration_ms.unwrap_or_else(|| started.elapsed().as_millis() as u64));
        self.audit.record(event);
    }
}

enum ApprovalOutcome {
    Approved,
    Denied,
    Expired,
}

/// Bidirectional copy between `client` and `origin` until either side
/// closes or `idle_timeout` elapses with no bytes moved in either
/// direction. Returns (bytes client->origin, bytes origin->client).
async fn tunnel(mut client: TcpStream, origin: &mut TcpStream, idle_timeout: Duration) -> (u64, u64) {
    let (mut client_read, mut client_write) = client.split();
    let (mut origin_read, mut origin_write) = origin.split();

    let client_to_origin = async {
        match timeout(idle_timeout, tokio::io::copy(&mut client_read, &mut origin_write)).await {
            Ok(Ok(n)) => n,
            _ => 0,
        }
    };
    let origin_to_client = async {
        match timeout(idle_timeout, tokio::io::copy(&mut origin_read, &mut client_write)).await {
            Ok(Ok(n)) => n,
            _ => 0,
        }
    };
    tokio::join!(client_to_origin, origin_to_client)
}

async fn read_line_limited(reader: &mut BufReader<TcpStream>, max_bytes: usize) -> Result<Option<String>, MediationError> {
    let mut line = String::new();
    let n = reader
        .take(max_bytes as u64)
        .read_line(&mut line)
        .await
        .map_err(|e| MediationError::NetworkError(format!("failed reading request line: {e}")))?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

fn parse_request_line(line: &str) -> Option<(String, String, String)> {
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();
    let version = parts.next()?.to_string();
    Some((method, target, version))
}

async fn read_headers(reader: &mut BufReader<TcpStream>) -> Result<Vec<(String, String)>, MediationError> {
    let mut headers = Vec::new();
    loop {
        let Some(line) = read_line_limited(reader, MAX_HEADER_BYTES).await? else {
            break;
        };
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Ok(headers)
}

fn content_length_of(headers: &[(String, String)]) -> usize {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse().ok())
        .unwrap_or(0)
}

/// Parse a CONNECT target (`host:port`, no scheme) into (host, port).
fn parse_host_port(target: &str, default_port: u16) -> Option<(String, u16)> {
    if let Some((host, port)) = target.rsplit_once(':') {
        let port = port.parse().ok()?;
        Some((host.to_string(), port))
    } else {
        Some((target.to_string(), default_port))
    }
}

/// Parse a request target that may be either absolute-form
/// (`http://host:port/path`, what a real forward proxy client sends) or
/// origin-form (`/path`, paired with a `Host` header).
fn parse_absolute_or_origin_form(target: &str, headers: &[(String, String)]) -> Option<(String, String, u16, String)> {
    if let Ok(url) = url::Url::parse(target) {
        let scheme = url.scheme().to_string();
        let host = url.host_str()?.to_string();
        let port = url.port_or_known_default().unwrap_or(if scheme == "https" { 443 } else { 80 });
        let path = if url.query().is_some() {
            format!("{}?{}", url.path(), url.query().unwrap())
        } else {
            url.path().to_string()
        };
        return Some((scheme, host, port, path));
    }

    let host_header = headers.iter().find(|(name, _)| name.eq_ignore_ascii_case("host"))?.1.clone();
    let (host, port) = parse_host_port(&host_header, 80);
    Some(("http".to_string(), host, port, target.to_string()))
}

async fn send_status_line(stream: &mut TcpStream, code: u16, reason: &str) -> Result<(), MediationError> {
    let response = format!("HTTP/1.1 {code} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(|e| MediationError::NetworkError(format!("failed writing status line: {e}")))
}
