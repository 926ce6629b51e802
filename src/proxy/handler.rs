use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::common::auth::{AuthGate, Decision as AuthDecision};
use crate::common::stats::{log_event, LogEvent, Stats};
use crate::net::conn::BufferedConnection;
use crate::proxy::acl::{Acl, Decision as AclDecision, RuleClass};
use crate::proxy::cache::{FillHandle, FillOutcome, Lookup, LruResponseCache};
use crate::proxy::context::{ConnectionContext, Stage};
use crate::proxy::parser::{self, ParseError, Request};
use crate::proxy::relay;

const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const FORWARD_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
const STREAM_CHUNK: usize = 4096;

#[derive(Error, Debug)]
enum HandlerError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("head was not received within 10s")]
    HeadTimeout,
    #[error("blocked by {0:?} rule")]
    Blocked(RuleClass),
    #[error("proxy authentication required")]
    Challenge,
    #[error("proxy authentication failed")]
    AuthFailed,
    #[error("dial to {0} failed: {1}")]
    DialFailed(String, std::io::Error),
    #[error("dial to {0} timed out")]
    DialTimeout(String),
    #[error("upstream response timed out")]
    ResponseTimeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Relay(#[from] relay::RelayError),
}

fn err_outcome(e: &HandlerError) -> &'static str {
    match e {
        HandlerError::Blocked(_) => "BLOCKED",
        HandlerError::Challenge | HandlerError::AuthFailed => "AUTH_FAILED",
        HandlerError::Parse(_) | HandlerError::HeadTimeout => "REJECTED",
        HandlerError::DialFailed(..) | HandlerError::DialTimeout(_) => "BAD_GATEWAY",
        HandlerError::ResponseTimeout | HandlerError::Io(_) | HandlerError::Relay(_) => "ERROR",
    }
}

/// Resources shared across every connection, owned by the listener.
pub struct HandlerShared {
    pub acl: Arc<Acl>,
    pub auth: Arc<AuthGate>,
    pub cache: Option<LruResponseCache>,
    pub stats: Arc<Stats>,
    pub buffer_size: usize,
}

struct Summary {
    event: &'static str,
    outcome: &'static str,
    method: String,
    request_target: String,
    version: &'static str,
    target: String,
}

/// Drives one accepted connection through Reading → Gating → Dispatch →
/// (Forwarding | Tunneling) → Closed, then emits exactly one log event.
pub async fn handle(stream: TcpStream, client_addr: SocketAddr, shared: Arc<HandlerShared>) {
    shared.stats.record_accepted();
    let _ = stream.set_nodelay(true);
    let ctx = Arc::new(ConnectionContext::new(client_addr));
    let mut conn = BufferedConnection::new(stream, shared.buffer_size);

    let result = drive(&mut conn, &ctx, &shared).await;
    ctx.set_stage(Stage::Closed);

    match result {
        Ok(summary) => {
            shared.stats.record_completed();
            log_event(
                &shared.stats,
                summary.outcome,
                LogEvent {
                    event: summary.event,
                    client_addr,
                    target: &summary.target,
                    method: &summary.method,
                    request_target: &summary.request_target,
                    version: summary.version,
                    outcome: summary.outcome,
                    sent: ctx.bytes_sent(),
                    received: ctx.bytes_received(),
                    reason: None,
                },
            );
        }
        Err(e) => {
            let outcome = err_outcome(&e);
            let reason = e.to_string();
            log_event(
                &shared.stats,
                outcome,
                LogEvent {
                    event: "CLOSE",
                    client_addr,
                    target: "-",
                    method: "-",
                    request_target: "-",
                    version: "-",
                    outcome,
                    sent: ctx.bytes_sent(),
                    received: ctx.bytes_received(),
                    reason: Some(&reason),
                },
            );
        }
    }
}

async fn drive(conn: &mut BufferedConnection, ctx: &Arc<ConnectionContext>, shared: &HandlerShared) -> Result<Summary, HandlerError> {
    ctx.set_stage(Stage::Reading);
    let req = match timeout(HEAD_READ_TIMEOUT, parser::parse_head(conn)).await {
        Err(_) => {
            write_simple(conn, 408, "Request Timeout", "request head not received in time").await?;
            return Err(HandlerError::HeadTimeout);
        }
        Ok(Err(ParseError::VersionUnsupported)) => {
            write_simple(conn, 505, "HTTP Version Not Supported", "unsupported HTTP version").await?;
            return Err(HandlerError::Parse(ParseError::VersionUnsupported));
        }
        Ok(Err(e)) => {
            write_simple(conn, 400, "Bad Request", "malformed request").await?;
            return Err(HandlerError::Parse(e));
        }
        Ok(Ok(req)) => req,
    };

    let target = format!("{}:{}", req.decomposed.host, req.decomposed.port);

    ctx.set_stage(Stage::Gating);
    if let AclDecision::Deny(class) = shared.acl.check(&req.decomposed.host) {
        write_simple(conn, 403, "Forbidden", &format!("denied by {class:?} rule")).await?;
        return Err(HandlerError::Blocked(class));
    }
    match shared.auth.check(&req) {
        AuthDecision::Allow => {}
        AuthDecision::Challenge => {
            write_auth_challenge(conn).await?;
            return Err(HandlerError::Challenge);
        }
        AuthDecision::AuthFailed => {
            write_auth_challenge(conn).await?;
            return Err(HandlerError::AuthFailed);
        }
    }

    if req.is_connect() {
        ctx.set_stage(Stage::Tunneling);
        return tunnel(conn, ctx, &req, &target).await;
    }

    ctx.set_stage(Stage::Forwarding);
    if req.method.eq_ignore_ascii_case("GET") {
        if let Some(cache) = &shared.cache {
            return cached_forward(conn, ctx, &req, &target, cache).await;
        }
    }
    forward(conn, ctx, &req, &target, None, None).await
}

async fn tunnel(conn: &mut BufferedConnection, ctx: &Arc<ConnectionContext>, req: &Request, target: &str) -> Result<Summary, HandlerError> {
    let mut upstream = match dial(target).await {
        Ok(s) => s,
        Err(e) => {
            write_simple(conn, 502, "Bad Gateway", "failed to reach upstream").await?;
            return Err(e);
        }
    };
    conn.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;
    relay::relay(conn, &mut upstream, ctx).await?;
    Ok(Summary {
        event: "TUNNEL",
        outcome: "ALLOWED",
        method: req.method.clone(),
        request_target: req.target.clone(),
        version: req.version.as_str(),
        target: target.to_string(),
    })
}

fn canonical_key(req: &Request) -> String {
    let scheme = req.decomposed.scheme.clone().unwrap_or_else(|| "http".to_string());
    format!("{}://{}:{}{}", scheme, req.decomposed.host, req.decomposed.port, req.decomposed.path)
}

async fn cached_forward(
    conn: &mut BufferedConnection,
    ctx: &Arc<ConnectionContext>,
    req: &Request,
    target: &str,
    cache: &LruResponseCache,
) -> Result<Summary, HandlerError> {
    let key = canonical_key(req);
    let mut lookup = cache.lookup(&key).await;
    loop {
        match lookup {
            Lookup::Hit(bytes) => {
                conn.write_all(&bytes).await?;
                ctx.add_sent(bytes.len() as u64);
                cache.touch(&key).await;
                return Ok(Summary {
                    event: "CACHE",
                    outcome: "HIT",
                    method: req.method.clone(),
                    request_target: req.target.clone(),
                    version: req.version.as_str(),
                    target: target.to_string(),
                });
            }
            Lookup::Pending(p) => {
                lookup = p.wait().await;
            }
            Lookup::Miss(handle) => {
                return forward(conn, ctx, req, target, Some(handle), Some(cache)).await;
            }
        }
    }
}

/// Dials `host:port`, with a 10s timeout, mapping failures into the
/// handler's disposition table.
async fn dial(target: &str) -> Result<TcpStream, HandlerError> {
    match timeout(DIAL_TIMEOUT, TcpStream::connect(target)).await {
        Err(_) => Err(HandlerError::DialTimeout(target.to_string())),
        Ok(Err(e)) => Err(HandlerError::DialFailed(target.to_string(), e)),
        Ok(Ok(stream)) => Ok(stream),
    }
}

async fn forward(
    conn: &mut BufferedConnection,
    ctx: &Arc<ConnectionContext>,
    req: &Request,
    target: &str,
    mut fill: Option<FillHandle>,
    cache: Option<&LruResponseCache>,
) -> Result<Summary, HandlerError> {
    let upstream = match dial(target).await {
        Ok(s) => s,
        Err(e) => {
            if let Some(handle) = fill.take() {
                cache.unwrap().complete(handle, FillOutcome::Abandon).await;
            }
            write_simple(conn, 502, "Bad Gateway", "failed to reach upstream").await?;
            return Err(e);
        }
    };
    let mut upstream_conn = BufferedConnection::new(upstream, STREAM_CHUNK);

    if let Err(e) = upstream_conn.write_all(&parser::serialize_forward(req)).await {
        abandon(&mut fill, cache).await;
        return Err(e.into());
    }

    if req.body_len > 0 {
        match conn.read_exact_bytes(req.body_len).await {
            Ok(body) => {
                ctx.add_received(body.len() as u64);
                if let Err(e) = upstream_conn.write_all(&body).await {
                    abandon(&mut fill, cache).await;
                    return Err(e.into());
                }
            }
            Err(e) => {
                abandon(&mut fill, cache).await;
                return Err(e.into());
            }
        }
    } else if req.chunked {
        if let Err(e) = stream_chunked_body(conn, &mut upstream_conn, ctx).await {
            abandon(&mut fill, cache).await;
            return Err(e);
        }
    }

    let head = match timeout(FORWARD_RESPONSE_TIMEOUT, read_response_head(&mut upstream_conn)).await {
        Err(_) => {
            abandon(&mut fill, cache).await;
            return Err(HandlerError::ResponseTimeout);
        }
        Ok(Err(e)) => {
            abandon(&mut fill, cache).await;
            return Err(e);
        }
        Ok(Ok(h)) => h,
    };

    let max_entry = cache.map(|c| c.max_entry_bytes()).unwrap_or(0);
    let cacheable = fill.is_some()
        && req.method.eq_ignore_ascii_case("GET")
        && head.status_code == 200
        && !head.no_store
        && head
            .content_length
            .map(|n| head.header_block.len() + n <= max_entry)
            .unwrap_or(false);

    if !cacheable {
        abandon(&mut fill, cache).await;
    }

    if let Err(e) = conn.write_all(&head.header_block).await {
        abandon(&mut fill, cache).await;
        return Err(e.into());
    }
    ctx.add_sent(head.header_block.len() as u64);

    let mut collected: Option<Vec<u8>> = if fill.is_some() { Some(head.header_block.clone()) } else { None };

    let stream_result = match head.content_length {
        Some(len) => stream_fixed_body(&mut upstream_conn, conn, len, ctx, &mut collected, max_entry).await,
        None => stream_until_eof(&mut upstream_conn, conn, ctx).await,
    };

    if let Err(e) = stream_result {
        abandon(&mut fill, cache).await;
        return Err(e);
    }

    if let Some(handle) = fill.take() {
        match collected {
            Some(bytes) => cache.unwrap().complete(handle, FillOutcome::Response(Bytes::from(bytes))).await,
            None => cache.unwrap().complete(handle, FillOutcome::Abandon).await,
        }
    }

    Ok(Summary {
        event: "FORWARD",
        outcome: "ALLOWED",
        method: req.method.clone(),
        request_target: req.target.clone(),
        version: req.version.as_str(),
        target: target.to_string(),
    })
}

async fn abandon(fill: &mut Option<FillHandle>, cache: Option<&LruResponseCache>) {
    if let Some(handle) = fill.take() {
        cache.unwrap().complete(handle, FillOutcome::Abandon).await;
    }
}

async fn stream_fixed_body(
    from: &mut BufferedConnection,
    to: &mut BufferedConnection,
    mut remaining: usize,
    ctx: &Arc<ConnectionContext>,
    collected: &mut Option<Vec<u8>>,
    max_entry: usize,
) -> Result<(), HandlerError> {
    let mut buf = vec![0u8; STREAM_CHUNK];
    while remaining > 0 {
        let take = remaining.min(buf.len());
        let n = AsyncReadExt::read(from, &mut buf[..take]).await?;
        if n == 0 {
            return Err(HandlerError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "upstream closed mid-body")));
        }
        to.write_all(&buf[..n]).await?;
        ctx.add_sent(n as u64);
        remaining -= n;
        if let Some(acc) = collected.as_mut() {
            if acc.len() + n <= max_entry {
                acc.extend_from_slice(&buf[..n]);
            } else {
                *collected = None;
            }
        }
    }
    Ok(())
}

async fn stream_until_eof(from: &mut BufferedConnection, to: &mut BufferedConnection, ctx: &Arc<ConnectionContext>) -> Result<(), HandlerError> {
    let mut buf = vec![0u8; STREAM_CHUNK];
    loop {
        let n = AsyncReadExt::read(from, &mut buf).await?;
        if n == 0 {
            break;
        }
        to.write_all(&buf[..n]).await?;
        ctx.add_sent(n as u64);
    }
    Ok(())
}

/// Relays a `Transfer-Encoding: chunked` request body from `from` to `to`
/// without interpreting chunk contents — only the chunk-size framing is
/// parsed, so the terminating zero-size chunk can be recognized.
async fn stream_chunked_body(from: &mut BufferedConnection, to: &mut BufferedConnection, ctx: &Arc<ConnectionContext>) -> Result<(), HandlerError> {
    let mut budget = parser::MAX_HEAD_SIZE;
    loop {
        let size_line = from.read_line_bounded(&mut budget).await?;
        let size_text = std::str::from_utf8(&size_line)
            .map_err(|_| HandlerError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid chunk size")))?;
        let size_hex = size_text.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|_| HandlerError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid chunk size")))?;

        to.write_all(&size_line).await?;
        to.write_all(b"\r\n").await?;
        ctx.add_received(size_line.len() as u64 + 2);

        if size == 0 {
            loop {
                let trailer = from.read_line_bounded(&mut budget).await?;
                to.write_all(&trailer).await?;
                to.write_all(b"\r\n").await?;
                if trailer.is_empty() {
                    break;
                }
            }
            return Ok(());
        }

        let chunk = from.read_exact_bytes(size).await?;
        to.write_all(&chunk).await?;
        ctx.add_received(chunk.len() as u64);
        let crlf = from.read_exact_bytes(2).await?;
        to.write_all(&crlf).await?;
    }
}

struct ResponseHead {
    header_block: Vec<u8>,
    status_code: u16,
    content_length: Option<usize>,
    no_store: bool,
}

async fn read_response_head(conn: &mut BufferedConnection) -> Result<ResponseHead, HandlerError> {
    let mut budget = parser::MAX_HEAD_SIZE;
    let mut raw = Vec::new();

    let status_line = conn.read_line_bounded(&mut budget).await?;
    raw.extend_from_slice(&status_line);
    raw.extend_from_slice(b"\r\n");
    let status_code = parse_status_code(&status_line)?;

    let mut content_length = None;
    let mut no_store = false;
    loop {
        let line = conn.read_line_bounded(&mut budget).await?;
        if line.is_empty() {
            raw.extend_from_slice(b"\r\n");
            break;
        }
        raw.extend_from_slice(&line);
        raw.extend_from_slice(b"\r\n");
        if let Some(pos) = line.iter().position(|&b| b == b':') {
            let name = String::from_utf8_lossy(&line[..pos]);
            let value = String::from_utf8_lossy(&line[pos + 1..]).trim().to_string();
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse::<usize>().ok();
            } else if name.eq_ignore_ascii_case("cache-control") {
                let lower = value.to_lowercase();
                if lower.contains("no-store") || lower.contains("private") {
                    no_store = true;
                }
            }
        }
    }

    Ok(ResponseHead {
        header_block: raw,
        status_code,
        content_length,
        no_store,
    })
}

fn parse_status_code(status_line: &[u8]) -> Result<u16, HandlerError> {
    let text = std::str::from_utf8(status_line)
        .map_err(|_| HandlerError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "non-UTF8 status line")))?;
    text.split(' ')
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| HandlerError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed status line")))
}

async fn write_simple(conn: &mut BufferedConnection, status: u16, reason: &str, detail: &str) -> std::io::Result<()> {
    let body = format!("<html><body><h1>{status} {reason}</h1><p>{detail}</p></body></html>");
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    conn.write_all(head.as_bytes()).await?;
    conn.write_all(body.as_bytes()).await
}

async fn write_auth_challenge(conn: &mut BufferedConnection) -> std::io::Result<()> {
    conn.write_all(
        b"HTTP/1.1 407 Proxy Authentication Required\r\n\
          Proxy-Authenticate: Basic realm=\"proxy\"\r\n\
          Content-Length: 0\r\n\
          Connection: close\r\n\r\n",
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::auth::AuthGate;
    use crate::proxy::acl::Acl;
    use crate::proxy::cache::LruResponseCache;
    use tokio::net::TcpListener;

    async fn shared_no_auth_no_acl() -> Arc<HandlerShared> {
        Arc::new(HandlerShared {
            acl: Arc::new(Acl::empty()),
            auth: Arc::new(AuthGate::disabled()),
            cache: None,
            stats: Arc::new(Stats::new()),
            buffer_size: 4096,
        })
    }

    #[tokio::test]
    async fn s1_http_forward_returns_upstream_bytes_verbatim() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        let origin_task = tokio::spawn(async move {
            let (mut s, _) = origin.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let n = tokio::io::AsyncReadExt::read(&mut s, &mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).starts_with("GET / HTTP/1.1\r\n"));
            s.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi").await.unwrap();
        });

        let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_listener.local_addr().unwrap();
        let shared = shared_no_auth_no_acl().await;

        let server_task = tokio::spawn(async move {
            let (stream, addr) = proxy_listener.accept().await.unwrap();
            handle(stream, addr, shared).await;
        });

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let request = format!("GET http://{origin_addr}/ HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n");
        client.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8(response).unwrap();
        assert!(text.ends_with("hi"));
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));

        origin_task.await.unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn s3_blocked_exact_host_never_dials_upstream() {
        let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_listener.local_addr().unwrap();

        let dir = std::env::temp_dir().join(format!("handler-acl-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("blacklist.txt");
        std::fs::write(&path, "example.com\n").unwrap();
        let acl = Acl::load_from_file(&path).unwrap();
        let _ = std::fs::remove_dir_all(&dir);

        let shared = Arc::new(HandlerShared {
            acl: Arc::new(acl),
            auth: Arc::new(AuthGate::disabled()),
            cache: None,
            stats: Arc::new(Stats::new()),
            buffer_size: 4096,
        });

        let server_task = tokio::spawn(async move {
            let (stream, addr) = proxy_listener.accept().await.unwrap();
            handle(stream, addr, shared).await;
        });

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client
            .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn s2_connect_dispatches_to_tunnel() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        let origin_task = tokio::spawn(async move {
            let (mut s, _) = origin.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = tokio::io::AsyncReadExt::read(&mut s, &mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"ping");
            s.write_all(b"pong").await.unwrap();
        });

        let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_listener.local_addr().unwrap();
        let shared = shared_no_auth_no_acl().await;

        let server_task = tokio::spawn(async move {
            let (stream, addr) = proxy_listener.accept().await.unwrap();
            handle(stream, addr, shared).await;
        });

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let request = format!("CONNECT {origin_addr} HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n");
        client.write_all(request.as_bytes()).await.unwrap();

        let mut head = [0u8; 64];
        let n = client.read(&mut head).await.unwrap();
        assert_eq!(&head[..n], b"HTTP/1.1 200 Connection Established\r\n\r\n");

        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        drop(client);
        origin_task.await.unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn s5_auth_challenge_on_missing_proxy_authorization() {
        let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_listener.local_addr().unwrap();

        let mut creds = std::collections::HashMap::new();
        creds.insert("admin".to_string(), "secret".to_string());
        let shared = Arc::new(HandlerShared {
            acl: Arc::new(Acl::empty()),
            auth: Arc::new(AuthGate::new(creds)),
            cache: None,
            stats: Arc::new(Stats::new()),
            buffer_size: 4096,
        });

        let server_task = tokio::spawn(async move {
            let (stream, addr) = proxy_listener.accept().await.unwrap();
            handle(stream, addr, shared).await;
        });

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client
            .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 407 Proxy Authentication Required\r\n"));
        assert!(text.contains("Proxy-Authenticate: Basic"));

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn s6_second_cached_get_skips_a_second_upstream_dial() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        let dial_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let dial_count_task = dial_count.clone();
        let origin_task = tokio::spawn(async move {
            let (mut s, _) = origin.accept().await.unwrap();
            dial_count_task.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let mut buf = [0u8; 256];
            let _ = tokio::io::AsyncReadExt::read(&mut s, &mut buf).await.unwrap();
            s.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi").await.unwrap();
        });

        let cache = LruResponseCache::new(1 << 16, 1 << 12);
        let shared = Arc::new(HandlerShared {
            acl: Arc::new(Acl::empty()),
            auth: Arc::new(AuthGate::disabled()),
            cache: Some(cache),
            stats: Arc::new(Stats::new()),
            buffer_size: 4096,
        });

        let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_listener.local_addr().unwrap();
        let shared1 = shared.clone();
        let server_task1 = tokio::spawn(async move {
            let (stream, addr) = proxy_listener.accept().await.unwrap();
            handle(stream, addr, shared1).await;
        });

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let request = format!("GET http://{origin_addr}/x HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n");
        client.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        server_task1.await.unwrap();
        origin_task.await.unwrap();

        let proxy_listener2 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr2 = proxy_listener2.local_addr().unwrap();
        let server_task2 = tokio::spawn(async move {
            let (stream, addr) = proxy_listener2.accept().await.unwrap();
            handle(stream, addr, shared).await;
        });
        let mut client2 = TcpStream::connect(proxy_addr2).await.unwrap();
        client2.write_all(request.as_bytes()).await.unwrap();
        let mut response2 = Vec::new();
        client2.read_to_end(&mut response2).await.unwrap();
        server_task2.await.unwrap();

        assert_eq!(dial_count.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(response, response2);
    }
}
