use thiserror::Error;

use crate::net::conn::BufferedConnection;

/// Maximum size, in bytes, of a request head (request line + headers + CRLFCRLF).
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("request head exceeds {MAX_HEAD_SIZE} bytes")]
    HeadTooLarge,
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("malformed header line")]
    MalformedHeader,
    #[error("obsolete line folding is not supported")]
    ObsoleteFolding,
    #[error("unsupported HTTP version")]
    VersionUnsupported,
    #[error("request specifies both Content-Length and Transfer-Encoding")]
    ConflictingBodyLength,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("invalid request-target: {0}")]
    InvalidTarget(String),
    #[error("non-UTF8 request head")]
    InvalidUtf8,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "HTTP/1.1" => Some(Version::Http11),
            "HTTP/1.0" => Some(Version::Http10),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http11 => "HTTP/1.1",
            Version::Http10 => "HTTP/1.0",
        }
    }
}

/// The `{scheme, host, port, path}` decomposition of a request-target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetParts {
    pub scheme: Option<String>,
    pub host: String,
    pub port: u16,
    /// path + query, or empty for a CONNECT target.
    pub path: String,
}

/// A parsed HTTP/1.1 request head.
#[derive(Clone, Debug)]
pub struct Request {
    pub method: String,
    /// Raw request-target bytes, exactly as received.
    pub target: String,
    pub version: Version,
    /// Ordered `(name, value)` pairs, preserving original case and duplicates.
    pub headers: Vec<(String, String)>,
    pub body_len: usize,
    pub chunked: bool,
    pub decomposed: TargetParts,
}

impl Request {
    /// Case-insensitive header lookup, returning the first match in order.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

/// Incrementally parses an HTTP/1.1 request head from a (possibly fragmented)
/// connection. Consumes bytes up to and including the terminating CRLFCRLF.
pub async fn parse_head(conn: &mut BufferedConnection) -> Result<Request, ParseError> {
    let mut budget = MAX_HEAD_SIZE;

    let request_line = read_line_str(conn, &mut budget).await?;
    let parts: Vec<&str> = request_line.split(' ').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(ParseError::MalformedRequestLine);
    }
    let method = parts[0].to_string();
    let target = parts[1].to_string();
    let version = Version::parse(parts[2]).ok_or(ParseError::VersionUnsupported)?;

    let mut headers = Vec::new();
    loop {
        let line = read_line_str(conn, &mut budget).await?;
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(ParseError::ObsoleteFolding);
        }
        let colon = line.find(':').ok_or(ParseError::MalformedHeader)?;
        let name = line[..colon].trim_end().to_string();
        if name.is_empty() {
            return Err(ParseError::MalformedHeader);
        }
        let value = line[colon + 1..].trim_start().to_string();
        headers.push((name, value));
    }

    let has_content_length = headers.iter().any(|(n, _)| n.eq_ignore_ascii_case("content-length"));
    let has_transfer_encoding = headers.iter().any(|(n, _)| n.eq_ignore_ascii_case("transfer-encoding"));
    if has_content_length && has_transfer_encoding {
        return Err(ParseError::ConflictingBodyLength);
    }

    let body_len = match headers.iter().find(|(n, _)| n.eq_ignore_ascii_case("content-length")) {
        Some((_, v)) => v.trim().parse::<usize>().map_err(|_| ParseError::InvalidContentLength)?,
        None => 0,
    };
    let chunked = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("transfer-encoding"))
        .map(|(_, v)| v.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false);

    let host_header = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("host"))
        .map(|(_, v)| v.as_str());
    let decomposed = decompose_target(&method, &target, host_header)?;

    Ok(Request {
        method,
        target,
        version,
        headers,
        body_len,
        chunked,
        decomposed,
    })
}

async fn read_line_str(conn: &mut BufferedConnection, budget: &mut usize) -> Result<String, ParseError> {
    let bytes = conn.read_line_bounded(budget).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::InvalidData {
            ParseError::HeadTooLarge
        } else {
            ParseError::Io(e)
        }
    })?;
    String::from_utf8(bytes).map_err(|_| ParseError::InvalidUtf8)
}

/// Splits a request-target into `{scheme, host, port, path}` per §4.1: absolute-URI
/// form (`scheme://host[:port][/path]`), CONNECT authority-form (`host:port`), or
/// origin-form (`/path`, with the `Host` header supplying authority).
fn decompose_target(method: &str, target: &str, host_header: Option<&str>) -> Result<TargetParts, ParseError> {
    if let Some((scheme, rest)) = target.split_once("://") {
        let scheme = scheme.to_lowercase();
        let default_port = default_port_for_scheme(&scheme);
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, "/".to_string()),
        };
        let (host, port) = split_host_port(authority, default_port)?;
        return Ok(TargetParts {
            scheme: Some(scheme),
            host,
            port,
            path,
        });
    }

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_host_port(target, 443)?;
        return Ok(TargetParts {
            scheme: None,
            host,
            port,
            path: String::new(),
        });
    }

    let authority = host_header.ok_or_else(|| ParseError::InvalidTarget("missing Host header".to_string()))?;
    let (host, port) = split_host_port(authority, 80)?;
    Ok(TargetParts {
        scheme: None,
        host,
        port,
        path: target.to_string(),
    })
}

fn default_port_for_scheme(scheme: &str) -> u16 {
    match scheme {
        "https" => 443,
        _ => 80,
    }
}

fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16), ParseError> {
    if authority.is_empty() {
        return Err(ParseError::InvalidTarget("empty authority".to_string()));
    }
    if authority.starts_with('[') && authority.find(']').is_none() {
        return Err(ParseError::InvalidTarget("unterminated IPv6 literal".to_string()));
    }

    let host = host_part(authority);
    let is_ipv6 = host.starts_with('[');
    let remainder = &authority[host.len()..];
    let port = match remainder.strip_prefix(':') {
        Some(p) if !p.is_empty() => p.parse::<u16>().map_err(|_| ParseError::InvalidTarget("invalid port".to_string()))?,
        _ => default_port,
    };

    Ok((if is_ipv6 { host.to_string() } else { host.to_lowercase() }, port))
}

/// Splits the bracket-aware host portion off an authority string
/// (`host:port`, `[ipv6]:port`, or a bare host), leaving any port digits for
/// the caller to parse. Infallible: an authority with no valid trailing port
/// is returned unchanged. Shared by [`split_host_port`] and the ACL's own
/// host-before-matching normalization, so the authority grammar is defined
/// in exactly one place.
pub(crate) fn host_part(authority: &str) -> &str {
    if authority.starts_with('[') {
        return match authority.find(']') {
            Some(end) => &authority[..=end],
            None => authority,
        };
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    }
}

/// Serializes a request head suitable for sending to an origin server: the
/// request-target becomes path+query only, `Proxy-Connection`/`Proxy-Authorization`
/// are dropped, `Connection: close` is set, and every other header is forwarded
/// verbatim in original order.
pub fn serialize_forward(req: &Request) -> Vec<u8> {
    let mut out = Vec::new();
    let path = if req.decomposed.path.is_empty() { "/" } else { req.decomposed.path.as_str() };
    out.extend_from_slice(format!("{} {} {}\r\n", req.method, path, req.version.as_str()).as_bytes());

    for (name, value) in &req.headers {
        if name.eq_ignore_ascii_case("proxy-connection") || name.eq_ignore_ascii_case("proxy-authorization") {
            continue;
        }
        if name.eq_ignore_ascii_case("connection") {
            continue;
        }
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out
}
