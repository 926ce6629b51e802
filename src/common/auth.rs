use base64::{engine::general_purpose, Engine as _};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::proxy::parser::Request;

#[derive(Error, Debug)]
pub enum AuthLoadError {
    #[error("failed to read credential file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid credential on line {0}: missing ':' separator")]
    MissingSeparator(usize),
}

/// Outcome of gating a request against the configured credential set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Not configured, or the header matched a known credential.
    Allow,
    /// No `Proxy-Authorization` header was present.
    Challenge,
    /// A header was present but didn't validate.
    AuthFailed,
}

/// Validates `Proxy-Authorization: Basic` against an immutable credential set
/// loaded once at startup. Active only when at least one credential is
/// configured; otherwise every request passes through.
pub struct AuthGate {
    credentials: HashMap<String, String>,
}

impl AuthGate {
    pub fn disabled() -> Self {
        AuthGate {
            credentials: HashMap::new(),
        }
    }

    pub fn new(credentials: HashMap<String, String>) -> Self {
        AuthGate { credentials }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AuthLoadError> {
        let contents = fs::read_to_string(path)?;
        let mut credentials = HashMap::new();

        for (idx, raw_line) in contents.lines().enumerate() {
            let trimmed = raw_line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let (user, pass) = trimmed
                .split_once(':')
                .ok_or(AuthLoadError::MissingSeparator(idx + 1))?;
            credentials.insert(user.to_string(), pass.to_string());
        }

        Ok(AuthGate::new(credentials))
    }

    pub fn is_active(&self) -> bool {
        !self.credentials.is_empty()
    }

    /// Validates the request's `Proxy-Authorization` header, if auth is active.
    pub fn check(&self, req: &Request) -> Decision {
        if !self.is_active() {
            return Decision::Allow;
        }

        let header = match req.header("Proxy-Authorization") {
            Some(h) => h,
            None => return Decision::Challenge,
        };

        let encoded = match split_scheme(header) {
            Some(encoded) => encoded,
            None => return Decision::AuthFailed,
        };

        let decoded = match general_purpose::STANDARD.decode(encoded.trim()) {
            Ok(d) => d,
            Err(_) => return Decision::AuthFailed,
        };
        let credentials = match String::from_utf8(decoded) {
            Ok(s) => s,
            Err(_) => return Decision::AuthFailed,
        };
        let (user, pass) = match credentials.split_once(':') {
            Some(pair) => pair,
            None => return Decision::AuthFailed,
        };

        match self.credentials.get(user) {
            Some(expected) if constant_time_eq(pass.as_bytes(), expected.as_bytes()) => Decision::Allow,
            _ => Decision::AuthFailed,
        }
    }
}

/// Splits a `Basic <payload>` header, accepting the scheme case-insensitively.
fn split_scheme(header: &str) -> Option<&str> {
    let mut parts = header.splitn(2, ' ');
    let scheme = parts.next()?;
    let rest = parts.next()?;
    if scheme.eq_ignore_ascii_case("basic") {
        Some(rest)
    } else {
        None
    }
}

/// Constant-time byte comparison so a timing side-channel can't be used to
/// guess a password one character at a time.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
