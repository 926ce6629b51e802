use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-lifetime counters, owned by the listener and shared (by reference)
/// with every spawned handler.
#[derive(Default)]
pub struct Stats {
    accepted: AtomicU64,
    allowed: AtomicU64,
    blocked: AtomicU64,
    auth_failed: AtomicU64,
    completed: AtomicU64,
    errors: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Stats::default()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
    pub fn allowed(&self) -> u64 {
        self.allowed.load(Ordering::Relaxed)
    }
    pub fn blocked(&self) -> u64 {
        self.blocked.load(Ordering::Relaxed)
    }
    pub fn auth_failed(&self) -> u64 {
        self.auth_failed.load(Ordering::Relaxed)
    }
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_blocked(&self) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_auth_failed(&self) {
        self.auth_failed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// One line describing a completed (or aborted) connection, shaped as
/// `TIMESTAMP | LEVEL | EVENT | client -> target | method target version | outcome | sent=N recv=M [reason=…]`.
/// The timestamp and level are supplied by the `log` backend's own pattern
/// encoder, so only the fields after `EVENT` are rendered here.
pub struct LogEvent<'a> {
    pub event: &'a str,
    pub client_addr: SocketAddr,
    pub target: &'a str,
    pub method: &'a str,
    pub request_target: &'a str,
    pub version: &'a str,
    pub outcome: &'a str,
    pub sent: u64,
    pub received: u64,
    pub reason: Option<&'a str>,
}

impl fmt::Display for LogEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | {} -> {} | {} {} {} | {} | sent={} recv={}",
            self.event,
            self.client_addr,
            self.target,
            self.method,
            self.request_target,
            self.version,
            self.outcome,
            self.sent,
            self.received,
        )?;
        if let Some(reason) = self.reason {
            write!(f, " reason={reason}")?;
        }
        Ok(())
    }
}

/// Emits a [`LogEvent`] at the severity matching its outcome and bumps the
/// matching counter.
pub fn log_event(stats: &Stats, outcome: &str, event: LogEvent<'_>) {
    match outcome {
        "ALLOWED" | "HIT" => {
            stats.record_allowed();
            log::info!("{event}");
        }
        "BLOCKED" => {
            stats.record_blocked();
            log::warn!("{event}");
        }
        "AUTH_FAILED" | "CHALLENGE" => {
            stats.record_auth_failed();
            log::warn!("{event}");
        }
        "ERROR" => {
            stats.record_error();
            log::error!("{event}");
        }
        _ => log::info!("{event}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_the_pipe_delimited_shape() {
        let event = LogEvent {
            event: "COMPLETE",
            client_addr: "127.0.0.1:9".parse().unwrap(),
            target: "example.org:80",
            method: "GET",
            request_target: "/",
            version: "HTTP/1.1",
            outcome: "ALLOWED",
            sent: 2,
            received: 0,
            reason: None,
        };
        let line = event.to_string();
        assert_eq!(line, "COMPLETE | 127.0.0.1:9 -> example.org:80 | GET / HTTP/1.1 | ALLOWED | sent=2 recv=0");
    }

    #[test]
    fn appends_reason_when_present() {
        let event = LogEvent {
            event: "CLOSE",
            client_addr: "127.0.0.1:9".parse().unwrap(),
            target: "example.com:80",
            method: "GET",
            request_target: "/",
            version: "HTTP/1.1",
            outcome: "BLOCKED",
            sent: 0,
            received: 0,
            reason: Some("exact"),
        };
        assert!(event.to_string().ends_with("reason=exact"));
    }

    #[test]
    fn counters_increment_independently() {
        let stats = Stats::new();
        stats.record_accepted();
        stats.record_allowed();
        stats.record_allowed();
        stats.record_blocked();
        assert_eq!(stats.accepted(), 1);
        assert_eq!(stats.allowed(), 2);
        assert_eq!(stats.blocked(), 1);
        assert_eq!(stats.auth_failed(), 0);
    }
}
