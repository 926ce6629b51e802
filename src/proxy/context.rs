use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Reading,
    Gating,
    Forwarding,
    Tunneling,
    Closed,
}

impl Stage {
    fn to_u8(self) -> u8 {
        match self {
            Stage::Reading => 0,
            Stage::Gating => 1,
            Stage::Forwarding => 2,
            Stage::Tunneling => 3,
            Stage::Closed => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Stage::Reading,
            1 => Stage::Gating,
            2 => Stage::Forwarding,
            3 => Stage::Tunneling,
            _ => Stage::Closed,
        }
    }
}

/// Per-connection mutable record, owned exclusively by its handler task.
/// Wrapped in an `Arc` only so the relay's two pump directions can update the
/// byte counters concurrently; it is never shared across connections.
pub struct ConnectionContext {
    pub client_addr: SocketAddr,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    start: Instant,
    stage: AtomicU8,
}

impl ConnectionContext {
    pub fn new(client_addr: SocketAddr) -> Self {
        ConnectionContext {
            client_addr,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            start: Instant::now(),
            stage: AtomicU8::new(Stage::Reading.to_u8()),
        }
    }

    pub fn set_stage(&self, stage: Stage) {
        self.stage.store(stage.to_u8(), Ordering::Relaxed);
    }

    pub fn stage(&self) -> Stage {
        Stage::from_u8(self.stage.load(Ordering::Relaxed))
    }

    pub fn add_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
