use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use crate::common::auth::AuthGate;
use crate::common::stats::Stats;
use crate::proxy::acl::Acl;
use crate::proxy::cache::LruResponseCache;
use crate::proxy::handler::{self, HandlerShared};

/// Accept loop bounded by `max_connections`, owning the shared ACL,
/// credential set, cache, and stats handed to every spawned handler.
pub struct Listener {
    shared: Arc<HandlerShared>,
    semaphore: Arc<Semaphore>,
}

impl Listener {
    pub fn new(acl: Acl, auth: AuthGate, cache: Option<LruResponseCache>, buffer_size: usize, max_connections: usize) -> Self {
        Listener {
            shared: Arc::new(HandlerShared {
                acl: Arc::new(acl),
                auth: Arc::new(auth),
                cache,
                stats: Arc::new(Stats::new()),
                buffer_size,
            }),
            semaphore: Arc::new(Semaphore::new(max_connections)),
        }
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.shared.stats
    }

    /// Accepts connections until Ctrl-C / SIGINT. When `max_connections` is
    /// already in flight, accept is paused rather than refused at the TCP
    /// level, so backpressure shows up as unaccepted connections in the
    /// kernel's listen backlog instead of a storm of RSTs.
    pub async fn run(&self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            log::info!("listening on {addr}");
        }

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("received shutdown signal");
                    break;
                }
                permit = self.semaphore.clone().acquire_owned() => {
                    let permit = match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };

                    tokio::select! {
                        result = listener.accept() => {
                            match result {
                                Ok((stream, addr)) => {
                                    let shared = self.shared.clone();
                                    tokio::spawn(async move {
                                        let join = tokio::spawn(handler::handle(stream, addr, shared));
                                        if let Err(panic) = join.await {
                                            log::error!("FATAL: handler for {addr} panicked: {panic}");
                                        }
                                        drop(permit);
                                    });
                                }
                                Err(e) => {
                                    log::error!("accept error: {e}");
                                    tokio::time::sleep(Duration::from_millis(100)).await;
                                    drop(permit);
                                }
                            }
                        }
                        _ = &mut shutdown => {
                            log::info!("received shutdown signal");
                            drop(permit);
                            break;
                        }
                    }
                }
            }
        }

        log::info!("stopped accepting new connections");
    }
}
