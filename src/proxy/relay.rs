use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::sleep;

use super::context::ConnectionContext;

const BUF_SIZE: usize = 4096;
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("no bytes in either direction for {0:?}")]
    IdleTimeout(Duration),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct RelayOutcome {
    pub bytes_ab: u64,
    pub bytes_ba: u64,
}

/// Bidirectional byte pump between `a` and `b` (e.g. client<->upstream for a
/// CONNECT tunnel), using a fixed 4 KiB buffer per direction. EOF on one
/// direction half-closes the other (shutdown-write) and the remaining
/// direction keeps draining until it too ends. Any read/write error, or 60s
/// of total inactivity, forcibly tears down both sides.
pub async fn relay<A, B>(a: &mut A, b: &mut B, ctx: &Arc<ConnectionContext>) -> Result<RelayOutcome, RelayError>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf_ab = vec![0u8; BUF_SIZE];
    let mut buf_ba = vec![0u8; BUF_SIZE];
    let mut a_to_b_open = true;
    let mut b_to_a_open = true;
    let mut bytes_ab: u64 = 0;
    let mut bytes_ba: u64 = 0;

    loop {
        if !a_to_b_open && !b_to_a_open {
            return Ok(RelayOutcome { bytes_ab, bytes_ba });
        }

        let idle = sleep(IDLE_TIMEOUT);
        tokio::pin!(idle);

        tokio::select! {
            result = a.read(&mut buf_ab), if a_to_b_open => {
                match result {
                    Ok(0) => {
                        a_to_b_open = false;
                        let _ = b.shutdown().await;
                    }
                    Ok(n) => {
                        b.write_all(&buf_ab[..n]).await?;
                        bytes_ab += n as u64;
                        ctx.add_received(n as u64);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            result = b.read(&mut buf_ba), if b_to_a_open => {
                match result {
                    Ok(0) => {
                        b_to_a_open = false;
                        let _ = a.shutdown().await;
                    }
                    Ok(n) => {
                        a.write_all(&buf_ba[..n]).await?;
                        bytes_ba += n as u64;
                        ctx.add_sent(n as u64);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            _ = &mut idle => {
                let _ = a.shutdown().await;
                let _ = b.shutdown().await;
                return Err(RelayError::IdleTimeout(IDLE_TIMEOUT));
            }
        }
    }
}
