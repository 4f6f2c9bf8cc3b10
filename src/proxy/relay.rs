//! Byte relay between the two legs of a connection.
//!
//! Copies in both directions until either side closes or errors, then shuts
//! both down. The stream is never interpreted.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved by one relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes read from the client and written to the target.
    pub client_to_target: u64,
    /// Bytes read from the target and written to the client.
    pub target_to_client: u64,
}

/// Relay bytes between `client` and `target` until one side is done.
///
/// Both streams are shut down and dropped before this returns.
pub async fn shuffle<C, T>(client: C, target: T) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut target_read, mut target_write) = tokio::io::split(target);

    let mut stats = RelayStats::default();
    {
        let client_to_target =
            copy_counted(&mut client_read, &mut target_write, &mut stats.client_to_target);
        let target_to_client =
            copy_counted(&mut target_read, &mut client_write, &mut stats.target_to_client);

        // When either direction closes or errors, we're done
        tokio::select! {
            result = client_to_target => {
                if let Err(e) = result {
                    debug!("Client->target copy ended: {}", e);
                }
            }
            result = target_to_client => {
                if let Err(e) = result {
                    debug!("Target->client copy ended: {}", e);
                }
            }
        }
    }

    let _ = client_write.shutdown().await;
    let _ = target_write.shutdown().await;

    debug!(
        "Relay closed ({} bytes up, {} bytes down)",
        stats.client_to_target, stats.target_to_client
    );
    stats
}

async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, count: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *count += n as u64;
    }
}
