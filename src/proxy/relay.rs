use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::stats::SessionStats;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

async fn pump<R, W, F>(reader: &mut R, writer: &mut W, mut on_bytes: F) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            // Propagate the half-close; the peer may already be gone.
            let _ = writer.shutdown().await;
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        on_bytes(n as u64);
        total += n as u64;
    }
}

/// Copies both directions until each side has closed, reporting every
/// chunk to `stats`. Returns `(uploaded, downloaded)` byte totals.
pub async fn relay<C, U>(
    client: C,
    upstream: U,
    stats: &SessionStats,
    session: &str,
) -> io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite,
    U: AsyncRead + AsyncWrite,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let upload = pump(&mut client_read, &mut upstream_write, |n| stats.on_upload_bytes(session, n));
    let download = pump(&mut upstream_read, &mut client_write, |n| stats.on_download_bytes(n));

    tokio::try_join!(upload, download)
}
