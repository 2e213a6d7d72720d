use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::time::timeout;
use tracing::trace;

use crate::core::frame::{encode_frame, encode_heartbeat, Frame};

const INITIAL_BUFFER_SIZE: usize = 8 * 1024;
/// Upper bound on bytes batched from the channel before a flush.
const MAX_BATCH_BYTES: usize = 64 * 1024;

/// Outbound half of a session.
///
/// Drains `rx` onto the socket and writes a heart-beat EOL whenever nothing was
/// written for `heartbeat`. Returns once every sender is gone and the channel
/// is empty.
pub(crate) async fn write_loop<W>(
    writer: W,
    rx: flume::Receiver<Frame>,
    heartbeat: Option<Duration>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);
    let mut buf = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);

    loop {
        let next = match heartbeat {
            Some(interval) => match timeout(interval, rx.recv_async()).await {
                Ok(received) => received.ok(),
                Err(_) => {
                    trace!("sending heart-beat");
                    encode_heartbeat(&mut buf);
                    flush(&mut writer, &mut buf).await?;
                    continue;
                }
            },
            None => rx.recv_async().await.ok(),
        };

        let Some(frame) = next else {
            break;
        };
        encode_frame(&frame, &mut buf);
        while buf.len() < MAX_BATCH_BYTES {
            match rx.try_recv() {
                Ok(frame) => encode_frame(&frame, &mut buf),
                Err(_) => break,
            }
        }
        flush(&mut writer, &mut buf).await?;
    }

    writer.flush().await?;
    // The peer may already be gone.
    let _ = writer.shutdown().await;
    Ok(())
}

async fn flush<W>(writer: &mut BufWriter<W>, buf: &mut BytesMut) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&buf[..]).await?;
    writer.flush().await?;
    buf.clear();
    Ok(())
}
