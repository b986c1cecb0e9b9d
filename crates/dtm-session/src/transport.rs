//! TCP framing for the driver.
//!
//! The engine produces whole frames and wants whole frames back, so this layer
//! only has two jobs: write a frame completely (retrying transient failures
//! with back-off) and split the inbound byte stream at packet boundaries.

use std::{io, time::Duration};

use bytes::{Bytes, BytesMut};
use dtm_proto::complete_prefix;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};

use crate::error::TransportError;

/// Write attempts before a frame is given up on.
pub const MAX_WRITE_ATTEMPTS: u32 = 8;

/// First back-off delay; doubles after every failed attempt.
pub const INITIAL_WRITE_BACKOFF: Duration = Duration::from_millis(1);

const READ_CHUNK: usize = 16 * 1024;

/// What the reader task reports back to the driver.
///
/// Each variant carries the connection generation so the driver can ignore
/// stragglers from a connection it already replaced.
#[derive(Debug)]
pub(crate) enum ReadEvent {
    /// One or more complete packets
    Chunk(u64, Bytes),
    /// The stream ended or failed
    Closed(u64, String),
}

/// Write `frame` fully, retrying `WouldBlock` and `Interrupted` with
/// exponential back-off.
pub(crate) async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    let mut attempts = 0;
    let mut backoff = INITIAL_WRITE_BACKOFF;

    while written < frame.len() {
        match writer.write(&frame[written..]).await {
            Ok(0) => {
                return Err(TransportError::Write {
                    attempts: attempts + 1,
                    reason: "connection closed".to_string(),
                });
            },
            Ok(n) => {
                written += n;
                attempts = 0;
                backoff = INITIAL_WRITE_BACKOFF;
            },
            Err(e) if is_transient(&e) => {
                attempts += 1;
                if attempts >= MAX_WRITE_ATTEMPTS {
                    return Err(TransportError::Write { attempts, reason: e.to_string() });
                }
                tracing::debug!(attempts, ?backoff, error = %e, "write stalled, backing off");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            },
            Err(e) => {
                return Err(TransportError::Write { attempts: attempts + 1, reason: e.to_string() });
            },
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| TransportError::Write { attempts: 1, reason: e.to_string() })
}

fn is_transient(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

/// Read `reader` until it ends, forwarding whole packets to `events`.
///
/// A header that can never complete is forwarded as-is so the engine's sanity
/// checks reject it, rather than buffering forever.
pub(crate) async fn read_loop<R>(
    mut reader: R,
    events: mpsc::UnboundedSender<ReadEvent>,
    max_payload: u64,
    generation: u64,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let reason = loop {
        match reader.read_buf(&mut buf).await {
            Ok(0) => break "peer closed the connection".to_string(),
            Ok(_) => {
                let ready = complete_prefix(&buf, max_payload);
                if ready > 0 {
                    let chunk = buf.split_to(ready).freeze();
                    if events.send(ReadEvent::Chunk(generation, chunk)).is_err() {
                        return;
                    }
                }
                if buf.capacity() - buf.len() < READ_CHUNK / 4 {
                    buf.reserve(READ_CHUNK);
                }
            },
            Err(e) => break e.to_string(),
        }
    };
    tracing::debug!(generation, %reason, "reader stopped");
    if events.send(ReadEvent::Closed(generation, reason)).is_err() {
        tracing::trace!(generation, "driver gone before the close was reported");
    }
}
