//! File transfers over ephemeral TCP connections.
//!
//! The offer travels on the main channel; the bytes do not. The sender
//! listens on a fresh port, the receiver connects to it, and the file is
//! streamed encrypted under the per-transfer key carried in the offer.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use dtm_core::TransferRequest;
use dtm_crypto::{CryptoError, StreamCipher};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::{error::TransportError, transport::write_frame};

/// Stream `path` to the first connection on `listener`.
pub(crate) async fn serve_file(
    listener: TcpListener,
    path: PathBuf,
    request: TransferRequest,
    chunk_size: usize,
    accept_timeout: Duration,
    mut progress: impl FnMut(u8) + Send,
) -> Result<(), TransportError> {
    let (mut stream, peer) = tokio::time::timeout(accept_timeout, listener.accept())
        .await
        .map_err(|_| {
            TransportError::Transfer(format!("receiver did not connect within {accept_timeout:?}"))
        })?
        .map_err(|e| TransportError::Transfer(format!("accept failed: {e}")))?;
    drop(listener);
    tracing::debug!(id = request.id, %peer, "transfer connection accepted");

    let mut file = File::open(&path).await.map_err(|e| file_error(&path, &e))?;
    let mut cipher = StreamCipher::new(&request.session, &request.key).map_err(key_error)?;
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut meter = Meter::new(request.size);

    let mut sent = 0u64;
    while sent < request.size {
        let want = (request.size - sent).min(buf.len() as u64) as usize;
        let n = file.read(&mut buf[..want]).await.map_err(|e| file_error(&path, &e))?;
        if n == 0 {
            return Err(TransportError::Transfer(format!(
                "{} shrank to {sent} of {} bytes",
                path.display(),
                request.size
            )));
        }
        cipher.transform_in_place(&mut buf[..n]).map_err(key_error)?;
        write_frame(&mut stream, &buf[..n]).await?;
        sent += n as u64;
        meter.update(sent, &mut progress);
    }
    meter.finish(&mut progress);

    if let Err(e) = stream.shutdown().await {
        tracing::debug!(id = request.id, error = %e, "transfer shutdown failed");
    }
    tracing::info!(id = request.id, bytes = sent, "file served");
    Ok(())
}

/// Connect to the sender at `addr` and write the decrypted file to
/// `destination`. A partial file is removed on failure.
pub(crate) async fn receive_file(
    addr: SocketAddr,
    request: TransferRequest,
    destination: PathBuf,
    chunk_size: usize,
    connect_timeout: Duration,
    mut progress: impl FnMut(u8) + Send,
) -> Result<(), TransportError> {
    let outcome =
        copy_in(addr, &request, &destination, chunk_size, connect_timeout, &mut progress).await;
    if outcome.is_err() {
        if let Err(e) = tokio::fs::remove_file(&destination).await {
            tracing::debug!(path = %destination.display(), error = %e, "partial file not removed");
        }
    }
    outcome
}

async fn copy_in(
    addr: SocketAddr,
    request: &TransferRequest,
    destination: &Path,
    chunk_size: usize,
    connect_timeout: Duration,
    progress: &mut (impl FnMut(u8) + Send),
) -> Result<(), TransportError> {
    let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Transfer(format!("{addr} did not answer")))?
        .map_err(|e| TransportError::Transfer(format!("connect to {addr} failed: {e}")))?;

    let mut file = File::create(destination).await.map_err(|e| file_error(destination, &e))?;
    let mut cipher = StreamCipher::new(&request.session, &request.key).map_err(key_error)?;
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut meter = Meter::new(request.size);

    let mut received = 0u64;
    while received < request.size {
        let want = (request.size - received).min(buf.len() as u64) as usize;
        let n = stream
            .read(&mut buf[..want])
            .await
            .map_err(|e| TransportError::Transfer(format!("read failed: {e}")))?;
        if n == 0 {
            return Err(TransportError::Transfer(format!(
                "sender closed after {received} of {} bytes",
                request.size
            )));
        }
        cipher.transform_in_place(&mut buf[..n]).map_err(key_error)?;
        file.write_all(&buf[..n]).await.map_err(|e| file_error(destination, &e))?;
        received += n as u64;
        meter.update(received, progress);
    }
    file.flush().await.map_err(|e| file_error(destination, &e))?;
    meter.finish(progress);

    tracing::info!(id = request.id, bytes = received, "file received");
    Ok(())
}

fn file_error(path: &Path, error: &std::io::Error) -> TransportError {
    TransportError::Transfer(format!("{}: {error}", path.display()))
}

fn key_error(error: CryptoError) -> TransportError {
    TransportError::Transfer(format!("transfer cipher: {error}"))
}

/// Reports each whole percentage once.
struct Meter {
    total: u64,
    last: Option<u8>,
}

impl Meter {
    fn new(total: u64) -> Self {
        Self { total, last: None }
    }

    fn update(&mut self, done: u64, progress: &mut impl FnMut(u8)) {
        let percent = if self.total == 0 { 100 } else { (done * 100 / self.total).min(100) as u8 };
        if self.last != Some(percent) {
            self.last = Some(percent);
            progress(percent);
        }
    }

    fn finish(&mut self, progress: &mut impl FnMut(u8)) {
        self.update(self.total, progress);
    }
}
