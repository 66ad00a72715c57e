//! Socket access for one connection: framed reads, locked writes, and the
//! soft/hard section protocol.
//!
//! All direct socket writes go through the writer lock (the soft section).
//! A keep-alive probe against an uncommitted response must pair a write
//! with a blocking reply read as one atomic unit; for that, the hard
//! section takes the reader lock first and then the writer lock, so a
//! probe round trip can never interleave with a body or header write, and
//! a body-chunk refill can never interleave with a probe. Lock order is
//! always reader before writer.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;

use crate::protocol::Frame;
use crate::{AppError, AppResult};

#[derive(Debug)]
pub struct FrameReader {
    io: OwnedReadHalf,
}

impl FrameReader {
    /// Reads one complete frame into `frame` and returns its payload
    /// length.
    ///
    /// `first_byte_timeout` bounds only the wait for the message to begin;
    /// once the first byte arrives the rest of the frame is read under the
    /// ambient socket behavior. A clean close before the first byte is
    /// reported as [`AppError::PeerClosed`]; a close mid-frame is an I/O
    /// error.
    pub async fn read_frame(
        &mut self,
        frame: &mut Frame,
        first_byte_timeout: Option<Duration>,
    ) -> AppResult<usize> {
        let header = frame.header_buf();
        let first = match first_byte_timeout {
            Some(limit) => match timeout(limit, self.io.read_exact(&mut header[..1])).await {
                Ok(res) => res,
                Err(_) => return Err(AppError::AwaitTimeout),
            },
            None => self.io.read_exact(&mut header[..1]).await,
        };
        match first {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(AppError::PeerClosed),
            Err(e) => return Err(e.into()),
        }
        self.io.read_exact(&mut header[1..]).await.map_err(|e| {
            AppError::DetailedIoError(format!("connection closed mid-frame: {}", e))
        })?;

        let payload_len = frame.verify_and_consume_header()?;
        if payload_len > 0 {
            self.io.read_exact(frame.payload_buf()).await.map_err(|e| {
                AppError::DetailedIoError(format!("connection closed mid-frame: {}", e))
            })?;
        }
        Ok(payload_len)
    }
}

#[derive(Debug)]
pub struct FrameWriter {
    io: BufWriter<OwnedWriteHalf>,
}

impl FrameWriter {
    pub async fn write_bytes(&mut self, bytes: &[u8]) -> AppResult<()> {
        self.io.write_all(bytes).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Best-effort close of the write half; errors are swallowed.
    pub async fn force_close(&mut self) {
        let _ = self.io.shutdown().await;
    }
}

#[derive(Debug)]
pub struct AjpChannel {
    reader: Mutex<FrameReader>,
    writer: Mutex<FrameWriter>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    epoch: Instant,
    last_write_ms: AtomicU64,
}

impl AjpChannel {
    pub fn new(socket: TcpStream) -> AjpChannel {
        let local_addr = socket.local_addr().ok();
        let peer_addr = socket.peer_addr().ok();
        let (read_half, write_half) = socket.into_split();
        AjpChannel {
            reader: Mutex::new(FrameReader { io: read_half }),
            writer: Mutex::new(FrameWriter {
                io: BufWriter::new(write_half),
            }),
            local_addr,
            peer_addr,
            epoch: Instant::now(),
            last_write_ms: AtomicU64::new(0),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Reads the next inbound frame. Takes the reader lock for the
    /// duration of the read.
    pub async fn read_frame(
        &self,
        frame: &mut Frame,
        first_byte_timeout: Option<Duration>,
    ) -> AppResult<usize> {
        let mut reader = self.reader.lock().await;
        reader.read_frame(frame, first_byte_timeout).await
    }

    /// Soft section: a single-frame write under the writer lock.
    pub async fn soft_write(&self, bytes: &[u8]) -> AppResult<()> {
        let mut writer = self.writer.lock().await;
        writer.write_bytes(bytes).await?;
        self.touch_write();
        Ok(())
    }

    /// Hard section entry: reader first, then writer. The caller holds
    /// both guards across a full write-then-read round trip.
    pub async fn hard_section(&self) -> (MutexGuard<'_, FrameReader>, MutexGuard<'_, FrameWriter>) {
        let reader = self.reader.lock().await;
        let writer = self.writer.lock().await;
        (reader, writer)
    }

    /// Reader lock alone, for round trips initiated by the service task
    /// (body-chunk refills): hold this, soft-write the request, then read
    /// the reply while still holding it.
    pub async fn reader_lock(&self) -> MutexGuard<'_, FrameReader> {
        self.reader.lock().await
    }

    pub async fn force_close(&self) {
        let mut writer = self.writer.lock().await;
        writer.force_close().await;
    }

    pub fn touch_write(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_write_ms.store(ms, Ordering::Relaxed);
    }

    /// Time since the last successful socket write.
    pub fn write_idle(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_write_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }
}
