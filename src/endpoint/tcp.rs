use super::{Endpoint, RawLogger};
use crate::config::duration_from_secs;
use crate::error::{LinkError, Result};
use crate::packet::{Packet, PacketKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Upper bound on a single length-prefixed frame.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

fn default_connect_timeout() -> f64 {
    5.0
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpConfig {
    pub host: String,
    pub port: u16,
    /// Seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,
    #[serde(default = "default_true")]
    pub read_allowed: bool,
}

/// TCP client speaking 4-byte big-endian length-prefixed frames.
#[derive(Debug)]
pub struct TcpClientEndpoint {
    config: TcpConfig,
    connect_timeout: Duration,
    raw: RawLogger,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
    session: parking_lot::Mutex<CancellationToken>,
}

impl TcpClientEndpoint {
    pub fn new(config: TcpConfig, raw: RawLogger) -> Result<Self> {
        if config.host.trim().is_empty() {
            return Err(LinkError::config("tcp endpoint requires a host"));
        }
        if config.port == 0 {
            return Err(LinkError::config("tcp endpoint requires a non-zero port"));
        }
        let connect_timeout = duration_from_secs(config.connect_timeout, "connect_timeout")?;
        if connect_timeout.is_zero() {
            return Err(LinkError::config("connect_timeout must be positive"));
        }
        Ok(Self {
            config,
            connect_timeout,
            raw,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            session: parking_lot::Mutex::new(CancellationToken::new()),
        })
    }

    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Option<Vec<u8>>> {
        let length = match reader.read_u32().await {
            Ok(length) => length as usize,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if length > MAX_FRAME_SIZE {
            return Err(LinkError::protocol(format!(
                "Frame length {length} exceeds maximum of {MAX_FRAME_SIZE}"
            )));
        }
        let mut buffer = vec![0u8; length];
        reader.read_exact(&mut buffer).await?;
        Ok(Some(buffer))
    }

    async fn write_frame(&self, length: u32, data: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| LinkError::connection(format!("Not connected to {}:{}", self.config.host, self.config.port)))?;
        writer.write_u32(length).await?;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Drops both socket halves. Cancelling the session first releases a
    /// read or write blocked on a stalled peer, so the locks come free.
    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.session.lock().cancel();
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await.ok();
        }
        self.reader.lock().await.take();
    }
}

#[async_trait]
impl Endpoint for TcpClientEndpoint {
    async fn connect(&self) -> Result<()> {
        let address = format!("{}:{}", self.config.host, self.config.port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                LinkError::Io(std::io::Error::new(
                    ErrorKind::TimedOut,
                    format!("Connect timeout to {address}"),
                ))
            })??;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(read_half);
        *self.writer.lock().await = Some(write_half);
        *self.session.lock() = CancellationToken::new();
        self.connected.store(true, Ordering::SeqCst);
        debug!("Connected to {}", address);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.close().await;
        Ok(())
    }

    async fn read(&self) -> Result<Option<Packet>> {
        let session = self.session.lock().clone();
        let mut guard = self.reader.lock().await;
        let Some(reader) = guard.as_mut() else {
            return Ok(None);
        };
        let frame = tokio::select! {
            () = session.cancelled() => return Ok(None),
            frame = Self::read_frame(reader) => frame?,
        };
        match frame {
            Some(buffer) => {
                self.raw.log_read(&buffer);
                Ok(Some(Packet::unidentified(PacketKind::Telemetry, buffer)))
            }
            None => {
                // Peer closed: release our write half too
                guard.take();
                drop(guard);
                self.close().await;
                Ok(None)
            }
        }
    }

    async fn write(&self, packet: &Packet) -> Result<()> {
        self.write_raw(&packet.buffer).await
    }

    async fn write_raw(&self, data: &[u8]) -> Result<()> {
        let length = u32::try_from(data.len())
            .ok()
            .filter(|l| *l as usize <= MAX_FRAME_SIZE)
            .ok_or_else(|| LinkError::protocol(format!("Frame of {} bytes too large", data.len())))?;
        let session = self.session.lock().clone();
        tokio::select! {
            () = session.cancelled() => {
                return Err(LinkError::connection(format!(
                    "Write to {}:{} interrupted by disconnect",
                    self.config.host, self.config.port
                )));
            }
            result = self.write_frame(length, data) => result?,
        }
        self.raw.log_write(data);
        Ok(())
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn read_allowed(&self) -> bool {
        self.config.read_allowed
    }

    fn raw_logger(&self) -> &RawLogger {
        &self.raw
    }
}
