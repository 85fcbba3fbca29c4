use super::{Endpoint, RawLogger};
use crate::error::{LinkError, Result};
use crate::packet::{Packet, PacketKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Writes kept for inspection; older ones are dropped.
pub const WRITE_HISTORY: usize = 64;

fn default_period_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedConfig {
    /// Delay before each generated frame.
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    /// Hex-encoded frames, replayed in order and cycled. Empty disables reads.
    #[serde(default)]
    pub frames: Vec<String>,
}

/// Loopback transport that replays canned telemetry and records writes.
#[derive(Debug)]
pub struct SimulatedEndpoint {
    period: Duration,
    frames: Vec<Vec<u8>>,
    raw: RawLogger,
    connected: AtomicBool,
    next_frame: AtomicUsize,
    session: Mutex<CancellationToken>,
    written: Mutex<VecDeque<Vec<u8>>>,
}

impl SimulatedEndpoint {
    pub fn new(config: SimulatedConfig, raw: RawLogger) -> Result<Self> {
        if config.period_ms == 0 {
            return Err(LinkError::config("simulated endpoint period_ms must be positive"));
        }
        let frames = config
            .frames
            .iter()
            .map(|f| hex::decode(f.trim()).map_err(|e| LinkError::config(format!("Invalid frame hex '{f}': {e}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            period: Duration::from_millis(config.period_ms),
            frames,
            raw,
            connected: AtomicBool::new(false),
            next_frame: AtomicUsize::new(0),
            session: Mutex::new(CancellationToken::new()),
            written: Mutex::new(VecDeque::with_capacity(WRITE_HISTORY)),
        })
    }

    /// The last [`WRITE_HISTORY`] buffers written, oldest first.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().iter().cloned().collect()
    }
}

#[async_trait]
impl Endpoint for SimulatedEndpoint {
    async fn connect(&self) -> Result<()> {
        *self.session.lock() = CancellationToken::new();
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.session.lock().cancel();
        Ok(())
    }

    async fn read(&self) -> Result<Option<Packet>> {
        if !self.connected() || self.frames.is_empty() {
            return Ok(None);
        }
        let session = self.session.lock().clone();
        tokio::select! {
            () = session.cancelled() => Ok(None),
            () = tokio::time::sleep(self.period) => {
                let index = self.next_frame.fetch_add(1, Ordering::Relaxed) % self.frames.len();
                let buffer = self.frames[index].clone();
                self.raw.log_read(&buffer);
                Ok(Some(Packet::unidentified(PacketKind::Telemetry, buffer)))
            }
        }
    }

    async fn write(&self, packet: &Packet) -> Result<()> {
        self.write_raw(&packet.buffer).await
    }

    async fn write_raw(&self, data: &[u8]) -> Result<()> {
        if !self.connected() {
            return Err(LinkError::connection("Simulated endpoint not connected"));
        }
        self.raw.log_write(data);
        let mut written = self.written.lock();
        if written.len() == WRITE_HISTORY {
            written.pop_front();
        }
        written.push_back(data.to_vec());
        Ok(())
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn read_allowed(&self) -> bool {
        !self.frames.is_empty()
    }

    fn raw_logger(&self) -> &RawLogger {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_frames_cycle_in_order() {
        let config = SimulatedConfig {
            period_ms: 10,
            frames: vec!["0001".into(), "0002".into()],
        };
        let endpoint = SimulatedEndpoint::new(config, RawLogger::new("SIM", None)).unwrap();
        endpoint.connect().await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(endpoint.read().await.unwrap().unwrap().buffer);
        }
        assert_eq!(seen, vec![vec![0, 1], vec![0, 2], vec![0, 1]]);
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let endpoint = SimulatedEndpoint::new(SimulatedConfig { period_ms: 1, frames: vec![] }, RawLogger::new("SIM", None)).unwrap();
        assert!(!endpoint.read_allowed());
        assert!(endpoint.write_raw(&[1]).await.is_err());

        endpoint.connect().await.unwrap();
        endpoint.write_raw(&[1]).await.unwrap();
        assert_eq!(endpoint.written(), vec![vec![1]]);
    }

    #[tokio::test]
    async fn test_write_history_bounded() {
        let endpoint = SimulatedEndpoint::new(SimulatedConfig { period_ms: 1, frames: vec![] }, RawLogger::new("SIM", None)).unwrap();
        endpoint.connect().await.unwrap();
        for i in 0..(WRITE_HISTORY + 10) {
            endpoint.write_raw(&(i as u32).to_be_bytes()).await.unwrap();
        }
        let written = endpoint.written();
        assert_eq!(written.len(), WRITE_HISTORY);
        assert_eq!(written[0], 10u32.to_be_bytes().to_vec());
        assert_eq!(written[WRITE_HISTORY - 1], ((WRITE_HISTORY + 9) as u32).to_be_bytes().to_vec());
    }

    #[test]
    fn test_bad_hex_is_configuration_error() {
        let config = SimulatedConfig { period_ms: 1, frames: vec!["zz".into()] };
        assert!(matches!(
            SimulatedEndpoint::new(config, RawLogger::new("SIM", None)),
            Err(LinkError::Configuration(_))
        ));
    }
}
