use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{trace, warn};

/// Captures raw transport bytes while enabled. With a directory the bytes are
/// appended to `<name>_raw_read.bin` / `<name>_raw_write.bin`.
#[derive(Debug)]
pub struct RawLogger {
    name: String,
    dir: Option<PathBuf>,
    enabled: AtomicBool,
    bytes_logged: AtomicU64,
    file_lock: Mutex<()>,
}

impl RawLogger {
    pub fn new(name: &str, dir: Option<PathBuf>) -> Self {
        Self {
            name: name.to_lowercase(),
            dir,
            enabled: AtomicBool::new(false),
            bytes_logged: AtomicU64::new(0),
            file_lock: Mutex::new(()),
        }
    }

    pub fn start(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn bytes_logged(&self) -> u64 {
        self.bytes_logged.load(Ordering::Relaxed)
    }

    pub fn log_read(&self, data: &[u8]) {
        self.log("read", data);
    }

    pub fn log_write(&self, data: &[u8]) {
        self.log("write", data);
    }

    fn log(&self, direction: &str, data: &[u8]) {
        if !self.is_enabled() {
            return;
        }
        self.bytes_logged.fetch_add(data.len() as u64, Ordering::Relaxed);
        trace!("{} raw {}: {}", self.name, direction, hex::encode_upper(data));

        let Some(dir) = &self.dir else { return };
        let _guard = self.file_lock.lock();
        let path = dir.join(format!("{}_raw_{}.bin", self.name, direction));
        let result = std::fs::create_dir_all(dir).and_then(|()| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?
                .write_all(data)
        });
        if let Err(e) = result {
            warn!("{}: raw log write to {} failed: {}", self.name, path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_logger_ignores_bytes() {
        let logger = RawLogger::new("INST_INT", None);
        logger.log_read(&[1, 2, 3]);
        assert_eq!(logger.bytes_logged(), 0);

        logger.start();
        logger.log_read(&[1, 2, 3]);
        assert_eq!(logger.bytes_logged(), 3);
    }

    #[test]
    fn test_logger_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let logger = RawLogger::new("INST_INT", Some(dir.path().to_path_buf()));
        logger.start();
        logger.log_write(&[0xAA]);
        logger.log_write(&[0xBB]);

        let bytes = std::fs::read(dir.path().join("inst_int_raw_write.bin")).unwrap();
        assert_eq!(bytes, vec![0xAA, 0xBB]);
    }
}
