use crate::error::Result;
use crate::{ConnectionState, LinkKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Observable state of one interface or router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub name: String,
    pub state: ConnectionState,
    pub count: u64,
    pub error: Option<String>,
    pub plugin: Option<String>,
    pub read_count: u64,
    pub write_count: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MicroserviceState {
    Initialized,
    Running,
    Finished,
    Killed,
    DiedError,
}

/// Generic process-level record, independent of the connection state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicroserviceStatus {
    pub name: String,
    pub state: MicroserviceState,
    pub count: u64,
    pub error: Option<String>,
    pub plugin: Option<String>,
}

#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn set_link(&self, scope: &str, kind: LinkKind, status: &LinkStatus) -> Result<()>;

    async fn remove_link(&self, scope: &str, kind: LinkKind, name: &str) -> Result<()>;

    async fn set_microservice(&self, scope: &str, status: &MicroserviceStatus) -> Result<()>;
}

/// Keeps the latest records in memory; also counts link writes for tests and
/// dashboards that poll.
#[derive(Debug, Default)]
pub struct MemoryStatusSink {
    links: Mutex<BTreeMap<(String, LinkKind, String), LinkStatus>>,
    microservices: Mutex<BTreeMap<(String, String), MicroserviceStatus>>,
    link_writes: Mutex<u64>,
}

impl MemoryStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&self, scope: &str, kind: LinkKind, name: &str) -> Option<LinkStatus> {
        self.links
            .lock()
            .get(&(scope.to_string(), kind, name.to_string()))
            .cloned()
    }

    pub fn microservice(&self, scope: &str, name: &str) -> Option<MicroserviceStatus> {
        self.microservices
            .lock()
            .get(&(scope.to_string(), name.to_string()))
            .cloned()
    }

    pub fn link_writes(&self) -> u64 {
        *self.link_writes.lock()
    }
}

#[async_trait]
impl StatusSink for MemoryStatusSink {
    async fn set_link(&self, scope: &str, kind: LinkKind, status: &LinkStatus) -> Result<()> {
        self.links
            .lock()
            .insert((scope.to_string(), kind, status.name.clone()), status.clone());
        *self.link_writes.lock() += 1;
        Ok(())
    }

    async fn remove_link(&self, scope: &str, kind: LinkKind, name: &str) -> Result<()> {
        self.links
            .lock()
            .remove(&(scope.to_string(), kind, name.to_string()));
        Ok(())
    }

    async fn set_microservice(&self, scope: &str, status: &MicroserviceStatus) -> Result<()> {
        self.microservices
            .lock()
            .insert((scope.to_string(), status.name.clone()), status.clone());
        Ok(())
    }
}
