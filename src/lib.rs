//! # Satellite Link Engine
//!
//! The real-time link layer of a command-and-telemetry ground station. Each
//! interface or router owns one connection to a radio, simulator or socket,
//! identifies the frames that cross it against a packet dictionary and relays
//! them to and from a publish-subscribe message bus.
//!
//! ## Features
//!
//! - **Connection state machine**: `DISCONNECTED`, `ATTEMPTING`, `CONNECTED`
//!   with auto-reconnect and operator reconfiguration
//! - **Command handling**: dictionary builds, raw buffers, hazardous-command
//!   interception and an ack for every request
//! - **Telemetry identification**: tagged, untagged, stored and unknown frames
//! - **Routers**: forward inbound commands to their targets and stream
//!   telemetry back out
//! - **Coordinated shutdown**: one cancellation token and one shutdown mutex
//!   shared by the two tasks of each instance
//!
//! ## Quick Start
//!
//! ```no_run
//! use satlink::{
//!     DefaultEndpointFactory, LinkConfig, LinkMicroservice, MemoryBus, MemoryStatusSink,
//!     Services, StaticDictionary,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> satlink::Result<()> {
//! let config = LinkConfig::from_file("inst_int.json")?;
//! let services = Services {
//!     bus: Arc::new(MemoryBus::new()),
//!     dictionary: Arc::new(StaticDictionary::from_file("inst.json")?),
//!     status: Arc::new(MemoryStatusSink::new()),
//!     endpoints: Arc::new(DefaultEndpointFactory::new(config.raw_log_dir.clone())),
//! };
//!
//! let link = LinkMicroservice::new(config, services).await?;
//! let runner = link.clone();
//! let task = tokio::spawn(async move { runner.run().await });
//!
//! // ... later
//! link.shutdown().await;
//! task.await.ok();
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`microservice`] - State machine task, packet handling, stop/shutdown
//! - [`handler`] - Command handler and router telemetry handler tasks
//! - [`link`] - Shared per-instance state guarded by the shutdown mutex
//! - [`routing`] - Telemetry identification and router command forwarding
//! - [`endpoint`] - Transports (TCP, simulated) and raw logging
//! - [`bus`], [`topics`] - Message bus contract and topic layout
//! - [`dictionary`] - Packet dictionary contract and a static implementation
//! - [`status`], [`exception`] - Status records and failure bookkeeping

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod bus;
pub mod config;
pub mod dictionary;
pub mod endpoint;
pub mod error;
pub mod exception;
pub mod handler;
pub mod link;
pub mod microservice;
pub mod packet;
pub mod routing;
pub mod sleeper;
pub mod status;
pub mod topics;

// Re-export main public types for convenience
pub use bus::{MemoryBus, MessageBus, TopicCursor, TopicMessage};
pub use config::{LinkConfig, MicroserviceName};
pub use dictionary::{PacketDictionary, StaticDictionary};
pub use endpoint::{DefaultEndpointFactory, Endpoint, EndpointConfig, EndpointFactory, RawLogger};
pub use error::{LinkError, Result};
pub use link::{ConnectionState, Link, LinkKind, ReconnectPolicy, Services};
pub use microservice::LinkMicroservice;
pub use packet::{Packet, PacketKind, UNKNOWN};
pub use status::{LinkStatus, MemoryStatusSink, MicroserviceState, MicroserviceStatus, StatusSink};

static_assertions::assert_impl_all!(Link: Send, Sync);
static_assertions::assert_impl_all!(LinkMicroservice: Send, Sync, Clone);
static_assertions::assert_impl_all!(Services: Send, Sync, Clone);
