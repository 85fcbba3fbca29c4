//! One running interface or router: the connection state machine task plus
//! the bus handler task, and their coordinated shutdown.

use crate::config::{LinkConfig, MicroserviceName};
use crate::error::Result;
use crate::handler::{CommandHandler, RouterTelemetryHandler};
use crate::link::{ConnectionState, Link, LinkKind, Services};
use crate::packet::{Packet, PacketKind};
use crate::routing;
use crate::status::{MicroserviceState, MicroserviceStatus};
use crate::topics;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Idle period of the `DISCONNECTED` state and of non-reading endpoints.
pub const IDLE_PERIOD: Duration = Duration::from_secs(1);

struct Inner {
    link: Arc<Link>,
    microservice_name: MicroserviceName,
    handler: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    finished: AtomicBool,
    died: AtomicBool,
}

/// Cloneable handle to a running link.
#[derive(Clone)]
pub struct LinkMicroservice {
    inner: Arc<Inner>,
}

impl LinkMicroservice {
    /// Validates `config`, builds the endpoint, seeds received counters from
    /// the newest telemetry on the bus, writes the first status and starts
    /// the handler task. The state machine starts with [`run`](Self::run).
    pub async fn new(config: LinkConfig, services: Services) -> Result<Self> {
        let microservice_name = config.validate()?;
        let endpoint = services.endpoints.build(&microservice_name.name, &config.endpoint)?;
        let link = Arc::new(Link::new(&microservice_name, &config, endpoint, services));

        seed_received_counts(&link).await;

        let ms = Self {
            inner: Arc::new(Inner {
                link,
                microservice_name,
                handler: Mutex::new(None),
                stopped: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                died: AtomicBool::new(false),
            }),
        };
        ms.publish_microservice_status(MicroserviceState::Initialized).await;
        ms.inner.link.publish_status().await;
        ms.start_handler().await?;
        Ok(ms)
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.inner.link
    }

    pub fn microservice_name(&self) -> &MicroserviceName {
        &self.inner.microservice_name
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.link.state()
    }

    async fn start_handler(&self) -> Result<()> {
        let link = self.inner.link.clone();
        let handle = match link.kind() {
            LinkKind::Interface => {
                let cursor = link.bus().cursor(owned_topics(&link)).await?;
                tokio::spawn(CommandHandler::new(link.clone(), cursor).run())
            }
            LinkKind::Router => {
                let cursor = link.bus().cursor(router_topics(&link)).await?;
                tokio::spawn(RouterTelemetryHandler::new(link.clone(), cursor).run())
            }
        };
        *self.inner.handler.lock() = Some(handle);
        Ok(())
    }

    /// Runs the connection state machine until the link is cancelled, then
    /// stops the instance.
    pub async fn run(&self) {
        let link = self.inner.link.clone();
        self.publish_microservice_status(MicroserviceState::Running).await;
        info!("{}: Starting packet reading", link.name());

        while !link.is_cancelled() {
            match link.state() {
                ConnectionState::Disconnected => {
                    if !link.sleeper().sleep(IDLE_PERIOD).await {
                        link.publish_status().await;
                    }
                }
                ConnectionState::Attempting => {
                    if let Err(e) = link.connect().await {
                        link.handle_connection_failed(e).await;
                    }
                }
                ConnectionState::Connected => self.read_once(&link).await,
            }
        }

        self.stop().await;
        info!("{}: Stopped packet reading", link.name());
    }

    async fn read_once(&self, link: &Arc<Link>) {
        let endpoint = link.endpoint();
        let generation = link.endpoint_generation();
        if !endpoint.read_allowed() {
            if link.sleeper().sleep(IDLE_PERIOD).await || generation != link.endpoint_generation() {
                return;
            }
            if !endpoint.connected() {
                link.handle_connection_lost(None).await;
            }
            return;
        }

        let result = tokio::select! {
            () = link.cancelled() => return,
            result = endpoint.read() => result,
        };
        // A reconfiguration disconnects the old endpoint under us; that is
        // not a lost connection.
        if generation != link.endpoint_generation() {
            return;
        }
        match result {
            Ok(Some(packet)) => {
                link.counters().record_read(packet.len());
                self.handle_packet(link, packet).await;
                link.counters().increment();
            }
            Ok(None) => {
                info!("{}: Internal disconnect requested (returned nil)", link.name());
                link.handle_connection_lost(None).await;
            }
            Err(e) => link.handle_connection_lost(Some(e)).await,
        }
    }

    async fn handle_packet(&self, link: &Link, frame: Packet) {
        match link.kind() {
            LinkKind::Interface => {
                let packet = routing::identify_telemetry(
                    link.dictionary(),
                    link.name(),
                    frame,
                    link.tlm_target_names(),
                );
                if let Err(e) = topics::write_telemetry(link.bus(), link.scope(), &packet).await {
                    error!("{}: Error publishing telemetry: {}", link.name(), e);
                    link.note_error(e.to_string());
                }
            }
            LinkKind::Router => {
                let result = routing::route_router_frame(
                    link.bus(),
                    link.dictionary(),
                    link.scope(),
                    frame,
                    link.cmd_target_names(),
                )
                .await;
                if let Err(e) = result {
                    error!("{}: Error routing command: {}", link.name(), e);
                    link.note_error(e.to_string());
                }
            }
        }
    }

    /// Cancels both tasks, disconnects the endpoint if connected and removes
    /// the status record. Only the first call has any effect.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let link = &self.inner.link;
        info!("{}: Stopping", link.name());
        link.shut_down().await;

        let handler = self.inner.handler.lock().take();
        if let Some(handler) = handler {
            if let Err(e) = handler.await {
                error!("{}: Handler task died: {}", link.name(), e);
                link.note_error(format!("Handler task died: {e}"));
                self.inner.died.store(true, Ordering::SeqCst);
            }
        }
    }

    /// [`stop`](Self::stop), then clears the topics this instance consumes
    /// and writes the final microservice status: `FINISHED`, or `DIED_ERROR`
    /// when a task crashed. Safe to repeat.
    pub async fn shutdown(&self) {
        self.finish(MicroserviceState::Finished).await;
    }

    /// Like [`shutdown`](Self::shutdown) for a process ended by a signal;
    /// the final status is `KILLED`.
    pub async fn kill(&self) {
        self.finish(MicroserviceState::Killed).await;
    }

    async fn finish(&self, state: MicroserviceState) {
        self.stop().await;
        if self.inner.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let link = &self.inner.link;
        let state = if state == MicroserviceState::Finished && self.inner.died.load(Ordering::SeqCst) {
            MicroserviceState::DiedError
        } else {
            state
        };
        if let Err(e) = link.bus().clear_topics(&owned_topics(link)).await {
            warn!("{}: Failed to clear topics: {}", link.name(), e);
        }
        self.publish_microservice_status(state).await;
        info!("{}: Shutdown complete", link.name());
    }

    async fn publish_microservice_status(&self, state: MicroserviceState) {
        let link = &self.inner.link;
        let status = MicroserviceStatus {
            name: self.inner.microservice_name.to_string(),
            state,
            count: link.counters().count(),
            error: link.last_error(),
            plugin: link.plugin().map(str::to_string),
        };
        if let Err(e) = link.status_sink().set_microservice(link.scope(), &status).await {
            warn!("{}: Failed to write microservice status: {}", link.name(), e);
        }
    }
}

/// Topics only this instance reads: its control topic, plus the target
/// command topics of an interface.
fn owned_topics(link: &Link) -> Vec<String> {
    match link.kind() {
        LinkKind::Interface => topics::interface_topics(link.scope(), link.name(), link.cmd_target_names()),
        LinkKind::Router => vec![topics::control_topic(link.scope(), LinkKind::Router, link.name())],
    }
}

fn router_topics(link: &Link) -> Vec<String> {
    let mut names = vec![topics::control_topic(link.scope(), LinkKind::Router, link.name())];
    for target_name in link.tlm_target_names() {
        match link.dictionary().packet_names(PacketKind::Telemetry, target_name) {
            Ok(packets) => names.extend(
                packets
                    .iter()
                    .map(|packet_name| topics::telemetry_topic(link.scope(), target_name, packet_name)),
            ),
            Err(e) => warn!("{}: No telemetry for {}: {}", link.name(), target_name, e),
        }
    }
    names
}

/// Continues each telemetry packet's received count from the newest entry on
/// its topic, so counts survive a restart.
async fn seed_received_counts(link: &Link) {
    for target_name in link.tlm_target_names() {
        let packets = match link.dictionary().packet_names(PacketKind::Telemetry, target_name) {
            Ok(packets) => packets,
            Err(e) => {
                warn!("{}: Cannot seed counts for {}: {}", link.name(), target_name, e);
                continue;
            }
        };
        for packet_name in packets {
            let topic = topics::telemetry_topic(link.scope(), target_name, &packet_name);
            let count = match link.bus().newest_message(&topic).await {
                Ok(message) => message.and_then(|m| m.get_u64("received_count")).unwrap_or(0),
                Err(e) => {
                    warn!("{}: Cannot read {}: {}", link.name(), topic, e);
                    0
                }
            };
            link.dictionary()
                .set_received_count(PacketKind::Telemetry, target_name, &packet_name, count);
        }
    }
}
