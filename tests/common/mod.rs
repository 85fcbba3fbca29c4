// Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use satlink::endpoint::{Endpoint, EndpointConfig, EndpointFactory, RawLogger};
use satlink::*;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const SCOPE: &str = "DEFAULT";

pub enum ReadEvent {
    Frame(Packet),
    Close,
    Fail(std::io::ErrorKind),
}

/// Scripted endpoint: counts calls, records writes and serves pushed frames.
pub struct MockEndpoint {
    pub config: EndpointConfig,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    connected: AtomicBool,
    read_allowed: bool,
    connect_failures: Mutex<VecDeque<LinkError>>,
    always_fail: AtomicBool,
    connect_times: Mutex<Vec<tokio::time::Instant>>,
    written: Mutex<Vec<Vec<u8>>>,
    raw_written: Mutex<Vec<Vec<u8>>>,
    frames_tx: mpsc::UnboundedSender<ReadEvent>,
    frames_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ReadEvent>>,
    session: Mutex<CancellationToken>,
    raw: RawLogger,
}

impl MockEndpoint {
    pub fn new(config: EndpointConfig, read_allowed: bool) -> Self {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        Self {
            config,
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
            read_allowed,
            connect_failures: Mutex::new(VecDeque::new()),
            always_fail: AtomicBool::new(false),
            connect_times: Mutex::new(Vec::new()),
            written: Mutex::new(Vec::new()),
            raw_written: Mutex::new(Vec::new()),
            frames_tx,
            frames_rx: tokio::sync::Mutex::new(frames_rx),
            session: Mutex::new(CancellationToken::new()),
            raw: RawLogger::new("MOCK", None),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn connect_times(&self) -> Vec<tokio::time::Instant> {
        self.connect_times.lock().clone()
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }

    pub fn raw_written(&self) -> Vec<Vec<u8>> {
        self.raw_written.lock().clone()
    }

    pub fn fail_next_connect(&self, err: LinkError) {
        self.connect_failures.lock().push_back(err);
    }

    pub fn set_always_fail(&self, fail: bool) {
        self.always_fail.store(fail, Ordering::SeqCst);
    }

    /// Peer vanished: the endpoint reports disconnected without a
    /// `disconnect` call.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn push(&self, event: ReadEvent) {
        self.frames_tx.send(event).ok();
    }

    pub fn push_frame(&self, buffer: Vec<u8>) {
        self.push(ReadEvent::Frame(Packet::unidentified(PacketKind::Telemetry, buffer)));
    }
}

#[async_trait]
impl Endpoint for MockEndpoint {
    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connect_times.lock().push(tokio::time::Instant::now());
        if self.always_fail.load(Ordering::SeqCst) {
            return Err(LinkError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "Connection refused",
            )));
        }
        let failure = self.connect_failures.lock().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        *self.session.lock() = CancellationToken::new();
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.session.lock().cancel();
        Ok(())
    }

    async fn read(&self) -> Result<Option<Packet>> {
        let session = self.session.lock().clone();
        let mut frames = self.frames_rx.lock().await;
        tokio::select! {
            () = session.cancelled() => Ok(None),
            event = frames.recv() => match event {
                Some(ReadEvent::Frame(packet)) => Ok(Some(packet)),
                Some(ReadEvent::Close) | None => {
                    self.connected.store(false, Ordering::SeqCst);
                    Ok(None)
                }
                Some(ReadEvent::Fail(kind)) => {
                    self.connected.store(false, Ordering::SeqCst);
                    Err(LinkError::Io(std::io::Error::new(kind, "mock read failure")))
                }
            },
        }
    }

    async fn write(&self, packet: &Packet) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(LinkError::connection("mock not connected"));
        }
        self.written.lock().push(packet.buffer.clone());
        Ok(())
    }

    async fn write_raw(&self, data: &[u8]) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(LinkError::connection("mock not connected"));
        }
        self.raw_written.lock().push(data.to_vec());
        Ok(())
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn read_allowed(&self) -> bool {
        self.read_allowed
    }

    fn raw_logger(&self) -> &RawLogger {
        &self.raw
    }
}

/// Hands out [`MockEndpoint`]s and keeps every one it built.
pub struct MockFactory {
    read_allowed: bool,
    always_fail: AtomicBool,
    built: Mutex<Vec<Arc<MockEndpoint>>>,
}

impl MockFactory {
    pub fn new(read_allowed: bool) -> Self {
        Self {
            read_allowed,
            always_fail: AtomicBool::new(false),
            built: Mutex::new(Vec::new()),
        }
    }

    /// Endpoints built from now on refuse every connect.
    pub fn set_always_fail(&self, fail: bool) {
        self.always_fail.store(fail, Ordering::SeqCst);
    }

    pub fn built(&self) -> Vec<Arc<MockEndpoint>> {
        self.built.lock().clone()
    }

    pub fn endpoint(&self, index: usize) -> Arc<MockEndpoint> {
        self.built.lock()[index].clone()
    }
}

impl EndpointFactory for MockFactory {
    fn build(&self, _link_name: &str, config: &EndpointConfig) -> Result<Arc<dyn Endpoint>> {
        let endpoint = Arc::new(MockEndpoint::new(config.clone(), self.read_allowed));
        endpoint.set_always_fail(self.always_fail.load(Ordering::SeqCst));
        self.built.lock().push(endpoint.clone());
        Ok(endpoint as Arc<dyn Endpoint>)
    }
}

pub fn dictionary() -> StaticDictionary {
    let definition = json!({
        "commands": [
            {
                "target_name": "INST",
                "packet_name": "COLLECT",
                "description": "Starts a collect",
                "items": [
                    {"name": "OPCODE", "offset": 0, "size": 2, "id_value": 1},
                    {"name": "TYPE", "offset": 2, "size": 1, "states": [
                        {"name": "NORMAL", "value": 0},
                        {"name": "SPECIAL", "value": 1, "hazardous": "Special collect overheats the sensor"}
                    ]},
                    {"name": "DURATION", "offset": 3, "size": 2, "minimum": 0, "maximum": 100}
                ]
            },
            {
                "target_name": "INST",
                "packet_name": "CLEAR",
                "hazardous": "Clears all counters",
                "items": [{"name": "OPCODE", "offset": 0, "size": 2, "id_value": 2}]
            },
            {
                "target_name": "INST",
                "packet_name": "NOOP",
                "items": [{"name": "OPCODE", "offset": 0, "size": 2, "id_value": 3}]
            },
            {
                "target_name": "INST2",
                "packet_name": "NOOP",
                "items": [{"name": "OPCODE", "offset": 0, "size": 2, "id_value": 9}]
            }
        ],
        "telemetry": [
            {
                "target_name": "INST",
                "packet_name": "HEALTH",
                "items": [
                    {"name": "ID", "offset": 0, "size": 2, "id_value": 1},
                    {"name": "TEMP", "offset": 2, "size": 2, "data_type": "int"}
                ]
            },
            {
                "target_name": "INST",
                "packet_name": "STATUS",
                "items": [
                    {"name": "ID", "offset": 0, "size": 2, "id_value": 2},
                    {"name": "MODE", "offset": 2, "size": 1}
                ]
            }
        ]
    });
    StaticDictionary::new(serde_json::from_value(definition).unwrap())
}

pub fn interface_config(name: &str) -> LinkConfig {
    serde_json::from_value(json!({
        "microservice_name": format!("{SCOPE}__INTERFACE__{name}"),
        "target_names": ["INST"],
        "reconnect_delay": 1.0,
        "endpoint": {"type": "tcp", "host": "127.0.0.1", "port": 9999}
    }))
    .unwrap()
}

pub fn router_config(name: &str, cmd_targets: &[&str]) -> LinkConfig {
    serde_json::from_value(json!({
        "microservice_name": format!("{SCOPE}__ROUTER__{name}"),
        "cmd_target_names": cmd_targets,
        "tlm_target_names": ["INST"],
        "reconnect_delay": 1.0,
        "endpoint": {"type": "tcp", "host": "127.0.0.1", "port": 9998}
    }))
    .unwrap()
}

/// Everything a test needs to drive and observe one link.
pub struct Harness {
    pub bus: Arc<MemoryBus>,
    pub dictionary: Arc<StaticDictionary>,
    pub status: Arc<MemoryStatusSink>,
    pub factory: Arc<MockFactory>,
    pub microservice: LinkMicroservice,
    pub task: Option<tokio::task::JoinHandle<()>>,
}

impl Harness {
    pub async fn new(config: LinkConfig) -> Self {
        Self::with_bus(config, Arc::new(MemoryBus::new()), MockFactory::new(true)).await
    }

    pub async fn with_bus(config: LinkConfig, bus: Arc<MemoryBus>, factory: MockFactory) -> Self {
        let dictionary = Arc::new(dictionary());
        let status = Arc::new(MemoryStatusSink::new());
        let factory = Arc::new(factory);
        let services = Services {
            bus: bus.clone(),
            dictionary: dictionary.clone(),
            status: status.clone(),
            endpoints: factory.clone(),
        };
        let microservice = LinkMicroservice::new(config, services).await.unwrap();
        Self {
            bus,
            dictionary,
            status,
            factory,
            microservice,
            task: None,
        }
    }

    pub fn start(&mut self) {
        let runner = self.microservice.clone();
        self.task = Some(tokio::spawn(async move { runner.run().await }));
    }

    pub fn link(&self) -> &Arc<Link> {
        self.microservice.link()
    }

    pub fn endpoint(&self) -> Arc<MockEndpoint> {
        self.factory.built().last().cloned().unwrap()
    }

    pub async fn wait_for_state(&self, state: ConnectionState) {
        let mut states = self.link().subscribe_state();
        tokio::time::timeout(Duration::from_secs(10), states.wait_for(|s| *s == state))
            .await
            .expect("state not reached in time")
            .unwrap();
    }

    /// Waits for the ack of the message with `id` on `ack_topic`.
    pub async fn ack(&self, ack_topic: &str, id: &str) -> String {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(ack) = self
                .bus
                .messages(ack_topic)
                .into_iter()
                .find(|m| m.get_str("id") == Some(id))
            {
                return ack.get_str("result").unwrap_or_default().to_string();
            }
            assert!(tokio::time::Instant::now() < deadline, "no ack for {id} on {ack_topic}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn shutdown(mut self) {
        self.microservice.shutdown().await;
        if let Some(task) = self.task.take() {
            task.await.unwrap();
        }
    }
}

pub fn interface_ack_topic(name: &str) -> String {
    format!("{{{SCOPE}__ACKCMD}}INTERFACE__{name}")
}

pub fn target_ack_topic(target: &str) -> String {
    format!("{{{SCOPE}__ACKCMD}}TARGET__{target}")
}
