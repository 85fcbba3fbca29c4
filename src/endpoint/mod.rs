//! Connection endpoints: the transports an interface or router talks through.
//!
//! The engine only sees [`Endpoint`]; concrete transports are produced by an
//! [`EndpointFactory`] from a typed [`EndpointConfig`], which is also how a
//! `connect` control message with new parameters rebuilds the endpoint.

mod raw_log;
mod simulated;
mod tcp;

pub use raw_log::RawLogger;
pub use simulated::{SimulatedConfig, SimulatedEndpoint, WRITE_HISTORY};
pub use tcp::{TcpClientEndpoint, TcpConfig, MAX_FRAME_SIZE};

use crate::config::duration_from_secs;
use crate::error::{LinkError, Result};
use crate::packet::Packet;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Blocks until a frame arrives. `Ok(None)` means the remote closed cleanly
    /// or the endpoint was disconnected locally.
    async fn read(&self) -> Result<Option<Packet>>;

    async fn write(&self, packet: &Packet) -> Result<()>;

    async fn write_raw(&self, data: &[u8]) -> Result<()>;

    fn connected(&self) -> bool;

    /// Whether the endpoint produces inbound frames at all.
    fn read_allowed(&self) -> bool {
        true
    }

    fn raw_logger(&self) -> &RawLogger;

    fn start_raw_logging(&self) {
        self.raw_logger().start();
    }

    fn stop_raw_logging(&self) {
        self.raw_logger().stop();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EndpointConfig {
    Tcp(TcpConfig),
    Simulated(SimulatedConfig),
}

fn positional_u64(params: &[Value], index: usize, what: &str) -> Result<u64> {
    match params.get(index) {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| LinkError::config(format!("Invalid {what} parameter: {:?}", params.get(index))))
}

impl EndpointConfig {
    /// Builds a replacement configuration from `connect` parameters.
    ///
    /// A single JSON object is a complete configuration of any kind; otherwise
    /// the array holds positional arguments for the current kind:
    /// `tcp` takes `host, port[, connect_timeout]`, `simulated` takes `period_ms`.
    pub fn from_params(&self, params: &[Value]) -> Result<EndpointConfig> {
        if let [object @ Value::Object(_)] = params {
            return serde_json::from_value(object.clone())
                .map_err(|e| LinkError::config(format!("Invalid endpoint parameters: {e}")));
        }
        match self {
            EndpointConfig::Tcp(current) => {
                if params.len() < 2 || params.len() > 3 {
                    return Err(LinkError::config(format!(
                        "tcp endpoint takes host, port[, connect_timeout]; got {} parameters",
                        params.len()
                    )));
                }
                let host = params[0]
                    .as_str()
                    .ok_or_else(|| LinkError::config(format!("Invalid host parameter: {}", params[0])))?;
                let port = u16::try_from(positional_u64(params, 1, "port")?)
                    .map_err(|_| LinkError::config(format!("Port out of range: {}", params[1])))?;
                let connect_timeout = match params.get(2) {
                    Some(v) => v
                        .as_f64()
                        .ok_or_else(|| LinkError::config(format!("Invalid connect_timeout parameter: {v}")))?,
                    None => current.connect_timeout,
                };
                duration_from_secs(connect_timeout, "connect_timeout")?;
                Ok(EndpointConfig::Tcp(TcpConfig {
                    host: host.to_string(),
                    port,
                    connect_timeout,
                    ..current.clone()
                }))
            }
            EndpointConfig::Simulated(current) => {
                if params.len() != 1 {
                    return Err(LinkError::config(format!(
                        "simulated endpoint takes period_ms; got {} parameters",
                        params.len()
                    )));
                }
                Ok(EndpointConfig::Simulated(SimulatedConfig {
                    period_ms: positional_u64(params, 0, "period_ms")?,
                    ..current.clone()
                }))
            }
        }
    }
}

pub trait EndpointFactory: Send + Sync {
    /// Fails with [`LinkError::Configuration`] on an invalid parameter set.
    fn build(&self, link_name: &str, config: &EndpointConfig) -> Result<Arc<dyn Endpoint>>;
}

/// Builds the transports shipped with the crate.
#[derive(Debug, Clone, Default)]
pub struct DefaultEndpointFactory {
    raw_log_dir: Option<PathBuf>,
}

impl DefaultEndpointFactory {
    pub fn new(raw_log_dir: Option<PathBuf>) -> Self {
        Self { raw_log_dir }
    }
}

impl EndpointFactory for DefaultEndpointFactory {
    fn build(&self, link_name: &str, config: &EndpointConfig) -> Result<Arc<dyn Endpoint>> {
        let raw = RawLogger::new(link_name, self.raw_log_dir.clone());
        match config {
            EndpointConfig::Tcp(tcp) => Ok(Arc::new(TcpClientEndpoint::new(tcp.clone(), raw)?)),
            EndpointConfig::Simulated(sim) => Ok(Arc::new(SimulatedEndpoint::new(sim.clone(), raw)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tcp() -> EndpointConfig {
        EndpointConfig::Tcp(TcpConfig {
            host: "127.0.0.1".into(),
            port: 8080,
            connect_timeout: 5.0,
            read_allowed: true,
        })
    }

    #[test]
    fn test_positional_tcp_params() {
        let config = tcp().from_params(&[json!("10.0.0.2"), json!(9000)]).unwrap();
        match config {
            EndpointConfig::Tcp(c) => {
                assert_eq!(c.host, "10.0.0.2");
                assert_eq!(c.port, 9000);
                assert!((c.connect_timeout - 5.0).abs() < f64::EPSILON);
            }
            EndpointConfig::Simulated(_) => panic!("Expected tcp config"),
        }
    }

    #[test]
    fn test_object_param_switches_kind() {
        let config = tcp()
            .from_params(&[json!({"type": "simulated", "period_ms": 50})])
            .unwrap();
        assert!(matches!(config, EndpointConfig::Simulated(SimulatedConfig { period_ms: 50, .. })));
    }

    #[test]
    fn test_bad_params_are_configuration_errors() {
        let err = tcp().from_params(&[json!("host")]).unwrap_err();
        assert!(matches!(err, LinkError::Configuration(_)));

        let err = tcp().from_params(&[json!("host"), json!(70000)]).unwrap_err();
        assert!(matches!(err, LinkError::Configuration(_)));

        let err = tcp().from_params(&[json!({"type": "carrier_pigeon"})]).unwrap_err();
        assert!(matches!(err, LinkError::Configuration(_)));

        let err = tcp().from_params(&[json!("host"), json!(8080), json!(1e20)]).unwrap_err();
        assert!(matches!(err, LinkError::Configuration(_)));
    }

    #[test]
    fn test_factory_rejects_unrepresentable_timeout() {
        // A full object bypasses positional checks; the endpoint itself refuses it
        let config = tcp()
            .from_params(&[json!({"type": "tcp", "host": "h", "port": 1, "connect_timeout": 1e20})])
            .unwrap();
        let result = DefaultEndpointFactory::default().build("INST_INT", &config);
        assert!(matches!(result, Err(LinkError::Configuration(_))));
    }
}
