//! Link configuration: what one interface or router microservice runs.

use crate::endpoint::EndpointConfig;
use crate::error::{LinkError, Result};
use crate::LinkKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

fn default_true() -> bool {
    true
}

fn default_reconnect_delay() -> f64 {
    5.0
}

/// Seconds as a [`Duration`]; negative, non-finite and overflowing values
/// are configuration errors.
pub fn duration_from_secs(seconds: f64, what: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(seconds)
        .map_err(|e| LinkError::config(format!("Invalid {what} of {seconds} seconds: {e}")))
}

/// `SCOPE__INTERFACE__NAME` or `SCOPE__ROUTER__NAME`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicroserviceName {
    pub scope: String,
    pub kind: LinkKind,
    pub name: String,
}

impl FromStr for MicroserviceName {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split("__").collect();
        let [scope, kind, name] = parts.as_slice() else {
            return Err(LinkError::config(format!(
                "Name {s} doesn't match convention of SCOPE__TYPE__NAME"
            )));
        };
        if scope.is_empty() || name.is_empty() {
            return Err(LinkError::config(format!("Name {s} has an empty scope or name")));
        }
        let kind = match *kind {
            "INTERFACE" => LinkKind::Interface,
            "ROUTER" => LinkKind::Router,
            other => {
                return Err(LinkError::config(format!(
                    "Unknown microservice type {other}, expected INTERFACE or ROUTER"
                )))
            }
        };
        Ok(Self {
            scope: (*scope).to_string(),
            kind,
            name: (*name).to_string(),
        })
    }
}

impl std::fmt::Display for MicroserviceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}__{}__{}", self.scope, self.kind, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub microservice_name: String,
    #[serde(default)]
    pub target_names: Vec<String>,
    /// Defaults to `target_names`.
    #[serde(default)]
    pub cmd_target_names: Option<Vec<String>>,
    /// Defaults to `target_names`.
    #[serde(default)]
    pub tlm_target_names: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub connect_on_startup: bool,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    /// Seconds.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: f64,
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub plugin: Option<String>,
    #[serde(default)]
    pub exception_dir: Option<PathBuf>,
    #[serde(default)]
    pub raw_log_dir: Option<PathBuf>,
}

fn upper(names: &[String]) -> Vec<String> {
    names.iter().map(|n| n.to_uppercase()).collect()
}

impl LinkConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| LinkError::config(format!("Cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<MicroserviceName> {
        let name: MicroserviceName = self.microservice_name.parse()?;
        duration_from_secs(self.reconnect_delay, "reconnect_delay")?;
        if self.cmd_target_names().is_empty() && self.tlm_target_names().is_empty() {
            return Err(LinkError::config(format!("{} serves no targets", name.name)));
        }
        if name.kind == LinkKind::Router && self.cmd_target_names().is_empty() {
            return Err(LinkError::config(format!("Router {} has no command targets to route to", name.name)));
        }
        Ok(name)
    }

    pub fn cmd_target_names(&self) -> Vec<String> {
        upper(self.cmd_target_names.as_deref().unwrap_or(&self.target_names))
    }

    pub fn tlm_target_names(&self) -> Vec<String> {
        upper(self.tlm_target_names.as_deref().unwrap_or(&self.target_names))
    }

    /// Zero for a delay that [`validate`](Self::validate) would reject.
    pub fn reconnect_delay(&self) -> Duration {
        duration_from_secs(self.reconnect_delay, "reconnect_delay").unwrap_or_default()
    }
}
