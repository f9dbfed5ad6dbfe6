//! Persistent data model for devices, parameters, tasks and sessions

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::{Error, Result};

pub use crate::protocols::cwmp::DeviceIdStruct;

/// Device (CPE) inventory row
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: String,
    pub manufacturer: String,
    pub oui: String,
    pub product_class: String,
    pub serial_number: String,
    pub ip_address: Option<String>,
    pub connection_request_url: Option<String>,
    pub software_version: Option<String>,
    pub hardware_version: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_inform: Option<DateTime<Utc>>,
    pub online: bool,
    pub tags: Vec<String>,
    pub metadata: Value,
}

/// Promoted device scalars settable from reconciled parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceField {
    SoftwareVersion,
    HardwareVersion,
    ConnectionRequestUrl,
}

impl DeviceField {
    pub fn column(&self) -> &'static str {
        match self {
            Self::SoftwareVersion => "software_version",
            Self::HardwareVersion => "hardware_version",
            Self::ConnectionRequestUrl => "connection_request_url",
        }
    }

    /// Match the trailing segment of a TR-069 parameter path
    pub fn from_name_suffix(name: &str) -> Option<Self> {
        match name.rsplit('.').next() {
            Some("SoftwareVersion") => Some(Self::SoftwareVersion),
            Some("HardwareVersion") => Some(Self::HardwareVersion),
            Some("ConnectionRequestURL") => Some(Self::ConnectionRequestUrl),
            _ => None,
        }
    }
}

/// Last observed value of a data-model parameter on a device
#[derive(Debug, Clone, Serialize)]
pub struct Parameter {
    pub id: i64,
    pub device_id: String,
    pub name: String,
    pub value: String,
    #[serde(rename = "type")]
    pub param_type: String,
    pub writable: bool,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    GetParams,
    SetParams,
    Reboot,
    FactoryReset,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetParams => "get_params",
            Self::SetParams => "set_params",
            Self::Reboot => "reboot",
            Self::FactoryReset => "factory_reset",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "get_params" => Ok(Self::GetParams),
            "set_params" => Ok(Self::SetParams),
            "reboot" => Ok(Self::Reboot),
            "factory_reset" => Ok(Self::FactoryReset),
            other => Err(Error::invalid_task(format!("unknown task type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Sent,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::internal(format!("unknown task status: {}", other))),
        }
    }

    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Legal lifecycle edges: pending -> sent -> {completed, failed}
    pub fn can_advance_to(&self, to: TaskStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, TaskStatus::Sent)
                | (Self::Sent, TaskStatus::Completed)
                | (Self::Sent, TaskStatus::Failed)
        )
    }
}

/// Kind-specific task instruction, persisted as a discriminator plus JSON payload
#[derive(Debug, Clone, PartialEq)]
pub enum TaskCommand {
    GetParams { names: Vec<String> },
    SetParams { values: Vec<(String, String)> },
    Reboot,
    FactoryReset,
}

impl TaskCommand {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::GetParams { .. } => TaskKind::GetParams,
            Self::SetParams { .. } => TaskKind::SetParams,
            Self::Reboot => TaskKind::Reboot,
            Self::FactoryReset => TaskKind::FactoryReset,
        }
    }

    /// Payload stored alongside the kind discriminator
    pub fn payload(&self) -> Value {
        match self {
            Self::GetParams { names } => json!({ "names": names }),
            Self::SetParams { values } => {
                let mut map = serde_json::Map::new();
                for (name, value) in values {
                    map.insert(name.clone(), Value::String(value.clone()));
                }
                json!({ "values": map })
            }
            Self::Reboot | Self::FactoryReset => json!({}),
        }
    }

    pub fn from_parts(kind: TaskKind, payload: &Value) -> Result<Self> {
        match kind {
            TaskKind::GetParams => {
                let names = payload
                    .get("names")
                    .and_then(Value::as_array)
                    .ok_or_else(|| Error::invalid_task("get_params payload missing names"))?
                    .iter()
                    .map(|v| {
                        v.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| Error::invalid_task("parameter names must be strings"))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self::GetParams { names })
            }
            TaskKind::SetParams => {
                let values = payload
                    .get("values")
                    .and_then(Value::as_object)
                    .ok_or_else(|| Error::invalid_task("set_params payload missing values"))?
                    .iter()
                    .map(|(name, value)| {
                        value
                            .as_str()
                            .map(|v| (name.clone(), v.to_string()))
                            .ok_or_else(|| Error::invalid_task("parameter values must be strings"))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self::SetParams { values })
            }
            TaskKind::Reboot => Ok(Self::Reboot),
            TaskKind::FactoryReset => Ok(Self::FactoryReset),
        }
    }
}

/// Operator-issued unit of management work scheduled against a device
#[derive(Debug, Clone)]
pub struct Task {
    pub id: i64,
    pub device_id: String,
    pub command: TaskCommand,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
}

/// One CPE-ACS transactional burst, opened by an accepted Inform
#[derive(Debug, Clone)]
pub struct CwmpSession {
    pub id: String,
    pub device_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub inform_events: Vec<String>,
    pub messages_exchanged: i64,
}

/// Inventory counters surfaced by the stats endpoint
#[derive(Debug, Clone, Serialize)]
pub struct AcsStats {
    pub total_devices: i64,
    pub online: i64,
    pub offline: i64,
    pub pending_tasks: i64,
}
