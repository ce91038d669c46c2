use crate::config::WakeTarget;
use serde::{Deserialize, Serialize};

/// Outcome of one evaluation call. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationResult {
    pub found: bool,
    pub allowed: bool,
    /// First target that allowed the wake, else the first that matched.
    pub target: Option<WakeTarget>,
}

// POST /api/upswake
#[derive(Debug, Serialize, Deserialize)]
pub struct UpsWakeIn {
    pub mac: String,
}

// POST /api/servers/wake
#[derive(Debug, Deserialize)]
pub struct WakeIn {
    pub mac: String,
    pub broadcast: String,
    #[serde(default)]
    pub port: Option<u16>,
}

// POST /api/servers/broadcastwake
#[derive(Debug, Deserialize)]
pub struct BroadcastWakeIn {
    pub mac: String,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub woken: Option<bool>,
}

impl Message {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            woken: None,
        }
    }

    pub fn woken(message: impl Into<String>, woken: bool) -> Self {
        Self {
            message: message.into(),
            woken: Some(woken),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthView {
    pub status: String,
    pub sources: usize,
    pub targets: usize,
}
