/*!
In-memory stand-ins for the kernel's seams: telemetry, policy, UDP transport
and interface discovery. All of them record what they were asked.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use upswake_kernel::config::NutSource;
use upswake_kernel::net::BroadcastResolver;
use upswake_kernel::policy::{PolicyEngine, PolicyError};
use upswake_kernel::telemetry::{TelemetryClient, TelemetryError};
use upswake_kernel::wol::{MacAddr, Transport, MAGIC_PACKET_LEN};

/// Telemetry JSON per source name. Unknown sources time out.
#[derive(Default)]
pub struct ScriptedTelemetry {
    replies: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTelemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, source: &str, json: impl Into<String>) {
        self.replies.lock().insert(source.to_string(), json.into());
    }

    /// Source names fetched, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl TelemetryClient for ScriptedTelemetry {
    async fn fetch_json(&self, source: &NutSource) -> Result<String, TelemetryError> {
        self.calls.lock().push(source.name.clone());
        self.replies
            .lock()
            .get(&source.name)
            .cloned()
            .ok_or_else(|| TelemetryError::Timeout {
                addr: format!("{}:{}", source.host, source.effective_port()),
            })
    }
}

#[derive(Debug, Clone)]
enum Verdict {
    Is(bool),
    Invalid(String),
}

/// Rule name -> verdict. Unknown rules are not found.
#[derive(Default)]
pub struct ScriptedPolicy {
    rules: Mutex<HashMap<String, Verdict>>,
    evaluations: Mutex<Vec<String>>,
}

impl ScriptedPolicy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `always_true` and `always_false` preset.
    pub fn constant() -> Arc<Self> {
        let p = Self::new();
        p.set("always_true", true);
        p.set("always_false", false);
        p
    }

    pub fn set(&self, rule: &str, verdict: bool) {
        self.rules.lock().insert(rule.to_string(), Verdict::Is(verdict));
    }

    pub fn set_invalid(&self, rule: &str, reason: &str) {
        self.rules.lock().insert(rule.to_string(), Verdict::Invalid(reason.to_string()));
    }

    pub fn evaluations(&self) -> Vec<String> {
        self.evaluations.lock().clone()
    }

    fn lookup(&self, rule: &str) -> Result<bool, PolicyError> {
        match self.rules.lock().get(rule).cloned() {
            Some(Verdict::Is(v)) => Ok(v),
            Some(Verdict::Invalid(reason)) => Err(PolicyError::Invalid {
                rule: rule.to_string(),
                reason,
            }),
            None => Err(PolicyError::NotFound {
                rule: rule.to_string(),
                path: format!("{rule}.yaml").into(),
            }),
        }
    }
}

#[async_trait]
impl PolicyEngine for ScriptedPolicy {
    async fn validate(&self, rule: &str) -> Result<(), PolicyError> {
        self.lookup(rule).map(|_| ())
    }

    async fn evaluate(&self, _telemetry: &str, rule: &str) -> Result<bool, PolicyError> {
        self.evaluations.lock().push(rule.to_string());
        self.lookup(rule)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPacket {
    pub addr: SocketAddr,
    pub mac: MacAddr,
}

/// Records every magic packet instead of sending it.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentPacket>>,
    short_by: Mutex<usize>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Report `n` fewer bytes than requested from now on.
    pub fn short_write(&self, n: usize) {
        *self.short_by.lock() = n;
    }

    pub fn sent(&self) -> Vec<SentPacket> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_to(&self, packet: &[u8], addr: SocketAddr) -> std::io::Result<usize> {
        if packet.len() == MAGIC_PACKET_LEN {
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&packet[6..12]);
            self.sent.lock().push(SentPacket { addr, mac: MacAddr(mac) });
        }
        Ok(packet.len().saturating_sub(*self.short_by.lock()))
    }
}

pub struct StaticResolver(pub Vec<Ipv4Addr>);

impl BroadcastResolver for StaticResolver {
    fn broadcast_addresses(&self) -> std::io::Result<Vec<Ipv4Addr>> {
        Ok(self.0.clone())
    }
}
