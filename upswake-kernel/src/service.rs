//! Evaluate-then-wake, shared by the HTTP handler and the in-process trigger.

use crate::config::{Config, WakeTarget};
use crate::evaluator::{EvaluateError, Evaluator};
use crate::wol::{WakeDispatcher, WakeError};
use thiserror::Error;
use tracing::{info, warn};

pub const MSG_WOKEN: &str = "Wake on LAN sent";
pub const MSG_NOT_ALLOWED: &str = "No rule evaluated to true";
pub const MSG_NOT_FOUND: &str = "MAC address not found in the config";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsWakeOutcome {
    Woken(WakeTarget),
    NotAllowed,
    NotFound,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Evaluate(#[from] EvaluateError),
    #[error("target {target}: {error}")]
    Wake {
        target: String,
        #[source]
        error: WakeError,
    },
}

#[derive(Clone)]
pub struct WakeService {
    evaluator: Evaluator,
    dispatcher: WakeDispatcher,
}

impl WakeService {
    pub fn new(evaluator: Evaluator, dispatcher: WakeDispatcher) -> Self {
        Self { evaluator, dispatcher }
    }

    pub fn dispatcher(&self) -> &WakeDispatcher {
        &self.dispatcher
    }

    /// Wakes `mac` only if one of its targets' rules allows it right now.
    pub async fn upswake(
        &self,
        config: &Config,
        mac: &str,
    ) -> Result<UpsWakeOutcome, ServiceError> {
        let eval = self.evaluator.evaluate(config, mac).await?;
        if !eval.found {
            warn!(mac, "wake requested for unknown MAC");
            return Ok(UpsWakeOutcome::NotFound);
        }

        match eval.target {
            Some(target) if eval.allowed => {
                self.dispatcher
                    .wake(&target)
                    .await
                    .map_err(|error| ServiceError::Wake {
                        target: target.name.clone(),
                        error,
                    })?;
                info!(wake_target = %target.name, mac = %target.mac, "target woken");
                Ok(UpsWakeOutcome::Woken(target))
            }
            _ => Ok(UpsWakeOutcome::NotAllowed),
        }
    }
}
