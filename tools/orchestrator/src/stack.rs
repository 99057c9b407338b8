//! Stack Adapter
//!
//! Brings compose stacks up and down and reports aggregate state. It owns no
//! per-container identity and never retries; readiness waiting belongs to the
//! health gate.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use warden_shared::{ContainerState, Result, StackAction, StackRef, WardenError};

use crate::probe::{StackRuntime, SystemProbe};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackUp {
    AlreadyUp,
    Started,
}

/// Result of a control-API stack action
#[derive(Debug, Clone, Serialize)]
pub struct StackReport {
    pub stack: String,
    pub action: StackAction,
    pub up: bool,
    pub containers: Vec<ContainerState>,
}

pub struct StackAdapter {
    runtime: Arc<dyn StackRuntime>,
    probe: Arc<dyn SystemProbe>,
    grace: Duration,
}

impl StackAdapter {
    pub fn new(runtime: Arc<dyn StackRuntime>, probe: Arc<dyn SystemProbe>, grace: Duration) -> Self {
        Self { runtime, probe, grace }
    }

    /// Ensure the stack is up; a no-op when every container already runs
    pub async fn up(&self, name: &str, stack: &StackRef) -> Result<StackUp> {
        if self.is_up(stack).await {
            debug!(stack = name, "already up");
            return Ok(StackUp::AlreadyUp);
        }

        info!(stack = name, "bringing stack up");
        self.runtime.up(stack).await.map_err(|e| WardenError::StackStartFailed {
            stack: name.to_string(),
            reason: e.to_string(),
        })?;

        if !self.grace.is_zero() {
            sleep(self.grace).await;
        }
        Ok(StackUp::Started)
    }

    pub async fn down(&self, name: &str, stack: &StackRef) -> Result<()> {
        info!(stack = name, "taking stack down");
        self.runtime.down(stack).await
    }

    /// Up only when the runtime reports at least one container and all of them running
    pub async fn is_up(&self, stack: &StackRef) -> bool {
        match self.probe.container_states(stack).await {
            Ok(states) => !states.is_empty() && states.iter().all(ContainerState::is_running),
            Err(e) => {
                warn!(error = %e, "stack state query failed");
                false
            }
        }
    }

    pub async fn states(&self, name: &str, stack: &StackRef) -> Result<Vec<ContainerState>> {
        self.probe
            .container_states(stack)
            .await
            .map_err(|e| WardenError::StackQuery {
                stack: name.to_string(),
                reason: e.to_string(),
            })
    }

    pub async fn apply(&self, name: &str, stack: &StackRef, action: StackAction) -> Result<StackReport> {
        match action {
            StackAction::Up => {
                self.up(name, stack).await?;
            }
            StackAction::Down => self.down(name, stack).await?,
            StackAction::Restart => {
                self.down(name, stack).await?;
                self.up(name, stack).await?;
            }
            StackAction::Status => {}
        }

        let containers = self.states(name, stack).await?;
        let up = !containers.is_empty() && containers.iter().all(ContainerState::is_running);
        Ok(StackReport {
            stack: name.to_string(),
            action,
            up,
            containers,
        })
    }
}
