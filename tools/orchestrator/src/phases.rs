//! Phase Orchestrator
//!
//! Drives `Prereqs -> Core -> Auxiliary -> Containers -> Verify -> Done`.
//! Every service in a phase is attempted, and its health gate resolved or
//! exhausted, before the next phase begins. Failures are recorded and logged
//! but never abort the run.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use warden_shared::{HealthCheckResult, Phase, ServiceCategory, ServiceDescriptor, WardenError};

use crate::descriptors::DescriptorStore;
use crate::health::{HealthGate, RetryPolicy};
use crate::process::ProcessController;
use crate::stack::StackAdapter;

/// What happened to one service during its phase
#[derive(Debug, Clone, Serialize)]
pub struct ServiceOutcome {
    pub name: String,
    pub phase: Phase,
    pub category: ServiceCategory,
    /// When the start (or, for external services, the first probe) was issued
    pub attempted_at: DateTime<Utc>,
    pub start_error: Option<String>,
    pub health: Option<HealthCheckResult>,
}

impl ServiceOutcome {
    pub fn ready(&self) -> bool {
        self.health.as_ref().map_or(false, |h| h.ready)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub outcomes: Vec<ServiceOutcome>,
    /// Single-probe results from the Verify phase
    pub verification: Vec<HealthCheckResult>,
    pub phases_completed: Vec<Phase>,
    pub cancelled: bool,
}

impl RunReport {
    /// Health results to build a status snapshot from: verification when it ran,
    /// otherwise whatever the phases observed
    pub fn final_results(&self) -> Vec<HealthCheckResult> {
        if !self.verification.is_empty() {
            return self.verification.clone();
        }
        self.outcomes.iter().filter_map(|o| o.health.clone()).collect()
    }

    pub fn completed(&self) -> bool {
        self.phases_completed.contains(&Phase::Verify)
    }
}

pub struct PhaseOrchestrator {
    store: Arc<DescriptorStore>,
    processes: Arc<ProcessController>,
    stacks: Arc<StackAdapter>,
    gate: HealthGate,
    policy: RetryPolicy,
}

impl PhaseOrchestrator {
    pub fn new(
        store: Arc<DescriptorStore>,
        processes: Arc<ProcessController>,
        stacks: Arc<StackAdapter>,
        gate: HealthGate,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            processes,
            stacks,
            gate,
            policy,
        }
    }

    /// Run every phase once. On cancellation no further starts are issued;
    /// services already started are left running.
    pub async fn run(&self, cancel: &CancellationToken) -> RunReport {
        let mut report = RunReport::default();
        let mut phase = Phase::Prereqs;

        while phase != Phase::Done {
            if cancel.is_cancelled() {
                warn!(%phase, "cancelled; no further services will be started");
                report.cancelled = true;
                break;
            }

            match phase {
                Phase::Verify => {
                    report.verification = self.verify(cancel).await;
                }
                declared => {
                    let services: Vec<&ServiceDescriptor> = self.store.in_phase(declared).collect();
                    info!(%phase, services = services.len(), "entering phase");
                    for descriptor in services {
                        if cancel.is_cancelled() {
                            break;
                        }
                        report.outcomes.push(self.bring_up(descriptor, cancel).await);
                    }
                    if cancel.is_cancelled() {
                        // The phase did not finish; do not count it
                        continue;
                    }
                }
            }

            report.phases_completed.push(phase);
            phase = phase.next();
        }

        let ready = report.outcomes.iter().filter(|o| o.ready()).count();
        info!(ready, total = report.outcomes.len(), cancelled = report.cancelled, "run finished");
        report
    }

    async fn bring_up(&self, descriptor: &ServiceDescriptor, cancel: &CancellationToken) -> ServiceOutcome {
        let name = descriptor.name.as_str();
        let attempted_at = Utc::now();

        let start_error = match descriptor.category {
            ServiceCategory::Native => match self.processes.start(descriptor).await {
                Ok(record) => {
                    debug!(service = name, pid = record.pid, "process started");
                    None
                }
                Err(e) => Some(e),
            },
            ServiceCategory::Stack => match &descriptor.stack {
                Some(stack) => self.stacks.up(name, stack).await.err(),
                None => Some(WardenError::StackStartFailed {
                    stack: name.to_string(),
                    reason: "no stack reference".to_string(),
                }),
            },
            ServiceCategory::External => None,
        };

        if let Some(e) = &start_error {
            error!(service = name, code = e.error_code(), error = %e, "start failed; continuing");
            return ServiceOutcome {
                name: name.to_string(),
                phase: descriptor.phase,
                category: descriptor.category,
                attempted_at,
                start_error: Some(e.to_string()),
                health: None,
            };
        }

        let health = self.gate.await_ready(name, &descriptor.health, self.policy, cancel).await;
        if health.ready {
            info!(service = name, attempts = health.attempts, "ready");
        } else {
            let timeout = WardenError::HealthTimeout {
                service: name.to_string(),
                attempts: health.attempts,
            };
            warn!(service = name, code = timeout.error_code(), "{}; continuing", timeout);
        }

        ServiceOutcome {
            name: name.to_string(),
            phase: descriptor.phase,
            category: descriptor.category,
            attempted_at,
            start_error: None,
            health: Some(health),
        }
    }

    /// Probe every service exactly once, in declared order
    pub async fn verify(&self, cancel: &CancellationToken) -> Vec<HealthCheckResult> {
        let mut results = Vec::with_capacity(self.store.len());
        for descriptor in self.store.list() {
            results.push(
                self.gate
                    .await_ready(&descriptor.name, &descriptor.health, RetryPolicy::ONCE, cancel)
                    .await,
            );
        }
        results
    }

    /// Reverse-order shutdown: native processes stopped, stacks taken down, external untouched
    pub async fn stop_all(&self) {
        for descriptor in self.store.list().iter().rev() {
            let name = descriptor.name.as_str();
            match descriptor.category {
                ServiceCategory::Native => match self.processes.stop(name).await {
                    Ok(()) => {}
                    Err(WardenError::NotRunning(_)) => debug!(service = name, "not running"),
                    Err(e) => error!(service = name, error = %e, "stop failed"),
                },
                ServiceCategory::Stack => {
                    if let Some(stack) = &descriptor.stack {
                        if let Err(e) = self.stacks.down(name, stack).await {
                            error!(service = name, error = %e, "stack down failed");
                        }
                    }
                }
                ServiceCategory::External => {}
            }
        }

        // Records left by services since removed from the config
        let records = match self.processes.records().list() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "process records unreadable");
                return;
            }
        };
        for record in records.iter().filter(|r| self.store.get(&r.service).is_none()) {
            info!(service = %record.service, pid = record.pid, "stopping undeclared service");
            match self.processes.stop(&record.service).await {
                Ok(()) | Err(WardenError::NotRunning(_)) => {}
                Err(e) => error!(service = %record.service, error = %e, "stop failed"),
            }
        }
    }
}
