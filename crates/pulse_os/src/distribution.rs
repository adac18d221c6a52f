#![forbid(unsafe_code)]

use std::sync::Mutex;

use pulse_kernel_contracts::UnixTimeSec;
use pulse_storage::PulseStore;
use serde::Serialize;

use crate::eligibility::{EligibilityClass, EligibilityMonitor};
use crate::execution::ExecutionCollaborator;
use crate::redemption::{
    lock_store, RedemptionConfig, RedemptionFault, RedemptionOrchestrator, RedemptionResult,
};
use crate::registry::DeadlineRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionRunReport {
    pub started_at: UnixTimeSec,
    pub users_checked: u32,
    pub users_distributing: u32,
    pub results: Vec<RedemptionResult>,
    pub errors: Vec<String>,
}

impl DistributionRunReport {
    pub fn success(&self) -> bool {
        self.errors.is_empty() && self.results.iter().all(|r| r.errors.is_empty())
    }
}

/// One batch pass over every user with at least one active grant.
pub struct DistributionRun<'a> {
    store: &'a Mutex<PulseStore>,
    registry: &'a dyn DeadlineRegistry,
    executor: &'a dyn ExecutionCollaborator,
    config: RedemptionConfig,
}

impl<'a> DistributionRun<'a> {
    pub fn new(
        store: &'a Mutex<PulseStore>,
        registry: &'a dyn DeadlineRegistry,
        executor: &'a dyn ExecutionCollaborator,
        config: RedemptionConfig,
    ) -> Self {
        Self {
            store,
            registry,
            executor,
            config,
        }
    }

    /// Users are processed sequentially. A fault for one user lands in `errors` and the pass
    /// continues; only failing to list users aborts it.
    pub fn run(&self, now: UnixTimeSec) -> Result<DistributionRunReport, RedemptionFault> {
        let users = lock_store(self.store)?.users_with_active_grants();
        tracing::info!(users = users.len(), now = now.0, "distribution run started");

        let monitor = EligibilityMonitor::new(self.registry);
        let orchestrator =
            RedemptionOrchestrator::new(self.store, self.registry, self.executor, self.config);
        let mut report = DistributionRunReport {
            started_at: now,
            users_checked: 0,
            users_distributing: 0,
            results: Vec::new(),
            errors: Vec::new(),
        };

        for user in &users {
            report.users_checked = report.users_checked.saturating_add(1);
            let status = monitor.status(user, now);
            if !status.distributing {
                tracing::debug!(user = %user, class = ?status.class, "user skipped");
                if status.class == EligibilityClass::Unreachable {
                    if let Some(err) = status.read_error {
                        report.errors.push(format!("{user}: registry read failed: {err}"));
                    }
                }
                continue;
            }
            report.users_distributing = report.users_distributing.saturating_add(1);
            match orchestrator.redeem(user, now) {
                Ok(result) => report.results.push(result),
                Err(fault) => {
                    tracing::error!(user = %user, error = %fault, "redemption fault");
                    report.errors.push(format!("{user}: {fault}"));
                }
            }
        }

        tracing::info!(
            users_checked = report.users_checked,
            users_distributing = report.users_distributing,
            results = report.results.len(),
            errors = report.errors.len(),
            "distribution run finished"
        );
        Ok(report)
    }
}
