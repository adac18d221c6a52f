#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use pulse_kernel_contracts::registry::{BackupAllocation, DistributionNotice, RegistryUserStatus};
use pulse_kernel_contracts::{Address, ContractViolation, UnixTimeSec};
use serde::Deserialize;

use crate::bridge::HttpBridgeConfig;

pub const REGISTRY_ENDPOINT_ENV: &str = "PULSE_REGISTRY_ENDPOINT";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("registry endpoint not configured")]
    NotConfigured,
    #[error("registry transport error: {0}")]
    Transport(String),
    #[error("registry answered http status {0}")]
    Status(u16),
    #[error("registry response invalid: {0}")]
    InvalidResponse(String),
    #[error("registry unavailable for {0}")]
    Unavailable(String),
}

impl From<ContractViolation> for RegistryError {
    fn from(err: ContractViolation) -> Self {
        RegistryError::InvalidResponse(err.to_string())
    }
}

/// Read/query seam over the external deadline and backup registry.
pub trait DeadlineRegistry: Send + Sync {
    fn user_status(&self, user: &Address) -> Result<RegistryUserStatus, RegistryError>;

    fn backups(&self, user: &Address) -> Result<Vec<BackupAllocation>, RegistryError>;

    /// Best-effort; callers log failures and move on.
    fn record_distribution(&self, notice: &DistributionNotice) -> Result<(), RegistryError>;

    fn is_registered(&self, user: &Address) -> Result<bool, RegistryError> {
        Ok(self.user_status(user)?.registered)
    }

    fn is_distributing(&self, user: &Address) -> Result<bool, RegistryError> {
        Ok(self.user_status(user)?.distributing)
    }
}

#[derive(Debug, Deserialize)]
struct StatusWire {
    registered: bool,
    #[serde(default)]
    distributing: bool,
    deadline: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackupWire {
    address: String,
    share_bps: u16,
}

#[derive(Debug, Clone)]
pub struct HttpRegistry {
    config: HttpBridgeConfig,
    agent: ureq::Agent,
}

impl HttpRegistry {
    pub fn new(config: HttpBridgeConfig) -> Self {
        let agent = config.agent();
        Self { config, agent }
    }

    pub fn from_env() -> Option<Self> {
        HttpBridgeConfig::from_env(REGISTRY_ENDPOINT_ENV).map(Self::new)
    }

    pub fn config(&self) -> &HttpBridgeConfig {
        &self.config
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, RegistryError> {
        let url = self
            .config
            .url(path)
            .map_err(|err| RegistryError::InvalidResponse(format!("bad registry path: {err}")))?;
        match self.agent.get(url.as_str()).call() {
            Ok(resp) => resp
                .into_json::<T>()
                .map_err(|err| RegistryError::InvalidResponse(err.to_string())),
            Err(ureq::Error::Status(code, _)) => Err(RegistryError::Status(code)),
            Err(ureq::Error::Transport(err)) => Err(RegistryError::Transport(err.to_string())),
        }
    }
}

impl DeadlineRegistry for HttpRegistry {
    fn user_status(&self, user: &Address) -> Result<RegistryUserStatus, RegistryError> {
        let wire: StatusWire = self.get_json(&format!("v1/users/{user}/status"))?;
        Ok(RegistryUserStatus {
            registered: wire.registered,
            distributing: wire.distributing,
            deadline: UnixTimeSec(wire.deadline),
        })
    }

    fn backups(&self, user: &Address) -> Result<Vec<BackupAllocation>, RegistryError> {
        let wire: Vec<BackupWire> = self.get_json(&format!("v1/users/{user}/backups"))?;
        wire.into_iter()
            .map(|b| -> Result<BackupAllocation, RegistryError> {
                Ok(BackupAllocation::v1(Address::new(b.address)?, b.share_bps)?)
            })
            .collect()
    }

    fn record_distribution(&self, notice: &DistributionNotice) -> Result<(), RegistryError> {
        let url = self
            .config
            .url("v1/distributions")
            .map_err(|err| RegistryError::InvalidResponse(format!("bad registry path: {err}")))?;
        match self
            .agent
            .post(url.as_str())
            .set("content-type", "application/json")
            .send_json(notice)
        {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, _)) => Err(RegistryError::Status(code)),
            Err(ureq::Error::Transport(err)) => Err(RegistryError::Transport(err.to_string())),
        }
    }
}

/// Stand-in when no registry endpoint is configured: every read fails, so every user is
/// classified conservatively and nothing is redeemed.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredRegistry;

impl DeadlineRegistry for UnconfiguredRegistry {
    fn user_status(&self, _user: &Address) -> Result<RegistryUserStatus, RegistryError> {
        Err(RegistryError::NotConfigured)
    }

    fn backups(&self, _user: &Address) -> Result<Vec<BackupAllocation>, RegistryError> {
        Err(RegistryError::NotConfigured)
    }

    fn record_distribution(&self, _notice: &DistributionNotice) -> Result<(), RegistryError> {
        Err(RegistryError::NotConfigured)
    }
}

#[derive(Debug, Default)]
struct InMemoryRegistryState {
    statuses: BTreeMap<Address, RegistryUserStatus>,
    backups: BTreeMap<Address, Vec<BackupAllocation>>,
    unreachable: BTreeSet<Address>,
    reject_notices: bool,
    notices: Vec<DistributionNotice>,
}

/// In-process registry for local runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    state: Mutex<InMemoryRegistryState>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, user: Address, deadline: UnixTimeSec) {
        self.state_for_setup().statuses.insert(
            user,
            RegistryUserStatus {
                registered: true,
                distributing: false,
                deadline,
            },
        );
    }

    pub fn set_backups(&self, user: Address, backups: Vec<BackupAllocation>) {
        self.state_for_setup().backups.insert(user, backups);
    }

    /// Reads for `user` fail until cleared.
    pub fn set_unreachable(&self, user: Address, unreachable: bool) {
        let mut state = self.state_for_setup();
        if unreachable {
            state.unreachable.insert(user);
        } else {
            state.unreachable.remove(&user);
        }
    }

    pub fn set_reject_notices(&self, reject: bool) {
        self.state_for_setup().reject_notices = reject;
    }

    pub fn notices(&self) -> Vec<DistributionNotice> {
        self.state_for_setup().notices.clone()
    }

    fn state_for_setup(&self) -> MutexGuard<'_, InMemoryRegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_state<T>(
        &self,
        user: Option<&Address>,
        f: impl FnOnce(&mut InMemoryRegistryState) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| RegistryError::Transport("in-memory registry lock poisoned".to_string()))?;
        if let Some(user) = user {
            if state.unreachable.contains(user) {
                return Err(RegistryError::Unavailable(user.to_string()));
            }
        }
        f(&mut state)
    }
}

impl DeadlineRegistry for InMemoryRegistry {
    fn user_status(&self, user: &Address) -> Result<RegistryUserStatus, RegistryError> {
        self.with_state(Some(user), |state| {
            Ok(state
                .statuses
                .get(user)
                .copied()
                .unwrap_or(RegistryUserStatus {
                    registered: false,
                    distributing: false,
                    deadline: UnixTimeSec(0),
                }))
        })
    }

    fn backups(&self, user: &Address) -> Result<Vec<BackupAllocation>, RegistryError> {
        self.with_state(Some(user), |state| {
            Ok(state.backups.get(user).cloned().unwrap_or_default())
        })
    }

    fn record_distribution(&self, notice: &DistributionNotice) -> Result<(), RegistryError> {
        self.with_state(None, |state| {
            if state.reject_notices {
                return Err(RegistryError::Status(503));
            }
            state.notices.push(notice.clone());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> Address {
        Address::new(format!("0x{:040x}", last)).unwrap()
    }

    #[test]
    fn at_registry_os_01_unknown_user_is_not_registered() {
        let r = InMemoryRegistry::new();
        let s = r.user_status(&addr(1)).unwrap();
        assert!(!s.registered);
        assert!(r.backups(&addr(1)).unwrap().is_empty());
    }

    #[test]
    fn at_registry_os_02_unreachable_user_fails_reads_only_for_that_user() {
        let r = InMemoryRegistry::new();
        r.register(addr(1), UnixTimeSec(10));
        r.register(addr(2), UnixTimeSec(10));
        r.set_unreachable(addr(1), true);
        assert!(matches!(
            r.user_status(&addr(1)),
            Err(RegistryError::Unavailable(_))
        ));
        assert!(r.is_registered(&addr(2)).unwrap());
        r.set_unreachable(addr(1), false);
        assert!(r.is_registered(&addr(1)).unwrap());
    }

    #[test]
    fn at_registry_os_03_rejected_notices_are_not_recorded() {
        let r = InMemoryRegistry::new();
        let notice = DistributionNotice::v1(addr(1), &addr(0xa0), vec![(addr(2), 5)]).unwrap();
        r.set_reject_notices(true);
        assert!(r.record_distribution(&notice).is_err());
        r.set_reject_notices(false);
        r.record_distribution(&notice).unwrap();
        assert_eq!(r.notices(), vec![notice]);
    }

    #[test]
    fn at_registry_os_04_unconfigured_registry_fails_every_read() {
        let r = UnconfiguredRegistry;
        assert_eq!(r.user_status(&addr(1)), Err(RegistryError::NotConfigured));
        assert_eq!(r.backups(&addr(1)), Err(RegistryError::NotConfigured));
    }

    #[test]
    fn at_registry_os_05_backup_wire_parses_camel_case() {
        let wire: Vec<BackupWire> = serde_json::from_str(
            r#"[{"address":"0x00000000000000000000000000000000000000AA","shareBps":5000}]"#,
        )
        .unwrap();
        let parsed: Result<Vec<BackupAllocation>, RegistryError> = wire
            .into_iter()
            .map(|b| -> Result<BackupAllocation, RegistryError> {
                Ok(BackupAllocation::v1(Address::new(b.address)?, b.share_bps)?)
            })
            .collect();
        let parsed = parsed.unwrap();
        assert_eq!(parsed[0].recipient, addr(0xaa));
        assert_eq!(parsed[0].share_bps, 5000);
    }

    #[test]
    fn at_registry_os_06_setup_still_applies_after_lock_poisoning() {
        let r = std::sync::Arc::new(InMemoryRegistry::new());
        let holder = r.clone();
        let _ = std::thread::spawn(move || {
            let _guard = holder.state.lock().unwrap();
            panic!("panicked while holding the registry lock");
        })
        .join();
        assert!(r.state.is_poisoned());

        r.register(addr(1), UnixTimeSec(10));
        r.set_backups(addr(1), vec![BackupAllocation::v1(addr(2), 10_000).unwrap()]);
        let state = r.state_for_setup();
        assert!(state.statuses.contains_key(&addr(1)));
        assert_eq!(state.backups[&addr(1)].len(), 1);
    }
}
