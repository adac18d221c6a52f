#![forbid(unsafe_code)]

use pulse_kernel_contracts::{Address, UnixTimeSec};
use serde::Serialize;

use crate::registry::DeadlineRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityClass {
    NotRegistered,
    Active,
    PastDeadline,
    /// Registry read failed; treated as not distributing.
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityStatus {
    pub user: Address,
    pub registered: bool,
    pub distributing: bool,
    pub deadline: Option<UnixTimeSec>,
    pub class: EligibilityClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_error: Option<String>,
}

/// Read-only classification of users against the deadline registry.
#[derive(Clone, Copy)]
pub struct EligibilityMonitor<'a> {
    registry: &'a dyn DeadlineRegistry,
}

impl<'a> EligibilityMonitor<'a> {
    pub fn new(registry: &'a dyn DeadlineRegistry) -> Self {
        Self { registry }
    }

    /// `distributing = registered && now > deadline`. Never fails: a registry error yields the
    /// conservative `Unreachable` classification.
    pub fn status(&self, user: &Address, now: UnixTimeSec) -> EligibilityStatus {
        match self.registry.user_status(user) {
            Ok(s) if !s.registered => EligibilityStatus {
                user: user.clone(),
                registered: false,
                distributing: false,
                deadline: None,
                class: EligibilityClass::NotRegistered,
                read_error: None,
            },
            Ok(s) => {
                let distributing = now > s.deadline;
                EligibilityStatus {
                    user: user.clone(),
                    registered: true,
                    distributing,
                    deadline: Some(s.deadline),
                    class: if distributing {
                        EligibilityClass::PastDeadline
                    } else {
                        EligibilityClass::Active
                    },
                    read_error: None,
                }
            }
            Err(err) => {
                tracing::warn!(user = %user, error = %err, "registry read failed; treating user as not distributing");
                EligibilityStatus {
                    user: user.clone(),
                    registered: false,
                    distributing: false,
                    deadline: None,
                    class: EligibilityClass::Unreachable,
                    read_error: Some(err.to_string()),
                }
            }
        }
    }

    pub fn statuses<'u>(
        &self,
        users: impl IntoIterator<Item = &'u Address>,
        now: UnixTimeSec,
    ) -> Vec<EligibilityStatus> {
        users.into_iter().map(|u| self.status(u, now)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistry;

    fn addr(last: u8) -> Address {
        Address::new(format!("0x{:040x}", last)).unwrap()
    }

    #[test]
    fn at_elig_01_classifies_by_deadline_strictly() {
        let r = InMemoryRegistry::new();
        r.register(addr(1), UnixTimeSec(1_000));
        let m = EligibilityMonitor::new(&r);

        let at_deadline = m.status(&addr(1), UnixTimeSec(1_000));
        assert_eq!(at_deadline.class, EligibilityClass::Active);
        assert!(!at_deadline.distributing);

        let after = m.status(&addr(1), UnixTimeSec(1_001));
        assert_eq!(after.class, EligibilityClass::PastDeadline);
        assert!(after.distributing);
        assert_eq!(after.deadline, Some(UnixTimeSec(1_000)));
    }

    #[test]
    fn at_elig_02_unregistered_user_is_never_distributing() {
        let r = InMemoryRegistry::new();
        let m = EligibilityMonitor::new(&r);
        let s = m.status(&addr(9), UnixTimeSec(u64::MAX));
        assert_eq!(s.class, EligibilityClass::NotRegistered);
        assert!(!s.distributing);
    }

    #[test]
    fn at_elig_03_read_failure_is_isolated_per_user() {
        let r = InMemoryRegistry::new();
        r.register(addr(1), UnixTimeSec(10));
        r.register(addr(2), UnixTimeSec(10));
        r.set_unreachable(addr(1), true);
        let m = EligibilityMonitor::new(&r);

        let users = vec![addr(1), addr(2)];
        let out = m.statuses(&users, UnixTimeSec(20));
        assert_eq!(out[0].class, EligibilityClass::Unreachable);
        assert!(!out[0].distributing);
        assert!(out[0].read_error.is_some());
        assert_eq!(out[1].class, EligibilityClass::PastDeadline);
    }
}
