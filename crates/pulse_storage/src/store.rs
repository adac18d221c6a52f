#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use pulse_kernel_contracts::grant::{Grant, GrantInput, GrantKey};
use pulse_kernel_contracts::redemption::{RedemptionId, RedemptionRecord, RedemptionRecordInput};
use pulse_kernel_contracts::{Address, Amount, ContractViolation, UnixTimeSec, Validate};
use sha2::{Digest, Sha256};

use crate::journal::{StoreJournal, StoreJournalEvent};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("row not found in {table}: {key}")]
    NotFound { table: &'static str, key: String },
    #[error("grant {key} is not active")]
    GrantInactive { key: String },
    #[error("grant {key} has expired")]
    GrantExpired { key: String },
    #[error("grant {key} changed since its allowance was computed")]
    StaleGrant { key: String },
    #[error("redemption already in flight for {key}")]
    ClaimConflict { key: String },
    #[error("nothing available this period for {key}")]
    NothingAvailable { key: String },
    #[error("requested {requested} but only {available} available in current period")]
    InsufficientAllowance { requested: Amount, available: Amount },
    #[error("period cap {period_cap} exceeded for {key}: {already} redeemed, {attempted} attempted")]
    PeriodCapExceeded {
        key: String,
        period_cap: Amount,
        already: Amount,
        attempted: Amount,
    },
    #[error("store journal: {0}")]
    Journal(String),
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),
}

/// One accounting period of one grant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeriodKey {
    pub user: Address,
    pub asset: Address,
    pub period_start: UnixTimeSec,
}

impl PeriodKey {
    pub fn label(&self) -> String {
        format!("{}/{}@{}", self.user, self.asset, self.period_start.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClaimId(pub u64);

/// Reservation of a period's allowance while its transfer batch is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodClaim {
    pub claim_id: ClaimId,
    pub key: PeriodKey,
    pub amount: Amount,
    pub period_cap: Amount,
    pub idempotency_key: String,
    pub reserved_at: UnixTimeSec,
    pub lease_expires_at: UnixTimeSec,
}

impl PeriodClaim {
    pub fn is_live(&self, now: UnixTimeSec) -> bool {
        now < self.lease_expires_at
    }
}

/// The grant revision and period the caller computed its allowance against.
/// `requested = None` claims everything still available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodClaimRequest {
    pub user: Address,
    pub asset: Address,
    pub granted_at: UnixTimeSec,
    pub period_start: UnixTimeSec,
    pub period_cap: Amount,
    pub requested: Option<Amount>,
}

#[derive(Debug)]
pub struct PulseStore {
    grants: BTreeMap<GrantKey, Grant>,

    // Append-only; the sum per PeriodKey never exceeds the cap recorded with each row.
    redemption_ledger: Vec<RedemptionRecord>,
    next_redemption_id: u64,

    // At most one live claim per period.
    period_claims: BTreeMap<PeriodKey, PeriodClaim>,
    next_claim_seq: u64,

    journal: Option<StoreJournal>,
}

impl Default for PulseStore {
    fn default() -> Self {
        Self::new_in_memory()
    }
}

impl PulseStore {
    pub fn new_in_memory() -> Self {
        Self {
            grants: BTreeMap::new(),
            redemption_ledger: Vec::new(),
            next_redemption_id: 1,
            period_claims: BTreeMap::new(),
            next_claim_seq: 1,
            journal: None,
        }
    }

    /// Opens (creating if needed) the journal at `path` and replays it into a fresh store.
    pub fn open_with_journal(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let journal = StoreJournal::open(path)?;
        let events = journal.read_events()?;
        let mut store = Self::new_in_memory();
        for (idx, event) in events.into_iter().enumerate() {
            store.apply_event(event).map_err(|err| {
                StorageError::Journal(format!("journal replay failed at event {}: {}", idx + 1, err))
            })?;
        }
        tracing::info!(
            path = %journal.path().display(),
            grants = store.grants.len(),
            redemptions = store.redemption_ledger.len(),
            "store journal replayed"
        );
        store.journal = Some(journal);
        Ok(store)
    }

    fn apply_event(&mut self, event: StoreJournalEvent) -> Result<(), StorageError> {
        match event {
            StoreJournalEvent::GrantUpserted { grant } => {
                grant.validate()?;
                self.grants.insert(grant.key(), grant);
                Ok(())
            }
            StoreJournalEvent::GrantDeactivated { user, asset, at } => {
                let key = GrantKey::new(user, asset);
                let grant = self.grants.get_mut(&key).ok_or_else(|| StorageError::NotFound {
                    table: "grants",
                    key: grant_key_label(&key),
                })?;
                grant.active = false;
                grant.updated_at = grant.updated_at.max(at);
                Ok(())
            }
            StoreJournalEvent::RedemptionAppended { record, period_cap } => {
                record.validate()?;
                let key = PeriodKey {
                    user: record.user.clone(),
                    asset: record.asset.clone(),
                    period_start: record.period_start,
                };
                self.ensure_within_cap(&key, period_cap, record.amount)?;
                self.next_redemption_id = self.next_redemption_id.max(record.redemption_id.0 + 1);
                self.redemption_ledger.push(record);
                Ok(())
            }
        }
    }

    fn write_ahead(&self, event: &StoreJournalEvent) -> Result<(), StorageError> {
        match self.journal.as_ref() {
            Some(journal) => journal.append(event),
            None => Ok(()),
        }
    }

    // ---- grants ----

    /// Creates the grant or re-issues it in place; re-issuing resets the period anchor to `now`
    /// and reactivates it.
    pub fn upsert_grant(&mut self, input: GrantInput, now: UnixTimeSec) -> Result<Grant, StorageError> {
        let grant = Grant::issue(input, now)?;
        let event = StoreJournalEvent::GrantUpserted {
            grant: grant.clone(),
        };
        self.write_ahead(&event)?;
        self.apply_event(event)?;
        Ok(grant)
    }

    pub fn deactivate_grant(
        &mut self,
        user: &Address,
        asset: &Address,
        now: UnixTimeSec,
    ) -> Result<Grant, StorageError> {
        let key = GrantKey::new(user.clone(), asset.clone());
        if !self.grants.contains_key(&key) {
            return Err(StorageError::NotFound {
                table: "grants",
                key: grant_key_label(&key),
            });
        }
        let event = StoreJournalEvent::GrantDeactivated {
            user: user.clone(),
            asset: asset.clone(),
            at: now,
        };
        self.write_ahead(&event)?;
        self.apply_event(event)?;
        self.grants
            .get(&key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                table: "grants",
                key: grant_key_label(&key),
            })
    }

    /// Returns how many grants were active before the call.
    pub fn deactivate_all_grants(
        &mut self,
        user: &Address,
        now: UnixTimeSec,
    ) -> Result<usize, StorageError> {
        let assets: Vec<Address> = self
            .active_grants_for_user(user)
            .into_iter()
            .map(|g| g.asset.clone())
            .collect();
        for asset in &assets {
            self.deactivate_grant(user, asset, now)?;
        }
        Ok(assets.len())
    }

    pub fn grant(&self, user: &Address, asset: &Address) -> Option<&Grant> {
        self.grants.get(&GrantKey::new(user.clone(), asset.clone()))
    }

    pub fn active_grants_for_user(&self, user: &Address) -> Vec<&Grant> {
        self.grants
            .values()
            .filter(|g| g.active && &g.user == user)
            .collect()
    }

    pub fn users_with_active_grants(&self) -> Vec<Address> {
        self.grants
            .values()
            .filter(|g| g.active)
            .map(|g| g.user.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn grant_rows(&self) -> impl Iterator<Item = &Grant> {
        self.grants.values()
    }

    // ---- redemption ledger ----

    /// Appends a settled redemption, refusing any row that would push the period sum above
    /// `period_cap`.
    pub fn append_redemption(
        &mut self,
        input: RedemptionRecordInput,
        period_cap: Amount,
    ) -> Result<RedemptionRecord, StorageError> {
        input.validate()?;
        let key = PeriodKey {
            user: input.user.clone(),
            asset: input.asset.clone(),
            period_start: input.period_start,
        };
        self.ensure_within_cap(&key, period_cap, input.amount)?;
        let record = RedemptionRecord::from_input(RedemptionId(self.next_redemption_id), input);
        let event = StoreJournalEvent::RedemptionAppended {
            record: record.clone(),
            period_cap,
        };
        self.write_ahead(&event)?;
        self.apply_event(event)?;
        Ok(record)
    }

    fn ensure_within_cap(
        &self,
        key: &PeriodKey,
        period_cap: Amount,
        amount: Amount,
    ) -> Result<(), StorageError> {
        let already = self.redeemed_in_period(&key.user, &key.asset, key.period_start);
        match already.checked_add(amount) {
            Some(total) if total <= period_cap => Ok(()),
            _ => Err(StorageError::PeriodCapExceeded {
                key: key.label(),
                period_cap,
                already,
                attempted: amount,
            }),
        }
    }

    pub fn redeemed_in_period(
        &self,
        user: &Address,
        asset: &Address,
        period_start: UnixTimeSec,
    ) -> Amount {
        self.redemption_ledger
            .iter()
            .filter(|r| &r.user == user && &r.asset == asset && r.period_start == period_start)
            .fold(0u128, |acc, r| acc.saturating_add(r.amount))
    }

    pub fn redemption_rows(&self) -> &[RedemptionRecord] {
        &self.redemption_ledger
    }

    /// Newest first.
    pub fn redemptions_for_user(&self, user: &Address) -> Vec<&RedemptionRecord> {
        let mut rows: Vec<&RedemptionRecord> = self
            .redemption_ledger
            .iter()
            .filter(|r| &r.user == user)
            .collect();
        sort_newest_first(&mut rows);
        rows
    }

    /// Newest first.
    pub fn redemptions_in_period(
        &self,
        user: &Address,
        asset: &Address,
        period_start: UnixTimeSec,
    ) -> Vec<&RedemptionRecord> {
        let mut rows: Vec<&RedemptionRecord> = self
            .redemption_ledger
            .iter()
            .filter(|r| &r.user == user && &r.asset == asset && r.period_start == period_start)
            .collect();
        sort_newest_first(&mut rows);
        rows
    }

    // ---- period claims ----

    /// Atomically re-checks the allowance of one period and reserves it.
    pub fn reserve_period_claim(
        &mut self,
        req: PeriodClaimRequest,
        now: UnixTimeSec,
        lease_secs: u64,
    ) -> Result<PeriodClaim, StorageError> {
        let grant_key = GrantKey::new(req.user.clone(), req.asset.clone());
        let label = grant_key_label(&grant_key);
        let grant = self.grants.get(&grant_key).ok_or_else(|| StorageError::NotFound {
            table: "grants",
            key: label.clone(),
        })?;
        if !grant.active {
            return Err(StorageError::GrantInactive { key: label });
        }
        if grant.is_expired(now) {
            return Err(StorageError::GrantExpired { key: label });
        }
        if grant.granted_at != req.granted_at || grant.period_cap != req.period_cap {
            return Err(StorageError::StaleGrant { key: label });
        }

        let key = PeriodKey {
            user: req.user,
            asset: req.asset,
            period_start: req.period_start,
        };
        if let Some(existing) = self.period_claims.get(&key) {
            if existing.is_live(now) {
                return Err(StorageError::ClaimConflict { key: key.label() });
            }
            tracing::warn!(
                period = %key.label(),
                claim_id = existing.claim_id.0,
                "period claim lease expired without settlement; reclaiming"
            );
        }

        let settled = self.redeemed_in_period(&key.user, &key.asset, key.period_start);
        let available = req.period_cap.saturating_sub(settled);
        if available == 0 {
            return Err(StorageError::NothingAvailable { key: key.label() });
        }
        let amount = match req.requested {
            None => available,
            Some(0) => {
                return Err(StorageError::ContractViolation(ContractViolation::InvalidValue {
                    field: "period_claim_request.requested",
                    reason: "must be > 0",
                }))
            }
            Some(requested) if requested > available => {
                return Err(StorageError::InsufficientAllowance {
                    requested,
                    available,
                })
            }
            Some(requested) => requested,
        };

        let settled_count = self
            .redemption_ledger
            .iter()
            .filter(|r| {
                r.user == key.user && r.asset == key.asset && r.period_start == key.period_start
            })
            .count();
        let claim = PeriodClaim {
            claim_id: ClaimId(self.next_claim_seq),
            idempotency_key: period_idempotency_key(&key, settled_count, amount),
            key: key.clone(),
            amount,
            period_cap: req.period_cap,
            reserved_at: now,
            lease_expires_at: now.saturating_add_secs(lease_secs.max(1)),
        };
        self.next_claim_seq = self.next_claim_seq.saturating_add(1);
        self.period_claims.insert(key, claim.clone());
        Ok(claim)
    }

    /// Converts a claim into a RedemptionRecord. Works even if the claim's lease lapsed, as long
    /// as the cap still holds.
    pub fn settle_period_claim(
        &mut self,
        claim: &PeriodClaim,
        settlement_ref: String,
        redeemed_at: UnixTimeSec,
    ) -> Result<RedemptionRecord, StorageError> {
        let input = RedemptionRecordInput::v1(
            claim.key.user.clone(),
            claim.key.asset.clone(),
            claim.amount,
            settlement_ref,
            redeemed_at.max(claim.key.period_start),
            claim.key.period_start,
        )?;
        let record = self.append_redemption(input, claim.period_cap)?;
        self.drop_claim_if_owned(claim);
        Ok(record)
    }

    /// Leaves the period pending. Returns false if the claim was already gone or replaced.
    pub fn release_period_claim(&mut self, claim: &PeriodClaim) -> bool {
        self.drop_claim_if_owned(claim)
    }

    fn drop_claim_if_owned(&mut self, claim: &PeriodClaim) -> bool {
        let owned = self
            .period_claims
            .get(&claim.key)
            .map(|c| c.claim_id == claim.claim_id)
            .unwrap_or(false);
        if owned {
            self.period_claims.remove(&claim.key);
        }
        owned
    }

    pub fn in_flight_in_period(
        &self,
        user: &Address,
        asset: &Address,
        period_start: UnixTimeSec,
        now: UnixTimeSec,
    ) -> Amount {
        let key = PeriodKey {
            user: user.clone(),
            asset: asset.clone(),
            period_start,
        };
        self.period_claims
            .get(&key)
            .filter(|c| c.is_live(now))
            .map(|c| c.amount)
            .unwrap_or(0)
    }

    pub fn live_claims(&self, now: UnixTimeSec) -> Vec<&PeriodClaim> {
        self.period_claims.values().filter(|c| c.is_live(now)).collect()
    }
}

fn sort_newest_first(rows: &mut [&RedemptionRecord]) {
    rows.sort_by(|a, b| {
        b.redeemed_at
            .cmp(&a.redeemed_at)
            .then(b.redemption_id.cmp(&a.redemption_id))
    });
}

fn grant_key_label(key: &GrantKey) -> String {
    format!("{}/{}", key.user, key.asset)
}

/// Stable across retries of the same pending period and amount; advances once a redemption
/// settles in it. A different amount for the same period never shares a key.
fn period_idempotency_key(key: &PeriodKey, settled_count: usize, amount: Amount) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.user.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(key.asset.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(key.period_start.0.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(settled_count.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(amount.to_string().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
