#![forbid(unsafe_code)]

pub mod config;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use pulse_engines::{PeriodAccountant, PeriodUsage};
use pulse_kernel_contracts::grant::{Grant, GrantInput};
use pulse_kernel_contracts::redemption::RedemptionRecord;
use pulse_kernel_contracts::{amount_string, Address, Amount, UnixTimeSec};
use pulse_os::{
    DeadlineRegistry, DistributionRun, DistributionRunReport, EligibilityMonitor,
    EligibilityStatus, ExecutionCollaborator, HttpExecution, HttpRegistry, LoopbackExecution,
    RedemptionConfig, RedemptionFault, RedemptionOrchestrator, RedemptionResult,
    UnconfiguredExecution, UnconfiguredRegistry,
};
use pulse_storage::{PulseStore, StorageError};
use serde::{Deserialize, Serialize};

use crate::config::{AdapterConfig, ConfigError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl From<StorageError> for AdapterError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { .. } => AdapterError::NotFound(err.to_string()),
            StorageError::ContractViolation(_) => AdapterError::BadRequest(err.to_string()),
            _ => AdapterError::Internal(err.to_string()),
        }
    }
}

impl From<RedemptionFault> for AdapterError {
    fn from(err: RedemptionFault) -> Self {
        AdapterError::Internal(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreGrantAdapterRequest {
    pub user_address: String,
    pub token_address: String,
    pub permissions_context: String,
    pub delegation_manager: String,
    pub period_amount: String,
    pub period_duration_seconds: u64,
    #[serde(default)]
    pub expires_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantView {
    pub user_address: Address,
    pub token_address: Address,
    pub permissions_context: String,
    pub delegation_manager: String,
    #[serde(with = "amount_string")]
    pub period_amount: Amount,
    pub period_duration_seconds: u64,
    pub granted_at: u64,
    pub expires_at: Option<u64>,
    pub active: bool,
    pub updated_at: u64,
}

impl From<&Grant> for GrantView {
    fn from(g: &Grant) -> Self {
        Self {
            user_address: g.user.clone(),
            token_address: g.asset.clone(),
            permissions_context: g.auth_context.clone(),
            delegation_manager: g.auth_manager.clone(),
            period_amount: g.period_cap,
            period_duration_seconds: g.period_length_seconds,
            granted_at: g.granted_at.0,
            expires_at: g.expires_at.map(|t| t.0),
            active: g.active,
            updated_at: g.updated_at.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreGrantResponse {
    pub status: String,
    pub grant: GrantView,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantsResponse {
    pub status: String,
    pub user_address: Address,
    pub grants: Vec<GrantView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowanceView {
    pub token_address: Address,
    #[serde(with = "amount_string")]
    pub period_amount: Amount,
    pub period_duration_seconds: u64,
    #[serde(with = "amount_string")]
    pub already_redeemed: Amount,
    #[serde(with = "amount_string")]
    pub in_flight: Amount,
    #[serde(with = "amount_string")]
    pub available_to_redeem: Amount,
    pub period_starts_at: u64,
    pub period_ends_at: u64,
    pub expired: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowanceSummaryResponse {
    pub status: String,
    pub user_address: Address,
    pub generated_at: u64,
    pub allowances: Vec<AllowanceView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionView {
    pub redemption_id: u64,
    pub token_address: Address,
    #[serde(with = "amount_string")]
    pub amount: Amount,
    pub settlement_ref: String,
    pub redeemed_at: u64,
    pub period_start: u64,
}

impl From<&RedemptionRecord> for RedemptionView {
    fn from(r: &RedemptionRecord) -> Self {
        Self {
            redemption_id: r.redemption_id.0,
            token_address: r.asset.clone(),
            amount: r.amount,
            settlement_ref: r.settlement_ref.clone(),
            redeemed_at: r.redeemed_at.0,
            period_start: r.period_start.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionsResponse {
    pub status: String,
    pub user_address: Address,
    pub redemptions: Vec<RedemptionView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanRedeemAdapterRequest {
    pub token_address: String,
    pub amount: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanRedeemResponse {
    pub status: String,
    pub can_redeem: bool,
    #[serde(with = "amount_string")]
    pub available: Amount,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeactivateResponse {
    pub status: String,
    pub deactivated: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemAdapterRequest {
    pub user_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemAmountAdapterRequest {
    pub user_address: String,
    pub token_address: String,
    pub amount: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemResponse {
    pub status: String,
    pub result: RedemptionResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionRunResponse {
    pub status: String,
    pub report: DistributionRunReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: String,
    pub eligibility: EligibilityStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllStatusesResponse {
    pub status: String,
    pub users: Vec<EligibilityStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterHealthResponse {
    pub status: String,
    pub grants: usize,
    pub active_grants: usize,
    pub redemptions: usize,
    pub live_claims: usize,
    pub session_key: String,
    pub journal_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: String,
    pub reason: String,
}

impl ErrorResponse {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            reason: reason.into(),
        }
    }
}

/// Request-level surface over the store, the registry and the execution bridge. Cheap to clone;
/// every clone shares the same store.
#[derive(Clone)]
pub struct AdapterRuntime {
    store: Arc<Mutex<PulseStore>>,
    registry: Arc<dyn DeadlineRegistry>,
    executor: Arc<dyn ExecutionCollaborator>,
    redemption_config: RedemptionConfig,
    session_key_fingerprint: Option<String>,
    journal_path: Option<PathBuf>,
}

impl AdapterRuntime {
    pub fn new(
        store: PulseStore,
        registry: Arc<dyn DeadlineRegistry>,
        executor: Arc<dyn ExecutionCollaborator>,
        redemption_config: RedemptionConfig,
    ) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            registry,
            executor,
            redemption_config,
            session_key_fingerprint: None,
            journal_path: None,
        }
    }

    pub fn with_session_key_fingerprint(mut self, fingerprint: Option<String>) -> Self {
        self.session_key_fingerprint = fingerprint;
        self
    }

    pub fn with_journal_path(mut self, path: PathBuf) -> Self {
        self.journal_path = Some(path);
        self
    }

    /// Opens the journal-backed store and wires collaborators from `config`. Without a registry
    /// endpoint every user reads as unreachable; without an execution endpoint every batch fails
    /// with a configuration error unless loopback settlement was asked for.
    pub fn from_config(config: &AdapterConfig) -> Result<Self, ConfigError> {
        let store = PulseStore::open_with_journal(&config.store_path)?;
        let registry: Arc<dyn DeadlineRegistry> = match config.registry.clone() {
            Some(bridge) => Arc::new(HttpRegistry::new(bridge)),
            None => {
                tracing::warn!("PULSE_REGISTRY_ENDPOINT not set; no user will be classified as distributing");
                Arc::new(UnconfiguredRegistry)
            }
        };
        let executor = executor_from_config(config);
        Ok(Self::new(store, registry, executor, config.redemption)
            .with_session_key_fingerprint(config.session_key.as_ref().map(|k| k.fingerprint()))
            .with_journal_path(config.store_path.clone()))
    }

    pub fn default_from_env() -> Result<Self, ConfigError> {
        Self::from_config(&AdapterConfig::from_env()?)
    }

    fn lock_store(&self) -> Result<MutexGuard<'_, PulseStore>, AdapterError> {
        self.store
            .lock()
            .map_err(|_| AdapterError::Internal("adapter store lock poisoned".to_string()))
    }

    fn orchestrator(&self) -> RedemptionOrchestrator<'_> {
        RedemptionOrchestrator::new(
            &self.store,
            self.registry.as_ref(),
            self.executor.as_ref(),
            self.redemption_config,
        )
    }

    pub fn health_report(&self, now: Option<u64>) -> Result<AdapterHealthResponse, AdapterError> {
        let now = resolve_now(now);
        let store = self.lock_store()?;
        Ok(AdapterHealthResponse {
            status: "ok".to_string(),
            grants: store.grant_rows().count(),
            active_grants: store.grant_rows().filter(|g| g.active).count(),
            redemptions: store.redemption_rows().len(),
            live_claims: store.live_claims(now).len(),
            session_key: match self.session_key_fingerprint.as_ref() {
                Some(fp) => format!("fp:{fp}"),
                None => "not configured".to_string(),
            },
            journal_path: self.journal_path.as_ref().map(|p| p.display().to_string()),
        })
    }

    pub fn store_grant(
        &self,
        request: StoreGrantAdapterRequest,
        now: Option<u64>,
    ) -> Result<StoreGrantResponse, AdapterError> {
        let now = resolve_now(now);
        let input = GrantInput::v1(
            parse_address("userAddress", &request.user_address)?,
            parse_address("tokenAddress", &request.token_address)?,
            request.permissions_context,
            request.delegation_manager,
            parse_amount("periodAmount", &request.period_amount)?,
            request.period_duration_seconds,
            request.expires_at.map(UnixTimeSec),
        )
        .map_err(|err| AdapterError::BadRequest(err.to_string()))?;
        let grant = self.lock_store()?.upsert_grant(input, now)?;
        tracing::info!(user = %grant.user, asset = %grant.asset, "grant stored");
        Ok(StoreGrantResponse {
            status: "ok".to_string(),
            grant: GrantView::from(&grant),
        })
    }

    pub fn grants(&self, user: &str) -> Result<GrantsResponse, AdapterError> {
        let user = parse_address("userAddress", user)?;
        let store = self.lock_store()?;
        let grants = store
            .active_grants_for_user(&user)
            .into_iter()
            .map(GrantView::from)
            .collect();
        Ok(GrantsResponse {
            status: "ok".to_string(),
            user_address: user,
            grants,
        })
    }

    pub fn allowance_summary(
        &self,
        user: &str,
        now: Option<u64>,
    ) -> Result<AllowanceSummaryResponse, AdapterError> {
        let user = parse_address("userAddress", user)?;
        let now = resolve_now(now);
        let store = self.lock_store()?;
        let mut allowances = Vec::new();
        for grant in store.active_grants_for_user(&user) {
            let snap = PeriodAccountant::snapshot(grant, now, |period_start| PeriodUsage {
                settled: store.redeemed_in_period(&user, &grant.asset, period_start),
                in_flight: store.in_flight_in_period(&user, &grant.asset, period_start, now),
            })
            .map_err(|err| AdapterError::Internal(err.to_string()))?;
            allowances.push(AllowanceView {
                token_address: snap.asset,
                period_amount: snap.period_cap,
                period_duration_seconds: snap.period_length_seconds,
                already_redeemed: snap.already_redeemed,
                in_flight: snap.in_flight,
                available_to_redeem: snap.available_to_redeem,
                period_starts_at: snap.period.start.0,
                period_ends_at: snap.period.end.0,
                expired: snap.expired,
            });
        }
        Ok(AllowanceSummaryResponse {
            status: "ok".to_string(),
            user_address: user,
            generated_at: now.0,
            allowances,
        })
    }

    pub fn can_redeem_amount(
        &self,
        user: &str,
        request: CanRedeemAdapterRequest,
        now: Option<u64>,
    ) -> Result<CanRedeemResponse, AdapterError> {
        let user = parse_address("userAddress", user)?;
        let asset = parse_address("tokenAddress", &request.token_address)?;
        let amount = parse_amount("amount", &request.amount)?;
        let now = resolve_now(now);
        let store = self.lock_store()?;
        let Some(grant) = store.grant(&user, &asset).filter(|g| g.active) else {
            return Ok(CanRedeemResponse {
                status: "ok".to_string(),
                can_redeem: false,
                available: 0,
                reason: Some("no active grant for this asset".to_string()),
            });
        };
        let snap = PeriodAccountant::snapshot(grant, now, |period_start| PeriodUsage {
            settled: store.redeemed_in_period(&user, &asset, period_start),
            in_flight: store.in_flight_in_period(&user, &asset, period_start, now),
        })
        .map_err(|err| AdapterError::Internal(err.to_string()))?;
        let available = snap.available_to_redeem;
        if amount > available {
            return Ok(CanRedeemResponse {
                status: "ok".to_string(),
                can_redeem: false,
                available,
                reason: Some(format!(
                    "requested {amount} but only {available} available in current period"
                )),
            });
        }
        Ok(CanRedeemResponse {
            status: "ok".to_string(),
            can_redeem: true,
            available,
            reason: None,
        })
    }

    pub fn redemptions(&self, user: &str) -> Result<RedemptionsResponse, AdapterError> {
        let user = parse_address("userAddress", user)?;
        let store = self.lock_store()?;
        let redemptions = store
            .redemptions_for_user(&user)
            .into_iter()
            .map(RedemptionView::from)
            .collect();
        Ok(RedemptionsResponse {
            status: "ok".to_string(),
            user_address: user,
            redemptions,
        })
    }

    pub fn redemptions_in_period(
        &self,
        user: &str,
        asset: &str,
        period_start: u64,
    ) -> Result<RedemptionsResponse, AdapterError> {
        let user = parse_address("userAddress", user)?;
        let asset = parse_address("tokenAddress", asset)?;
        let store = self.lock_store()?;
        let redemptions = store
            .redemptions_in_period(&user, &asset, UnixTimeSec(period_start))
            .into_iter()
            .map(RedemptionView::from)
            .collect();
        Ok(RedemptionsResponse {
            status: "ok".to_string(),
            user_address: user,
            redemptions,
        })
    }

    pub fn deactivate_grant(
        &self,
        user: &str,
        asset: &str,
        now: Option<u64>,
    ) -> Result<DeactivateResponse, AdapterError> {
        let user = parse_address("userAddress", user)?;
        let asset = parse_address("tokenAddress", asset)?;
        self.lock_store()?
            .deactivate_grant(&user, &asset, resolve_now(now))?;
        tracing::info!(user = %user, asset = %asset, "grant deactivated");
        Ok(DeactivateResponse {
            status: "ok".to_string(),
            deactivated: 1,
        })
    }

    pub fn deactivate_all_grants(
        &self,
        user: &str,
        now: Option<u64>,
    ) -> Result<DeactivateResponse, AdapterError> {
        let user = parse_address("userAddress", user)?;
        let deactivated = self
            .lock_store()?
            .deactivate_all_grants(&user, resolve_now(now))?;
        tracing::info!(user = %user, deactivated, "grants deactivated");
        Ok(DeactivateResponse {
            status: "ok".to_string(),
            deactivated,
        })
    }

    pub fn run_distribution(&self, now: Option<u64>) -> Result<DistributionRunResponse, AdapterError> {
        let report = DistributionRun::new(
            &self.store,
            self.registry.as_ref(),
            self.executor.as_ref(),
            self.redemption_config,
        )
        .run(resolve_now(now))?;
        Ok(DistributionRunResponse {
            status: "ok".to_string(),
            report,
        })
    }

    pub fn status(&self, user: &str, now: Option<u64>) -> Result<StatusResponse, AdapterError> {
        let user = parse_address("userAddress", user)?;
        let eligibility = EligibilityMonitor::new(self.registry.as_ref()).status(&user, resolve_now(now));
        Ok(StatusResponse {
            status: "ok".to_string(),
            eligibility,
        })
    }

    /// Every user with at least one active grant.
    pub fn all_statuses(&self, now: Option<u64>) -> Result<AllStatusesResponse, AdapterError> {
        let users = self.lock_store()?.users_with_active_grants();
        let users = EligibilityMonitor::new(self.registry.as_ref()).statuses(&users, resolve_now(now));
        Ok(AllStatusesResponse {
            status: "ok".to_string(),
            users,
        })
    }

    pub fn redeem_now(
        &self,
        request: RedeemAdapterRequest,
        now: Option<u64>,
    ) -> Result<RedeemResponse, AdapterError> {
        let user = parse_address("userAddress", &request.user_address)?;
        let result = self.orchestrator().redeem(&user, resolve_now(now))?;
        Ok(RedeemResponse {
            status: "ok".to_string(),
            result,
        })
    }

    pub fn redeem_partial(
        &self,
        request: RedeemAmountAdapterRequest,
        now: Option<u64>,
    ) -> Result<RedeemResponse, AdapterError> {
        let user = parse_address("userAddress", &request.user_address)?;
        let asset = parse_address("tokenAddress", &request.token_address)?;
        let amount = parse_amount("amount", &request.amount)?;
        let result = self
            .orchestrator()
            .redeem_partial(&user, &asset, amount, resolve_now(now))?;
        Ok(RedeemResponse {
            status: "ok".to_string(),
            result,
        })
    }
}

fn executor_from_config(config: &AdapterConfig) -> Arc<dyn ExecutionCollaborator> {
    match (config.execution.clone(), config.execution_loopback) {
        (Some(exec), _) => Arc::new(HttpExecution::new(exec, config.session_key.clone())),
        (None, true) => {
            tracing::warn!("loopback settlement enabled; redemptions are recorded but no funds move");
            Arc::new(LoopbackExecution)
        }
        (None, false) => {
            tracing::warn!("PULSE_EXECUTION_ENDPOINT not set; every redemption will fail until it is");
            Arc::new(UnconfiguredExecution)
        }
    }
}

fn parse_address(field: &str, raw: &str) -> Result<Address, AdapterError> {
    Address::new(raw).map_err(|err| AdapterError::BadRequest(format!("{field}: {err}")))
}

/// Positive decimal amount.
fn parse_amount(field: &str, raw: &str) -> Result<Amount, AdapterError> {
    let amount = amount_string::parse(raw)
        .map_err(|err| AdapterError::BadRequest(format!("{field}: {err}")))?;
    if amount == 0 {
        return Err(AdapterError::BadRequest(format!("{field}: must be > 0")));
    }
    Ok(amount)
}

fn resolve_now(now: Option<u64>) -> UnixTimeSec {
    UnixTimeSec(now.unwrap_or_else(system_time_now_secs))
}

fn system_time_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
