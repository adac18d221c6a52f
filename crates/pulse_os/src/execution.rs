#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use pulse_kernel_contracts::transfer::{
    BatchHandle, SettlementReceipt, SettlementStatus, TransferBatch, TransferInstruction,
};
use pulse_kernel_contracts::Address;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::bridge::{env_u64, HttpBridgeConfig};

pub const EXECUTION_ENDPOINT_ENV: &str = "PULSE_EXECUTION_ENDPOINT";
pub const EXECUTION_LOOPBACK_ENV: &str = "PULSE_EXECUTION_LOOPBACK";
pub const SESSION_KEY_ENV: &str = "PULSE_SESSION_KEY";
pub const SETTLEMENT_TIMEOUT_MS_DEFAULT: u64 = 120_000;
pub const SETTLEMENT_POLL_MS_DEFAULT: u64 = 2_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("execution misconfigured: {0}")]
    Configuration(String),
    #[error("batch rejected: {0}")]
    Rejected(String),
    #[error("execution transport error: {0}")]
    Transport(String),
    #[error("execution service answered http status {0}")]
    Status(u16),
    #[error("settlement failed: {0}")]
    SettlementFailed(String),
    #[error("settlement not confirmed within {waited_ms}ms")]
    SettlementTimeout { waited_ms: u64 },
    #[error("execution response invalid: {0}")]
    InvalidResponse(String),
}

impl ExecutionError {
    /// Whether resubmitting the same batch (same idempotency key) may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecutionError::Transport(_) => true,
            ExecutionError::Status(code) => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

/// Seam over the delegated-transfer executor.
pub trait ExecutionCollaborator: Send + Sync {
    /// Submits one atomic batch. Resubmitting a batch with the same idempotency key must not
    /// execute it twice.
    fn submit_batch(&self, batch: &TransferBatch) -> Result<BatchHandle, ExecutionError>;

    /// Blocks until the batch is settled or failed. A `Failed` receipt is returned as `Ok`.
    fn await_settlement(&self, handle: &BatchHandle) -> Result<SettlementReceipt, ExecutionError>;
}

/// Signing credential handed to the execution bridge at start-up. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn from_env() -> Option<Self> {
        std::env::var(SESSION_KEY_ENV).ok().and_then(Self::new)
    }

    /// First 16 hex chars of the SHA-256 of the key.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
    }

    fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey(fp:{})", self.fingerprint())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionHttpConfig {
    pub bridge: HttpBridgeConfig,
    pub settlement_timeout_ms: u64,
    pub settlement_poll_ms: u64,
}

impl ExecutionHttpConfig {
    pub fn from_env() -> Option<Self> {
        let bridge = HttpBridgeConfig::from_env(EXECUTION_ENDPOINT_ENV)?;
        Some(Self {
            bridge,
            settlement_timeout_ms: env_u64(
                "PULSE_SETTLEMENT_TIMEOUT_MS",
                1_000..=1_800_000,
                SETTLEMENT_TIMEOUT_MS_DEFAULT,
            ),
            settlement_poll_ms: env_u64(
                "PULSE_SETTLEMENT_POLL_MS",
                50..=60_000,
                SETTLEMENT_POLL_MS_DEFAULT,
            ),
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBatchWire<'a> {
    auth_context: &'a str,
    auth_manager: &'a str,
    transfers: &'a [TransferInstruction],
}

#[derive(Debug, Deserialize)]
struct SubmitBatchAckWire {
    handle: String,
}

/// Execution bridge over HTTP. Submissions carry the session key as a bearer token and the
/// batch idempotency key as a header.
#[derive(Debug, Clone)]
pub struct HttpExecution {
    config: ExecutionHttpConfig,
    session_key: Option<SessionKey>,
    agent: ureq::Agent,
}

impl HttpExecution {
    pub fn new(config: ExecutionHttpConfig, session_key: Option<SessionKey>) -> Self {
        let agent = config.bridge.agent();
        Self {
            config,
            session_key,
            agent,
        }
    }

    fn session_key(&self) -> Result<&SessionKey, ExecutionError> {
        self.session_key
            .as_ref()
            .ok_or_else(|| ExecutionError::Configuration("session key not configured".to_string()))
    }

    fn poll_once(&self, handle: &BatchHandle) -> Result<SettlementReceipt, ExecutionError> {
        let key = self.session_key()?;
        let url = self
            .config
            .bridge
            .url(&format!("v1/batches/{}", handle.as_str()))
            .map_err(|err| ExecutionError::InvalidResponse(format!("bad batch handle: {err}")))?;
        match self
            .agent
            .get(url.as_str())
            .set("authorization", &format!("Bearer {}", key.expose()))
            .call()
        {
            Ok(resp) => resp
                .into_json::<SettlementReceipt>()
                .map_err(|err| ExecutionError::InvalidResponse(err.to_string())),
            Err(ureq::Error::Status(code, _)) => Err(ExecutionError::Status(code)),
            Err(ureq::Error::Transport(err)) => Err(ExecutionError::Transport(err.to_string())),
        }
    }
}

impl ExecutionCollaborator for HttpExecution {
    fn submit_batch(&self, batch: &TransferBatch) -> Result<BatchHandle, ExecutionError> {
        let key = self.session_key()?;
        let url = self
            .config
            .bridge
            .url("v1/batches")
            .map_err(|err| ExecutionError::Configuration(err.to_string()))?;
        let body = SubmitBatchWire {
            auth_context: &batch.auth_context,
            auth_manager: &batch.auth_manager,
            transfers: &batch.transfers,
        };
        match self
            .agent
            .post(url.as_str())
            .set("content-type", "application/json")
            .set("authorization", &format!("Bearer {}", key.expose()))
            .set("idempotency-key", &batch.idempotency_key)
            .send_json(&body)
        {
            Ok(resp) => {
                let ack: SubmitBatchAckWire = resp
                    .into_json()
                    .map_err(|err| ExecutionError::InvalidResponse(err.to_string()))?;
                if ack.handle.trim().is_empty() {
                    return Err(ExecutionError::InvalidResponse(
                        "empty batch handle".to_string(),
                    ));
                }
                Ok(BatchHandle(ack.handle))
            }
            Err(ureq::Error::Status(code, resp)) if (400..500).contains(&code) && code != 429 => {
                let detail = resp
                    .into_string()
                    .unwrap_or_else(|_| format!("http status {code}"));
                Err(ExecutionError::Rejected(detail))
            }
            Err(ureq::Error::Status(code, _)) => Err(ExecutionError::Status(code)),
            Err(ureq::Error::Transport(err)) => Err(ExecutionError::Transport(err.to_string())),
        }
    }

    fn await_settlement(&self, handle: &BatchHandle) -> Result<SettlementReceipt, ExecutionError> {
        let started = Instant::now();
        let timeout = Duration::from_millis(self.config.settlement_timeout_ms);
        let poll = Duration::from_millis(self.config.settlement_poll_ms);
        loop {
            match self.poll_once(handle) {
                Ok(receipt) if receipt.status != SettlementStatus::Pending => return Ok(receipt),
                Ok(_) => {}
                Err(err) if err.is_retryable() => {
                    tracing::warn!(handle = handle.as_str(), error = %err, "settlement poll failed; polling again");
                }
                Err(err) => return Err(err),
            }
            if started.elapsed() + poll > timeout {
                return Err(ExecutionError::SettlementTimeout {
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            thread::sleep(poll);
        }
    }
}

/// Settles every batch immediately. Development only: nothing leaves the process.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackExecution;

impl ExecutionCollaborator for LoopbackExecution {
    fn submit_batch(&self, batch: &TransferBatch) -> Result<BatchHandle, ExecutionError> {
        Ok(BatchHandle(format!("loopback:{}", batch.idempotency_key)))
    }

    fn await_settlement(&self, handle: &BatchHandle) -> Result<SettlementReceipt, ExecutionError> {
        Ok(SettlementReceipt::settled(handle.as_str()))
    }
}

/// Installed when no execution endpoint is configured and loopback was not asked for. Every
/// submission fails with a configuration error, so periods stay pending.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredExecution;

impl ExecutionCollaborator for UnconfiguredExecution {
    fn submit_batch(&self, _batch: &TransferBatch) -> Result<BatchHandle, ExecutionError> {
        Err(ExecutionError::Configuration(format!(
            "{EXECUTION_ENDPOINT_ENV} not set"
        )))
    }

    fn await_settlement(&self, _handle: &BatchHandle) -> Result<SettlementReceipt, ExecutionError> {
        Err(ExecutionError::Configuration(format!(
            "{EXECUTION_ENDPOINT_ENV} not set"
        )))
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    submit_failures: BTreeMap<Address, ExecutionError>,
    settlement_failures: BTreeMap<Address, String>,
    transient_submit_failures: u32,
    settlement_timeouts: u32,
    submit_calls: u32,
    accepted: BTreeMap<String, TransferBatch>,
    order: Vec<String>,
}

/// Scriptable in-process executor: per-asset failures, transient submit faults and a settlement
/// delay. Deduplicates resubmissions by idempotency key the way a real executor must.
#[derive(Debug, Default)]
pub struct ScriptedExecution {
    state: Mutex<ScriptState>,
    settlement_delay: Duration,
}

impl ScriptedExecution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settlement_delay(delay: Duration) -> Self {
        Self {
            settlement_delay: delay,
            ..Self::default()
        }
    }

    pub fn fail_submissions_for(&self, asset: Address, err: ExecutionError) {
        self.state_for_setup().submit_failures.insert(asset, err);
    }

    pub fn fail_settlement_for(&self, asset: Address, reason: impl Into<String>) {
        self.state_for_setup()
            .settlement_failures
            .insert(asset, reason.into());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state_for_setup();
        state.submit_failures.clear();
        state.settlement_failures.clear();
        state.transient_submit_failures = 0;
        state.settlement_timeouts = 0;
    }

    /// The next `n` submissions fail with a retryable transport error.
    pub fn fail_next_submissions(&self, n: u32) {
        self.state_for_setup().transient_submit_failures = n;
    }

    /// The next `n` settlement waits time out. The batch stays accepted and settles on a later
    /// wait, like a receipt that arrives after the caller gave up.
    pub fn time_out_next_settlements(&self, n: u32) {
        self.state_for_setup().settlement_timeouts = n;
    }

    pub fn submit_calls(&self) -> u32 {
        self.state_for_setup().submit_calls
    }

    /// Distinct accepted batches, in acceptance order.
    pub fn accepted_batches(&self) -> Vec<TransferBatch> {
        let state = self.state_for_setup();
        state
            .order
            .iter()
            .filter_map(|k| state.accepted.get(k).cloned())
            .collect()
    }

    fn state_for_setup(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> Result<MutexGuard<'_, ScriptState>, ExecutionError> {
        self.state
            .lock()
            .map_err(|_| ExecutionError::Transport("scripted executor lock poisoned".to_string()))
    }
}

impl ExecutionCollaborator for ScriptedExecution {
    fn submit_batch(&self, batch: &TransferBatch) -> Result<BatchHandle, ExecutionError> {
        let mut state = self.lock()?;
        state.submit_calls = state.submit_calls.saturating_add(1);
        if state.transient_submit_failures > 0 {
            state.transient_submit_failures -= 1;
            return Err(ExecutionError::Transport("connection reset".to_string()));
        }
        if let Some(asset) = batch.asset() {
            if let Some(err) = state.submit_failures.get(asset) {
                return Err(err.clone());
            }
        }
        let key = batch.idempotency_key.clone();
        if !state.accepted.contains_key(&key) {
            state.accepted.insert(key.clone(), batch.clone());
            state.order.push(key.clone());
        }
        Ok(BatchHandle(format!("scripted:{key}")))
    }

    fn await_settlement(&self, handle: &BatchHandle) -> Result<SettlementReceipt, ExecutionError> {
        if !self.settlement_delay.is_zero() {
            thread::sleep(self.settlement_delay);
        }
        let mut state = self.lock()?;
        if state.settlement_timeouts > 0 {
            state.settlement_timeouts -= 1;
            return Err(ExecutionError::SettlementTimeout { waited_ms: 0 });
        }
        let key = handle
            .as_str()
            .strip_prefix("scripted:")
            .ok_or_else(|| ExecutionError::InvalidResponse("unknown batch handle".to_string()))?;
        let batch = state
            .accepted
            .get(key)
            .ok_or_else(|| ExecutionError::InvalidResponse("unknown batch handle".to_string()))?;
        if let Some(reason) = batch.asset().and_then(|a| state.settlement_failures.get(a)) {
            return Ok(SettlementReceipt::failed(reason.clone()));
        }
        Ok(SettlementReceipt::settled(format!("0x{}", &key[..key.len().min(64)])))
    }
}
