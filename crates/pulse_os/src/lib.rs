#![forbid(unsafe_code)]

pub mod bridge;
pub mod distribution;
pub mod eligibility;
pub mod execution;
pub mod redemption;
pub mod registry;

pub use distribution::{DistributionRun, DistributionRunReport};
pub use eligibility::{EligibilityClass, EligibilityMonitor, EligibilityStatus};
pub use execution::{
    ExecutionCollaborator, ExecutionError, ExecutionHttpConfig, HttpExecution, LoopbackExecution,
    ScriptedExecution, SessionKey, UnconfiguredExecution,
};
pub use redemption::{
    AssetOutcome, AssetOutcomeStatus, RedemptionConfig, RedemptionFault, RedemptionOrchestrator,
    RedemptionResult, SkipReason, TransferLine,
};
pub use registry::{
    DeadlineRegistry, HttpRegistry, InMemoryRegistry, RegistryError, UnconfiguredRegistry,
};
