#![forbid(unsafe_code)]

pub mod allocation;
pub mod period;

pub use allocation::AllocationSplitter;
pub use period::{AccountingError, AllowanceSnapshot, PeriodAccountant, PeriodUsage, PeriodWindow};
