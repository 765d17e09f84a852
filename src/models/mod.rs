// Models module - Database entity representations

pub mod activation_code;
pub mod usage_log;

pub use activation_code::{normalize_code, ActivationCode, NewActivationCode, RedemptionUpdate, Usability};
pub use usage_log::{NewUsageLogEntry, UsageLogEntry};
