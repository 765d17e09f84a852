// Services module - Business logic

pub mod redemption;

pub use redemption::{
    OutcomeClass, RedemptionCoordinator, RedemptionErrorKind, RedemptionResult,
    RedemptionSettings,
};
