pub mod admission;
pub mod clock;
pub mod config;
pub mod domain;
pub mod errors;
pub mod storage;
pub mod tokens;

pub use admission::{
    AdmissionCoordinator, AdmissionSnapshot, BlockReason, BudgetAdmission, BudgetReservation,
    BudgetStatus, CacheStats, Calendar, CoalescedBatch, CommitOutcome, DeactivationReason,
    Decision, Gate, MaintenanceReport, MessageCoalescer, RateBudgetTracker, ResponseCache,
    ThrottleDecision, UserThrottle,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use domain::{IntentSource, PurchaseIntent, SenderId};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use storage::{InMemoryStateStore, StateStore, StoreError};
pub use tokens::{CharRatioEstimator, TokenEstimator};
