//! Repair request and quote lifecycle: the request state machine, quote arbitration and the
//! unit-of-work store both run on.

pub mod arbitration;
pub mod service;
pub mod store;
pub mod transitions;

pub use arbitration::{AcceptanceOutcome, SubmissionOutcome};
pub use service::{RepairLifecycleService, RequestDraft, ShopAssignment, ShopRequestView};
pub use store::{InMemoryRepairStore, RepairStore, RepairTransaction, StoreError};
pub use transitions::TransitionOutcome;
