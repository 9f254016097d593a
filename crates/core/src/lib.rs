pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod lifecycle;
pub mod notifications;

pub use domain::actor::Actor;
pub use domain::customer::{Customer, CustomerId};
pub use domain::quote::{QuoteDraft, QuoteId, QuoteStatus, RepairQuote};
pub use domain::request::{
    DeviceDetails, ProblemCategory, RepairRequest, RepairRequestId, RequestStatus,
};
pub use domain::review::{Review, ReviewId, ShopRatingSummary};
pub use domain::shop::{RepairShop, ShopId};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use lifecycle::{
    InMemoryRepairStore, RepairLifecycleService, RepairStore, RepairTransaction, RequestDraft,
    ShopAssignment, ShopRequestView, StoreError,
};
