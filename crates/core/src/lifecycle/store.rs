use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::customer::{Customer, CustomerId};
use crate::domain::quote::{QuoteId, QuoteStatus, RepairQuote};
use crate::domain::request::{RepairRequest, RepairRequestId, RequestStatus};
use crate::domain::review::Review;
use crate::domain::shop::{RepairShop, ShopId};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Lock timeout, stale version or uniqueness race. The whole unit of work may be retried.
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("decode error: {0}")]
    Decode(String),
}

#[async_trait]
pub trait RepairStore: Send + Sync {
    /// Opens a unit of work that may write.
    async fn begin(&self) -> Result<Box<dyn RepairTransaction>, StoreError>;

    /// Opens a unit of work that only reads. Backends may skip write locking for it.
    async fn begin_read(&self) -> Result<Box<dyn RepairTransaction>, StoreError> {
        self.begin().await
    }
}

/// One unit of work. Dropping it without calling [`RepairTransaction::commit`] discards every
/// write made through it.
#[async_trait]
pub trait RepairTransaction: Send {
    /// Takes the per-request write lock and returns the request as persisted.
    async fn lock_request(
        &mut self,
        id: &RepairRequestId,
    ) -> Result<Option<RepairRequest>, StoreError>;

    async fn find_request(
        &mut self,
        id: &RepairRequestId,
    ) -> Result<Option<RepairRequest>, StoreError>;

    async fn insert_request(&mut self, request: &RepairRequest) -> Result<(), StoreError>;

    /// Writes `request` if the stored version still equals `request.version`. The stored
    /// version becomes `request.version + 1`; callers bump their copy to match.
    async fn update_request(&mut self, request: &RepairRequest) -> Result<(), StoreError>;

    async fn requests_for_customer(
        &mut self,
        customer_id: &CustomerId,
    ) -> Result<Vec<RepairRequest>, StoreError>;

    async fn requests_with_status(
        &mut self,
        status: RequestStatus,
    ) -> Result<Vec<RepairRequest>, StoreError>;

    async fn find_quote(&mut self, id: &QuoteId) -> Result<Option<RepairQuote>, StoreError>;

    async fn quotes_for_request(
        &mut self,
        request_id: &RepairRequestId,
    ) -> Result<Vec<RepairQuote>, StoreError>;

    /// Every quote the shop submitted, newest first.
    async fn quotes_for_shop(&mut self, shop_id: &ShopId) -> Result<Vec<RepairQuote>, StoreError>;

    async fn shop_has_quoted(
        &mut self,
        request_id: &RepairRequestId,
        shop_id: &ShopId,
    ) -> Result<bool, StoreError>;

    async fn quote_exists_with_status(
        &mut self,
        request_id: &RepairRequestId,
        status: QuoteStatus,
    ) -> Result<bool, StoreError>;

    async fn find_accepted_quote(
        &mut self,
        request_id: &RepairRequestId,
    ) -> Result<Option<RepairQuote>, StoreError>;

    async fn insert_quote(&mut self, quote: &RepairQuote) -> Result<(), StoreError>;

    async fn update_quote(&mut self, quote: &RepairQuote) -> Result<(), StoreError>;

    /// Rejects every quote of the request except `keep` in a single write; returns how many
    /// rows changed.
    async fn reject_other_quotes(
        &mut self,
        request_id: &RepairRequestId,
        keep: &QuoteId,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn find_customer(&mut self, id: &CustomerId) -> Result<Option<Customer>, StoreError>;

    async fn insert_customer(&mut self, customer: &Customer) -> Result<(), StoreError>;

    async fn find_shop(&mut self, id: &ShopId) -> Result<Option<RepairShop>, StoreError>;

    async fn insert_shop(&mut self, shop: &RepairShop) -> Result<(), StoreError>;

    async fn find_review_for_request(
        &mut self,
        request_id: &RepairRequestId,
    ) -> Result<Option<Review>, StoreError>;

    async fn insert_review(&mut self, review: &Review) -> Result<(), StoreError>;

    /// Newest first, as are the customer's reviews.
    async fn reviews_for_shop(&mut self, shop_id: &ShopId) -> Result<Vec<Review>, StoreError>;

    async fn reviews_for_customer(
        &mut self,
        customer_id: &CustomerId,
    ) -> Result<Vec<Review>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[derive(Clone, Debug, Default)]
struct MemoryState {
    customers: HashMap<CustomerId, Customer>,
    shops: HashMap<ShopId, RepairShop>,
    requests: HashMap<RepairRequestId, RepairRequest>,
    quotes: HashMap<QuoteId, RepairQuote>,
    reviews: Vec<Review>,
}

/// Keeps everything behind one async mutex. A transaction holds the lock until it commits or
/// is dropped, so units of work are fully serialised.
#[derive(Clone, Default)]
pub struct InMemoryRepairStore {
    state: Arc<Mutex<MemoryState>>,
    fail_next_commit: Arc<AtomicBool>,
}

impl InMemoryRepairStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next commit fail after all writes were staged.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RepairStore for InMemoryRepairStore {
    async fn begin(&self) -> Result<Box<dyn RepairTransaction>, StoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(InMemoryTransaction {
            guard,
            working,
            fail_commit: Arc::clone(&self.fail_next_commit),
        }))
    }
}

struct InMemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    fail_commit: Arc<AtomicBool>,
}

fn sorted_quotes<'a>(quotes: impl Iterator<Item = &'a RepairQuote>) -> Vec<RepairQuote> {
    let mut quotes: Vec<RepairQuote> = quotes.cloned().collect();
    quotes.sort_by(|left, right| {
        left.created_at.cmp(&right.created_at).then_with(|| left.id.cmp(&right.id))
    });
    quotes
}

fn sorted_reviews<'a>(reviews: impl Iterator<Item = &'a Review>) -> Vec<Review> {
    let mut reviews: Vec<Review> = reviews.cloned().collect();
    reviews.sort_by(|left, right| {
        right.created_at.cmp(&left.created_at).then_with(|| left.id.cmp(&right.id))
    });
    reviews
}

fn sorted_requests<'a>(requests: impl Iterator<Item = &'a RepairRequest>) -> Vec<RepairRequest> {
    let mut requests: Vec<RepairRequest> = requests.cloned().collect();
    requests.sort_by(|left, right| {
        right.created_at.cmp(&left.created_at).then_with(|| left.id.cmp(&right.id))
    });
    requests
}

#[async_trait]
impl RepairTransaction for InMemoryTransaction {
    async fn lock_request(
        &mut self,
        id: &RepairRequestId,
    ) -> Result<Option<RepairRequest>, StoreError> {
        Ok(self.working.requests.get(id).cloned())
    }

    async fn find_request(
        &mut self,
        id: &RepairRequestId,
    ) -> Result<Option<RepairRequest>, StoreError> {
        Ok(self.working.requests.get(id).cloned())
    }

    async fn insert_request(&mut self, request: &RepairRequest) -> Result<(), StoreError> {
        if self.working.requests.contains_key(&request.id) {
            return Err(StoreError::Conflict(format!("request {} already exists", request.id.0)));
        }
        self.working.requests.insert(request.id.clone(), request.clone());
        Ok(())
    }

    async fn update_request(&mut self, request: &RepairRequest) -> Result<(), StoreError> {
        let stored = self
            .working
            .requests
            .get_mut(&request.id)
            .ok_or_else(|| StoreError::Conflict(format!("request {} vanished", request.id.0)))?;
        if stored.version != request.version {
            return Err(StoreError::Conflict(format!(
                "stale version {} for request {}",
                request.version, request.id.0
            )));
        }

        let mut updated = request.clone();
        updated.version += 1;
        *stored = updated;
        Ok(())
    }

    async fn requests_for_customer(
        &mut self,
        customer_id: &CustomerId,
    ) -> Result<Vec<RepairRequest>, StoreError> {
        Ok(sorted_requests(
            self.working.requests.values().filter(|request| &request.customer_id == customer_id),
        ))
    }

    async fn requests_with_status(
        &mut self,
        status: RequestStatus,
    ) -> Result<Vec<RepairRequest>, StoreError> {
        Ok(sorted_requests(self.working.requests.values().filter(|request| request.status == status)))
    }

    async fn find_quote(&mut self, id: &QuoteId) -> Result<Option<RepairQuote>, StoreError> {
        Ok(self.working.quotes.get(id).cloned())
    }

    async fn quotes_for_request(
        &mut self,
        request_id: &RepairRequestId,
    ) -> Result<Vec<RepairQuote>, StoreError> {
        Ok(sorted_quotes(self.working.quotes.values().filter(|quote| &quote.request_id == request_id)))
    }

    async fn quotes_for_shop(&mut self, shop_id: &ShopId) -> Result<Vec<RepairQuote>, StoreError> {
        let mut quotes: Vec<RepairQuote> =
            self.working.quotes.values().filter(|quote| &quote.shop_id == shop_id).cloned().collect();
        quotes.sort_by(|left, right| {
            right.created_at.cmp(&left.created_at).then_with(|| left.id.cmp(&right.id))
        });
        Ok(quotes)
    }

    async fn shop_has_quoted(
        &mut self,
        request_id: &RepairRequestId,
        shop_id: &ShopId,
    ) -> Result<bool, StoreError> {
        Ok(self
            .working
            .quotes
            .values()
            .any(|quote| &quote.request_id == request_id && &quote.shop_id == shop_id))
    }

    async fn quote_exists_with_status(
        &mut self,
        request_id: &RepairRequestId,
        status: QuoteStatus,
    ) -> Result<bool, StoreError> {
        Ok(self
            .working
            .quotes
            .values()
            .any(|quote| &quote.request_id == request_id && quote.status == status))
    }

    async fn find_accepted_quote(
        &mut self,
        request_id: &RepairRequestId,
    ) -> Result<Option<RepairQuote>, StoreError> {
        Ok(self
            .working
            .quotes
            .values()
            .find(|quote| &quote.request_id == request_id && quote.accepted)
            .cloned())
    }

    async fn insert_quote(&mut self, quote: &RepairQuote) -> Result<(), StoreError> {
        let duplicate = self.working.quotes.values().any(|existing| {
            existing.request_id == quote.request_id && existing.shop_id == quote.shop_id
        });
        if duplicate || self.working.quotes.contains_key(&quote.id) {
            return Err(StoreError::Conflict(format!(
                "shop {} already quoted request {}",
                quote.shop_id.0, quote.request_id.0
            )));
        }
        self.working.quotes.insert(quote.id.clone(), quote.clone());
        Ok(())
    }

    async fn update_quote(&mut self, quote: &RepairQuote) -> Result<(), StoreError> {
        if quote.status == QuoteStatus::Accepted {
            let other_accepted = self.working.quotes.values().any(|existing| {
                existing.request_id == quote.request_id
                    && existing.id != quote.id
                    && existing.status == QuoteStatus::Accepted
            });
            if other_accepted {
                return Err(StoreError::Conflict(format!(
                    "request {} already has an accepted quote",
                    quote.request_id.0
                )));
            }
        }

        let stored = self
            .working
            .quotes
            .get_mut(&quote.id)
            .ok_or_else(|| StoreError::Conflict(format!("quote {} vanished", quote.id.0)))?;
        *stored = quote.clone();
        Ok(())
    }

    async fn reject_other_quotes(
        &mut self,
        request_id: &RepairRequestId,
        keep: &QuoteId,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut changed = 0;
        for quote in self
            .working
            .quotes
            .values_mut()
            .filter(|quote| &quote.request_id == request_id && &quote.id != keep)
        {
            quote.reject(at);
            changed += 1;
        }
        Ok(changed)
    }

    async fn find_customer(&mut self, id: &CustomerId) -> Result<Option<Customer>, StoreError> {
        Ok(self.working.customers.get(id).cloned())
    }

    async fn insert_customer(&mut self, customer: &Customer) -> Result<(), StoreError> {
        self.working.customers.insert(customer.id.clone(), customer.clone());
        Ok(())
    }

    async fn find_shop(&mut self, id: &ShopId) -> Result<Option<RepairShop>, StoreError> {
        Ok(self.working.shops.get(id).cloned())
    }

    async fn insert_shop(&mut self, shop: &RepairShop) -> Result<(), StoreError> {
        self.working.shops.insert(shop.id.clone(), shop.clone());
        Ok(())
    }

    async fn find_review_for_request(
        &mut self,
        request_id: &RepairRequestId,
    ) -> Result<Option<Review>, StoreError> {
        Ok(self.working.reviews.iter().find(|review| &review.request_id == request_id).cloned())
    }

    async fn insert_review(&mut self, review: &Review) -> Result<(), StoreError> {
        if self.working.reviews.iter().any(|existing| existing.request_id == review.request_id) {
            return Err(StoreError::Conflict(format!(
                "request {} already reviewed",
                review.request_id.0
            )));
        }
        self.working.reviews.push(review.clone());
        Ok(())
    }

    async fn reviews_for_shop(&mut self, shop_id: &ShopId) -> Result<Vec<Review>, StoreError> {
        Ok(sorted_reviews(self.working.reviews.iter().filter(|review| &review.shop_id == shop_id)))
    }

    async fn reviews_for_customer(
        &mut self,
        customer_id: &CustomerId,
    ) -> Result<Vec<Review>, StoreError> {
        Ok(sorted_reviews(
            self.working.reviews.iter().filter(|review| &review.customer_id == customer_id),
        ))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if self.fail_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("commit failed".to_owned()));
        }

        let InMemoryTransaction { mut guard, working, .. } = *self;
        *guard = working;
        Ok(())
    }
}
