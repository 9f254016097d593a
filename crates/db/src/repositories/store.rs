use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, Transaction};

use repairhub_core::domain::customer::{Customer, CustomerId};
use repairhub_core::domain::quote::{QuoteId, QuoteStatus, RepairQuote};
use repairhub_core::domain::request::{RepairRequest, RepairRequestId, RequestStatus};
use repairhub_core::domain::review::Review;
use repairhub_core::domain::shop::{RepairShop, ShopId};
use repairhub_core::lifecycle::{RepairStore, RepairTransaction, StoreError};

use super::{directory, quote, request, review, RepositoryError};
use crate::DbPool;

/// [`RepairStore`] over a SQLite pool. Each unit of work is one SQL transaction.
///
/// Write units open with `BEGIN IMMEDIATE`: a deferred transaction that reads first cannot be
/// upgraded while another writer is active and fails with SQLITE_BUSY without honouring the
/// busy timeout. Taking the write lock up front makes concurrent units wait their turn.
#[derive(Clone)]
pub struct SqlRepairStore {
    pool: DbPool,
}

impl SqlRepairStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

fn store_error(error: sqlx::Error) -> StoreError {
    StoreError::from(RepositoryError::from(error))
}

#[async_trait]
impl RepairStore for SqlRepairStore {
    async fn begin(&self) -> Result<Box<dyn RepairTransaction>, StoreError> {
        let tx = self.pool.begin_with("BEGIN IMMEDIATE").await.map_err(store_error)?;
        Ok(Box::new(SqlRepairTransaction { tx }))
    }

    async fn begin_read(&self) -> Result<Box<dyn RepairTransaction>, StoreError> {
        let tx = self.pool.begin().await.map_err(store_error)?;
        Ok(Box::new(SqlRepairTransaction { tx }))
    }
}

pub struct SqlRepairTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl RepairTransaction for SqlRepairTransaction {
    /// The unit already holds the database write lock; the no-op write still fails fast when
    /// the row is gone and keeps the version column as the row's change marker.
    async fn lock_request(
        &mut self,
        id: &RepairRequestId,
    ) -> Result<Option<RepairRequest>, StoreError> {
        sqlx::query("UPDATE repair_request SET version = version WHERE id = ?")
            .bind(&id.0)
            .execute(&mut *self.tx)
            .await
            .map_err(store_error)?;
        Ok(request::fetch_request(&mut *self.tx, id).await?)
    }

    async fn find_request(
        &mut self,
        id: &RepairRequestId,
    ) -> Result<Option<RepairRequest>, StoreError> {
        Ok(request::fetch_request(&mut *self.tx, id).await?)
    }

    async fn insert_request(&mut self, repair: &RepairRequest) -> Result<(), StoreError> {
        Ok(request::insert_request(&mut *self.tx, repair).await?)
    }

    async fn update_request(&mut self, repair: &RepairRequest) -> Result<(), StoreError> {
        let written = request::update_request_versioned(&mut *self.tx, repair).await?;
        if written == 0 {
            return Err(StoreError::Conflict(format!(
                "stale version {} for request {}",
                repair.version, repair.id.0
            )));
        }
        Ok(())
    }

    async fn requests_for_customer(
        &mut self,
        customer_id: &CustomerId,
    ) -> Result<Vec<RepairRequest>, StoreError> {
        Ok(request::fetch_requests_for_customer(&mut *self.tx, customer_id).await?)
    }

    async fn requests_with_status(
        &mut self,
        status: RequestStatus,
    ) -> Result<Vec<RepairRequest>, StoreError> {
        Ok(request::fetch_requests_with_status(&mut *self.tx, status).await?)
    }

    async fn find_quote(&mut self, id: &QuoteId) -> Result<Option<RepairQuote>, StoreError> {
        Ok(quote::fetch_quote(&mut *self.tx, id).await?)
    }

    async fn quotes_for_request(
        &mut self,
        request_id: &RepairRequestId,
    ) -> Result<Vec<RepairQuote>, StoreError> {
        Ok(quote::fetch_quotes_for_request(&mut *self.tx, request_id, None).await?)
    }

    async fn quotes_for_shop(&mut self, shop_id: &ShopId) -> Result<Vec<RepairQuote>, StoreError> {
        Ok(quote::fetch_quotes_for_shop(&mut *self.tx, shop_id).await?)
    }

    async fn shop_has_quoted(
        &mut self,
        request_id: &RepairRequestId,
        shop_id: &ShopId,
    ) -> Result<bool, StoreError> {
        Ok(quote::quote_exists(&mut *self.tx, request_id, Some(shop_id), None).await?)
    }

    async fn quote_exists_with_status(
        &mut self,
        request_id: &RepairRequestId,
        status: QuoteStatus,
    ) -> Result<bool, StoreError> {
        Ok(quote::quote_exists(&mut *self.tx, request_id, None, Some(status)).await?)
    }

    async fn find_accepted_quote(
        &mut self,
        request_id: &RepairRequestId,
    ) -> Result<Option<RepairQuote>, StoreError> {
        let accepted =
            quote::fetch_quotes_for_request(&mut *self.tx, request_id, Some(QuoteStatus::Accepted))
                .await?;
        Ok(accepted.into_iter().next())
    }

    async fn insert_quote(&mut self, repair_quote: &RepairQuote) -> Result<(), StoreError> {
        Ok(quote::insert_quote(&mut *self.tx, repair_quote).await?)
    }

    async fn update_quote(&mut self, repair_quote: &RepairQuote) -> Result<(), StoreError> {
        if quote::update_quote(&mut *self.tx, repair_quote).await? == 0 {
            return Err(StoreError::Conflict(format!("quote {} vanished", repair_quote.id.0)));
        }
        Ok(())
    }

    async fn reject_other_quotes(
        &mut self,
        request_id: &RepairRequestId,
        keep: &QuoteId,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        Ok(quote::reject_other_quotes(&mut *self.tx, request_id, keep, at).await?)
    }

    async fn find_customer(&mut self, id: &CustomerId) -> Result<Option<Customer>, StoreError> {
        Ok(directory::fetch_customer(&mut *self.tx, id).await?)
    }

    async fn insert_customer(&mut self, customer: &Customer) -> Result<(), StoreError> {
        Ok(directory::upsert_customer(&mut *self.tx, customer).await?)
    }

    async fn find_shop(&mut self, id: &ShopId) -> Result<Option<RepairShop>, StoreError> {
        Ok(directory::fetch_shop(&mut *self.tx, id).await?)
    }

    async fn insert_shop(&mut self, shop: &RepairShop) -> Result<(), StoreError> {
        Ok(directory::upsert_shop(&mut *self.tx, shop).await?)
    }

    async fn find_review_for_request(
        &mut self,
        request_id: &RepairRequestId,
    ) -> Result<Option<Review>, StoreError> {
        Ok(review::fetch_review_for_request(&mut *self.tx, request_id).await?)
    }

    async fn insert_review(&mut self, submitted: &Review) -> Result<(), StoreError> {
        Ok(review::insert_review(&mut *self.tx, submitted).await?)
    }

    async fn reviews_for_shop(&mut self, shop_id: &ShopId) -> Result<Vec<Review>, StoreError> {
        Ok(review::fetch_reviews_for_shop(&mut *self.tx, shop_id).await?)
    }

    async fn reviews_for_customer(
        &mut self,
        customer_id: &CustomerId,
    ) -> Result<Vec<Review>, StoreError> {
        Ok(review::fetch_reviews_for_customer(&mut *self.tx, customer_id).await?)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(store_error)
    }
}
