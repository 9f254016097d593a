//! Quote submission and acceptance. Both run inside a caller-owned unit of work and never
//! commit; the service commits and notifies once these return.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::customer::{Customer, CustomerId};
use crate::domain::quote::{QuoteDraft, QuoteId, QuoteStatus, RepairQuote};
use crate::domain::request::{RepairRequest, RepairRequestId, RequestStatus};
use crate::domain::shop::{RepairShop, ShopId};
use crate::errors::ApplicationError;
use crate::lifecycle::store::RepairTransaction;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmissionOutcome {
    pub quote: RepairQuote,
    pub request: RepairRequest,
    pub customer: Customer,
    pub shop: RepairShop,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceptanceOutcome {
    pub quote: RepairQuote,
    pub request: RepairRequest,
    pub customer: Customer,
    pub shop: RepairShop,
    pub rejected_quotes: u64,
}

pub async fn submit_quote(
    tx: &mut dyn RepairTransaction,
    shop_id: &ShopId,
    request_id: &RepairRequestId,
    draft: QuoteDraft,
    now: DateTime<Utc>,
) -> Result<SubmissionOutcome, ApplicationError> {
    draft.validate()?;

    let request = tx
        .lock_request(request_id)
        .await?
        .ok_or_else(|| ApplicationError::NotFound(format!("repair request {}", request_id.0)))?;

    if request.status != RequestStatus::Pending {
        return Err(ApplicationError::InvalidState(format!(
            "request is {} and no longer accepts quotes",
            request.status.as_str()
        )));
    }
    if tx.shop_has_quoted(request_id, shop_id).await? {
        return Err(ApplicationError::Conflict("shop has already quoted this request".to_owned()));
    }
    if tx.quote_exists_with_status(request_id, QuoteStatus::Accepted).await? {
        return Err(ApplicationError::InvalidState("another quote already accepted".to_owned()));
    }

    let shop = require_shop(tx, shop_id).await?;
    let customer = require_customer(tx, &request.customer_id).await?;

    let quote = RepairQuote::new(request_id.clone(), shop_id.clone(), draft, now)?;
    tx.insert_quote(&quote).await?;

    Ok(SubmissionOutcome { quote, request, customer, shop })
}

pub async fn accept_quote(
    tx: &mut dyn RepairTransaction,
    customer_id: &CustomerId,
    quote_id: &QuoteId,
    now: DateTime<Utc>,
) -> Result<AcceptanceOutcome, ApplicationError> {
    let loaded = tx
        .find_quote(quote_id)
        .await?
        .ok_or_else(|| ApplicationError::NotFound(format!("quote {}", quote_id.0)))?;

    let mut request = tx.lock_request(&loaded.request_id).await?.ok_or_else(|| {
        ApplicationError::NotFound(format!("repair request {}", loaded.request_id.0))
    })?;
    // The lock is held now; everything below reads persisted state, not `loaded`.
    let mut quote = tx
        .find_quote(quote_id)
        .await?
        .ok_or_else(|| ApplicationError::NotFound(format!("quote {}", quote_id.0)))?;

    if &request.customer_id != customer_id {
        return Err(ApplicationError::Unauthorized(
            "quote belongs to another customer's request".to_owned(),
        ));
    }
    if !quote.is_pending() {
        return Err(ApplicationError::InvalidState("cannot accept non-pending quote".to_owned()));
    }
    if request.status != RequestStatus::Pending {
        return Err(ApplicationError::InvalidState("request no longer open".to_owned()));
    }
    if tx.quote_exists_with_status(&request.id, QuoteStatus::Accepted).await? {
        return Err(ApplicationError::InvalidState("another quote already accepted".to_owned()));
    }

    let rejected_quotes = tx.reject_other_quotes(&request.id, &quote.id, now).await?;
    quote.accept(now)?;
    tx.update_quote(&quote).await?;
    request.mark_quote_accepted(now)?;
    tx.update_request(&request).await?;
    request.version += 1;

    let shop = require_shop(tx, &quote.shop_id).await?;
    let customer = require_customer(tx, customer_id).await?;

    Ok(AcceptanceOutcome { quote, request, customer, shop, rejected_quotes })
}

/// The shop whose quote was accepted for this request, if any.
pub async fn resolve_assigned_shop(
    tx: &mut dyn RepairTransaction,
    request_id: &RepairRequestId,
) -> Result<Option<RepairShop>, ApplicationError> {
    let Some(quote) = tx.find_accepted_quote(request_id).await? else {
        debug!(
            event_name = "lifecycle.assigned_shop.absent",
            request_id = %request_id.0,
            "no accepted quote for request"
        );
        return Ok(None);
    };

    let shop = tx.find_shop(&quote.shop_id).await?;
    if shop.is_none() {
        debug!(
            event_name = "lifecycle.assigned_shop.missing_directory_entry",
            request_id = %request_id.0,
            shop_id = %quote.shop_id.0,
            "accepted quote references unknown shop"
        );
    }
    Ok(shop)
}

pub(crate) async fn require_shop(
    tx: &mut dyn RepairTransaction,
    shop_id: &ShopId,
) -> Result<RepairShop, ApplicationError> {
    tx.find_shop(shop_id)
        .await?
        .ok_or_else(|| ApplicationError::NotFound(format!("repair shop {}", shop_id.0)))
}

pub(crate) async fn require_customer(
    tx: &mut dyn RepairTransaction,
    customer_id: &CustomerId,
) -> Result<Customer, ApplicationError> {
    tx.find_customer(customer_id)
        .await?
        .ok_or_else(|| ApplicationError::NotFound(format!("customer {}", customer_id.0)))
}
