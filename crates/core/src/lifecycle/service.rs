use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::actor::Actor;
use crate::domain::customer::CustomerId;
use crate::domain::quote::{QuoteDraft, QuoteId, QuoteStatus, RepairQuote};
use crate::domain::request::{DeviceDetails, RepairRequest, RepairRequestId, RequestStatus};
use crate::domain::review::{Review, ShopRatingSummary};
use crate::domain::shop::{RepairShop, ShopId};
use crate::errors::ApplicationError;
use crate::lifecycle::arbitration::{
    self, require_customer, require_shop, resolve_assigned_shop, AcceptanceOutcome,
};
use crate::lifecycle::store::RepairStore;
use crate::lifecycle::transitions::{self, TransitionOutcome};
use crate::notifications::{NotificationDispatcher, NotificationEvent};

/// What a customer submits to open a repair request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDraft {
    pub device: DeviceDetails,
    #[serde(default)]
    pub image_refs: Vec<String>,
}

/// Which of a shop's assigned repairs to list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShopRequestView {
    /// Requests the shop quoted that are still QUOTED, plus ACCEPTED or IN_PROGRESS requests
    /// whose accepted quote is the shop's.
    Active,
    /// COMPLETED or CANCELLED requests whose accepted quote is the shop's, most recently
    /// updated first.
    Completed,
}

impl ShopRequestView {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    fn includes(&self, request: &RepairRequest, quote: &RepairQuote) -> bool {
        match self {
            Self::Active => match request.status {
                RequestStatus::Quoted => true,
                RequestStatus::Accepted | RequestStatus::InProgress => quote.accepted,
                _ => false,
            },
            Self::Completed => request.status.is_terminal() && quote.accepted,
        }
    }
}

/// A request as seen by one shop, together with that shop's quote on it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShopAssignment {
    pub request: RepairRequest,
    pub quote: RepairQuote,
}

/// Entry point for every request and quote mutation. Each call is one unit of work on the
/// store; notifications go out only after it committed.
#[derive(Clone)]
pub struct RepairLifecycleService<S> {
    store: S,
    notifications: Arc<dyn NotificationDispatcher>,
    audit: Arc<dyn AuditSink>,
}

fn correlation_id() -> String {
    format!("op-{}", Uuid::new_v4())
}

fn outcome_of<T>(result: &Result<T, ApplicationError>) -> AuditOutcome {
    match result {
        Ok(_) => AuditOutcome::Success,
        Err(ApplicationError::Persistence(_) | ApplicationError::Configuration(_)) => {
            AuditOutcome::Failed
        }
        Err(_) => AuditOutcome::Rejected,
    }
}

impl<S: RepairStore> RepairLifecycleService<S> {
    pub fn new(
        store: S,
        notifications: Arc<dyn NotificationDispatcher>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { store, notifications, audit }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn record<T>(&self, result: &Result<T, ApplicationError>, event: AuditEvent) {
        let outcome = outcome_of(result);
        let mut event = AuditEvent { outcome, ..event };
        if let Err(error) = result {
            event = event.with_metadata("error", error.to_string());
            if matches!(event.outcome, AuditOutcome::Failed) {
                warn!(
                    event_name = %event.event_type,
                    correlation_id = %event.correlation_id,
                    error = %error,
                    "lifecycle operation failed"
                );
            }
        }
        self.audit.emit(event);
    }

    pub async fn create_request(
        &self,
        customer_id: &CustomerId,
        draft: RequestDraft,
    ) -> Result<RepairRequest, ApplicationError> {
        let correlation_id = correlation_id();
        let result = self.create_request_in_unit(customer_id, draft).await;

        let mut event = AuditEvent::new(
            &correlation_id,
            "lifecycle.request.created",
            AuditCategory::Request,
            Actor::Customer(customer_id.clone()).to_string(),
            AuditOutcome::Success,
        );
        if let Ok((request, _)) = &result {
            event = event.for_request(&request.id);
        }
        self.record(&result, event);

        let (request, notification) = result?;
        info!(
            event_name = "lifecycle.request.created",
            correlation_id = %correlation_id,
            request_id = %request.id.0,
            customer_id = %customer_id.0,
            "repair request created"
        );
        self.notifications.dispatch(notification);
        Ok(request)
    }

    async fn create_request_in_unit(
        &self,
        customer_id: &CustomerId,
        draft: RequestDraft,
    ) -> Result<(RepairRequest, NotificationEvent), ApplicationError> {
        let mut tx = self.store.begin().await?;
        let customer = require_customer(tx.as_mut(), customer_id).await?;
        let request =
            RepairRequest::new(customer_id.clone(), draft.device, draft.image_refs, Utc::now())?;
        tx.insert_request(&request).await?;
        tx.commit().await?;

        let notification =
            NotificationEvent::NewRepairRequest { request: request.clone(), customer };
        Ok((request, notification))
    }

    pub async fn submit_quote(
        &self,
        shop_id: &ShopId,
        request_id: &RepairRequestId,
        draft: QuoteDraft,
    ) -> Result<RepairQuote, ApplicationError> {
        let correlation_id = correlation_id();
        let result = async {
            let mut tx = self.store.begin().await?;
            let outcome =
                arbitration::submit_quote(tx.as_mut(), shop_id, request_id, draft, Utc::now())
                    .await?;
            tx.commit().await?;
            Ok::<_, ApplicationError>(outcome)
        }
        .await;

        let mut event = AuditEvent::new(
            &correlation_id,
            "lifecycle.quote.submitted",
            AuditCategory::Quote,
            Actor::Shop(shop_id.clone()).to_string(),
            AuditOutcome::Success,
        )
        .for_request(request_id);
        if let Ok(outcome) = &result {
            event = event.for_quote(&outcome.quote.id);
        }
        self.record(&result, event);

        let outcome = result?;
        info!(
            event_name = "lifecycle.quote.submitted",
            correlation_id = %correlation_id,
            request_id = %request_id.0,
            quote_id = %outcome.quote.id.0,
            shop_id = %shop_id.0,
            "quote submitted"
        );
        let quote = outcome.quote.clone();
        self.notifications.dispatch(NotificationEvent::NewQuote {
            quote: outcome.quote,
            request: outcome.request,
            customer: outcome.customer,
            shop: outcome.shop,
        });
        Ok(quote)
    }

    pub async fn accept_quote(
        &self,
        customer_id: &CustomerId,
        quote_id: &QuoteId,
    ) -> Result<AcceptanceOutcome, ApplicationError> {
        let correlation_id = correlation_id();
        let result = async {
            let mut tx = self.store.begin().await?;
            let outcome =
                arbitration::accept_quote(tx.as_mut(), customer_id, quote_id, Utc::now()).await?;
            tx.commit().await?;
            Ok::<_, ApplicationError>(outcome)
        }
        .await;

        let mut event = AuditEvent::new(
            &correlation_id,
            "lifecycle.quote.accepted",
            AuditCategory::Quote,
            Actor::Customer(customer_id.clone()).to_string(),
            AuditOutcome::Success,
        )
        .for_quote(quote_id);
        if let Ok(outcome) = &result {
            event = event
                .for_request(&outcome.request.id)
                .with_metadata("rejected_quotes", outcome.rejected_quotes.to_string());
        }
        self.record(&result, event);

        let outcome = result?;
        info!(
            event_name = "lifecycle.quote.accepted",
            correlation_id = %correlation_id,
            request_id = %outcome.request.id.0,
            quote_id = %quote_id.0,
            rejected_quotes = outcome.rejected_quotes,
            "quote accepted"
        );
        self.notifications.dispatch(NotificationEvent::QuoteAccepted {
            quote: outcome.quote.clone(),
            request: outcome.request.clone(),
            customer: outcome.customer.clone(),
            shop: outcome.shop.clone(),
        });
        Ok(outcome)
    }

    pub async fn transition_request(
        &self,
        actor: &Actor,
        request_id: &RepairRequestId,
        target: RequestStatus,
    ) -> Result<RepairRequest, ApplicationError> {
        let correlation_id = correlation_id();
        let result = async {
            let mut tx = self.store.begin().await?;
            let outcome = transitions::transition_request(
                tx.as_mut(),
                actor,
                request_id,
                target,
                Utc::now(),
            )
            .await?;
            tx.commit().await?;
            Ok::<_, ApplicationError>(outcome)
        }
        .await;

        let event = AuditEvent::new(
            &correlation_id,
            "lifecycle.request.transitioned",
            AuditCategory::Request,
            actor.to_string(),
            AuditOutcome::Success,
        )
        .for_request(request_id)
        .with_metadata("to", target.as_str());
        self.record(&result, event);

        let TransitionOutcome { request, previous, customer, assigned_shop } = result?;
        info!(
            event_name = "lifecycle.request.transitioned",
            correlation_id = %correlation_id,
            request_id = %request_id.0,
            from = previous.as_str(),
            to = target.as_str(),
            "request status changed"
        );
        self.notifications.dispatch(NotificationEvent::RequestStatusChanged {
            request: request.clone(),
            previous,
            customer,
            assigned_shop,
        });
        Ok(request)
    }

    /// Replaces the device details and moves an ACCEPTED request to IN_PROGRESS. Only the
    /// assigned shop may do this.
    pub async fn start_repair(
        &self,
        shop_id: &ShopId,
        request_id: &RepairRequestId,
        details: DeviceDetails,
    ) -> Result<RepairRequest, ApplicationError> {
        let correlation_id = correlation_id();
        let result = self.start_repair_in_unit(shop_id, request_id, details).await;

        let event = AuditEvent::new(
            &correlation_id,
            "lifecycle.repair.started",
            AuditCategory::Request,
            Actor::Shop(shop_id.clone()).to_string(),
            AuditOutcome::Success,
        )
        .for_request(request_id);
        self.record(&result, event);

        let (request, notification) = result?;
        info!(
            event_name = "lifecycle.repair.started",
            correlation_id = %correlation_id,
            request_id = %request_id.0,
            shop_id = %shop_id.0,
            "repair started"
        );
        self.notifications.dispatch(notification);
        Ok(request)
    }

    async fn start_repair_in_unit(
        &self,
        shop_id: &ShopId,
        request_id: &RepairRequestId,
        details: DeviceDetails,
    ) -> Result<(RepairRequest, NotificationEvent), ApplicationError> {
        let mut tx = self.store.begin().await?;
        let mut request = tx
            .lock_request(request_id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("repair request {}", request_id.0)))?;

        if request.status != RequestStatus::Accepted {
            return Err(ApplicationError::InvalidState(
                "can only update details for accepted repairs".to_owned(),
            ));
        }
        let assigned = tx.find_accepted_quote(request_id).await?;
        if assigned.as_ref().map(|quote| &quote.shop_id) != Some(shop_id) {
            return Err(ApplicationError::Unauthorized(
                "only the assigned shop can start this repair".to_owned(),
            ));
        }

        request.start_repair(details, Utc::now())?;
        tx.update_request(&request).await?;
        request.version += 1;
        let customer = require_customer(tx.as_mut(), &request.customer_id).await?;
        let shop = require_shop(tx.as_mut(), shop_id).await?;
        tx.commit().await?;

        let notification =
            NotificationEvent::RepairStarted { request: request.clone(), customer, shop };
        Ok((request, notification))
    }

    pub async fn assigned_shop(
        &self,
        request_id: &RepairRequestId,
    ) -> Result<Option<RepairShop>, ApplicationError> {
        let mut tx = self.store.begin_read().await?;
        resolve_assigned_shop(tx.as_mut(), request_id).await
    }

    pub async fn submit_review(
        &self,
        customer_id: &CustomerId,
        request_id: &RepairRequestId,
        rating: u8,
        comment: &str,
    ) -> Result<Review, ApplicationError> {
        let correlation_id = correlation_id();
        let result = self.submit_review_in_unit(customer_id, request_id, rating, comment).await;

        let event = AuditEvent::new(
            &correlation_id,
            "lifecycle.review.submitted",
            AuditCategory::Review,
            Actor::Customer(customer_id.clone()).to_string(),
            AuditOutcome::Success,
        )
        .for_request(request_id)
        .with_metadata("rating", rating.to_string());
        self.record(&result, event);

        let (review, notification) = result?;
        info!(
            event_name = "lifecycle.review.submitted",
            correlation_id = %correlation_id,
            request_id = %request_id.0,
            shop_id = %review.shop_id.0,
            rating = review.rating,
            "review submitted"
        );
        self.notifications.dispatch(notification);
        Ok(review)
    }

    async fn submit_review_in_unit(
        &self,
        customer_id: &CustomerId,
        request_id: &RepairRequestId,
        rating: u8,
        comment: &str,
    ) -> Result<(Review, NotificationEvent), ApplicationError> {
        let mut tx = self.store.begin().await?;
        let request = tx
            .lock_request(request_id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("repair request {}", request_id.0)))?;

        if request.status != RequestStatus::Completed {
            return Err(ApplicationError::InvalidState(
                "cannot review a repair that is not completed".to_owned(),
            ));
        }
        if &request.customer_id != customer_id {
            return Err(ApplicationError::Unauthorized(
                "request belongs to another customer".to_owned(),
            ));
        }
        if tx.find_review_for_request(request_id).await?.is_some() {
            return Err(ApplicationError::Conflict("request has already been reviewed".to_owned()));
        }
        let accepted = tx.find_accepted_quote(request_id).await?.ok_or_else(|| {
            ApplicationError::InvalidState("request has no accepted quote".to_owned())
        })?;

        let review = Review::new(
            request_id.clone(),
            customer_id.clone(),
            accepted.shop_id.clone(),
            rating,
            comment,
            Utc::now(),
        )?;
        tx.insert_review(&review).await?;
        let shop = require_shop(tx.as_mut(), &accepted.shop_id).await?;
        tx.commit().await?;

        let notification =
            NotificationEvent::ReviewSubmitted { review: review.clone(), request, shop };
        Ok((review, notification))
    }

    pub async fn shop_rating_summary(
        &self,
        shop_id: &ShopId,
    ) -> Result<ShopRatingSummary, ApplicationError> {
        let mut tx = self.store.begin_read().await?;
        let reviews = tx.reviews_for_shop(shop_id).await?;
        Ok(ShopRatingSummary::from_reviews(shop_id, &reviews))
    }

    pub async fn request(
        &self,
        request_id: &RepairRequestId,
    ) -> Result<RepairRequest, ApplicationError> {
        let mut tx = self.store.begin_read().await?;
        tx.find_request(request_id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("repair request {}", request_id.0)))
    }

    pub async fn quotes_for_request(
        &self,
        request_id: &RepairRequestId,
    ) -> Result<Vec<RepairQuote>, ApplicationError> {
        let mut tx = self.store.begin_read().await?;
        if tx.find_request(request_id).await?.is_none() {
            return Err(ApplicationError::NotFound(format!("repair request {}", request_id.0)));
        }
        Ok(tx.quotes_for_request(request_id).await?)
    }

    pub async fn requests_for_customer(
        &self,
        customer_id: &CustomerId,
    ) -> Result<Vec<RepairRequest>, ApplicationError> {
        let mut tx = self.store.begin_read().await?;
        Ok(tx.requests_for_customer(customer_id).await?)
    }

    /// Open requests this shop could still quote: PENDING, not quoted by the shop yet and
    /// without an accepted quote.
    pub async fn requests_available_for_quoting(
        &self,
        shop_id: &ShopId,
    ) -> Result<Vec<RepairRequest>, ApplicationError> {
        let mut tx = self.store.begin_read().await?;
        let open = tx.requests_with_status(RequestStatus::Pending).await?;

        let mut available = Vec::with_capacity(open.len());
        for request in open {
            if tx.shop_has_quoted(&request.id, shop_id).await? {
                continue;
            }
            if tx.quote_exists_with_status(&request.id, QuoteStatus::Accepted).await? {
                continue;
            }
            available.push(request);
        }
        Ok(available)
    }

    pub async fn requests_for_shop(
        &self,
        shop_id: &ShopId,
        view: ShopRequestView,
    ) -> Result<Vec<ShopAssignment>, ApplicationError> {
        let mut tx = self.store.begin_read().await?;
        require_shop(tx.as_mut(), shop_id).await?;

        let mut assignments = Vec::new();
        for quote in tx.quotes_for_shop(shop_id).await? {
            let Some(request) = tx.find_request(&quote.request_id).await? else {
                continue;
            };
            if view.includes(&request, &quote) {
                assignments.push(ShopAssignment { request, quote });
            }
        }
        if view == ShopRequestView::Completed {
            assignments
                .sort_by(|left, right| right.request.updated_at.cmp(&left.request.updated_at));
        }
        Ok(assignments)
    }

    pub async fn reviews_for_shop(&self, shop_id: &ShopId) -> Result<Vec<Review>, ApplicationError> {
        let mut tx = self.store.begin_read().await?;
        require_shop(tx.as_mut(), shop_id).await?;
        Ok(tx.reviews_for_shop(shop_id).await?)
    }

    pub async fn reviews_for_customer(
        &self,
        customer_id: &CustomerId,
    ) -> Result<Vec<Review>, ApplicationError> {
        let mut tx = self.store.begin_read().await?;
        require_customer(tx.as_mut(), customer_id).await?;
        Ok(tx.reviews_for_customer(customer_id).await?)
    }

    pub async fn review_for_request(
        &self,
        request_id: &RepairRequestId,
    ) -> Result<Review, ApplicationError> {
        let mut tx = self.store.begin_read().await?;
        if tx.find_request(request_id).await?.is_none() {
            return Err(ApplicationError::NotFound(format!("repair request {}", request_id.0)));
        }
        tx.find_review_for_request(request_id).await?.ok_or_else(|| {
            ApplicationError::NotFound(format!("review for repair request {}", request_id.0))
        })
    }

    pub async fn has_shop_quoted(
        &self,
        shop_id: &ShopId,
        request_id: &RepairRequestId,
    ) -> Result<bool, ApplicationError> {
        let mut tx = self.store.begin_read().await?;
        Ok(tx.shop_has_quoted(request_id, shop_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::{RepairLifecycleService, RequestDraft, ShopRequestView};
    use crate::audit::{AuditOutcome, InMemoryAuditSink};
    use crate::domain::actor::Actor;
    use crate::domain::customer::{Customer, CustomerId};
    use crate::domain::quote::{QuoteDraft, QuoteStatus};
    use crate::domain::request::{DeviceDetails, ProblemCategory, RepairRequest, RequestStatus};
    use crate::domain::shop::{RepairShop, ShopId};
    use crate::errors::ApplicationError;
    use crate::lifecycle::store::{InMemoryRepairStore, RepairStore};
    use crate::notifications::{InMemoryNotificationSink, NotificationEvent};

    struct Harness {
        service: RepairLifecycleService<InMemoryRepairStore>,
        notifications: InMemoryNotificationSink,
        audit: InMemoryAuditSink,
    }

    fn customer_id(id: &str) -> CustomerId {
        CustomerId(id.to_owned())
    }

    fn shop_id(id: &str) -> ShopId {
        ShopId(id.to_owned())
    }

    fn device() -> DeviceDetails {
        DeviceDetails {
            brand: "Apple".to_owned(),
            model: "iPhone 14".to_owned(),
            imei: None,
            problem_category: ProblemCategory::ScreenDamage,
            problem_description: "display flickers after drop".to_owned(),
        }
    }

    fn draft(cost: i64) -> QuoteDraft {
        QuoteDraft {
            estimated_cost: Decimal::new(cost, 0),
            description: "replace display".to_owned(),
            estimated_days: 2,
        }
    }

    async fn harness() -> Harness {
        let store = InMemoryRepairStore::new();
        let now = Utc::now();
        let mut tx = store.begin().await.expect("begin");
        for id in ["C1", "C2"] {
            tx.insert_customer(&Customer {
                id: customer_id(id),
                full_name: format!("Customer {id}"),
                email: format!("{id}@customers.test"),
                created_at: now,
            })
            .await
            .expect("customer");
        }
        for id in ["A", "B", "C"] {
            tx.insert_shop(&RepairShop {
                id: shop_id(id),
                shop_name: format!("Shop {id}"),
                owner_email: format!("{id}@shops.test"),
                created_at: now,
            })
            .await
            .expect("shop");
        }
        tx.commit().await.expect("commit");

        let notifications = InMemoryNotificationSink::default();
        let audit = InMemoryAuditSink::default();
        let service = RepairLifecycleService::new(
            store,
            Arc::new(notifications.clone()),
            Arc::new(audit.clone()),
        );
        Harness { service, notifications, audit }
    }

    async fn open_request(harness: &Harness) -> RepairRequest {
        harness
            .service
            .create_request(&customer_id("C1"), RequestDraft { device: device(), image_refs: vec![] })
            .await
            .expect("create request")
    }

    async fn force_status(harness: &Harness, request: &RepairRequest, status: RequestStatus) {
        let mut tx = harness.service.store().begin().await.expect("begin");
        let mut stored = tx.find_request(&request.id).await.expect("find").expect("present");
        stored.status = status;
        tx.update_request(&stored).await.expect("update");
        tx.commit().await.expect("commit");
    }

    #[tokio::test]
    async fn worked_example_accepting_second_quote_rejects_first() {
        let harness = harness().await;
        let request = open_request(&harness).await;

        let quote_a =
            harness.service.submit_quote(&shop_id("A"), &request.id, draft(50)).await.expect("A");
        let quote_b =
            harness.service.submit_quote(&shop_id("B"), &request.id, draft(70)).await.expect("B");

        let stored = harness.service.request(&request.id).await.expect("request");
        assert_eq!(stored.status, RequestStatus::Pending, "submission leaves request pending");

        let outcome =
            harness.service.accept_quote(&customer_id("C1"), &quote_b.id).await.expect("accept");
        assert_eq!(outcome.request.status, RequestStatus::Accepted);
        assert_eq!(outcome.quote.status, QuoteStatus::Accepted);
        assert!(outcome.quote.accepted);

        let quotes = harness.service.quotes_for_request(&request.id).await.expect("quotes");
        let a = quotes.iter().find(|quote| quote.id == quote_a.id).expect("quote a");
        let b = quotes.iter().find(|quote| quote.id == quote_b.id).expect("quote b");
        assert_eq!(a.status, QuoteStatus::Rejected);
        assert!(!a.accepted);
        assert_eq!(b.status, QuoteStatus::Accepted);
        assert_eq!(quotes.iter().filter(|quote| quote.accepted).count(), 1);

        let assigned = harness.service.assigned_shop(&request.id).await.expect("assigned");
        assert_eq!(assigned.map(|shop| shop.id), Some(shop_id("B")));

        let accepted_to = harness.notifications.events().into_iter().find_map(|event| match event {
            NotificationEvent::QuoteAccepted { shop, .. } => Some(shop.id),
            _ => None,
        });
        assert_eq!(accepted_to, Some(shop_id("B")));
    }

    #[tokio::test]
    async fn duplicate_shop_quote_is_a_conflict() {
        let harness = harness().await;
        let request = open_request(&harness).await;

        harness.service.submit_quote(&shop_id("A"), &request.id, draft(50)).await.expect("first");
        let error = harness
            .service
            .submit_quote(&shop_id("A"), &request.id, draft(45))
            .await
            .expect_err("second quote from A");

        assert!(matches!(error, ApplicationError::Conflict(_)));
        assert_eq!(harness.service.quotes_for_request(&request.id).await.expect("quotes").len(), 1);
    }

    #[tokio::test]
    async fn quote_after_acceptance_is_invalid_state() {
        let harness = harness().await;
        let request = open_request(&harness).await;
        let quote =
            harness.service.submit_quote(&shop_id("A"), &request.id, draft(50)).await.expect("A");
        harness.service.accept_quote(&customer_id("C1"), &quote.id).await.expect("accept");

        let error = harness
            .service
            .submit_quote(&shop_id("C"), &request.id, draft(40))
            .await
            .expect_err("request already accepted");
        assert!(matches!(error, ApplicationError::InvalidState(_)));
    }

    #[tokio::test]
    async fn quote_on_quoted_request_is_invalid_state() {
        let harness = harness().await;
        let request = open_request(&harness).await;
        harness
            .service
            .transition_request(&Actor::Customer(customer_id("C1")), &request.id, RequestStatus::Quoted)
            .await
            .expect("pending -> quoted");

        let error = harness
            .service
            .submit_quote(&shop_id("A"), &request.id, draft(50))
            .await
            .expect_err("request left pending");
        assert!(matches!(error, ApplicationError::InvalidState(_)));
    }

    #[tokio::test]
    async fn accepting_non_pending_quote_is_invalid_state() {
        let harness = harness().await;
        let request = open_request(&harness).await;
        let quote_a =
            harness.service.submit_quote(&shop_id("A"), &request.id, draft(50)).await.expect("A");
        let quote_b =
            harness.service.submit_quote(&shop_id("B"), &request.id, draft(70)).await.expect("B");
        harness.service.accept_quote(&customer_id("C1"), &quote_b.id).await.expect("accept b");

        let error = harness
            .service
            .accept_quote(&customer_id("C1"), &quote_a.id)
            .await
            .expect_err("quote a was rejected");
        assert_eq!(
            error,
            ApplicationError::InvalidState("cannot accept non-pending quote".to_owned())
        );
    }

    #[tokio::test]
    async fn foreign_customer_cannot_accept() {
        let harness = harness().await;
        let request = open_request(&harness).await;
        let quote =
            harness.service.submit_quote(&shop_id("A"), &request.id, draft(50)).await.expect("A");

        let error = harness
            .service
            .accept_quote(&customer_id("C2"), &quote.id)
            .await
            .expect_err("C2 does not own the request");
        assert!(matches!(error, ApplicationError::Unauthorized(_)));

        let quotes = harness.service.quotes_for_request(&request.id).await.expect("quotes");
        assert!(quotes.iter().all(|quote| quote.status == QuoteStatus::Pending));
        let rejected = harness
            .audit
            .events()
            .into_iter()
            .filter(|event| event.event_type == "lifecycle.quote.accepted")
            .map(|event| event.outcome)
            .collect::<Vec<_>>();
        assert_eq!(rejected, vec![AuditOutcome::Rejected]);
    }

    #[tokio::test]
    async fn unknown_quote_is_not_found() {
        let harness = harness().await;
        let error = harness
            .service
            .accept_quote(&customer_id("C1"), &crate::domain::quote::QuoteId("QTE-missing".to_owned()))
            .await
            .expect_err("missing quote");
        assert!(matches!(error, ApplicationError::NotFound(_)));
    }

    #[tokio::test]
    async fn concurrent_acceptances_admit_exactly_one_winner() {
        let harness = harness().await;
        let request = open_request(&harness).await;
        let quote_a =
            harness.service.submit_quote(&shop_id("A"), &request.id, draft(50)).await.expect("A");
        let quote_b =
            harness.service.submit_quote(&shop_id("B"), &request.id, draft(70)).await.expect("B");

        let service = Arc::new(harness.service.clone());
        let first = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.accept_quote(&customer_id("C1"), &quote_a.id).await })
        };
        let second = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.accept_quote(&customer_id("C1"), &quote_b.id).await })
        };

        let results = [first.await.expect("join"), second.await.expect("join")];
        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        assert!(results.iter().filter_map(|result| result.as_ref().err()).all(|error| matches!(
            error,
            ApplicationError::InvalidState(_) | ApplicationError::Conflict(_)
        )));

        let quotes = service.quotes_for_request(&request.id).await.expect("quotes");
        assert_eq!(quotes.iter().filter(|quote| quote.status == QuoteStatus::Accepted).count(), 1);
        assert_eq!(quotes.iter().filter(|quote| quote.status == QuoteStatus::Rejected).count(), 1);
    }

    #[tokio::test]
    async fn failed_commit_rolls_back_whole_acceptance() {
        let harness = harness().await;
        let request = open_request(&harness).await;
        let quote_a =
            harness.service.submit_quote(&shop_id("A"), &request.id, draft(50)).await.expect("A");
        harness.service.submit_quote(&shop_id("B"), &request.id, draft(70)).await.expect("B");
        let before = harness.notifications.events().len();

        harness.service.store().fail_next_commit();
        let error = harness
            .service
            .accept_quote(&customer_id("C1"), &quote_a.id)
            .await
            .expect_err("commit fails");
        assert!(matches!(error, ApplicationError::Persistence(_)));

        let quotes = harness.service.quotes_for_request(&request.id).await.expect("quotes");
        assert!(quotes.iter().all(|quote| quote.status == QuoteStatus::Pending && !quote.accepted));
        let stored = harness.service.request(&request.id).await.expect("request");
        assert_eq!(stored.status, RequestStatus::Pending);
        assert_eq!(harness.notifications.events().len(), before, "nothing dispatched on failure");
    }

    #[tokio::test]
    async fn start_repair_while_pending_is_invalid_state() {
        let harness = harness().await;
        let request = open_request(&harness).await;
        harness.service.submit_quote(&shop_id("A"), &request.id, draft(50)).await.expect("A");

        let error = harness
            .service
            .start_repair(&shop_id("A"), &request.id, device())
            .await
            .expect_err("request still pending");
        assert_eq!(
            error,
            ApplicationError::InvalidState("can only update details for accepted repairs".to_owned())
        );
    }

    #[tokio::test]
    async fn start_repair_by_assigned_shop_moves_to_in_progress() {
        let harness = harness().await;
        let request = open_request(&harness).await;
        let quote =
            harness.service.submit_quote(&shop_id("A"), &request.id, draft(50)).await.expect("A");
        harness.service.submit_quote(&shop_id("B"), &request.id, draft(70)).await.expect("B");
        harness.service.accept_quote(&customer_id("C1"), &quote.id).await.expect("accept");

        let error = harness
            .service
            .start_repair(&shop_id("B"), &request.id, device())
            .await
            .expect_err("B is not assigned");
        assert!(matches!(error, ApplicationError::Unauthorized(_)));

        let mut details = device();
        details.imei = Some("490154203237518".to_owned());
        let started =
            harness.service.start_repair(&shop_id("A"), &request.id, details).await.expect("start");
        assert_eq!(started.status, RequestStatus::InProgress);
        assert_eq!(started.device.imei.as_deref(), Some("490154203237518"));
        assert!(harness.notifications.names().contains(&"repair_started"));
    }

    #[tokio::test]
    async fn full_lifecycle_completes_and_accepts_one_review() {
        let harness = harness().await;
        let request = open_request(&harness).await;
        let quote =
            harness.service.submit_quote(&shop_id("A"), &request.id, draft(50)).await.expect("A");
        harness.service.accept_quote(&customer_id("C1"), &quote.id).await.expect("accept");
        harness.service.start_repair(&shop_id("A"), &request.id, device()).await.expect("start");

        let completed = harness
            .service
            .transition_request(&Actor::Shop(shop_id("A")), &request.id, RequestStatus::Completed)
            .await
            .expect("complete");
        assert_eq!(completed.status, RequestStatus::Completed);
        assert!(completed.completed_at.is_some());

        let review = harness
            .service
            .submit_review(&customer_id("C1"), &request.id, 5, "fast and friendly")
            .await
            .expect("review");
        assert_eq!(review.shop_id, shop_id("A"));

        let error = harness
            .service
            .submit_review(&customer_id("C1"), &request.id, 4, "again")
            .await
            .expect_err("second review");
        assert!(matches!(error, ApplicationError::Conflict(_)));

        let summary = harness.service.shop_rating_summary(&shop_id("A")).await.expect("summary");
        assert_eq!(summary.total_reviews, 1);
        assert_eq!(summary.average_rating, 5.0);

        let changed = harness.notifications.events().into_iter().find_map(|event| match event {
            NotificationEvent::RequestStatusChanged { assigned_shop, customer, .. } => {
                Some((customer.id, assigned_shop.map(|shop| shop.id)))
            }
            _ => None,
        });
        assert_eq!(changed, Some((customer_id("C1"), Some(shop_id("A")))));
    }

    #[tokio::test]
    async fn review_before_completion_is_invalid_state() {
        let harness = harness().await;
        let request = open_request(&harness).await;

        let error = harness
            .service
            .submit_review(&customer_id("C1"), &request.id, 5, "premature")
            .await
            .expect_err("not completed");
        assert_eq!(
            error,
            ApplicationError::InvalidState("cannot review a repair that is not completed".to_owned())
        );
    }

    #[tokio::test]
    async fn illegal_transition_names_both_statuses() {
        let harness = harness().await;
        let request = open_request(&harness).await;

        let error = harness
            .service
            .transition_request(&Actor::Admin("ops".to_owned()), &request.id, RequestStatus::Completed)
            .await
            .expect_err("pending -> completed");
        assert_eq!(
            error,
            ApplicationError::InvalidTransition {
                from: RequestStatus::Pending,
                to: RequestStatus::Completed
            }
        );
    }

    #[tokio::test]
    async fn terminal_requests_reject_every_transition() {
        let harness = harness().await;
        let request = open_request(&harness).await;
        force_status(&harness, &request, RequestStatus::Cancelled).await;

        for target in RequestStatus::ALL {
            let error = harness
                .service
                .transition_request(&Actor::Admin("ops".to_owned()), &request.id, target)
                .await
                .expect_err("cancelled is terminal");
            assert!(matches!(error, ApplicationError::InvalidTransition { .. }));
        }
    }

    #[tokio::test]
    async fn transition_authorization_by_actor() {
        let harness = harness().await;
        let request = open_request(&harness).await;

        let foreign = harness
            .service
            .transition_request(&Actor::Customer(customer_id("C2")), &request.id, RequestStatus::Cancelled)
            .await
            .expect_err("C2 does not own it");
        assert!(matches!(foreign, ApplicationError::Unauthorized(_)));

        let stranger = harness
            .service
            .transition_request(&Actor::Shop(shop_id("C")), &request.id, RequestStatus::Cancelled)
            .await
            .expect_err("shop C never quoted");
        assert!(matches!(stranger, ApplicationError::Unauthorized(_)));

        let cancelled = harness
            .service
            .transition_request(&Actor::Customer(customer_id("C1")), &request.id, RequestStatus::Cancelled)
            .await
            .expect("owner cancels");
        assert_eq!(cancelled.status, RequestStatus::Cancelled);
        assert_eq!(cancelled.completed_at, None);
    }

    #[tokio::test]
    async fn available_requests_exclude_quoted_and_accepted() {
        let harness = harness().await;
        let quoted_by_a = open_request(&harness).await;
        let accepted = open_request(&harness).await;
        let untouched = open_request(&harness).await;

        harness.service.submit_quote(&shop_id("A"), &quoted_by_a.id, draft(50)).await.expect("A");
        let quote =
            harness.service.submit_quote(&shop_id("B"), &accepted.id, draft(60)).await.expect("B");
        harness.service.accept_quote(&customer_id("C1"), &quote.id).await.expect("accept");

        let available =
            harness.service.requests_available_for_quoting(&shop_id("A")).await.expect("available");
        let ids: Vec<_> = available.iter().map(|request| request.id.clone()).collect();
        assert_eq!(ids, vec![untouched.id.clone()]);

        assert!(harness.service.has_shop_quoted(&shop_id("A"), &quoted_by_a.id).await.expect("q"));
        assert!(!harness.service.has_shop_quoted(&shop_id("A"), &untouched.id).await.expect("q"));
        assert_eq!(
            harness.service.requests_for_customer(&customer_id("C1")).await.expect("list").len(),
            3
        );
    }

    #[tokio::test]
    async fn returned_requests_carry_the_stored_version() {
        let harness = harness().await;
        let request = open_request(&harness).await;
        let quote =
            harness.service.submit_quote(&shop_id("A"), &request.id, draft(50)).await.expect("A");

        let accepted =
            harness.service.accept_quote(&customer_id("C1"), &quote.id).await.expect("accept");
        let stored = harness.service.request(&request.id).await.expect("after accept");
        assert_eq!(accepted.request.version, stored.version);
        assert_eq!(stored.version, request.version + 1);

        let started =
            harness.service.start_repair(&shop_id("A"), &request.id, device()).await.expect("start");
        let stored = harness.service.request(&request.id).await.expect("after start");
        assert_eq!(started.version, stored.version);

        let completed = harness
            .service
            .transition_request(&Actor::Shop(shop_id("A")), &request.id, RequestStatus::Completed)
            .await
            .expect("complete");
        let stored = harness.service.request(&request.id).await.expect("after complete");
        assert_eq!(completed.version, stored.version);

        // The returned copy is usable for a further versioned write.
        let mut tx = harness.service.store().begin().await.expect("begin");
        tx.update_request(&completed).await.expect("write with returned version");
        tx.commit().await.expect("commit");
    }

    #[tokio::test]
    async fn shop_views_split_active_and_completed_repairs() {
        let harness = harness().await;
        let finished = open_request(&harness).await;
        let running = open_request(&harness).await;
        let lost = open_request(&harness).await;

        for request in [&finished, &running] {
            let quote =
                harness.service.submit_quote(&shop_id("A"), &request.id, draft(50)).await.expect("A");
            harness.service.accept_quote(&customer_id("C1"), &quote.id).await.expect("accept");
        }
        harness.service.submit_quote(&shop_id("A"), &lost.id, draft(90)).await.expect("A lost");
        let winner =
            harness.service.submit_quote(&shop_id("B"), &lost.id, draft(40)).await.expect("B");
        harness.service.accept_quote(&customer_id("C1"), &winner.id).await.expect("accept B");

        harness.service.start_repair(&shop_id("A"), &finished.id, device()).await.expect("start");
        harness
            .service
            .transition_request(&Actor::Shop(shop_id("A")), &finished.id, RequestStatus::Completed)
            .await
            .expect("complete");

        let active = harness
            .service
            .requests_for_shop(&shop_id("A"), ShopRequestView::Active)
            .await
            .expect("active");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].request.id, running.id);
        assert_eq!(active[0].quote.shop_id, shop_id("A"));
        assert!(active[0].quote.accepted);

        let completed = harness
            .service
            .requests_for_shop(&shop_id("A"), ShopRequestView::Completed)
            .await
            .expect("completed");
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].request.id, finished.id);
        assert_eq!(completed[0].request.status, RequestStatus::Completed);

        let for_b = harness
            .service
            .requests_for_shop(&shop_id("B"), ShopRequestView::Active)
            .await
            .expect("B active");
        assert_eq!(for_b.iter().map(|a| a.request.id.clone()).collect::<Vec<_>>(), vec![lost.id]);

        let error = harness
            .service
            .requests_for_shop(&shop_id("ghost"), ShopRequestView::Active)
            .await
            .expect_err("unknown shop");
        assert!(matches!(error, ApplicationError::NotFound(_)));
    }

    #[tokio::test]
    async fn review_queries_by_shop_customer_and_request() {
        let harness = harness().await;
        let request = open_request(&harness).await;
        let quote =
            harness.service.submit_quote(&shop_id("C"), &request.id, draft(30)).await.expect("C");

        let missing = harness.service.review_for_request(&request.id).await.expect_err("none yet");
        assert!(matches!(missing, ApplicationError::NotFound(_)));

        harness.service.accept_quote(&customer_id("C1"), &quote.id).await.expect("accept");
        harness.service.start_repair(&shop_id("C"), &request.id, device()).await.expect("start");
        harness
            .service
            .transition_request(&Actor::Shop(shop_id("C")), &request.id, RequestStatus::Completed)
            .await
            .expect("complete");
        let review = harness
            .service
            .submit_review(&customer_id("C1"), &request.id, 3, "slow but fine")
            .await
            .expect("review");

        assert_eq!(harness.service.review_for_request(&request.id).await.expect("by request"), review);
        assert_eq!(
            harness.service.reviews_for_shop(&shop_id("C")).await.expect("by shop"),
            vec![review.clone()]
        );
        assert!(harness.service.reviews_for_shop(&shop_id("A")).await.expect("A").is_empty());
        assert_eq!(
            harness.service.reviews_for_customer(&customer_id("C1")).await.expect("by customer"),
            vec![review]
        );
        assert!(harness.service.reviews_for_customer(&customer_id("C2")).await.expect("C2").is_empty());

        let unknown = harness
            .service
            .reviews_for_customer(&customer_id("ghost"))
            .await
            .expect_err("unknown customer");
        assert!(matches!(unknown, ApplicationError::NotFound(_)));
    }

    #[tokio::test]
    async fn create_request_requires_known_customer() {
        let harness = harness().await;
        let error = harness
            .service
            .create_request(&customer_id("ghost"), RequestDraft { device: device(), image_refs: vec![] })
            .await
            .expect_err("unknown customer");
        assert!(matches!(error, ApplicationError::NotFound(_)));
        assert!(harness.notifications.events().is_empty());
    }
}
