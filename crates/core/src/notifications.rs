//! Post-commit notifications. Lifecycle operations hand events to a [`NotificationDispatcher`]
//! after their unit of work committed; delivery happens on a separate task and its failures
//! never reach the caller.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{error, info, warn};

use crate::domain::customer::Customer;
use crate::domain::quote::RepairQuote;
use crate::domain::request::{RepairRequest, RequestStatus};
use crate::domain::review::Review;
use crate::domain::shop::RepairShop;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    NewRepairRequest { request: RepairRequest, customer: Customer },
    NewQuote { quote: RepairQuote, request: RepairRequest, customer: Customer, shop: RepairShop },
    QuoteAccepted { quote: RepairQuote, request: RepairRequest, customer: Customer, shop: RepairShop },
    RequestStatusChanged {
        request: RepairRequest,
        previous: RequestStatus,
        customer: Customer,
        assigned_shop: Option<RepairShop>,
    },
    RepairStarted { request: RepairRequest, customer: Customer, shop: RepairShop },
    ReviewSubmitted { review: Review, request: RepairRequest, shop: RepairShop },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Recipient {
    pub role: &'static str,
    pub id: String,
    pub email: String,
}

impl Recipient {
    fn customer(customer: &Customer) -> Self {
        Self { role: "customer", id: customer.id.0.clone(), email: customer.email.clone() }
    }

    fn shop(shop: &RepairShop) -> Self {
        Self { role: "shop", id: shop.id.0.clone(), email: shop.owner_email.clone() }
    }
}

impl NotificationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewRepairRequest { .. } => "new_repair_request",
            Self::NewQuote { .. } => "new_quote",
            Self::QuoteAccepted { .. } => "quote_accepted",
            Self::RequestStatusChanged { .. } => "request_status_changed",
            Self::RepairStarted { .. } => "repair_started",
            Self::ReviewSubmitted { .. } => "review_submitted",
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Self::NewRepairRequest { request, .. }
            | Self::NewQuote { request, .. }
            | Self::QuoteAccepted { request, .. }
            | Self::RequestStatusChanged { request, .. }
            | Self::RepairStarted { request, .. }
            | Self::ReviewSubmitted { request, .. } => &request.id.0,
        }
    }

    /// Direct recipients. A new request has none here; fanning it out to shops is up to the
    /// sink.
    pub fn recipients(&self) -> Vec<Recipient> {
        match self {
            Self::NewRepairRequest { .. } => Vec::new(),
            Self::NewQuote { customer, .. } => vec![Recipient::customer(customer)],
            Self::QuoteAccepted { shop, .. } => vec![Recipient::shop(shop)],
            Self::RequestStatusChanged { customer, assigned_shop, .. } => {
                let mut recipients = vec![Recipient::customer(customer)];
                recipients.extend(assigned_shop.iter().map(Recipient::shop));
                recipients
            }
            Self::RepairStarted { customer, .. } => vec![Recipient::customer(customer)],
            Self::ReviewSubmitted { shop, .. } => vec![Recipient::shop(shop)],
        }
    }
}

pub trait NotificationDispatcher: Send + Sync {
    /// Must not block and must not fail the caller.
    fn dispatch(&self, event: NotificationEvent);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotificationDispatcher;

impl NotificationDispatcher for NoopNotificationDispatcher {
    fn dispatch(&self, _event: NotificationEvent) {}
}

#[derive(Clone, Debug)]
pub struct QueueNotificationDispatcher {
    sender: mpsc::Sender<NotificationEvent>,
}

/// Bounded queue between lifecycle operations and the delivery worker.
pub fn notification_channel(
    capacity: usize,
) -> (QueueNotificationDispatcher, NotificationWorker) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (QueueNotificationDispatcher { sender }, NotificationWorker { receiver })
}

impl NotificationDispatcher for QueueNotificationDispatcher {
    fn dispatch(&self, event: NotificationEvent) {
        let name = event.name();
        let request_id = event.request_id().to_owned();
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!(
                event_name = "notifications.queue.full",
                notification = name,
                request_id = %request_id,
                "notification queue full; event dropped"
            ),
            Err(TrySendError::Closed(_)) => warn!(
                event_name = "notifications.queue.closed",
                notification = name,
                request_id = %request_id,
                "notification worker stopped; event dropped"
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotificationError>;
}

pub struct NotificationWorker {
    receiver: mpsc::Receiver<NotificationEvent>,
}

impl NotificationWorker {
    /// Drains the queue until every dispatcher handle is dropped. Returns the number of events
    /// the sink accepted.
    pub async fn run(mut self, sink: Arc<dyn NotificationSink>) -> u64 {
        let mut delivered = 0;
        while let Some(event) = self.receiver.recv().await {
            match sink.deliver(&event).await {
                Ok(()) => delivered += 1,
                Err(error) => error!(
                    event_name = "notifications.delivery.failed",
                    notification = event.name(),
                    request_id = %event.request_id(),
                    error = %error,
                    "notification delivery failed"
                ),
            }
        }
        delivered
    }
}

/// Writes each notification as a structured log line per recipient.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotificationError> {
        let recipients = event.recipients();
        if recipients.is_empty() {
            info!(
                event_name = "notifications.broadcast",
                notification = event.name(),
                request_id = %event.request_id(),
                "notification broadcast"
            );
        }
        for recipient in recipients {
            info!(
                event_name = "notifications.delivered",
                notification = event.name(),
                request_id = %event.request_id(),
                recipient_role = recipient.role,
                recipient_id = %recipient.id,
                recipient_email = %recipient.email,
                "notification delivered"
            );
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryNotificationSink {
    events: Arc<Mutex<Vec<NotificationEvent>>>,
}

impl InMemoryNotificationSink {
    pub fn events(&self) -> Vec<NotificationEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(NotificationEvent::name).collect()
    }
}

#[async_trait]
impl NotificationSink for InMemoryNotificationSink {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotificationError> {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
        Ok(())
    }
}

/// Synchronous dispatcher that records events directly; handy where no worker task runs.
impl NotificationDispatcher for InMemoryNotificationSink {
    fn dispatch(&self, event: NotificationEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}
