use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::request::RepairRequestId;
use crate::domain::shop::ShopId;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuoteId(pub String);

impl QuoteId {
    pub fn generate() -> Self {
        Self(format!("QTE-{}", Uuid::new_v4()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuoteStatus {
    Pending,
    Accepted,
    Rejected,
}

impl QuoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// What a shop submits when quoting a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteDraft {
    pub estimated_cost: Decimal,
    pub description: String,
    pub estimated_days: u32,
}

impl QuoteDraft {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.estimated_cost <= Decimal::ZERO {
            return Err(DomainError::Validation("estimated cost must be positive".to_owned()));
        }
        if self.estimated_days == 0 {
            return Err(DomainError::Validation("estimated days must be at least 1".to_owned()));
        }
        if self.description.trim().is_empty() {
            return Err(DomainError::Validation("quote description is required".to_owned()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairQuote {
    pub id: QuoteId,
    pub request_id: RepairRequestId,
    pub shop_id: ShopId,
    pub estimated_cost: Decimal,
    pub description: String,
    pub estimated_days: u32,
    pub status: QuoteStatus,
    /// Mirrors `status == Accepted`; only [`RepairQuote::accept`] sets it.
    pub accepted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RepairQuote {
    pub fn new(
        request_id: RepairRequestId,
        shop_id: ShopId,
        draft: QuoteDraft,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        draft.validate()?;

        Ok(Self {
            id: QuoteId::generate(),
            request_id,
            shop_id,
            estimated_cost: draft.estimated_cost,
            description: draft.description.trim().to_owned(),
            estimated_days: draft.estimated_days,
            status: QuoteStatus::Pending,
            accepted: false,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.status == QuoteStatus::Pending
    }

    pub fn accept(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        if !self.is_pending() {
            return Err(DomainError::InvariantViolation("cannot accept non-pending quote".to_owned()));
        }

        self.status = QuoteStatus::Accepted;
        self.accepted = true;
        self.updated_at = now;
        Ok(())
    }

    pub fn reject(&mut self, now: DateTime<Utc>) {
        self.status = QuoteStatus::Rejected;
        self.accepted = false;
        self.updated_at = now;
    }
}
