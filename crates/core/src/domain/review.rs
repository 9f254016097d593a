use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::customer::CustomerId;
use crate::domain::request::RepairRequestId;
use crate::domain::shop::ShopId;
use crate::errors::DomainError;

pub const MAX_COMMENT_CHARS: usize = 500;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReviewId(pub String);

impl ReviewId {
    pub fn generate() -> Self {
        Self(format!("REV-{}", Uuid::new_v4()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub id: ReviewId,
    pub request_id: RepairRequestId,
    pub customer_id: CustomerId,
    pub shop_id: ShopId,
    pub rating: u8,
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

impl Review {
    pub fn new(
        request_id: RepairRequestId,
        customer_id: CustomerId,
        shop_id: ShopId,
        rating: u8,
        comment: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        if !(1..=5).contains(&rating) {
            return Err(DomainError::Validation("rating must be between 1 and 5".to_owned()));
        }
        let comment = comment.trim();
        if comment.is_empty() {
            return Err(DomainError::Validation("review comment is required".to_owned()));
        }
        if comment.chars().count() > MAX_COMMENT_CHARS {
            return Err(DomainError::Validation(format!(
                "review comment must be at most {MAX_COMMENT_CHARS} characters"
            )));
        }

        Ok(Self {
            id: ReviewId::generate(),
            request_id,
            customer_id,
            shop_id,
            rating,
            comment: comment.to_owned(),
            created_at: now,
        })
    }
}

/// Aggregated view over every review a shop has received.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShopRatingSummary {
    pub shop_id: String,
    pub average_rating: f64,
    pub total_reviews: u32,
    /// Index 0 counts one-star reviews, index 4 five-star reviews.
    pub star_counts: [u32; 5],
}

impl ShopRatingSummary {
    pub fn from_reviews<'a>(shop_id: &ShopId, reviews: impl IntoIterator<Item = &'a Review>) -> Self {
        let mut summary = Self { shop_id: shop_id.0.clone(), ..Self::default() };
        let mut sum = 0u32;

        for review in reviews {
            let index = usize::from(review.rating.clamp(1, 5)) - 1;
            summary.star_counts[index] += 1;
            summary.total_reviews += 1;
            sum += u32::from(review.rating);
        }

        if summary.total_reviews > 0 {
            let average = f64::from(sum) / f64::from(summary.total_reviews);
            summary.average_rating = (average * 10.0).round() / 10.0;
        }
        summary
    }
}
