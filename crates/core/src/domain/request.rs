use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::customer::CustomerId;
use crate::errors::DomainError;

pub const MAX_IMAGE_REFS: usize = 3;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepairRequestId(pub String);

impl RepairRequestId {
    pub fn generate() -> Self {
        Self(format!("REQ-{}", Uuid::new_v4()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Quoted,
    Accepted,
    InProgress,
    Completed,
    Cancelled,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 6] = [
        Self::Pending,
        Self::Quoted,
        Self::Accepted,
        Self::InProgress,
        Self::Completed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Quoted => "quoted",
            Self::Accepted => "accepted",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "quoted" => Some(Self::Quoted),
            "accepted" => Some(Self::Accepted),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// The generic transition table. Quote acceptance moves PENDING straight to ACCEPTED and
    /// starting a repair moves ACCEPTED to IN_PROGRESS; both edges live on [`RepairRequest`]
    /// and are not reachable through this table alone.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::{Accepted, Cancelled, Completed, InProgress, Pending, Quoted};

        matches!(
            (self, next),
            (Pending, Quoted)
                | (Pending, Cancelled)
                | (Quoted, Accepted)
                | (Quoted, Cancelled)
                | (Accepted, InProgress)
                | (Accepted, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Cancelled)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProblemCategory {
    ScreenDamage,
    BatteryIssue,
    ChargingProblem,
    WaterDamage,
    SoftwareIssue,
    CameraProblem,
    SpeakerIssue,
    Other,
}

impl ProblemCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScreenDamage => "screen_damage",
            Self::BatteryIssue => "battery_issue",
            Self::ChargingProblem => "charging_problem",
            Self::WaterDamage => "water_damage",
            Self::SoftwareIssue => "software_issue",
            Self::CameraProblem => "camera_problem",
            Self::SpeakerIssue => "speaker_issue",
            Self::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "screen_damage" => Some(Self::ScreenDamage),
            "battery_issue" => Some(Self::BatteryIssue),
            "charging_problem" => Some(Self::ChargingProblem),
            "water_damage" => Some(Self::WaterDamage),
            "software_issue" => Some(Self::SoftwareIssue),
            "camera_problem" => Some(Self::CameraProblem),
            "speaker_issue" => Some(Self::SpeakerIssue),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDetails {
    pub brand: String,
    pub model: String,
    pub imei: Option<String>,
    pub problem_category: ProblemCategory,
    pub problem_description: String,
}

impl DeviceDetails {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.brand.trim().is_empty() {
            return Err(DomainError::Validation("device brand is required".to_owned()));
        }
        if self.model.trim().is_empty() {
            return Err(DomainError::Validation("device model is required".to_owned()));
        }
        if self.problem_description.trim().is_empty() {
            return Err(DomainError::Validation("problem description is required".to_owned()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairRequest {
    pub id: RepairRequestId,
    pub customer_id: CustomerId,
    pub device: DeviceDetails,
    pub image_refs: BTreeSet<String>,
    pub status: RequestStatus,
    /// Bumped by the store on every write; writes carrying a stale value are rejected.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RepairRequest {
    pub fn new(
        customer_id: CustomerId,
        device: DeviceDetails,
        image_refs: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        device.validate()?;

        let image_refs: BTreeSet<String> = image_refs
            .into_iter()
            .map(|image| image.trim().to_owned())
            .filter(|image| !image.is_empty())
            .collect();
        if image_refs.len() > MAX_IMAGE_REFS {
            return Err(DomainError::Validation(format!(
                "maximum {MAX_IMAGE_REFS} images allowed per request"
            )));
        }

        Ok(Self {
            id: RepairRequestId::generate(),
            customer_id,
            device,
            image_refs,
            status: RequestStatus::Pending,
            version: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        })
    }

    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        self.status.can_transition_to(next)
    }

    pub fn transition_to(
        &mut self,
        next: RequestStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if !self.can_transition_to(next) {
            return Err(DomainError::InvalidRequestTransition { from: self.status, to: next });
        }

        self.status = next;
        self.updated_at = now;
        if next == RequestStatus::Completed {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Arbitration edge: an open request becomes ACCEPTED when one of its quotes is accepted.
    pub fn mark_quote_accepted(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        if self.status != RequestStatus::Pending {
            return Err(DomainError::InvalidRequestTransition {
                from: self.status,
                to: RequestStatus::Accepted,
            });
        }

        self.status = RequestStatus::Accepted;
        self.updated_at = now;
        Ok(())
    }

    /// Replaces the device details and moves the repair into IN_PROGRESS in one step.
    pub fn start_repair(
        &mut self,
        details: DeviceDetails,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if self.status != RequestStatus::Accepted {
            return Err(DomainError::InvariantViolation(
                "can only update details for accepted repairs".to_owned(),
            ));
        }
        details.validate()?;

        self.device = details;
        self.status = RequestStatus::InProgress;
        self.updated_at = now;
        Ok(())
    }
}
