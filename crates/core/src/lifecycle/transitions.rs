use chrono::{DateTime, Utc};

use crate::domain::actor::Actor;
use crate::domain::customer::Customer;
use crate::domain::request::{RepairRequest, RepairRequestId, RequestStatus};
use crate::domain::shop::RepairShop;
use crate::errors::ApplicationError;
use crate::lifecycle::arbitration::{require_customer, resolve_assigned_shop};
use crate::lifecycle::store::RepairTransaction;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub request: RepairRequest,
    pub previous: RequestStatus,
    pub customer: Customer,
    pub assigned_shop: Option<RepairShop>,
}

/// Customers may move their own requests, shops only requests they quoted (and, once a quote
/// is accepted, only as the assigned shop). Admins may move any request.
pub async fn authorize(
    tx: &mut dyn RepairTransaction,
    actor: &Actor,
    request: &RepairRequest,
) -> Result<(), ApplicationError> {
    match actor {
        Actor::Admin(_) => Ok(()),
        Actor::Customer(customer_id) => {
            if &request.customer_id == customer_id {
                Ok(())
            } else {
                Err(ApplicationError::Unauthorized(
                    "request belongs to another customer".to_owned(),
                ))
            }
        }
        Actor::Shop(shop_id) => {
            if !tx.shop_has_quoted(&request.id, shop_id).await? {
                return Err(ApplicationError::Unauthorized(
                    "shop has not quoted this request".to_owned(),
                ));
            }
            match tx.find_accepted_quote(&request.id).await? {
                Some(accepted) if &accepted.shop_id != shop_id => Err(
                    ApplicationError::Unauthorized("request is assigned to another shop".to_owned()),
                ),
                _ => Ok(()),
            }
        }
    }
}

/// Moves a request along the generic transition table.
pub async fn transition_request(
    tx: &mut dyn RepairTransaction,
    actor: &Actor,
    request_id: &RepairRequestId,
    target: RequestStatus,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome, ApplicationError> {
    let mut request = tx
        .lock_request(request_id)
        .await?
        .ok_or_else(|| ApplicationError::NotFound(format!("repair request {}", request_id.0)))?;

    authorize(tx, actor, &request).await?;

    let previous = request.status;
    request.transition_to(target, now)?;
    tx.update_request(&request).await?;
    request.version += 1;

    let customer = require_customer(tx, &request.customer_id).await?;
    let assigned_shop = resolve_assigned_shop(tx, request_id).await?;

    Ok(TransitionOutcome { request, previous, customer, assigned_shop })
}
