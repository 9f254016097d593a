use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::customer::CustomerId;
use crate::domain::shop::ShopId;

/// Identity resolved at the boundary and passed into every lifecycle operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    Customer(CustomerId),
    Shop(ShopId),
    Admin(String),
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Customer(id) => write!(f, "customer:{}", id.0),
            Self::Shop(id) => write!(f, "shop:{}", id.0),
            Self::Admin(id) => write!(f, "admin:{id}"),
        }
    }
}
