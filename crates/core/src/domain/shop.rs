use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShopId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairShop {
    pub id: ShopId,
    pub shop_name: String,
    pub owner_email: String,
    pub created_at: DateTime<Utc>,
}
