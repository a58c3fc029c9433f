use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a payment intent.
///
/// `pending` and `initiated` are live; `successful` and `failed` are
/// terminal and only the callback reconciler writes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckoutStatus {
    Pending,
    Initiated,
    Successful,
    Failed,
}

impl CheckoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckoutStatus::Pending => "pending",
            CheckoutStatus::Initiated => "initiated",
            CheckoutStatus::Successful => "successful",
            CheckoutStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CheckoutStatus::Pending),
            "initiated" => Some(CheckoutStatus::Initiated),
            "successful" => Some(CheckoutStatus::Successful),
            "failed" => Some(CheckoutStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CheckoutStatus::Successful | CheckoutStatus::Failed)
    }
}

/// Payment intent for one push attempt against an order.
///
/// `external_request_id` is the provider's CheckoutRequestID and the only
/// correlation key the callback carries. `receipt_number` is unique across
/// intents so a replayed receipt cannot settle two payments.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "checkout_intents")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub intent_number: String,
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub phone_number: String,
    pub delivery_address: String,
    pub amount: Decimal,
    pub status: String,
    pub external_request_id: Option<String>,
    pub merchant_request_id: Option<String>,
    pub receipt_number: Option<String>,
    /// Raw provider response/callback JSON, kept for audit
    pub provider_metadata: Option<String>,
    pub simulated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        let now = Utc::now();

        if insert {
            if let ActiveValue::NotSet = active_model.id {
                active_model.id = Set(Uuid::new_v4());
            }
            if let ActiveValue::NotSet = active_model.created_at {
                active_model.created_at = Set(now);
            }
        }

        active_model.updated_at = Set(Some(now));

        Ok(active_model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for status in [
            CheckoutStatus::Pending,
            CheckoutStatus::Initiated,
            CheckoutStatus::Successful,
            CheckoutStatus::Failed,
        ] {
            assert_eq!(CheckoutStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(CheckoutStatus::parse("bogus"), None);
    }

    #[test]
    fn only_success_and_failure_are_terminal() {
        assert!(!CheckoutStatus::Pending.is_terminal());
        assert!(!CheckoutStatus::Initiated.is_terminal());
        assert!(CheckoutStatus::Successful.is_terminal());
        assert!(CheckoutStatus::Failed.is_terminal());
    }
}
