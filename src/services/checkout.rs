use crate::entities::checkout_intent::{self, CheckoutStatus, Entity as CheckoutIntent};
use crate::entities::order::{self, Entity as Order, OrderStatus, PaymentStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Address that waives the delivery fee: the customer collects in person.
const PICKUP_SENTINEL: &str = "pick from pharmacy";

const MAX_INTENT_NUMBER_ATTEMPTS: u32 = 3;

/// Creates and reads payment intents. The amount is always recomputed here
/// from the order; client-supplied amounts are never accepted.
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateCheckoutRequest {
    pub order_id: Uuid,
    #[validate(length(min = 9, max = 15, message = "Phone number must be 9 to 15 characters"))]
    pub phone_number: String,
    #[validate(length(min = 1, max = 255, message = "Delivery address is required"))]
    pub delivery_address: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub id: Uuid,
    pub intent_number: String,
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub phone_number: String,
    pub delivery_address: String,
    pub amount: Decimal,
    pub status: String,
    pub external_request_id: Option<String>,
    pub receipt_number: Option<String>,
    pub simulated: bool,
    pub created_at: DateTime<Utc>,
}

/// True when the address means in-person collection, so no delivery fee.
/// Compared trimmed and case-insensitively.
pub fn is_pickup_address(address: &str) -> bool {
    address.trim().eq_ignore_ascii_case(PICKUP_SENTINEL)
}

/// Server-side payable amount: order subtotal plus the stored delivery fee,
/// waived for pickup.
pub fn checkout_amount(subtotal: Decimal, stored_fee: Decimal, delivery_address: &str) -> Decimal {
    if is_pickup_address(delivery_address) {
        subtotal
    } else {
        subtotal + stored_fee
    }
}

/// Human-readable intent number, same scheme as order numbers with a `CO`
/// prefix.
pub fn generate_intent_number() -> String {
    let tail = Utc::now().timestamp_millis() % 1_000_000;
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(char::from)
        .collect::<String>()
        .to_ascii_uppercase();
    format!("CO{:06}{}", tail, suffix)
}

impl CheckoutService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Creates a payment intent for an order.
    ///
    /// Retried requests get the existing live intent back rather than a
    /// second concurrent attempt; a failed intent frees the order for a
    /// fresh one.
    #[instrument(skip(self), fields(order_id = %request.order_id))]
    pub async fn create_intent(
        &self,
        request: CreateCheckoutRequest,
    ) -> Result<CheckoutResponse, ServiceError> {
        request.validate()?;

        let order_model = Order::find_by_id(request.order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))?;

        if order_model.status == OrderStatus::Cancelled.as_str() {
            return Err(ServiceError::Conflict(
                "Order has been cancelled".to_string(),
            ));
        }
        if order_model.payment_status == PaymentStatus::Paid.as_str() {
            return Err(ServiceError::Conflict("Order is already paid".to_string()));
        }

        let amount = checkout_amount(
            order_model.subtotal,
            order_model.delivery_fee,
            &request.delivery_address,
        );

        if amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Checkout amount must be positive".to_string(),
            ));
        }

        // Idempotent retry: hand back the live intent if one exists
        if let Some(existing) = self.find_live_intent(request.order_id).await? {
            info!(checkout_id = %existing.id, "Returning existing live checkout intent");
            return Ok(Self::model_to_response(existing));
        }

        let mut attempt = 0;
        let created = loop {
            attempt += 1;
            let insert = checkout_intent::ActiveModel {
                id: Set(Uuid::new_v4()),
                intent_number: Set(generate_intent_number()),
                order_id: Set(request.order_id),
                user_id: Set(order_model.user_id),
                phone_number: Set(request.phone_number.clone()),
                delivery_address: Set(request.delivery_address.clone()),
                amount: Set(amount),
                status: Set(CheckoutStatus::Pending.as_str().to_string()),
                simulated: Set(false),
                ..Default::default()
            }
            .insert(&*self.db)
            .await;

            match insert {
                Ok(model) => break model,
                Err(db_err)
                    if ServiceError::is_unique_violation(&db_err)
                        && attempt < MAX_INTENT_NUMBER_ATTEMPTS =>
                {
                    warn!(attempt, "Intent number collision, retrying with fresh suffix");
                    continue;
                }
                Err(db_err) => return Err(ServiceError::DatabaseError(db_err)),
            }
        };

        self.event_sender
            .send_or_log(Event::CheckoutCreated(created.id))
            .await;

        info!(checkout_id = %created.id, intent_number = %created.intent_number, %amount, "Checkout intent created");

        Ok(Self::model_to_response(created))
    }

    async fn find_live_intent(
        &self,
        order_id: Uuid,
    ) -> Result<Option<checkout_intent::Model>, ServiceError> {
        let live = CheckoutIntent::find()
            .filter(checkout_intent::Column::OrderId.eq(order_id))
            .filter(
                checkout_intent::Column::Status.is_in([
                    CheckoutStatus::Pending.as_str(),
                    CheckoutStatus::Initiated.as_str(),
                ]),
            )
            .order_by_desc(checkout_intent::Column::CreatedAt)
            .one(&*self.db)
            .await?;

        Ok(live)
    }

    #[instrument(skip(self))]
    pub async fn get_checkout(&self, checkout_id: Uuid) -> Result<CheckoutResponse, ServiceError> {
        let model = CheckoutIntent::find_by_id(checkout_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Checkout not found".to_string()))?;

        Ok(Self::model_to_response(model))
    }

    /// Lists intents, newest first.
    #[instrument(skip(self))]
    pub async fn list_checkouts(
        &self,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<CheckoutResponse>, u64), ServiceError> {
        let paginator = CheckoutIntent::find()
            .order_by_desc(checkout_intent::Column::CreatedAt)
            .paginate(&*self.db, per_page.clamp(1, 100));

        let total = paginator.num_items().await?;
        let models = paginator.fetch_page(page.saturating_sub(1)).await?;

        Ok((
            models.into_iter().map(Self::model_to_response).collect(),
            total,
        ))
    }

    pub(crate) fn model_to_response(model: checkout_intent::Model) -> CheckoutResponse {
        CheckoutResponse {
            id: model.id,
            intent_number: model.intent_number,
            order_id: model.order_id,
            user_id: model.user_id,
            phone_number: model.phone_number,
            delivery_address: model.delivery_address,
            amount: model.amount,
            status: model.status,
            external_request_id: model.external_request_id,
            receipt_number: model.receipt_number,
            simulated: model.simulated,
            created_at: model.created_at,
        }
    }
}
