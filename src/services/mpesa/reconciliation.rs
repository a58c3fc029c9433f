use crate::entities::checkout_intent::{self, CheckoutStatus, Entity as CheckoutIntent};
use crate::entities::order::{self, Entity as Order, OrderStatus, PaymentStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::mpesa::types::StkCallback;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Metadata item names in the provider's callback
const META_RECEIPT: &str = "MpesaReceiptNumber";
const META_AMOUNT: &str = "Amount";
const META_PHONE: &str = "PhoneNumber";

/// Business outcome of one callback delivery. All three are acknowledged
/// with 200 so the provider stops redelivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    Confirmed,
    Failed,
    AlreadyProcessed,
}

impl CallbackOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            CallbackOutcome::Confirmed => "Payment confirmed",
            CallbackOutcome::Failed => "Payment failure recorded",
            CallbackOutcome::AlreadyProcessed => "Callback already processed",
        }
    }
}

/// Applies provider callbacks to intents: the only writer of terminal
/// checkout states.
#[derive(Clone)]
pub struct ReconciliationService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl ReconciliationService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Processes one STK callback delivery.
    ///
    /// Exactly-once: a terminal intent short-circuits to `AlreadyProcessed`,
    /// and the success transition plus the order promotion commit together
    /// or not at all. Unknown request ids are a `NotFound` the handler maps
    /// to 404; the provider redelivers until the push response has landed.
    #[instrument(skip(self, callback), fields(checkout_request_id = %callback.checkout_request_id, result_code = callback.result_code))]
    pub async fn process_callback(
        &self,
        callback: StkCallback,
    ) -> Result<CallbackOutcome, ServiceError> {
        let intent = CheckoutIntent::find()
            .filter(
                checkout_intent::Column::ExternalRequestId
                    .eq(callback.checkout_request_id.clone()),
            )
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                warn!("Callback for unknown checkout request id");
                ServiceError::NotFound("Unknown checkout request".to_string())
            })?;

        let status = CheckoutStatus::parse(&intent.status).ok_or_else(|| {
            ServiceError::InternalError(format!("Unknown checkout status: {}", intent.status))
        })?;

        if status.is_terminal() {
            info!(checkout_id = %intent.id, "Redelivered callback for settled intent, ignoring");
            return Ok(CallbackOutcome::AlreadyProcessed);
        }

        if callback.is_success() {
            self.confirm_payment(intent, &callback).await
        } else {
            self.record_failure(intent, &callback).await
        }
    }

    async fn confirm_payment(
        &self,
        intent: checkout_intent::Model,
        callback: &StkCallback,
    ) -> Result<CallbackOutcome, ServiceError> {
        let receipt = callback.metadata_string(META_RECEIPT);
        let paid_amount = callback.metadata_decimal(META_AMOUNT);
        let payer_phone = callback.metadata_string(META_PHONE);

        if receipt.is_none() {
            warn!(checkout_id = %intent.id, "Success callback without a receipt number");
        }
        if let Some(paid) = paid_amount {
            if paid < intent.amount {
                warn!(
                    checkout_id = %intent.id,
                    expected = %intent.amount,
                    paid = %paid,
                    "Callback amount below intent amount"
                );
            }
        }

        let checkout_id = intent.id;
        let order_id = intent.order_id;
        let amount = intent.amount;

        let txn = self.db.begin().await?;

        let mut active: checkout_intent::ActiveModel = intent.into();
        active.status = Set(CheckoutStatus::Successful.as_str().to_string());
        active.receipt_number = Set(receipt.clone());
        if let Some(phone) = payer_phone {
            active.phone_number = Set(phone);
        }
        active.provider_metadata = Set(serde_json::to_string(callback).ok());

        if let Err(db_err) = active.update(&txn).await {
            // The receipt unique index caught a replay onto a second intent
            if ServiceError::is_unique_violation(&db_err) {
                error!(%checkout_id, "Receipt number already recorded on another intent");
                return Err(ServiceError::Conflict(
                    "Receipt already recorded".to_string(),
                ));
            }
            return Err(ServiceError::DatabaseError(db_err));
        }

        let order_model = Order::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                error!(%order_id, "Intent references a missing order");
                ServiceError::InternalError("Order missing for paid checkout".to_string())
            })?;

        let version = order_model.version;
        let mut order_active: order::ActiveModel = order_model.into();
        order_active.payment_status = Set(PaymentStatus::Paid.as_str().to_string());
        order_active.status = Set(OrderStatus::Processing.as_str().to_string());
        order_active.version = Set(version + 1);
        order_active.update(&txn).await?;

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::PaymentSucceeded {
                checkout_id,
                order_id,
                amount,
                receipt_number: receipt,
            })
            .await;
        self.event_sender.send_or_log(Event::OrderPaid(order_id)).await;

        info!(%checkout_id, %order_id, "Payment confirmed, order promoted to processing");

        Ok(CallbackOutcome::Confirmed)
    }

    /// Records a failed push. The order stays as it was so a fresh checkout
    /// attempt can follow.
    async fn record_failure(
        &self,
        intent: checkout_intent::Model,
        callback: &StkCallback,
    ) -> Result<CallbackOutcome, ServiceError> {
        let checkout_id = intent.id;
        let description = callback
            .result_desc
            .clone()
            .unwrap_or_else(|| "Payment failed".to_string());

        let mut active: checkout_intent::ActiveModel = intent.into();
        active.status = Set(CheckoutStatus::Failed.as_str().to_string());
        active.provider_metadata = Set(serde_json::to_string(callback).ok());
        active.update(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::PaymentFailed {
                checkout_id,
                result_code: callback.result_code,
                description: description.clone(),
            })
            .await;

        info!(%checkout_id, result_code = callback.result_code, %description, "Payment failure recorded");

        Ok(CallbackOutcome::Failed)
    }
}
