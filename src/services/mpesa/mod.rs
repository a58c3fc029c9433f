pub mod gateway;
pub mod reconciliation;
pub mod types;

use crate::config::MpesaConfig;
use crate::entities::checkout_intent::{self, CheckoutStatus, Entity as CheckoutIntent};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::checkout::{CheckoutResponse, CheckoutService};
use gateway::{amount_to_shillings, normalize_phone, sanitize_account_reference, MpesaGateway};
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use types::StkQueryResponse;
use uuid::Uuid;

/// Drives the push side of the payment flow: validates the intent, talks to
/// the gateway, and records the outcome on the intent.
#[derive(Clone)]
pub struct MpesaService {
    db: Arc<DatabaseConnection>,
    config: MpesaConfig,
    gateway: Arc<MpesaGateway>,
    event_sender: EventSender,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePushRequest {
    pub checkout_id: Uuid,
    /// Overrides the phone captured at checkout, e.g. paying from a
    /// different line
    pub phone_number: Option<String>,
}

impl MpesaService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: MpesaConfig,
        gateway: Arc<MpesaGateway>,
        event_sender: EventSender,
    ) -> Self {
        Self {
            db,
            config,
            gateway,
            event_sender,
        }
    }

    /// Sends the STK push for a checkout intent.
    ///
    /// A failed push leaves the intent `pending` so the customer can retry;
    /// a repeated call on an already-initiated intent returns it unchanged.
    #[instrument(skip(self), fields(checkout_id = %request.checkout_id))]
    pub async fn initiate_push(
        &self,
        request: InitiatePushRequest,
    ) -> Result<CheckoutResponse, ServiceError> {
        let intent = CheckoutIntent::find_by_id(request.checkout_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Checkout not found".to_string()))?;

        let status = CheckoutStatus::parse(&intent.status).ok_or_else(|| {
            ServiceError::InternalError(format!("Unknown checkout status: {}", intent.status))
        })?;

        if status.is_terminal() {
            return Err(ServiceError::Conflict(format!(
                "Checkout is already {}",
                status.as_str()
            )));
        }

        if status == CheckoutStatus::Initiated && intent.external_request_id.is_some() {
            info!("Push already initiated, returning current intent");
            return Ok(CheckoutService::model_to_response(intent));
        }

        let phone = normalize_phone(
            request
                .phone_number
                .as_deref()
                .unwrap_or(&intent.phone_number),
        )?;
        let amount = amount_to_shillings(intent.amount)?;
        let reference = sanitize_account_reference(&intent.intent_number);

        let token = match self.gateway.access_token().await {
            Ok(token) => token,
            Err(e) => {
                // Sandbox escape hatch: only the token path, never in
                // production, and only when explicitly enabled.
                if !self.config.is_production() && self.config.allow_simulated_push {
                    warn!("Token fetch failed, falling back to simulated push: {}", e);
                    return self.mark_simulated(intent).await;
                }
                return Err(e);
            }
        };

        let response = self
            .gateway
            .stk_push(&token, &phone, amount, &reference, "Pharmacy order payment")
            .await?;

        let checkout_id = intent.id;
        let mut active: checkout_intent::ActiveModel = intent.into();
        active.status = Set(CheckoutStatus::Initiated.as_str().to_string());
        active.phone_number = Set(phone);
        active.external_request_id = Set(Some(response.checkout_request_id.clone()));
        active.merchant_request_id = Set(Some(response.merchant_request_id.clone()));
        active.provider_metadata = Set(serde_json::to_string(&response).ok());
        let updated = active.update(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::StkPushInitiated {
                checkout_id,
                simulated: false,
            })
            .await;

        info!(
            external_request_id = %response.checkout_request_id,
            "STK push initiated"
        );

        Ok(CheckoutService::model_to_response(updated))
    }

    /// Marks the intent initiated with a synthetic request id so sandbox
    /// flows can proceed without provider credentials.
    async fn mark_simulated(
        &self,
        intent: checkout_intent::Model,
    ) -> Result<CheckoutResponse, ServiceError> {
        let checkout_id = intent.id;
        let mut active: checkout_intent::ActiveModel = intent.into();
        active.status = Set(CheckoutStatus::Initiated.as_str().to_string());
        active.simulated = Set(true);
        active.external_request_id = Set(Some(format!("SIM-{}", Uuid::new_v4().simple())));
        let updated = active.update(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::StkPushInitiated {
                checkout_id,
                simulated: true,
            })
            .await;

        Ok(CheckoutService::model_to_response(updated))
    }

    /// Asks the provider for the current status of an initiated push.
    #[instrument(skip(self))]
    pub async fn verify_transaction(
        &self,
        checkout_id: Uuid,
    ) -> Result<StkQueryResponse, ServiceError> {
        let intent = CheckoutIntent::find_by_id(checkout_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Checkout not found".to_string()))?;

        if intent.simulated {
            return Err(ServiceError::InvalidOperation(
                "Simulated pushes have no provider-side status".to_string(),
            ));
        }

        let external_request_id = intent.external_request_id.ok_or_else(|| {
            ServiceError::InvalidOperation("Push has not been initiated".to_string())
        })?;

        let token = self.gateway.access_token().await?;
        self.gateway.query_status(&token, &external_request_id).await
    }
}
