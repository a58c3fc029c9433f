use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Events emitted after a state change commits. Consumers are best-effort;
/// a dropped event never affects the committed state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Order events
    OrderCreated(Uuid),
    OrderCancelled(Uuid),
    OrderPaid(Uuid),

    // Checkout / payment events
    CheckoutCreated(Uuid),
    StkPushInitiated {
        checkout_id: Uuid,
        simulated: bool,
    },
    PaymentSucceeded {
        checkout_id: Uuid,
        order_id: Uuid,
        amount: Decimal,
        receipt_number: Option<String>,
    },
    PaymentFailed {
        checkout_id: Uuid,
        result_code: i64,
        description: String,
    },

    // Housekeeping
    CartClearFailed {
        user_id: Uuid,
        order_id: Uuid,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Fire-and-forget send used after commit, where the caller must not
    /// fail because a consumer lagged.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event.clone()).await {
            warn!(?event, "Event channel closed or full: {}", e);
        }
    }
}

/// Builds the channel and a sender, sized from config.
pub fn event_channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

/// Background consumer: logs each event as the notification/audit record.
pub async fn process_events(mut receiver: mpsc::Receiver<Event>) {
    info!("Event processor started");

    while let Some(event) = receiver.recv().await {
        match &event {
            Event::OrderCreated(order_id) => {
                info!(%order_id, "Order created");
            }
            Event::OrderCancelled(order_id) => {
                info!(%order_id, "Order cancelled, stock restored");
            }
            Event::OrderPaid(order_id) => {
                info!(%order_id, "Order paid");
            }
            Event::CheckoutCreated(checkout_id) => {
                info!(%checkout_id, "Checkout intent created");
            }
            Event::StkPushInitiated {
                checkout_id,
                simulated,
            } => {
                info!(%checkout_id, simulated, "STK push initiated");
            }
            Event::PaymentSucceeded {
                checkout_id,
                order_id,
                amount,
                receipt_number,
            } => {
                info!(
                    %checkout_id,
                    %order_id,
                    %amount,
                    receipt = receipt_number.as_deref().unwrap_or("-"),
                    "Payment confirmed"
                );
            }
            Event::PaymentFailed {
                checkout_id,
                result_code,
                description,
            } => {
                warn!(%checkout_id, result_code, description, "Payment failed");
            }
            Event::CartClearFailed { user_id, order_id } => {
                error!(%user_id, %order_id, "Cart clear failed after order commit");
            }
        }
    }

    info!("Event processor stopped");
}
