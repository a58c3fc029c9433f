use crate::entities::cart_item::{self, Entity as CartItem};
use crate::entities::order::{self, Entity as Order, OrderStatus, PaymentStatus};
use crate::entities::order_item::{self, Entity as OrderItem};
use crate::entities::product::{self, Entity as Product};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::stock::StockLedger;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Attempts at inserting an order before giving up on number collisions
const MAX_ORDER_NUMBER_ATTEMPTS: u32 = 3;

/// Builds immutable order snapshots out of carts, reserving stock as it goes.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    default_delivery_fee: Decimal,
}

/// Request to build an order from the caller's cart
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub user_id: Uuid,
    pub delivery_address: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemResponse {
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub id: Uuid,
    pub order_number: String,
    pub user_id: Uuid,
    pub status: String,
    pub payment_status: String,
    pub subtotal: Decimal,
    pub delivery_fee: Decimal,
    pub total_amount: Decimal,
    pub delivery_address: Option<String>,
    pub notes: Option<String>,
    pub items: Vec<OrderItemResponse>,
    pub created_at: DateTime<Utc>,
}

/// Priced line assembled from cart + catalog before anything is written
struct PricedLine {
    product_id: Uuid,
    product_name: String,
    quantity: i32,
    unit_price: Decimal,
    line_total: Decimal,
}

/// Sums line totals; pure so the arithmetic can be property-tested.
pub fn subtotal_of(lines: &[(Decimal, i32)]) -> Decimal {
    lines
        .iter()
        .map(|(unit_price, qty)| *unit_price * Decimal::from(*qty))
        .sum()
}

/// Human-readable order number: `OR` + millisecond tail + random suffix.
/// Probabilistically unique; the unique index plus a bounded retry absorbs
/// the rare collision.
pub fn generate_order_number() -> String {
    let tail = Utc::now().timestamp_millis() % 1_000_000;
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(char::from)
        .collect::<String>()
        .to_ascii_uppercase();
    format!("OR{:06}{}", tail, suffix)
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: EventSender,
        default_delivery_fee: Decimal,
    ) -> Self {
        Self {
            db,
            event_sender,
            default_delivery_fee,
        }
    }

    /// Builds an order from the user's cart.
    ///
    /// Stock reservation, order insert and item inserts share one
    /// transaction: either the whole cart becomes an order or nothing
    /// changes. The cart is cleared only after commit, and a clear failure
    /// never undoes the order.
    #[instrument(skip(self), fields(user_id = %request.user_id))]
    pub async fn create_from_cart(
        &self,
        request: CreateOrderRequest,
    ) -> Result<OrderResponse, ServiceError> {
        let cart_rows = CartItem::find()
            .filter(cart_item::Column::UserId.eq(request.user_id))
            .all(&*self.db)
            .await?;

        if cart_rows.is_empty() {
            return Err(ServiceError::ValidationError("Cart is empty".to_string()));
        }

        let lines = self.price_cart(&cart_rows).await?;

        let subtotal: Decimal = lines.iter().map(|l| l.line_total).sum();
        let delivery_fee = self.default_delivery_fee;
        let total_amount = subtotal + delivery_fee;

        // Unique-violation on the generated order number retries the whole
        // transaction with a fresh suffix; any other error is final.
        let mut attempt = 0;
        let (order_model, item_models) = loop {
            attempt += 1;
            match self
                .insert_order_txn(&request, &lines, subtotal, delivery_fee, total_amount)
                .await
            {
                Ok(created) => break created,
                Err(ServiceError::DatabaseError(db_err))
                    if ServiceError::is_unique_violation(&db_err)
                        && attempt < MAX_ORDER_NUMBER_ATTEMPTS =>
                {
                    warn!(attempt, "Order number collision, retrying with fresh suffix");
                    continue;
                }
                Err(e) => return Err(e),
            }
        };

        self.clear_cart_post_commit(request.user_id, order_model.id)
            .await;

        self.event_sender
            .send_or_log(Event::OrderCreated(order_model.id))
            .await;

        info!(order_id = %order_model.id, order_number = %order_model.order_number, "Order created");

        Ok(Self::model_to_response(order_model, item_models))
    }

    /// Resolves cart rows against the catalog and prices each line.
    async fn price_cart(&self, cart_rows: &[cart_item::Model]) -> Result<Vec<PricedLine>, ServiceError> {
        let product_ids: Vec<Uuid> = cart_rows.iter().map(|c| c.product_id).collect();
        let products = Product::find()
            .filter(product::Column::Id.is_in(product_ids))
            .all(&*self.db)
            .await?;

        let mut lines = Vec::with_capacity(cart_rows.len());
        for row in cart_rows {
            let product = products
                .iter()
                .find(|p| p.id == row.product_id)
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Product {} not found", row.product_id))
                })?;

            if !product.is_active {
                return Err(ServiceError::InvalidOperation(format!(
                    "Product {} is no longer available",
                    product.name
                )));
            }

            if row.quantity <= 0 {
                return Err(ServiceError::ValidationError(format!(
                    "Invalid quantity for {}",
                    product.name
                )));
            }

            // Pre-check gives a clean error message; the conditional UPDATE
            // in the transaction is what actually enforces the invariant.
            if product.stock_on_hand < row.quantity {
                return Err(ServiceError::InsufficientStock(product.name.clone()));
            }

            let unit_price = product.unit_price;
            lines.push(PricedLine {
                product_id: product.id,
                product_name: product.name.clone(),
                quantity: row.quantity,
                unit_price,
                line_total: unit_price * Decimal::from(row.quantity),
            });
        }

        Ok(lines)
    }

    /// One attempt: reserve stock, insert order + items, commit.
    async fn insert_order_txn(
        &self,
        request: &CreateOrderRequest,
        lines: &[PricedLine],
        subtotal: Decimal,
        delivery_fee: Decimal,
        total_amount: Decimal,
    ) -> Result<(order::Model, Vec<order_item::Model>), ServiceError> {
        let txn = self.db.begin().await.map_err(|e| {
            error!("Failed to begin transaction: {}", e);
            ServiceError::DatabaseError(e)
        })?;

        for line in lines {
            StockLedger::reserve(&txn, line.product_id, &line.product_name, line.quantity).await?;
        }

        let order_id = Uuid::new_v4();
        let order_model = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(generate_order_number()),
            user_id: Set(request.user_id),
            status: Set(OrderStatus::Placed.as_str().to_string()),
            payment_status: Set(PaymentStatus::Pending.as_str().to_string()),
            subtotal: Set(subtotal),
            delivery_fee: Set(delivery_fee),
            total_amount: Set(total_amount),
            delivery_address: Set(request.delivery_address.clone()),
            stock_released: Set(false),
            notes: Set(request.notes.clone()),
            version: Set(1),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        let mut item_models = Vec::with_capacity(lines.len());
        for line in lines {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(line.product_id),
                product_name: Set(line.product_name.clone()),
                quantity: Set(line.quantity),
                unit_price: Set(line.unit_price),
                line_total: Set(line.line_total),
                ..Default::default()
            }
            .insert(&txn)
            .await?;
            item_models.push(item);
        }

        txn.commit().await.map_err(|e| {
            error!("Failed to commit order transaction: {}", e);
            ServiceError::DatabaseError(e)
        })?;

        Ok((order_model, item_models))
    }

    /// Clears the cart after the order committed. Failures are logged and
    /// retried once in the background; the order stands either way.
    async fn clear_cart_post_commit(&self, user_id: Uuid, order_id: Uuid) {
        let result = CartItem::delete_many()
            .filter(cart_item::Column::UserId.eq(user_id))
            .exec(&*self.db)
            .await;

        if let Err(e) = result {
            error!(%user_id, %order_id, "Cart clear failed after commit: {}", e);
            self.event_sender
                .send_or_log(Event::CartClearFailed { user_id, order_id })
                .await;

            let db = Arc::clone(&self.db);
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                if let Err(e) = CartItem::delete_many()
                    .filter(cart_item::Column::UserId.eq(user_id))
                    .exec(&*db)
                    .await
                {
                    error!(%user_id, %order_id, "Cart clear retry failed: {}", e);
                }
            });
        }
    }

    /// Cancels an unpaid, non-terminal order and restores its stock exactly
    /// once.
    #[instrument(skip(self))]
    pub async fn cancel_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
    ) -> Result<OrderResponse, ServiceError> {
        let txn = self.db.begin().await?;

        let order_model = Order::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))?;

        if order_model.user_id != user_id {
            return Err(ServiceError::NotFound("Order not found".to_string()));
        }

        let status = OrderStatus::parse(&order_model.status).ok_or_else(|| {
            ServiceError::InternalError(format!("Unknown order status: {}", order_model.status))
        })?;

        if status.is_terminal() {
            return Err(ServiceError::InvalidOperation(format!(
                "Order is already {}",
                status.as_str()
            )));
        }

        if order_model.payment_status == PaymentStatus::Paid.as_str() {
            return Err(ServiceError::Conflict(
                "Paid orders cannot be cancelled".to_string(),
            ));
        }

        let items = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&txn)
            .await?;

        // stock_released makes restock idempotent across retried cancels
        if !order_model.stock_released {
            for item in &items {
                StockLedger::release(&txn, item.product_id, item.quantity).await?;
            }
        }

        let version = order_model.version;
        let mut active: order::ActiveModel = order_model.into();
        active.status = Set(OrderStatus::Cancelled.as_str().to_string());
        active.stock_released = Set(true);
        active.version = Set(version + 1);
        let updated = active.update(&txn).await?;

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::OrderCancelled(order_id))
            .await;

        info!(%order_id, "Order cancelled");

        Ok(Self::model_to_response(updated, items))
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderResponse, ServiceError> {
        let order_model = Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))?;

        let items = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?;

        Ok(Self::model_to_response(order_model, items))
    }

    /// Lists a user's orders, newest first.
    #[instrument(skip(self))]
    pub async fn list_orders_for_user(
        &self,
        user_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<OrderResponse>, u64), ServiceError> {
        let paginator = Order::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, per_page.clamp(1, 100));

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;

        let mut responses = Vec::with_capacity(orders.len());
        for order_model in orders {
            let items = OrderItem::find()
                .filter(order_item::Column::OrderId.eq(order_model.id))
                .all(&*self.db)
                .await?;
            responses.push(Self::model_to_response(order_model, items));
        }

        Ok((responses, total))
    }

    fn model_to_response(model: order::Model, items: Vec<order_item::Model>) -> OrderResponse {
        OrderResponse {
            id: model.id,
            order_number: model.order_number,
            user_id: model.user_id,
            status: model.status,
            payment_status: model.payment_status,
            subtotal: model.subtotal,
            delivery_fee: model.delivery_fee,
            total_amount: model.total_amount,
            delivery_address: model.delivery_address,
            notes: model.notes,
            items: items
                .into_iter()
                .map(|i| OrderItemResponse {
                    product_id: i.product_id,
                    product_name: i.product_name,
                    quantity: i.quantity,
                    unit_price: i.unit_price,
                    line_total: i.line_total,
                })
                .collect(),
            created_at: model.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn order_number_format() {
        let number = generate_order_number();
        assert!(number.starts_with("OR"));
        assert_eq!(number.len(), 12);
        assert!(number[2..8].chars().all(|c| c.is_ascii_digit()));
        assert!(number[8..].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn order_numbers_differ_across_calls() {
        let a: Vec<String> = (0..50).map(|_| generate_order_number()).collect();
        let unique: std::collections::HashSet<_> = a.iter().collect();
        // Random suffix should keep collisions out of a 50-draw sample
        assert!(unique.len() > 45);
    }

    #[test]
    fn subtotal_sums_lines() {
        let lines = vec![(dec!(100.50), 2), (dec!(49.50), 1)];
        assert_eq!(subtotal_of(&lines), dec!(250.50));
    }

    proptest! {
        #[test]
        fn subtotal_is_sum_of_line_totals(
            prices in proptest::collection::vec(0u64..1_000_000, 1..10),
            quantities in proptest::collection::vec(1i32..100, 10),
        ) {
            let lines: Vec<(Decimal, i32)> = prices
                .iter()
                .zip(quantities.iter())
                .map(|(p, q)| (Decimal::from(*p) / dec!(100), *q))
                .collect();

            let expected: Decimal = lines
                .iter()
                .map(|(p, q)| *p * Decimal::from(*q))
                .sum();

            prop_assert_eq!(subtotal_of(&lines), expected);
            prop_assert!(subtotal_of(&lines) >= Decimal::ZERO);
        }
    }
}
