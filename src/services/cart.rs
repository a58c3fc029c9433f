use crate::entities::cart_item::{self, Entity as CartItem};
use crate::entities::product::{self, Entity as Product};
use crate::errors::ServiceError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

/// Minimal cart store; exists to feed the order builder, which consumes and
/// clears it.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AddCartItemRequest {
    pub user_id: Uuid,
    pub product_id: Uuid,
    #[validate(range(min = 1, max = 100, message = "Quantity must be between 1 and 100"))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItemResponse {
    pub id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub unit_price: Decimal,
    pub quantity: i32,
    pub line_total: Decimal,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartResponse {
    pub user_id: Uuid,
    pub items: Vec<CartItemResponse>,
    pub subtotal: Decimal,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Adds a product to the cart, merging into the existing row when the
    /// user already carries that product.
    #[instrument(skip(self), fields(user_id = %request.user_id, product_id = %request.product_id))]
    pub async fn add_item(&self, request: AddCartItemRequest) -> Result<CartResponse, ServiceError> {
        request.validate()?;

        let product_model = Product::find_by_id(request.product_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Product not found".to_string()))?;

        if !product_model.is_active {
            return Err(ServiceError::InvalidOperation(format!(
                "Product {} is no longer available",
                product_model.name
            )));
        }

        let existing = CartItem::find()
            .filter(cart_item::Column::UserId.eq(request.user_id))
            .filter(cart_item::Column::ProductId.eq(request.product_id))
            .one(&*self.db)
            .await?;

        match existing {
            Some(row) => {
                let quantity = row.quantity;
                let mut active: cart_item::ActiveModel = row.into();
                active.quantity = Set(quantity + request.quantity);
                active.update(&*self.db).await?;
            }
            None => {
                cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    user_id: Set(request.user_id),
                    product_id: Set(request.product_id),
                    quantity: Set(request.quantity),
                    ..Default::default()
                }
                .insert(&*self.db)
                .await?;
            }
        }

        self.get_cart(request.user_id).await
    }

    /// Returns the cart with live catalog names and prices.
    #[instrument(skip(self))]
    pub async fn get_cart(&self, user_id: Uuid) -> Result<CartResponse, ServiceError> {
        let rows = CartItem::find()
            .filter(cart_item::Column::UserId.eq(user_id))
            .find_also_related(Product)
            .all(&*self.db)
            .await?;

        let mut items = Vec::with_capacity(rows.len());
        let mut subtotal = Decimal::ZERO;

        for (row, product_model) in rows {
            let product_model = product_model.ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", row.product_id))
            })?;
            let line_total = product_model.unit_price * Decimal::from(row.quantity);
            subtotal += line_total;
            items.push(CartItemResponse {
                id: row.id,
                product_id: row.product_id,
                product_name: product_model.name,
                unit_price: product_model.unit_price,
                quantity: row.quantity,
                line_total,
                updated_at: row.updated_at,
            });
        }

        Ok(CartResponse {
            user_id,
            items,
            subtotal,
        })
    }

    /// Empties the user's cart.
    #[instrument(skip(self))]
    pub async fn clear_cart(&self, user_id: Uuid) -> Result<u64, ServiceError> {
        let result = CartItem::delete_many()
            .filter(cart_item::Column::UserId.eq(user_id))
            .exec(&*self.db)
            .await?;

        info!(%user_id, removed = result.rows_affected, "Cart cleared");
        Ok(result.rows_affected)
    }
}
