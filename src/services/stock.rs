use crate::entities::product::{self, Entity as Product};
use crate::errors::ServiceError;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use tracing::{debug, warn};
use uuid::Uuid;

/// Stock ledger: all stock movement goes through the conditional updates
/// below so `stock_on_hand` can never go negative, regardless of how many
/// orders race on the same product.
///
/// The functions are generic over `ConnectionTrait` so they compose into the
/// order transaction as well as run standalone.
pub struct StockLedger;

impl StockLedger {
    /// Atomically reserves `quantity` units of a product.
    ///
    /// Issued as a single `UPDATE … SET stock = stock - q WHERE id = ? AND
    /// stock >= q`; zero rows affected means another request drained the
    /// stock first.
    pub async fn reserve<C: ConnectionTrait>(
        db: &C,
        product_id: Uuid,
        product_name: &str,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::InvalidInput(
                "Quantity must be positive".to_string(),
            ));
        }

        let result = Product::update_many()
            .col_expr(
                product::Column::StockOnHand,
                Expr::col(product::Column::StockOnHand).sub(quantity),
            )
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::StockOnHand.gte(quantity))
            .exec(db)
            .await?;

        if result.rows_affected == 0 {
            warn!(%product_id, quantity, "Stock reservation failed: insufficient stock");
            return Err(ServiceError::InsufficientStock(product_name.to_string()));
        }

        debug!(%product_id, quantity, "Stock reserved");
        Ok(())
    }

    /// Returns `quantity` units to a product. Unconditional add-back; callers
    /// are responsible for the exactly-once guard (`orders.stock_released`).
    pub async fn release<C: ConnectionTrait>(
        db: &C,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::InvalidInput(
                "Quantity must be positive".to_string(),
            ));
        }

        Product::update_many()
            .col_expr(
                product::Column::StockOnHand,
                Expr::col(product::Column::StockOnHand).add(quantity),
            )
            .filter(product::Column::Id.eq(product_id))
            .exec(db)
            .await?;

        debug!(%product_id, quantity, "Stock released");
        Ok(())
    }
}
