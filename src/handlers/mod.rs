pub mod carts;
pub mod checkout;
pub mod common;
pub mod mpesa;
pub mod orders;

use crate::services::cart::CartService;
use crate::services::checkout::CheckoutService;
use crate::services::mpesa::reconciliation::ReconciliationService;
use crate::services::mpesa::MpesaService;
use crate::services::orders::OrderService;

/// Service instances shared across handlers
#[derive(Clone)]
pub struct AppServices {
    pub orders: OrderService,
    pub cart: CartService,
    pub checkout: CheckoutService,
    pub mpesa: MpesaService,
    pub reconciliation: ReconciliationService,
}
