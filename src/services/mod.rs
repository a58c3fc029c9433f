pub mod cart;
pub mod checkout;
pub mod mpesa;
pub mod orders;
pub mod stock;
