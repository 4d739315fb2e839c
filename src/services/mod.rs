// Checkout core
pub mod checkout;
pub mod coupons;
pub mod orders;
pub mod pricing;

// Scheduling
pub mod scheduling;

// External collaborators
pub mod media;
pub mod notifications;
pub mod payment_gateway;
