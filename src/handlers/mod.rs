pub mod checkout;
pub mod common;
pub mod coupons;
pub mod media;
pub mod orders;
pub mod programs;

use std::sync::Arc;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    services::{
        checkout::CheckoutService, coupons::CouponService, media::MediaService,
        notifications::NotificationSender, orders::OrderService, payment_gateway::PaymentGateway,
        pricing::PricingService, scheduling::SchedulingService,
    },
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub coupons: Arc<CouponService>,
    pub pricing: Arc<PricingService>,
    pub checkout: Arc<CheckoutService>,
    pub orders: Arc<OrderService>,
    pub scheduling: Arc<SchedulingService>,
    pub media: Arc<MediaService>,
}

impl AppServices {
    /// Wires every service over one pool; the gateway and notifier are injected so tests can
    /// script them.
    pub fn new(
        db: DbPool,
        event_sender: EventSender,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn NotificationSender>,
        config: &AppConfig,
    ) -> Self {
        let coupons = CouponService::new(db.clone());
        let pricing = PricingService::new(db.clone(), coupons.clone(), config.checkout.clone());
        let checkout = CheckoutService::new(
            db.clone(),
            pricing.clone(),
            gateway,
            notifier,
            event_sender.clone(),
            config.checkout.clone(),
            config.gateway.description.clone(),
        );

        Self {
            coupons: Arc::new(coupons),
            pricing: Arc::new(pricing),
            checkout: Arc::new(checkout),
            orders: Arc::new(OrderService::new(db.clone(), event_sender.clone())),
            scheduling: Arc::new(SchedulingService::new(db.clone(), event_sender)),
            media: Arc::new(MediaService::new(db, config.media_dir.clone())),
        }
    }
}
