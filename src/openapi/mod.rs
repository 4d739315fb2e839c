use axum::{routing::get, Json, Router};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Academy API",
        version = "1.0.0",
        description = r#"
# Academy Checkout API

Checkout, coupons and scheduling for a learning platform that sells courses, physical
products and cohort-based class programs.

## Authentication

Every endpoint except the payment callback and health checks needs a bearer token:

```
Authorization: Bearer <your-jwt-token>
```

## Money

All amounts are integers in the smallest currency unit.

## Errors

Failures share one body shape; `code` is stable and machine-readable:

```json
{
  "error": "Bad Request",
  "message": "Invalid coupon SPRING: coupon expired or not yet valid",
  "code": "coupon_inactive",
  "request_id": "req-abc123xyz",
  "timestamp": "2025-01-10T10:30:00Z"
}
```
        "#,
    ),
    servers(
        (url = "http://localhost:8080/api/v1", description = "Local development")
    ),
    tags(
        (name = "Checkout", description = "Quotes, order creation and payment callbacks"),
        (name = "Orders", description = "Order queries and administration"),
        (name = "Coupons", description = "Coupon and referral code management"),
        (name = "Scheduling", description = "Program sessions and coach availability"),
        (name = "Media", description = "Private course media")
    ),
    paths(
        // Checkout
        crate::handlers::checkout::quote_cart,
        crate::handlers::checkout::quote_program,
        crate::handlers::checkout::start_cart_checkout,
        crate::handlers::checkout::start_program_checkout,
        crate::handlers::checkout::retry_payment,
        crate::handlers::checkout::payment_callback,

        // Orders
        crate::handlers::orders::list_orders,
        crate::handlers::orders::get_order,
        crate::handlers::orders::cancel_order,
        crate::handlers::orders::delete_order,
        crate::handlers::orders::price_drift,
        crate::handlers::orders::recommit_order,

        // Coupons
        crate::handlers::coupons::create_coupon,
        crate::handlers::coupons::create_referral_coupon,
        crate::handlers::coupons::validate_coupon,

        // Scheduling
        crate::handlers::programs::coach_availability,
        crate::handlers::programs::add_session,
        crate::handlers::programs::update_session,
        crate::handlers::programs::update_session_status,

        // Media
        crate::handlers::media::download_media,
    ),
    components(
        schemas(
            crate::services::checkout::CheckoutRequest,
            crate::services::coupons::NewCoupon,
            crate::services::coupons::NewReferralCoupon,
            crate::services::coupons::AppliedCoupon,
            crate::handlers::coupons::ValidateCouponRequest,
            crate::services::scheduling::SessionSlot,
            crate::handlers::programs::Availability,
            crate::handlers::programs::SessionStatusRequest,
            crate::services::pricing::PriceDriftReport,
            crate::services::pricing::LineDrift,
            crate::entities::coupon::CouponTarget,
            crate::entities::order::OrderStatus,
            crate::entities::order::PaymentStatus,
            crate::entities::order::OrderKind,
            crate::entities::program_session::SessionStatus,
            crate::errors::ErrorResponse
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDocV1;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "Bearer",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

/// Serves the generated document at `/api-docs/openapi.json`
pub fn openapi_routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route(
        "/api-docs/openapi.json",
        get(|| async { Json(ApiDocV1::openapi()) }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_checkout_paths() {
        let json = serde_json::to_string(&ApiDocV1::openapi()).unwrap();
        assert!(json.contains("Academy API"));
        assert!(json.contains("/api/v1/checkout/callback/{order_id}"));
        assert!(json.contains("/api/v1/orders/{id}/recommit"));
        assert!(json.contains("Bearer"));
    }
}
