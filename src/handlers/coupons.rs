use axum::{extract::State, response::Response, Json};
use serde::Deserialize;
use utoipa::ToSchema;
use validator::Validate;

use crate::{
    auth::AuthUser,
    entities::coupon::CouponTarget,
    errors::ServiceError,
    handlers::common::{created_response, validate_input},
    services::coupons::{AppliedCoupon, NewCoupon, NewReferralCoupon},
    ApiResponse, ApiResult, AppState,
};

/// Single code checked against a prospective purchase
#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct ValidateCouponRequest {
    #[validate(length(min = 1, max = 32))]
    pub code: String,
    #[validate(range(min = 0))]
    pub amount: i64,
    /// Products or programs in the purchase; with none, only universal coupons apply
    #[serde(default)]
    pub targets: Vec<CouponTarget>,
}

/// Create a coupon (admin)
#[utoipa::path(
    post,
    path = "/api/v1/coupons",
    request_body = NewCoupon,
    responses(
        (status = 201, description = "Coupon created"),
        (status = 400, description = "Invalid coupon definition", body = crate::errors::ErrorResponse),
        (status = 403, description = "Admins only", body = crate::errors::ErrorResponse),
        (status = 409, description = "Code already exists", body = crate::errors::ErrorResponse),
    ),
    tag = "Coupons",
    security(("Bearer" = []))
)]
pub async fn create_coupon(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(payload): Json<NewCoupon>,
) -> Result<Response, ServiceError> {
    validate_input(&payload)?;
    let coupon = state
        .services
        .coupons
        .create_coupon(&auth_user.actor(), payload)
        .await?;
    Ok(created_response(coupon))
}

/// Issue a referral code
#[utoipa::path(
    post,
    path = "/api/v1/coupons/referral",
    request_body = NewReferralCoupon,
    responses(
        (status = 201, description = "Referral coupon created"),
        (status = 403, description = "Issuing for another user requires admin", body = crate::errors::ErrorResponse),
    ),
    tag = "Coupons",
    security(("Bearer" = []))
)]
pub async fn create_referral_coupon(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(payload): Json<NewReferralCoupon>,
) -> Result<Response, ServiceError> {
    validate_input(&payload)?;
    let coupon = state
        .services
        .coupons
        .create_referral_coupon(&auth_user.actor(), payload)
        .await?;
    Ok(created_response(coupon))
}

/// Check a code without consuming it
#[utoipa::path(
    post,
    path = "/api/v1/coupons/validate",
    request_body = ValidateCouponRequest,
    responses(
        (status = 200, description = "Coupon applies", body = AppliedCoupon),
        (status = 400, description = "Coupon rejected; `code` names the reason", body = crate::errors::ErrorResponse),
    ),
    tag = "Coupons",
    security(("Bearer" = []))
)]
pub async fn validate_coupon(
    State(state): State<AppState>,
    _auth_user: AuthUser,
    Json(payload): Json<ValidateCouponRequest>,
) -> ApiResult<AppliedCoupon> {
    validate_input(&payload)?;
    let applied = state
        .services
        .coupons
        .validate(&payload.code, payload.amount, &payload.targets)
        .await?;
    Ok(Json(ApiResponse::success(applied)))
}
