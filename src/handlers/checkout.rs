use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use reqwest::Url;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    errors::ServiceError,
    handlers::common::{created_response, validate_input},
    services::{
        checkout::{CallbackParams, CheckoutRequest, CheckoutSession, ConfirmedCheckout},
        pricing::{CheckoutTarget, PriceSummary},
    },
    ApiResponse, ApiResult, AppState,
};

/// Outcome label handed to the client result page
fn payment_label(result: &Result<ConfirmedCheckout, ServiceError>) -> &'static str {
    match result {
        Ok(_) => "paid",
        Err(ServiceError::AlreadyVerified(_)) => "already_verified",
        Err(_) => "failed",
    }
}

fn result_url(base: &str, order_id: Uuid, payment: &str, reason: Option<&str>) -> Result<Url, ServiceError> {
    let mut url = Url::parse(base)
        .map_err(|e| ServiceError::InternalError(format!("invalid client checkout url: {}", e)))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("order_id", &order_id.to_string());
        query.append_pair("payment", payment);
        if let Some(reason) = reason {
            query.append_pair("reason", reason);
        }
    }
    Ok(url)
}

/// Price a cart checkout without creating an order
#[utoipa::path(
    post,
    path = "/api/v1/checkout/cart/{cart_id}/quote",
    params(("cart_id" = Uuid, Path, description = "Cart to price")),
    request_body = CheckoutRequest,
    responses(
        (status = 200, description = "Price breakdown, including rejected coupons"),
        (status = 400, description = "Empty cart or invalid input", body = crate::errors::ErrorResponse),
        (status = 403, description = "Cart belongs to someone else", body = crate::errors::ErrorResponse),
        (status = 404, description = "Cart not found", body = crate::errors::ErrorResponse),
    ),
    tag = "Checkout",
    security(("Bearer" = []))
)]
pub async fn quote_cart(
    State(state): State<AppState>,
    Path(cart_id): Path<Uuid>,
    auth_user: AuthUser,
    Json(request): Json<CheckoutRequest>,
) -> ApiResult<PriceSummary> {
    validate_input(&request)?;
    let summary = state
        .services
        .checkout
        .quote(&auth_user.actor(), CheckoutTarget::Cart(cart_id), &request)
        .await?;
    Ok(Json(ApiResponse::success(summary)))
}

/// Price a program registration without creating an order
#[utoipa::path(
    post,
    path = "/api/v1/checkout/program/{program_id}/quote",
    params(("program_id" = Uuid, Path, description = "Program to price")),
    request_body = CheckoutRequest,
    responses(
        (status = 200, description = "Price breakdown, including rejected coupons"),
        (status = 400, description = "Registration closed or invalid input", body = crate::errors::ErrorResponse),
        (status = 404, description = "Program not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Program full or already a member", body = crate::errors::ErrorResponse),
    ),
    tag = "Checkout",
    security(("Bearer" = []))
)]
pub async fn quote_program(
    State(state): State<AppState>,
    Path(program_id): Path<Uuid>,
    auth_user: AuthUser,
    Json(request): Json<CheckoutRequest>,
) -> ApiResult<PriceSummary> {
    validate_input(&request)?;
    let summary = state
        .services
        .checkout
        .quote(&auth_user.actor(), CheckoutTarget::Program(program_id), &request)
        .await?;
    Ok(Json(ApiResponse::success(summary)))
}

/// Create an order for a cart and open a payment session
#[utoipa::path(
    post,
    path = "/api/v1/checkout/cart/{cart_id}",
    params(("cart_id" = Uuid, Path, description = "Cart to check out")),
    request_body = CheckoutRequest,
    responses(
        (status = 201, description = "Order created; redirect the payer to redirect_url"),
        (status = 400, description = "Invalid coupon, empty cart or amount below the gateway minimum", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway refused or was unreachable; the order can be retried", body = crate::errors::ErrorResponse),
    ),
    tag = "Checkout",
    security(("Bearer" = []))
)]
pub async fn start_cart_checkout(
    State(state): State<AppState>,
    Path(cart_id): Path<Uuid>,
    auth_user: AuthUser,
    Json(request): Json<CheckoutRequest>,
) -> Result<Response, ServiceError> {
    validate_input(&request)?;
    let session: CheckoutSession = state
        .services
        .checkout
        .start_checkout(&auth_user.actor(), CheckoutTarget::Cart(cart_id), &request)
        .await?;
    Ok(created_response(session))
}

/// Create an order for a program seat and open a payment session
#[utoipa::path(
    post,
    path = "/api/v1/checkout/program/{program_id}",
    params(("program_id" = Uuid, Path, description = "Program to register for")),
    request_body = CheckoutRequest,
    responses(
        (status = 201, description = "Order created; redirect the payer to redirect_url"),
        (status = 400, description = "Invalid coupon or registration closed", body = crate::errors::ErrorResponse),
        (status = 409, description = "Program full or already a member", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway refused or was unreachable; the order can be retried", body = crate::errors::ErrorResponse),
    ),
    tag = "Checkout",
    security(("Bearer" = []))
)]
pub async fn start_program_checkout(
    State(state): State<AppState>,
    Path(program_id): Path<Uuid>,
    auth_user: AuthUser,
    Json(request): Json<CheckoutRequest>,
) -> Result<Response, ServiceError> {
    validate_input(&request)?;
    let session = state
        .services
        .checkout
        .start_checkout(
            &auth_user.actor(),
            CheckoutTarget::Program(program_id),
            &request,
        )
        .await?;
    Ok(created_response(session))
}

/// Open a new payment session for an unpaid order
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/retry-payment",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 201, description = "New transaction linked; redirect the payer to redirect_url"),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order cancelled or already paid", body = crate::errors::ErrorResponse),
    ),
    tag = "Checkout",
    security(("Bearer" = []))
)]
pub async fn retry_payment(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    auth_user: AuthUser,
) -> Result<Response, ServiceError> {
    let session = state
        .services
        .checkout
        .retry_checkout(&auth_user.actor(), order_id)
        .await?;
    Ok(created_response(session))
}

/// Gateway return URL. The payer's browser lands here, so every outcome redirects to
/// the client result page instead of rendering an error body.
#[utoipa::path(
    get,
    path = "/api/v1/checkout/callback/{order_id}",
    params(
        ("order_id" = Uuid, Path, description = "Order the payment belongs to"),
        ("Authority" = Option<String>, Query, description = "Gateway session token"),
        ("Status" = Option<String>, Query, description = "OK when the payer completed the payment"),
    ),
    responses((status = 303, description = "Redirect to the client result page")),
    tag = "Checkout"
)]
pub async fn payment_callback(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Query(params): Query<CallbackParams>,
) -> Result<Response, ServiceError> {
    let result = state
        .services
        .checkout
        .confirm_checkout(order_id, &params)
        .await;

    let payment = payment_label(&result);
    let reason = match &result {
        Ok(confirmed) => {
            info!(%order_id, commit_complete = confirmed.commit.is_complete(), "checkout confirmed");
            None
        }
        Err(ServiceError::AlreadyVerified(_)) => None,
        Err(e) => {
            warn!(%order_id, error = %e, "checkout callback did not confirm the payment");
            Some(e.code())
        }
    };

    let url = result_url(
        &state.config.checkout.client_checkout_url,
        order_id,
        payment,
        reason,
    )?;
    Ok(Redirect::to(url.as_str()).into_response())
}
