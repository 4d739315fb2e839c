use axum::{
    extract::{Path, Query, State},
    Json,
};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    entities::order::Model as OrderModel,
    handlers::common::{paginated, validate_input},
    services::{
        checkout::CommitReport, orders::OrderDetails, orders::OrderFilter,
        pricing::PriceDriftReport,
    },
    ApiResponse, ApiResult, AppState, PaginatedResponse,
};

/// List orders
#[utoipa::path(
    get,
    path = "/api/v1/orders",
    summary = "List orders",
    description = "Paginated orders. Users see their own; admins may filter by user and include deleted orders.",
    params(
        ("user_id" = Option<Uuid>, Query, description = "Admins only"),
        ("status" = Option<String>, Query, description = "pending, confirmed or cancelled"),
        ("payment_status" = Option<String>, Query, description = "unpaid, paid or refunded"),
        ("kind" = Option<String>, Query, description = "shop or course_session"),
        ("created_from" = Option<String>, Query, description = "RFC 3339 lower bound"),
        ("created_to" = Option<String>, Query, description = "RFC 3339 upper bound"),
        ("include_deleted" = Option<bool>, Query, description = "Admins only"),
        ("page" = Option<u64>, Query, description = "Page number (default: 1)"),
        ("limit" = Option<u64>, Query, description = "Items per page (default: 20, max: 100)"),
    ),
    responses(
        (status = 200, description = "Orders retrieved successfully"),
        (status = 400, description = "Unknown or invalid filter", body = crate::errors::ErrorResponse),
        (status = 403, description = "Filter restricted to admins", body = crate::errors::ErrorResponse),
    ),
    tag = "Orders",
    security(("Bearer" = []))
)]
pub async fn list_orders(
    State(state): State<AppState>,
    Query(filter): Query<OrderFilter>,
    auth_user: AuthUser,
) -> ApiResult<PaginatedResponse<OrderModel>> {
    validate_input(&filter)?;
    let (orders, total) = state
        .services
        .orders
        .list_orders(&auth_user.actor(), &filter)
        .await?;
    Ok(Json(ApiResponse::success(paginated(
        orders,
        total,
        filter.page(),
        filter.limit(),
    ))))
}

/// Get an order with its lines, coupons and payment attempts
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order found"),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    tag = "Orders",
    security(("Bearer" = []))
)]
pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    auth_user: AuthUser,
) -> ApiResult<OrderDetails> {
    let details = state
        .services
        .orders
        .get_order(&auth_user.actor(), id)
        .await?;
    Ok(Json(ApiResponse::success(details)))
}

/// Cancel a pending, unpaid order
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/cancel",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order cancelled"),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order already paid or cancelled", body = crate::errors::ErrorResponse),
    ),
    tag = "Orders",
    security(("Bearer" = []))
)]
pub async fn cancel_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    auth_user: AuthUser,
) -> ApiResult<OrderModel> {
    let order = state
        .services
        .orders
        .cancel_order(&auth_user.actor(), id)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

/// Soft-delete an order (admin)
#[utoipa::path(
    delete,
    path = "/api/v1/orders/{id}",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order flagged deleted"),
        (status = 403, description = "Admins only", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    tag = "Orders",
    security(("Bearer" = []))
)]
pub async fn delete_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    auth_user: AuthUser,
) -> ApiResult<OrderModel> {
    let order = state
        .services
        .orders
        .soft_delete_order(&auth_user.actor(), id)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

/// Compare the prices captured on the order with the current catalog
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}/price-drift",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Per-line comparison", body = PriceDriftReport),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    tag = "Orders",
    security(("Bearer" = []))
)]
pub async fn price_drift(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    auth_user: AuthUser,
) -> ApiResult<PriceDriftReport> {
    let report = state
        .services
        .checkout
        .inspect_price_drift(&auth_user.actor(), id)
        .await?;
    Ok(Json(ApiResponse::success(report)))
}

/// Re-run the post-payment commit for a paid order (admin)
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/recommit",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Per-step commit outcome"),
        (status = 403, description = "Admins only", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order not paid", body = crate::errors::ErrorResponse),
    ),
    tag = "Orders",
    security(("Bearer" = []))
)]
pub async fn recommit_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    auth_user: AuthUser,
) -> ApiResult<CommitReport> {
    let report = state
        .services
        .checkout
        .recommit_order(&auth_user.actor(), id)
        .await?;
    Ok(Json(ApiResponse::success(report)))
}
