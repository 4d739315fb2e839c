mod common;

use academy_api::{
    auth::Actor,
    entities::order::{Entity as Order, PaymentStatus},
};
use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use common::{coach, seed_program, TestContext};
use sea_orm::EntityTrait;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post_json(uri: &str, bearer: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::AUTHORIZATION, bearer)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_with(uri: &str, bearer: &str) -> Request<Body> {
    Request::get(uri)
        .header(header::AUTHORIZATION, bearer)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn health_reports_database_status() {
    let ctx = TestContext::new().await;
    let app = ctx.router();

    let (status, body) = send(
        &app,
        Request::get("/api/v1/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["checks"]["database"], "healthy");
}

#[tokio::test]
async fn protected_routes_require_a_bearer_token() {
    let ctx = TestContext::new().await;
    let app = ctx.router();

    let (status, _) = send(&app, Request::get("/api/v1/orders").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, get_with("/api/v1/orders", "Bearer not-a-token")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn order_list_rejects_unknown_filters() {
    let ctx = TestContext::new().await;
    let app = ctx.router();
    let bearer = ctx.bearer(Actor::user(Uuid::new_v4()));

    let (status, body) = send(&app, get_with("/api/v1/orders?page=1&limit=10", &bearer)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total"], 0);

    let (status, _) = send(&app, get_with("/api/v1/orders?sort=amount", &bearer)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, get_with("/api/v1/orders?limit=500", &bearer)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_error");
}

#[tokio::test]
async fn program_checkout_round_trip_through_the_callback() {
    let ctx = TestContext::new().await;
    let app = ctx.router();
    let user = Actor::user(Uuid::new_v4());
    let bearer = ctx.bearer(user);
    let program = seed_program(&ctx.db, coach().user_id, 200_000, 10).await;

    let (status, quote) = send(
        &app,
        post_json(
            &format!("/api/v1/checkout/program/{}/quote", program.id),
            &bearer,
            json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(quote["data"]["final_amount"], 210_000);

    let (status, started) = send(
        &app,
        post_json(
            &format!("/api/v1/checkout/program/{}", program.id),
            &bearer,
            json!({ "use_wallet": false }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let order_id = started["data"]["order"]["id"].as_str().unwrap().to_string();
    let authority = started["data"]["transaction"]["authority"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(started["data"]["redirect_url"]
        .as_str()
        .unwrap()
        .ends_with(&authority));

    let callback = format!(
        "/api/v1/checkout/callback/{}?Authority={}&Status=OK",
        order_id, authority
    );
    let response = app
        .clone()
        .oneshot(Request::get(&callback).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let location = response.headers()[header::LOCATION].to_str().unwrap();
    assert!(location.starts_with(&ctx.config.checkout.client_checkout_url));
    assert!(location.contains("payment=paid"));
    assert!(location.contains(&order_id));

    let order = Order::find_by_id(order_id.parse::<Uuid>().unwrap())
        .one(&ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.payment_status, PaymentStatus::Paid);

    // the payer refreshing the result page lands on the same outcome
    let response = app
        .clone()
        .oneshot(Request::get(&callback).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let location = response.headers()[header::LOCATION].to_str().unwrap();
    assert!(location.contains("payment=already_verified"));

    let (status, details) = send(&app, get_with(&format!("/api/v1/orders/{}", order_id), &bearer)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(details["data"]["transactions"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn failed_callback_redirects_with_a_reason() {
    let ctx = TestContext::new().await;
    let app = ctx.router();

    let response = app
        .clone()
        .oneshot(
            Request::get(&format!(
                "/api/v1/checkout/callback/{}?Authority=A1&Status=NOK",
                Uuid::new_v4()
            ))
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let location = response.headers()[header::LOCATION].to_str().unwrap();
    assert!(location.contains("payment=failed"));
    assert!(location.contains("reason=not_found"));
}

#[tokio::test]
async fn coupon_admin_routes_enforce_roles() {
    let ctx = TestContext::new().await;
    let app = ctx.router();
    let coupon = json!({
        "code": "launch",
        "coupon_type": "discount",
        "discount_type": "percentage",
        "discount_value": 20,
        "max_uses": 50,
        "valid_from": "2025-01-01T00:00:00Z",
        "valid_until": "2099-01-01T00:00:00Z",
        "min_purchase_amount": 0
    });

    let (status, _) = send(
        &app,
        post_json("/api/v1/coupons", &ctx.bearer(Actor::user(Uuid::new_v4())), coupon.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let admin = ctx.bearer(Actor::admin(Uuid::new_v4()));
    let (status, created) = send(&app, post_json("/api/v1/coupons", &admin, coupon)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["data"]["code"], "LAUNCH");

    let (status, applied) = send(
        &app,
        post_json(
            "/api/v1/coupons/validate",
            &admin,
            json!({ "code": "Launch", "amount": 100_000 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(applied["data"]["discount_amount"], 20_000);
}

#[tokio::test]
async fn openapi_document_is_served() {
    let ctx = TestContext::new().await;
    let (status, doc) = send(
        &ctx.router(),
        Request::get("/api-docs/openapi.json").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(doc["paths"]["/api/v1/checkout/callback/{order_id}"].is_object());
}
