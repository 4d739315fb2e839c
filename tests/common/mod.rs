#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use academy_api::{
    auth::{Actor, AuthService, Role},
    config::AppConfig,
    db::{self, DbPool},
    entities::{
        cart, cart_item, class_program,
        coupon::{self, CouponScope, CouponTarget, CouponType, DiscountType},
        media_file, package,
        product::{self, ProductKind},
        profile, program_session,
        program_session::SessionStatus,
    },
    events::{self, EventSender},
    handlers::AppServices,
    services::{
        notifications::{NotificationError, NotificationSender},
        payment_gateway::{
            GatewayCode, GatewayError, PaymentGateway, PaymentRequest, RequestOutcome,
            VerifyOutcome,
        },
    },
    AppState,
};
use async_trait::async_trait;
use axum::Router;
use chrono::{Duration as ChronoDuration, NaiveDate, NaiveTime, Utc};
use sea_orm::{ActiveModelTrait, Set};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const JWT_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";

/// Gateway double whose answers are set per test
pub struct ScriptedGateway {
    pub request_code: Mutex<GatewayCode>,
    pub verify_code: Mutex<GatewayCode>,
    pub unreachable: AtomicBool,
    pub request_calls: AtomicUsize,
    pub verify_calls: AtomicUsize,
    pub requests: Mutex<Vec<PaymentRequest>>,
}

impl Default for ScriptedGateway {
    fn default() -> Self {
        Self {
            request_code: Mutex::new(GatewayCode::Success),
            verify_code: Mutex::new(GatewayCode::Success),
            unreachable: AtomicBool::new(false),
            request_calls: AtomicUsize::new(0),
            verify_calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedGateway {
    pub fn set_request_code(&self, code: GatewayCode) {
        *self.request_code.lock().unwrap() = code;
    }

    pub fn set_verify_code(&self, code: GatewayCode) {
        *self.verify_code.lock().unwrap() = code;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<PaymentRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn request_payment(&self, request: &PaymentRequest) -> Result<RequestOutcome, GatewayError> {
        let call = self.request_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(GatewayError::Timeout);
        }
        self.requests.lock().unwrap().push(request.clone());
        let code = *self.request_code.lock().unwrap();
        Ok(RequestOutcome {
            code,
            authority: code
                .is_success()
                .then(|| format!("A{:035}", call)),
            message: None,
        })
    }

    async fn verify_payment(&self, amount: i64, authority: &str) -> Result<VerifyOutcome, GatewayError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(GatewayError::Timeout);
        }
        let code = *self.verify_code.lock().unwrap();
        Ok(VerifyOutcome {
            code,
            reference_id: code.is_success().then(|| "201".to_string()),
            card_mask: code.is_success().then(|| "502229******5995".to_string()),
            fee: Some(0),
            fee_type: Some("Merchant".to_string()),
            raw: json!({ "data": { "code": code.as_i32(), "amount": amount, "authority": authority } }),
        })
    }

    fn redirect_url(&self, authority: &str) -> String {
        format!("https://pay.test/StartPay/{}", authority)
    }
}

/// Notifier that keeps every message in memory
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSender for RecordingNotifier {
    async fn send(&self, destination: &str, message: &str) -> Result<(), NotificationError> {
        self.sent
            .lock()
            .unwrap()
            .push((destination.to_string(), message.to_string()));
        Ok(())
    }
}

/// Services over a fresh in-memory database with scripted collaborators
pub struct TestContext {
    pub db: DbPool,
    pub config: AppConfig,
    pub services: AppServices,
    pub gateway: Arc<ScriptedGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub auth: Arc<AuthService>,
    pub events: EventSender,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: AppConfig) -> Self {
        let db = db::connect_in_memory()
            .await
            .expect("failed to create in-memory database");

        let (event_tx, event_rx) = mpsc::channel(256);
        let events = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = Arc::new(ScriptedGateway::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let services = AppServices::new(
            db.clone(),
            events.clone(),
            gateway.clone(),
            notifier.clone(),
            &config,
        );
        let auth = Arc::new(AuthService::new(JWT_SECRET, Duration::from_secs(3600)));

        Self {
            db,
            config,
            services,
            gateway,
            notifier,
            auth,
            events,
            _event_task: event_task,
        }
    }

    pub fn state(&self) -> AppState {
        AppState {
            db: self.db.clone(),
            config: self.config.clone(),
            event_sender: self.events.clone(),
            services: self.services.clone(),
            auth: self.auth.clone(),
        }
    }

    pub fn router(&self) -> Router {
        academy_api::app_router(self.state())
    }

    pub fn bearer(&self, actor: Actor) -> String {
        let token = self
            .auth
            .issue_token(actor.user_id, actor.role)
            .expect("token");
        format!("Bearer {}", token)
    }
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::new(
        "sqlite::memory:".to_string(),
        JWT_SECRET.to_string(),
        "test".to_string(),
    );
    config.checkout.callback_base_url = "http://localhost:8080/api/v1/checkout/callback".to_string();
    config.checkout.client_checkout_url = "http://localhost:3000/checkout/result".to_string();
    config
}

pub fn coach() -> Actor {
    Actor::new(Uuid::new_v4(), Role::Coach)
}

pub async fn seed_profile(db: &DbPool, user_id: Uuid, wallet_balance: i64, phone: Option<&str>) {
    profile::ActiveModel {
        user_id: Set(user_id),
        full_name: Set("Test Learner".to_string()),
        phone: Set(phone.map(str::to_string)),
        email: Set(Some("learner@example.com".to_string())),
        wallet_balance: Set(wallet_balance),
        updated_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("seed profile");
}

pub async fn seed_product(
    db: &DbPool,
    kind: ProductKind,
    price: i64,
    discount_price: Option<i64>,
) -> product::Model {
    let now = Utc::now();
    product::ActiveModel {
        id: Set(Uuid::new_v4()),
        title: Set(format!("{:?} product", kind)),
        kind: Set(kind),
        price: Set(price),
        discount_price: Set(discount_price),
        is_active: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("seed product")
}

pub async fn seed_cart(db: &DbPool, user_id: Uuid, items: &[(Uuid, i32)]) -> Uuid {
    let now = Utc::now();
    let cart = cart::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(user_id),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("seed cart");

    for (product_id, quantity) in items {
        cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            cart_id: Set(cart.id),
            product_id: Set(*product_id),
            quantity: Set(*quantity),
        }
        .insert(db)
        .await
        .expect("seed cart item");
    }
    cart.id
}

pub async fn seed_package(db: &DbPool, price: i64) -> Uuid {
    package::ActiveModel {
        id: Set(Uuid::new_v4()),
        title: Set("Workbook bundle".to_string()),
        price: Set(price),
        is_active: Set(true),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("seed package")
    .id
}

pub async fn seed_program(
    db: &DbPool,
    coach_id: Uuid,
    price: i64,
    capacity: i32,
) -> class_program::Model {
    let now = Utc::now();
    class_program::ActiveModel {
        id: Set(Uuid::new_v4()),
        title: Set("Evening cohort".to_string()),
        coach_id: Set(coach_id),
        price: Set(price),
        discount_price: Set(None),
        capacity: Set(capacity),
        member_count: Set(0),
        is_active: Set(true),
        registration_deadline: Set(Some(now + ChronoDuration::days(30))),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("seed program")
}

pub struct CouponSeed {
    pub code: &'static str,
    pub discount_type: DiscountType,
    pub discount_value: i64,
    pub max_uses: i32,
    pub current_uses: i32,
    pub min_purchase_amount: i64,
    pub scope: Vec<CouponTarget>,
}

impl CouponSeed {
    pub fn percentage(code: &'static str, value: i64) -> Self {
        Self {
            code,
            discount_type: DiscountType::Percentage,
            discount_value: value,
            max_uses: 100,
            current_uses: 0,
            min_purchase_amount: 0,
            scope: Vec::new(),
        }
    }

    pub fn fixed(code: &'static str, value: i64) -> Self {
        Self {
            discount_type: DiscountType::FixedAmount,
            ..Self::percentage(code, value)
        }
    }
}

pub async fn seed_coupon(db: &DbPool, seed: CouponSeed) -> coupon::Model {
    let now = Utc::now();
    coupon::ActiveModel {
        id: Set(Uuid::new_v4()),
        code: Set(seed.code.to_uppercase()),
        coupon_type: Set(CouponType::Discount),
        discount_type: Set(seed.discount_type),
        discount_value: Set(seed.discount_value),
        max_uses: Set(seed.max_uses),
        current_uses: Set(seed.current_uses),
        valid_from: Set(now - ChronoDuration::days(1)),
        valid_until: Set(now + ChronoDuration::days(30)),
        min_purchase_amount: Set(seed.min_purchase_amount),
        is_active: Set(true),
        scope: Set(CouponScope(seed.scope)),
        creator_id: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("seed coupon")
}

pub fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
}

pub fn jan_10() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 10).unwrap()
}

pub async fn seed_session(
    db: &DbPool,
    program: &class_program::Model,
    date: NaiveDate,
    start: NaiveTime,
    end: NaiveTime,
) -> program_session::Model {
    let now = Utc::now();
    program_session::ActiveModel {
        id: Set(Uuid::new_v4()),
        program_id: Set(program.id),
        coach_id: Set(program.coach_id),
        session_date: Set(date),
        start_time: Set(start),
        end_time: Set(end),
        status: Set(SessionStatus::Scheduled),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("seed session")
}

pub async fn seed_media(db: &DbPool, owner_id: Uuid, stored_path: &str, is_private: bool) -> Uuid {
    media_file::ActiveModel {
        id: Set(Uuid::new_v4()),
        owner_id: Set(owner_id),
        file_name: Set("lesson-1.txt".to_string()),
        stored_path: Set(stored_path.to_string()),
        mime_type: Set("text/plain".to_string()),
        is_private: Set(is_private),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("seed media")
    .id
}
