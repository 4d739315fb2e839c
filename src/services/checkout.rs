//! Checkout orchestration: order creation, payment request, callback verification and the
//! post-payment commit.
//!
//! An order moves `pending/unpaid -> (gateway) -> paid/confirmed`; a failed or abandoned
//! payment leaves it unpaid and retryable. Every post-payment side effect is guarded so a
//! repeated callback or an admin re-commit applies it at most once.

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use rand::{distributions::Alphanumeric, Rng};
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::Actor,
    config::CheckoutConfig,
    db::is_unique_violation,
    entities::{
        class_program::{self, Entity as ClassProgram, Model as ClassProgramModel},
        enrollment::{self, EnrollmentTarget},
        order::{self, Entity as Order, Model as OrderModel, OrderKind, OrderStatus, PaymentStatus},
        order_coupon::{self, Entity as OrderCoupon},
        order_item::{self, Entity as OrderItem, ItemKind},
        profile::{self, Entity as Profile},
        program_member::{self, Entity as ProgramMember},
        transaction::{self, Entity as Transaction, Model as TransactionModel},
    },
    errors::ServiceError,
    events::{CommitStep, Event, EventSender},
    services::{
        coupons::CouponService,
        notifications::{self, NotificationSender},
        payment_gateway::{GatewayCode, PaymentGateway, PaymentRequest},
        pricing::{CheckoutTarget, PriceDriftReport, PriceSummary, PricedTarget, PricingOptions, PricingService},
    },
};

const REFERENCE_SUFFIX_LEN: usize = 10;
const CALLBACK_STATUS_OK: &str = "OK";
const PAYMENT_METHOD_GATEWAY: &str = "online_gateway";

/// Coupons, add-ons and wallet choice for a checkout
#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CheckoutRequest {
    #[serde(default)]
    #[validate(length(max = 5))]
    pub coupon_codes: Vec<String>,
    #[serde(default)]
    #[validate(length(max = 10))]
    pub add_on_ids: Vec<Uuid>,
    #[serde(default)]
    pub use_wallet: bool,
}

impl CheckoutRequest {
    fn pricing_options(&self) -> PricingOptions {
        PricingOptions {
            coupon_codes: self.coupon_codes.clone(),
            add_on_ids: self.add_on_ids.clone(),
            use_wallet: self.use_wallet,
        }
    }
}

/// Parameters the gateway appends to the callback URL
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    #[serde(rename = "Authority")]
    pub authority: Option<String>,
    #[serde(rename = "Status")]
    pub status: Option<String>,
}

/// Result of starting or retrying a checkout
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutSession {
    pub order: OrderModel,
    pub transaction: TransactionModel,
    pub redirect_url: String,
}

/// How one post-payment side effect went
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum StepOutcome {
    Applied,
    AlreadyApplied,
    NotApplicable,
    Failed(String),
}

impl StepOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CouponCommit {
    pub coupon_id: Uuid,
    pub code: String,
    pub outcome: StepOutcome,
}

/// Per-step outcome of the post-payment commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    pub roster: StepOutcome,
    pub enrollment: StepOutcome,
    pub wallet: StepOutcome,
    pub coupons: Vec<CouponCommit>,
}

impl CommitReport {
    pub fn is_complete(&self) -> bool {
        !(self.roster.is_failed()
            || self.enrollment.is_failed()
            || self.wallet.is_failed()
            || self.coupons.iter().any(|c| c.outcome.is_failed()))
    }
}

/// Verified payment plus what the commit managed to apply
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmedCheckout {
    pub order: OrderModel,
    pub transaction: TransactionModel,
    pub commit: CommitReport,
}

fn generate_reference(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REFERENCE_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, suffix.to_uppercase())
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Checks a program can still take `user_id`
pub fn ensure_purchasable(
    program: &ClassProgramModel,
    already_member: bool,
) -> Result<(), ServiceError> {
    if !program.is_active {
        return Err(ServiceError::BadRequest(format!(
            "program {} is not open for registration",
            program.id
        )));
    }
    if program.registration_closed(Utc::now()) {
        return Err(ServiceError::BadRequest(format!(
            "registration for program {} has closed",
            program.id
        )));
    }
    if program.is_full() {
        return Err(ServiceError::Conflict(format!("program {} is full", program.id)));
    }
    if already_member {
        return Err(ServiceError::Conflict(format!(
            "already enrolled in program {}",
            program.id
        )));
    }
    Ok(())
}

/// Order/Checkout orchestrator
#[derive(Clone)]
pub struct CheckoutService {
    db: DatabaseConnection,
    pricing: PricingService,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn NotificationSender>,
    events: EventSender,
    config: CheckoutConfig,
    payment_description: String,
}

impl CheckoutService {
    pub fn new(
        db: DatabaseConnection,
        pricing: PricingService,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn NotificationSender>,
        events: EventSender,
        config: CheckoutConfig,
        payment_description: String,
    ) -> Self {
        Self {
            db,
            pricing,
            gateway,
            notifier,
            events,
            config,
            payment_description,
        }
    }

    async fn purchasable_program(
        &self,
        program_id: Uuid,
        user_id: Uuid,
    ) -> Result<ClassProgramModel, ServiceError> {
        let program = ClassProgram::find_by_id(program_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("program {}", program_id)))?;
        let already_member = ProgramMember::find_by_id((program_id, user_id))
            .one(&self.db)
            .await?
            .is_some();
        ensure_purchasable(&program, already_member)?;
        Ok(program)
    }

    async fn price(
        &self,
        actor: &Actor,
        target: CheckoutTarget,
        request: &CheckoutRequest,
    ) -> Result<PricedTarget, ServiceError> {
        request.validate()?;
        let options = request.pricing_options();
        match target {
            CheckoutTarget::Cart(cart_id) => {
                self.pricing.price_cart(cart_id, actor.user_id, &options).await
            }
            CheckoutTarget::Program(program_id) => {
                let program = self.purchasable_program(program_id, actor.user_id).await?;
                self.pricing
                    .price_program(&program, actor.user_id, &options)
                    .await
            }
        }
    }

    /// Prices a checkout without writing anything or touching coupon counters
    #[instrument(skip(self, actor, request), fields(user_id = %actor.user_id))]
    pub async fn quote(
        &self,
        actor: &Actor,
        target: CheckoutTarget,
        request: &CheckoutRequest,
    ) -> Result<PriceSummary, ServiceError> {
        Ok(self.price(actor, target, request).await?.summary)
    }

    /// Creates the order and opens a gateway payment session for it
    #[instrument(skip(self, actor, request), fields(user_id = %actor.user_id))]
    pub async fn start_checkout(
        &self,
        actor: &Actor,
        target: CheckoutTarget,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, ServiceError> {
        let priced = self.price(actor, target, request).await?;
        let summary = &priced.summary;

        if let Some(rejected) = summary.invalid_coupons.first() {
            return Err(ServiceError::InvalidCoupon {
                code: rejected.code.clone(),
                reason: rejected.reason,
            });
        }
        if summary.payable_amount < self.config.min_payable_amount {
            return Err(ServiceError::BadRequest(format!(
                "payable amount {} is below the minimum of {}",
                summary.payable_amount, self.config.min_payable_amount
            )));
        }

        let order = self.create_order(actor.user_id, &priced).await?;
        counter!("academy.checkout.started", 1);
        info!(order_id = %order.id, reference = %order.reference, payable = order.payable_amount, "order created");
        self.events
            .send_or_log(Event::CheckoutStarted {
                order_id: order.id,
                user_id: order.user_id,
                payable_amount: order.payable_amount,
            });

        self.request_and_link(order).await
    }

    /// Inserts order, captured lines and coupons; retries the reference on collision
    async fn create_order(
        &self,
        user_id: Uuid,
        priced: &PricedTarget,
    ) -> Result<OrderModel, ServiceError> {
        let summary = &priced.summary;
        let attempts = self.config.reference_attempts.max(1);

        for attempt in 1..=attempts {
            let txn = self.db.begin().await?;
            let now = Utc::now();
            let order = order::ActiveModel {
                id: Set(Uuid::new_v4()),
                reference: Set(generate_reference(&self.config.reference_prefix)),
                user_id: Set(user_id),
                kind: Set(priced.target.order_kind()),
                target_id: Set(priced.target.id()),
                original_amount: Set(summary.original_amount),
                discount_amount: Set(summary.total_discount),
                tax_amount: Set(summary.tax_amount),
                shipping_amount: Set(summary.shipping_amount),
                add_on_amount: Set(summary.add_on_total),
                final_amount: Set(summary.final_amount),
                wallet_applied: Set(summary.wallet_applied),
                wallet_debited: Set(false),
                payable_amount: Set(summary.payable_amount),
                status: Set(OrderStatus::Pending),
                payment_status: Set(PaymentStatus::Unpaid),
                payment_method: Set(PAYMENT_METHOD_GATEWAY.to_string()),
                transaction_id: Set(None),
                is_deleted: Set(false),
                deleted_at: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
            };

            let order = match order.insert(&txn).await {
                Ok(order) => order,
                Err(e) if is_unique_violation(&e) => {
                    warn!(attempt, "order reference collision, regenerating");
                    txn.rollback().await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let lines = summary.line_items.iter().map(|line| order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                item_id: Set(line.item_id),
                kind: Set(line.kind),
                title: Set(line.title.clone()),
                unit_price: Set(line.unit_price),
                quantity: Set(line.quantity),
                line_total: Set(line.line_total()),
            });
            let add_ons = summary.add_ons.iter().map(|add_on| order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                item_id: Set(add_on.package_id),
                kind: Set(ItemKind::Package),
                title: Set(add_on.title.clone()),
                unit_price: Set(add_on.price),
                quantity: Set(1),
                line_total: Set(add_on.price),
            });
            let items: Vec<order_item::ActiveModel> = lines.chain(add_ons).collect();
            if !items.is_empty() {
                OrderItem::insert_many(items).exec_without_returning(&txn).await?;
            }

            if !summary.valid_coupons.is_empty() {
                let coupons = summary
                    .valid_coupons
                    .iter()
                    .map(|coupon| order_coupon::ActiveModel {
                        order_id: Set(order.id),
                        coupon_id: Set(coupon.coupon_id),
                        code: Set(coupon.code.clone()),
                        discount_amount: Set(coupon.discount_amount),
                        consumed: Set(false),
                        consumed_at: Set(None),
                    });
                OrderCoupon::insert_many(coupons)
                    .exec_without_returning(&txn)
                    .await?;
            }

            txn.commit().await?;
            return Ok(order);
        }

        Err(ServiceError::Conflict(
            "could not allocate a unique order reference".to_string(),
        ))
    }

    /// Opens a payment session for the order's stored amount and links a new transaction
    async fn request_and_link(&self, order: OrderModel) -> Result<CheckoutSession, ServiceError> {
        let contact = Profile::find_by_id(order.user_id).one(&self.db).await?;
        let request = PaymentRequest {
            amount: order.payable_amount,
            callback_url: format!(
                "{}/{}",
                self.config.callback_base_url.trim_end_matches('/'),
                order.id
            ),
            description: format!("{} {}", self.payment_description, order.reference),
            mobile: contact.as_ref().and_then(|p| p.phone.clone()),
            email: contact.as_ref().and_then(|p| p.email.clone()),
            order_reference: order.reference.clone(),
        };

        let outcome = self.gateway.request_payment(&request).await.map_err(|e| {
            warn!(order_id = %order.id, error = %e, "payment request failed");
            ServiceError::from(e)
        })?;
        let authority = match (outcome.code.is_success(), outcome.authority) {
            (true, Some(authority)) => authority,
            (_, _) => {
                warn!(order_id = %order.id, code = outcome.code.as_i32(), "gateway refused payment request");
                return Err(ServiceError::PaymentGatewayError(format!(
                    "payment request refused ({}): {}",
                    outcome.code.as_i32(),
                    outcome.code.reason()
                )));
            }
        };

        let (order, transaction) = self
            .persist_transaction(&order, &authority)
            .await
            .map_err(|e| {
                error!(order_id = %order.id, error = %e, "transaction could not be saved");
                ServiceError::TransactionPersistError(e.to_string())
            })?;

        self.events
            .send_or_log(Event::PaymentRequested {
                order_id: order.id,
                transaction_id: transaction.id,
                authority: authority.clone(),
            });

        Ok(CheckoutSession {
            redirect_url: self.gateway.redirect_url(&authority),
            order,
            transaction,
        })
    }

    async fn persist_transaction(
        &self,
        order: &OrderModel,
        authority: &str,
    ) -> Result<(OrderModel, TransactionModel), ServiceError> {
        let txn = self.db.begin().await?;
        let now = Utc::now();
        let transaction = transaction::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            user_id: Set(order.user_id),
            amount: Set(order.payable_amount),
            tax_amount: Set(order.tax_amount),
            authority: Set(authority.to_string()),
            is_verified: Set(false),
            reference_id: Set(None),
            card_mask: Set(None),
            provider_payload: Set(None),
            created_at: Set(now),
            verified_at: Set(None),
        }
        .insert(&txn)
        .await?;

        let mut active: order::ActiveModel = order.clone().into();
        active.transaction_id = Set(Some(transaction.id));
        active.updated_at = Set(now);
        let order = active.update(&txn).await?;
        txn.commit().await?;
        Ok((order, transaction))
    }

    /// Handles the gateway callback for `order_id`
    #[instrument(skip(self, params))]
    pub async fn confirm_checkout(
        &self,
        order_id: Uuid,
        params: &CallbackParams,
    ) -> Result<ConfirmedCheckout, ServiceError> {
        let (Some(authority), Some(status)) = (non_empty(&params.authority), non_empty(&params.status))
        else {
            return Err(ServiceError::BadRequest(
                "callback is missing Authority or Status".to_string(),
            ));
        };

        let order = Order::find_by_id(order_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_id)))?;
        let transaction_id = order
            .transaction_id
            .ok_or_else(|| ServiceError::NotFound(format!("transaction for order {}", order_id)))?;
        let transaction = Transaction::find_by_id(transaction_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("transaction {}", transaction_id)))?;

        if transaction.authority != authority {
            return Err(ServiceError::BadRequest(
                "authority does not belong to the order's current payment".to_string(),
            ));
        }
        if transaction.amount != order.payable_amount {
            error!(
                %order_id,
                order_amount = order.payable_amount,
                transaction_amount = transaction.amount,
                "order and transaction amounts disagree"
            );
            return Err(ServiceError::AmountMismatch {
                order_id,
                order_amount: order.payable_amount,
                transaction_amount: transaction.amount,
            });
        }
        if transaction.is_verified || order.payment_status == PaymentStatus::Paid {
            info!(%order_id, "callback repeated for a verified payment");
            return Err(ServiceError::AlreadyVerified(order_id));
        }
        if !status.eq_ignore_ascii_case(CALLBACK_STATUS_OK) {
            return Err(self
                .rejected(order_id, GatewayCode::PaymentFailed, "payer did not complete the payment")
                .await);
        }

        let outcome = self
            .gateway
            .verify_payment(transaction.amount, &transaction.authority)
            .await?;
        match outcome.code {
            GatewayCode::Success => {}
            // captured earlier but never recorded locally
            GatewayCode::AlreadyVerified => {
                warn!(%order_id, "gateway already verified an unrecorded payment, finalizing");
            }
            code => return Err(self.rejected(order_id, code, code.reason()).await),
        }

        let reference_id = outcome.reference_id.clone().unwrap_or_default();
        let now = Utc::now();
        let txn = self.db.begin().await?;
        let flipped = Transaction::update_many()
            .col_expr(transaction::Column::IsVerified, Expr::value(true))
            .col_expr(transaction::Column::ReferenceId, Expr::value(outcome.reference_id.clone()))
            .col_expr(transaction::Column::CardMask, Expr::value(outcome.card_mask.clone()))
            .col_expr(transaction::Column::ProviderPayload, Expr::value(outcome.raw.clone()))
            .col_expr(transaction::Column::VerifiedAt, Expr::value(now))
            .filter(transaction::Column::Id.eq(transaction.id))
            .filter(transaction::Column::IsVerified.eq(false))
            .exec(&txn)
            .await?;
        if flipped.rows_affected == 0 {
            txn.rollback().await?;
            return Err(ServiceError::AlreadyVerified(order_id));
        }
        Order::update_many()
            .col_expr(order::Column::PaymentStatus, Expr::value(PaymentStatus::Paid))
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Confirmed))
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::PaymentStatus.eq(PaymentStatus::Unpaid))
            .exec(&txn)
            .await?;
        txn.commit().await?;

        counter!("academy.checkout.confirmed", 1);
        info!(%order_id, %reference_id, "payment verified");
        self.events
            .send_or_log(Event::PaymentVerified {
                order_id,
                transaction_id: transaction.id,
                reference_id: reference_id.clone(),
            });

        let order = self.load_order(order_id).await?;
        let transaction = Transaction::find_by_id(transaction.id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("transaction {}", transaction.id)))?;
        let commit = self.run_commit(&order).await?;
        self.notify_paid(&order, &reference_id).await;

        Ok(ConfirmedCheckout {
            order,
            transaction,
            commit,
        })
    }

    async fn rejected(&self, order_id: Uuid, code: GatewayCode, reason: &str) -> ServiceError {
        counter!("academy.checkout.rejected", 1);
        warn!(%order_id, code = code.as_i32(), reason, "payment rejected");
        self.events
            .send_or_log(Event::PaymentRejected {
                order_id,
                code: code.as_i32(),
            });
        ServiceError::PaymentRejected {
            code: code.as_i32(),
            reason: reason.to_string(),
        }
    }

    async fn load_order(&self, order_id: Uuid) -> Result<OrderModel, ServiceError> {
        Order::find_by_id(order_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_id)))
    }

    async fn notify_paid(&self, order: &OrderModel, reference_id: &str) {
        let phone = match Profile::find_by_id(order.user_id).one(&self.db).await {
            Ok(profile) => profile.and_then(|p| p.phone),
            Err(e) => {
                warn!(order_id = %order.id, error = %e, "could not load profile for notification");
                None
            }
        };
        if let Some(phone) = phone {
            let message = format!(
                "Payment for order {} received. Tracking code: {}",
                order.reference, reference_id
            );
            notifications::dispatch(self.notifier.clone(), phone, message);
        }
    }

    /// Re-opens payment for an unpaid order with a fresh transaction
    #[instrument(skip(self, actor), fields(user_id = %actor.user_id))]
    pub async fn retry_checkout(
        &self,
        actor: &Actor,
        order_id: Uuid,
    ) -> Result<CheckoutSession, ServiceError> {
        let order = self.load_order(order_id).await?;
        if !actor.can_access(order.user_id) || order.is_deleted {
            return Err(ServiceError::NotFound(format!("order {}", order_id)));
        }
        if order.status == OrderStatus::Cancelled {
            return Err(ServiceError::Conflict(format!("order {} is cancelled", order_id)));
        }
        if order.payment_status != PaymentStatus::Unpaid {
            return Err(ServiceError::Conflict(format!(
                "order {} is already {:?}",
                order_id, order.payment_status
            )));
        }

        info!(%order_id, previous_transaction = ?order.transaction_id, "retrying payment");
        self.request_and_link(order).await
    }

    /// Re-runs the post-payment commit for a paid order (admin recovery)
    #[instrument(skip(self, actor))]
    pub async fn recommit_order(
        &self,
        actor: &Actor,
        order_id: Uuid,
    ) -> Result<CommitReport, ServiceError> {
        if !actor.is_admin() {
            return Err(ServiceError::Forbidden(
                "only admins can re-run the order commit".to_string(),
            ));
        }
        let order = self.load_order(order_id).await?;
        if order.payment_status != PaymentStatus::Paid {
            return Err(ServiceError::Conflict(format!(
                "order {} has not been paid",
                order_id
            )));
        }
        self.run_commit(&order).await
    }

    /// Compares the order's captured prices with the catalog
    pub async fn inspect_price_drift(
        &self,
        actor: &Actor,
        order_id: Uuid,
    ) -> Result<PriceDriftReport, ServiceError> {
        let order = self.load_order(order_id).await?;
        if !actor.can_access(order.user_id) {
            return Err(ServiceError::NotFound(format!("order {}", order_id)));
        }
        self.pricing.inspect_price_drift(order_id).await
    }

    /// Roster, enrollment, wallet, then coupons. Each step is guarded and a failure does
    /// not stop the later ones.
    async fn run_commit(&self, order: &OrderModel) -> Result<CommitReport, ServiceError> {
        let roster = match order.kind {
            OrderKind::CourseSession => self
                .step(order.id, CommitStep::Roster, self.commit_roster(order))
                .await,
            OrderKind::Shop => StepOutcome::NotApplicable,
        };
        let enrollment = self
            .step(order.id, CommitStep::Enrollment, self.commit_enrollments(order))
            .await;
        let wallet = self
            .step(order.id, CommitStep::Wallet, self.commit_wallet(order))
            .await;

        let pending = OrderCoupon::find()
            .filter(order_coupon::Column::OrderId.eq(order.id))
            .all(&self.db)
            .await?;
        let mut coupons = Vec::with_capacity(pending.len());
        for coupon in pending {
            let outcome = if coupon.consumed {
                StepOutcome::AlreadyApplied
            } else {
                self.step(
                    order.id,
                    CommitStep::Coupon,
                    self.commit_coupon(order.id, coupon.coupon_id),
                )
                .await
            };
            coupons.push(CouponCommit {
                coupon_id: coupon.coupon_id,
                code: coupon.code,
                outcome,
            });
        }

        let report = CommitReport {
            roster,
            enrollment,
            wallet,
            coupons,
        };
        if report.is_complete() {
            info!(order_id = %order.id, "order commit complete");
        } else {
            error!(order_id = %order.id, ?report, "order commit incomplete, re-commit required");
        }
        Ok(report)
    }

    async fn step<F>(&self, order_id: Uuid, step: CommitStep, fut: F) -> StepOutcome
    where
        F: std::future::Future<Output = Result<StepOutcome, ServiceError>>,
    {
        match fut.await {
            Ok(StepOutcome::Failed(reason)) | Err(ServiceError::Conflict(reason)) => {
                self.step_failed(order_id, step, reason).await
            }
            Ok(outcome) => outcome,
            Err(e) => self.step_failed(order_id, step, e.to_string()).await,
        }
    }

    async fn step_failed(&self, order_id: Uuid, step: CommitStep, reason: String) -> StepOutcome {
        counter!("academy.checkout.commit_step_failed", 1);
        error!(%order_id, ?step, reason = %reason, "post-payment step failed");
        self.events
            .send_or_log(Event::CommitStepFailed {
                order_id,
                step,
                reason: reason.clone(),
            });
        StepOutcome::Failed(reason)
    }

    /// Adds the buyer to the program roster unless already there, within capacity
    async fn commit_roster(&self, order: &OrderModel) -> Result<StepOutcome, ServiceError> {
        let txn = self.db.begin().await?;
        let inserted = ProgramMember::insert(program_member::ActiveModel {
            program_id: Set(order.target_id),
            user_id: Set(order.user_id),
            order_id: Set(order.id),
            joined_at: Set(Utc::now()),
        })
        .on_conflict(
            OnConflict::columns([program_member::Column::ProgramId, program_member::Column::UserId])
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(&txn)
        .await?;

        if inserted == 0 {
            txn.rollback().await?;
            return Ok(StepOutcome::AlreadyApplied);
        }

        if !Self::claim_seat(&txn, order.target_id).await? {
            txn.rollback().await?;
            return Ok(StepOutcome::Failed(format!(
                "program {} is at capacity",
                order.target_id
            )));
        }
        txn.commit().await?;

        self.events
            .send_or_log(Event::MemberEnrolled {
                program_id: order.target_id,
                user_id: order.user_id,
            });
        Ok(StepOutcome::Applied)
    }

    async fn claim_seat(txn: &DatabaseTransaction, program_id: Uuid) -> Result<bool, ServiceError> {
        let result = ClassProgram::update_many()
            .col_expr(
                class_program::Column::MemberCount,
                Expr::col(class_program::Column::MemberCount).add(1),
            )
            .filter(class_program::Column::Id.eq(program_id))
            .filter(
                Expr::col(class_program::Column::MemberCount)
                    .lt(Expr::col(class_program::Column::Capacity)),
            )
            .exec(txn)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Grants access to the program, or to every course bought in a shop order
    async fn commit_enrollments(&self, order: &OrderModel) -> Result<StepOutcome, ServiceError> {
        let targets: Vec<(Uuid, EnrollmentTarget)> = match order.kind {
            OrderKind::CourseSession => vec![(order.target_id, EnrollmentTarget::Program)],
            OrderKind::Shop => OrderItem::find()
                .filter(order_item::Column::OrderId.eq(order.id))
                .filter(order_item::Column::Kind.eq(ItemKind::Course))
                .all(&self.db)
                .await?
                .into_iter()
                .map(|item| (item.item_id, EnrollmentTarget::Course))
                .collect(),
        };
        if targets.is_empty() {
            return Ok(StepOutcome::NotApplicable);
        }

        let now = Utc::now();
        let mut inserted = 0;
        for (target_id, target_type) in targets {
            inserted += enrollment::Entity::insert(enrollment::ActiveModel {
                user_id: Set(order.user_id),
                target_id: Set(target_id),
                target_type: Set(target_type),
                order_id: Set(order.id),
                enrolled_at: Set(now),
            })
            .on_conflict(
                OnConflict::columns([enrollment::Column::UserId, enrollment::Column::TargetId])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        }

        Ok(if inserted > 0 {
            StepOutcome::Applied
        } else {
            StepOutcome::AlreadyApplied
        })
    }

    /// Takes the wallet offset from the profile once
    async fn commit_wallet(&self, order: &OrderModel) -> Result<StepOutcome, ServiceError> {
        if order.wallet_applied <= 0 {
            return Ok(StepOutcome::NotApplicable);
        }

        let txn = self.db.begin().await?;
        let marked = Order::update_many()
            .col_expr(order::Column::WalletDebited, Expr::value(true))
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::WalletDebited.eq(false))
            .exec(&txn)
            .await?;
        if marked.rows_affected == 0 {
            txn.rollback().await?;
            return Ok(StepOutcome::AlreadyApplied);
        }

        let debited = Profile::update_many()
            .col_expr(
                profile::Column::WalletBalance,
                Expr::col(profile::Column::WalletBalance).sub(order.wallet_applied),
            )
            .col_expr(profile::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(profile::Column::UserId.eq(order.user_id))
            .filter(profile::Column::WalletBalance.gte(order.wallet_applied))
            .exec(&txn)
            .await?;
        if debited.rows_affected == 0 {
            txn.rollback().await?;
            return Ok(StepOutcome::Failed(format!(
                "wallet balance no longer covers {}",
                order.wallet_applied
            )));
        }
        txn.commit().await?;
        Ok(StepOutcome::Applied)
    }

    /// Marks the order coupon consumed and charges the coupon's use counter together
    async fn commit_coupon(&self, order_id: Uuid, coupon_id: Uuid) -> Result<StepOutcome, ServiceError> {
        let txn = self.db.begin().await?;
        let marked = OrderCoupon::update_many()
            .col_expr(order_coupon::Column::Consumed, Expr::value(true))
            .col_expr(order_coupon::Column::ConsumedAt, Expr::value(Some(Utc::now())))
            .filter(order_coupon::Column::OrderId.eq(order_id))
            .filter(order_coupon::Column::CouponId.eq(coupon_id))
            .filter(order_coupon::Column::Consumed.eq(false))
            .exec(&txn)
            .await?;
        if marked.rows_affected == 0 {
            txn.rollback().await?;
            return Ok(StepOutcome::AlreadyApplied);
        }

        if !CouponService::commit_use(&txn, coupon_id).await? {
            txn.rollback().await?;
            return Ok(StepOutcome::Failed(format!(
                "coupon {} has no uses left",
                coupon_id
            )));
        }
        txn.commit().await?;

        self.events
            .send_or_log(Event::CouponConsumed { coupon_id, order_id });
        Ok(StepOutcome::Applied)
    }
}
