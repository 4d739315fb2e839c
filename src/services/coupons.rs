use crate::{
    auth::Actor,
    db::is_unique_violation,
    entities::coupon::{
        self, ActiveModel as CouponActiveModel, CouponScope, CouponTarget, CouponType,
        DiscountType, Entity as Coupon, Model as CouponModel,
    },
    errors::ServiceError,
};
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use rand::{distributions::Alphanumeric, Rng};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

const REFERRAL_PREFIX: &str = "REF-";
const REFERRAL_SUFFIX_LEN: usize = 8;
const REFERRAL_ATTEMPTS: u32 = 5;

/// Why an otherwise well-formed coupon cannot be used right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InactiveReason {
    Disabled,
    NotStarted,
    Expired,
    UsageExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum CouponRejection {
    #[error("coupon does not exist")]
    NotFound,
    #[error("coupon is not active ({0:?})")]
    Inactive(InactiveReason),
    #[error("order amount is below the coupon minimum of {minimum}")]
    BelowMinimum { minimum: i64 },
    #[error("coupon does not apply to this purchase")]
    NotApplicable,
    #[error("coupon was given more than once")]
    Duplicate,
}

impl CouponRejection {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "coupon_not_found",
            Self::Inactive(InactiveReason::UsageExhausted) => "coupon_usage_exhausted",
            Self::Inactive(_) => "coupon_inactive",
            Self::BelowMinimum { .. } => "coupon_below_minimum",
            Self::NotApplicable => "coupon_not_applicable",
            Self::Duplicate => "coupon_duplicate",
        }
    }
}

/// A coupon that passed validation, with the discount it yields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AppliedCoupon {
    pub coupon_id: Uuid,
    pub code: String,
    pub discount_amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedCoupon {
    pub code: String,
    pub reason: CouponRejection,
}

/// Outcome of evaluating several codes against one amount
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponApplication {
    pub valid: Vec<AppliedCoupon>,
    pub invalid: Vec<RejectedCoupon>,
    pub total_discount: i64,
}

/// Coupon creation input
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct NewCoupon {
    #[validate(length(min = 3, max = 32))]
    pub code: String,
    pub coupon_type: CouponType,
    pub discount_type: DiscountType,
    #[validate(range(min = 1))]
    pub discount_value: i64,
    #[validate(range(min = 1))]
    pub max_uses: i32,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    #[serde(default)]
    #[validate(range(min = 0))]
    pub min_purchase_amount: i64,
    #[serde(default)]
    pub scope: Vec<CouponTarget>,
    /// Required for referral coupons
    #[serde(default)]
    pub creator_id: Option<Uuid>,
}

/// Terms for an auto-generated referral code
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct NewReferralCoupon {
    /// Defaults to the caller; only admins may issue for someone else
    #[serde(default)]
    pub creator_id: Option<Uuid>,
    pub discount_type: DiscountType,
    #[validate(range(min = 1))]
    pub discount_value: i64,
    #[validate(range(min = 1, max = 10000))]
    pub max_uses: i32,
    #[validate(range(min = 1, max = 365))]
    pub valid_days: i64,
}

/// Uppercase, trimmed form every code is stored and looked up under
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Checks activity window, usage cap, minimum purchase and scope, in that order.
pub fn check_eligibility(
    coupon: &CouponModel,
    amount: i64,
    targets: &[CouponTarget],
    now: DateTime<Utc>,
) -> Result<(), CouponRejection> {
    if !coupon.is_active {
        return Err(CouponRejection::Inactive(InactiveReason::Disabled));
    }
    if now < coupon.valid_from {
        return Err(CouponRejection::Inactive(InactiveReason::NotStarted));
    }
    if now > coupon.valid_until {
        return Err(CouponRejection::Inactive(InactiveReason::Expired));
    }
    if coupon.current_uses >= coupon.max_uses {
        return Err(CouponRejection::Inactive(InactiveReason::UsageExhausted));
    }
    if amount < coupon.min_purchase_amount {
        return Err(CouponRejection::BelowMinimum {
            minimum: coupon.min_purchase_amount,
        });
    }
    if !coupon.scope.covers_any(targets) {
        return Err(CouponRejection::NotApplicable);
    }
    Ok(())
}

/// Discount for `amount`, never negative and never above `amount`
pub fn compute_discount(discount_type: DiscountType, value: i64, amount: i64) -> i64 {
    if amount <= 0 || value <= 0 {
        return 0;
    }
    let raw = match discount_type {
        DiscountType::Percentage => {
            let percent = Decimal::from(value.min(100));
            (Decimal::from(amount) * percent / Decimal::from(100))
                .trunc()
                .to_i64()
                .unwrap_or(0)
        }
        DiscountType::FixedAmount => value,
    };
    raw.clamp(0, amount)
}

fn generate_referral_code() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REFERRAL_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{}{}", REFERRAL_PREFIX, suffix.to_uppercase())
}

/// Coupon lookup, validation, creation and use accounting
#[derive(Clone)]
pub struct CouponService {
    db: DatabaseConnection,
}

impl CouponService {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn find_by_code(&self, code: &str) -> Result<Option<CouponModel>, ServiceError> {
        Ok(Coupon::find()
            .filter(coupon::Column::Code.eq(normalize_code(code)))
            .one(&self.db)
            .await?)
    }

    async fn evaluate(
        &self,
        code: &str,
        amount: i64,
        targets: &[CouponTarget],
        now: DateTime<Utc>,
    ) -> Result<Result<AppliedCoupon, CouponRejection>, ServiceError> {
        let Some(coupon) = self.find_by_code(code).await? else {
            return Ok(Err(CouponRejection::NotFound));
        };
        if let Err(reason) = check_eligibility(&coupon, amount, targets, now) {
            return Ok(Err(reason));
        }
        Ok(Ok(AppliedCoupon {
            coupon_id: coupon.id,
            code: coupon.code.clone(),
            discount_amount: compute_discount(coupon.discount_type, coupon.discount_value, amount),
        }))
    }

    /// Validates a single code. Read-only: the use counter is not touched.
    #[instrument(skip(self, targets))]
    pub async fn validate(
        &self,
        code: &str,
        amount: i64,
        targets: &[CouponTarget],
    ) -> Result<AppliedCoupon, ServiceError> {
        self.evaluate(code, amount, targets, Utc::now())
            .await?
            .map_err(|reason| {
                debug!(%reason, "coupon rejected");
                ServiceError::InvalidCoupon {
                    code: normalize_code(code),
                    reason,
                }
            })
    }

    /// Evaluates every code against the same original amount and sums the discounts.
    ///
    /// Discounts are additive: two 10% coupons on 1000 give 200, not 190. The sum never
    /// exceeds `amount`. A code given twice counts once.
    #[instrument(skip(self, codes, targets), fields(codes = codes.len()))]
    pub async fn apply_multiple(
        &self,
        codes: &[String],
        amount: i64,
        targets: &[CouponTarget],
    ) -> Result<CouponApplication, ServiceError> {
        let now = Utc::now();
        let mut seen = HashSet::new();
        let mut application = CouponApplication::default();

        for raw in codes {
            let code = normalize_code(raw);
            if !seen.insert(code.clone()) {
                application.invalid.push(RejectedCoupon {
                    code,
                    reason: CouponRejection::Duplicate,
                });
                continue;
            }
            match self.evaluate(&code, amount, targets, now).await? {
                Ok(applied) => {
                    application.total_discount += applied.discount_amount;
                    application.valid.push(applied);
                }
                Err(reason) => application.invalid.push(RejectedCoupon { code, reason }),
            }
        }

        application.total_discount = application.total_discount.min(amount.max(0));
        Ok(application)
    }

    /// Charges one use against the coupon if it still has one left.
    ///
    /// Returns `false` without writing when the cap is already reached.
    pub async fn commit_use<C: ConnectionTrait>(
        conn: &C,
        coupon_id: Uuid,
    ) -> Result<bool, ServiceError> {
        let result = Coupon::update_many()
            .col_expr(
                coupon::Column::CurrentUses,
                Expr::col(coupon::Column::CurrentUses).add(1),
            )
            .col_expr(coupon::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(coupon::Column::Id.eq(coupon_id))
            .filter(Expr::col(coupon::Column::CurrentUses).lt(Expr::col(coupon::Column::MaxUses)))
            .exec(conn)
            .await?;

        if result.rows_affected == 1 {
            counter!("academy.coupons.uses_committed", 1);
            Ok(true)
        } else {
            warn!(%coupon_id, "coupon use not committed, cap reached or coupon missing");
            Ok(false)
        }
    }

    #[instrument(skip(self, input), fields(code = %input.code))]
    pub async fn create_coupon(
        &self,
        actor: &Actor,
        input: NewCoupon,
    ) -> Result<CouponModel, ServiceError> {
        if !actor.is_admin() {
            return Err(ServiceError::Forbidden(
                "only admins can create coupons".to_string(),
            ));
        }
        input.validate()?;
        if input.valid_from > input.valid_until {
            return Err(ServiceError::ValidationError(
                "valid_from must not be after valid_until".to_string(),
            ));
        }
        if input.discount_type == DiscountType::Percentage && input.discount_value > 100 {
            return Err(ServiceError::ValidationError(
                "percentage discount cannot exceed 100".to_string(),
            ));
        }
        if input.coupon_type == CouponType::Referral && input.creator_id.is_none() {
            return Err(ServiceError::ValidationError(
                "referral coupons require a creator".to_string(),
            ));
        }
        let code = normalize_code(&input.code);
        if !code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ServiceError::ValidationError(
                "code may only contain letters, digits, '-' and '_'".to_string(),
            ));
        }

        let now = Utc::now();
        let model = CouponActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.clone()),
            coupon_type: Set(input.coupon_type),
            discount_type: Set(input.discount_type),
            discount_value: Set(input.discount_value),
            max_uses: Set(input.max_uses),
            current_uses: Set(0),
            valid_from: Set(input.valid_from),
            valid_until: Set(input.valid_until),
            min_purchase_amount: Set(input.min_purchase_amount),
            is_active: Set(true),
            scope: Set(CouponScope(input.scope)),
            creator_id: Set(input.creator_id),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let created = model.insert(&self.db).await.map_err(|e| {
            if is_unique_violation(&e) {
                ServiceError::Conflict(format!("coupon code {} already exists", code))
            } else {
                ServiceError::from(e)
            }
        })?;
        info!(coupon_id = %created.id, "coupon created");
        Ok(created)
    }

    /// Issues a referral code with a generated `REF-` code
    #[instrument(skip(self, input))]
    pub async fn create_referral_coupon(
        &self,
        actor: &Actor,
        input: NewReferralCoupon,
    ) -> Result<CouponModel, ServiceError> {
        input.validate()?;
        let creator_id = match input.creator_id {
            Some(creator) if creator != actor.user_id && !actor.is_admin() => {
                return Err(ServiceError::Forbidden(
                    "referral codes can only be issued for yourself".to_string(),
                ))
            }
            Some(creator) => creator,
            None => actor.user_id,
        };
        if input.discount_type == DiscountType::Percentage && input.discount_value > 100 {
            return Err(ServiceError::ValidationError(
                "percentage discount cannot exceed 100".to_string(),
            ));
        }

        let now = Utc::now();
        for attempt in 1..=REFERRAL_ATTEMPTS {
            let model = CouponActiveModel {
                id: Set(Uuid::new_v4()),
                code: Set(generate_referral_code()),
                coupon_type: Set(CouponType::Referral),
                discount_type: Set(input.discount_type),
                discount_value: Set(input.discount_value),
                max_uses: Set(input.max_uses),
                current_uses: Set(0),
                valid_from: Set(now),
                valid_until: Set(now + Duration::days(input.valid_days)),
                min_purchase_amount: Set(0),
                is_active: Set(true),
                scope: Set(CouponScope::default()),
                creator_id: Set(Some(creator_id)),
                created_at: Set(now),
                updated_at: Set(now),
            };
            match model.insert(&self.db).await {
                Ok(created) => {
                    info!(coupon_id = %created.id, %creator_id, "referral coupon issued");
                    return Ok(created);
                }
                Err(e) if is_unique_violation(&e) => {
                    warn!(attempt, "referral code collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ServiceError::Conflict(
            "could not generate a unique referral code".to_string(),
        ))
    }
}
