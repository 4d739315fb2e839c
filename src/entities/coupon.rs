use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::FromJsonQueryResult;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Discount or referral code
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "coupon_codes")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    /// Always stored uppercase
    #[sea_orm(unique)]
    pub code: String,
    pub coupon_type: CouponType,
    pub discount_type: DiscountType,
    /// Percent (0..=100) or an absolute amount, depending on `discount_type`
    pub discount_value: i64,
    pub max_uses: i32,
    pub current_uses: i32,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub min_purchase_amount: i64,
    pub is_active: bool,
    /// Empty scope means the coupon applies everywhere
    #[sea_orm(column_type = "Json")]
    pub scope: CouponScope,
    #[sea_orm(nullable)]
    pub creator_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum, ToSchema)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum CouponType {
    #[sea_orm(string_value = "discount")]
    Discount,
    #[sea_orm(string_value = "referral")]
    Referral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum, ToSchema)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    #[sea_orm(string_value = "percentage")]
    Percentage,
    #[sea_orm(string_value = "fixed_amount")]
    FixedAmount,
}

/// What a coupon may be applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Product,
    Program,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct CouponTarget {
    pub kind: TargetKind,
    pub id: Uuid,
}

impl CouponTarget {
    pub fn product(id: Uuid) -> Self {
        Self {
            kind: TargetKind::Product,
            id,
        }
    }

    pub fn program(id: Uuid) -> Self {
        Self {
            kind: TargetKind::Program,
            id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct CouponScope(pub Vec<CouponTarget>);

impl CouponScope {
    pub fn is_universal(&self) -> bool {
        self.0.is_empty()
    }

    /// True when any of `targets` falls inside the scope
    pub fn covers_any(&self, targets: &[CouponTarget]) -> bool {
        self.is_universal() || targets.iter().any(|t| self.0.contains(t))
    }
}
