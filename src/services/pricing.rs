use crate::{
    config::CheckoutConfig,
    entities::{
        cart::Entity as Cart,
        cart_item::{self, Entity as CartItem},
        class_program::{Entity as ClassProgram, Model as ClassProgramModel},
        coupon::CouponTarget,
        order::{Entity as Order, OrderKind},
        order_item::{self, Entity as OrderItem, ItemKind},
        package::{self, Entity as Package},
        product::{self, Entity as Product, ProductKind},
        profile::Entity as Profile,
    },
    errors::ServiceError,
    services::coupons::{AppliedCoupon, CouponService, RejectedCoupon},
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

/// How tax is charged for a product line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaxPolicy {
    /// Fraction of the discounted subtotal (shop orders)
    Percentage(Decimal),
    /// Fixed amount per checkout (course sessions)
    Flat(i64),
}

impl TaxPolicy {
    pub fn tax_on(&self, discounted_subtotal: i64) -> i64 {
        match self {
            TaxPolicy::Percentage(rate) => (Decimal::from(discounted_subtotal) * rate)
                .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
                .to_i64()
                .unwrap_or(0)
                .max(0),
            TaxPolicy::Flat(amount) => (*amount).max(0),
        }
    }
}

/// What is being bought
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum CheckoutTarget {
    Cart(Uuid),
    Program(Uuid),
}

impl CheckoutTarget {
    pub fn id(&self) -> Uuid {
        match self {
            CheckoutTarget::Cart(id) | CheckoutTarget::Program(id) => *id,
        }
    }

    pub fn order_kind(&self) -> OrderKind {
        match self {
            CheckoutTarget::Cart(_) => OrderKind::Shop,
            CheckoutTarget::Program(_) => OrderKind::CourseSession,
        }
    }
}

/// Priced line with the unit price in force when it was resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LineItem {
    pub item_id: Uuid,
    pub kind: ItemKind,
    pub title: String,
    pub unit_price: i64,
    pub quantity: i32,
}

impl LineItem {
    pub fn line_total(&self) -> i64 {
        self.unit_price * i64::from(self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AddOn {
    pub package_id: Uuid,
    pub title: String,
    pub price: i64,
}

/// Full price breakdown of one checkout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSummary {
    pub original_amount: i64,
    pub total_discount: i64,
    pub tax_amount: i64,
    pub shipping_amount: i64,
    pub add_on_total: i64,
    /// `max(0, original - discount) + tax + add_on_total + shipping`
    pub final_amount: i64,
    pub wallet_applied: i64,
    /// `final_amount - wallet_applied`, never below zero
    pub payable_amount: i64,
    pub line_items: Vec<LineItem>,
    pub add_ons: Vec<AddOn>,
    pub valid_coupons: Vec<AppliedCoupon>,
    pub invalid_coupons: Vec<RejectedCoupon>,
}

/// Inputs to the calculator that are not tied to the target
#[derive(Debug, Clone, Default)]
pub struct PricingOptions {
    pub coupon_codes: Vec<String>,
    pub add_on_ids: Vec<Uuid>,
    pub use_wallet: bool,
}

/// Target resolved into lines and the rules that price them
#[derive(Debug, Clone)]
pub struct PricedTarget {
    pub target: CheckoutTarget,
    pub summary: PriceSummary,
}

/// Sum of effective unit price times quantity
pub fn original_amount(lines: &[LineItem]) -> i64 {
    lines.iter().map(LineItem::line_total).sum()
}

/// Shipping applies only when something physical is being sent
pub fn shipping_for(lines: &[LineItem], flat_rate: i64) -> i64 {
    if lines.iter().any(|line| line.kind == ItemKind::Physical) {
        flat_rate
    } else {
        0
    }
}

/// Composes the summary from already resolved parts.
///
/// The wallet offset is clamped so the payable amount never goes below zero.
#[allow(clippy::too_many_arguments)]
pub fn compose_summary(
    line_items: Vec<LineItem>,
    add_ons: Vec<AddOn>,
    valid_coupons: Vec<AppliedCoupon>,
    invalid_coupons: Vec<RejectedCoupon>,
    tax_policy: TaxPolicy,
    shipping_flat_rate: i64,
    wallet_balance: Option<i64>,
) -> PriceSummary {
    let original_amount = original_amount(&line_items);
    let total_discount = valid_coupons
        .iter()
        .map(|c| c.discount_amount)
        .sum::<i64>()
        .min(original_amount.max(0));
    let discounted = original_amount - total_discount;
    let tax_amount = tax_policy.tax_on(discounted);
    let add_on_total: i64 = add_ons.iter().map(|a| a.price).sum();
    let shipping_amount = shipping_for(&line_items, shipping_flat_rate);
    let final_amount = discounted + tax_amount + add_on_total + shipping_amount;
    let wallet_applied = wallet_balance.unwrap_or(0).clamp(0, final_amount);

    PriceSummary {
        original_amount,
        total_discount,
        tax_amount,
        shipping_amount,
        add_on_total,
        final_amount,
        wallet_applied,
        payable_amount: final_amount - wallet_applied,
        line_items,
        add_ons,
        valid_coupons,
        invalid_coupons,
    }
}

/// Line whose captured price no longer matches the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LineDrift {
    pub item_id: Uuid,
    pub kind: ItemKind,
    pub title: String,
    pub captured_unit_price: i64,
    /// `None` when the item is gone from the catalog
    pub current_unit_price: Option<i64>,
    pub difference: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PriceDriftReport {
    pub order_id: Uuid,
    pub lines: Vec<LineDrift>,
    pub has_drift: bool,
}

/// Price Calculator over the catalog tables
#[derive(Clone)]
pub struct PricingService {
    db: DatabaseConnection,
    coupons: CouponService,
    config: CheckoutConfig,
}

impl PricingService {
    pub fn new(db: DatabaseConnection, coupons: CouponService, config: CheckoutConfig) -> Self {
        Self {
            db,
            coupons,
            config,
        }
    }

    pub fn tax_policy(&self, kind: OrderKind) -> TaxPolicy {
        match kind {
            OrderKind::Shop => TaxPolicy::Percentage(self.config.shop_tax_rate_decimal()),
            OrderKind::CourseSession => TaxPolicy::Flat(self.config.course_session_tax),
        }
    }

    /// Loads the cart lines at current effective prices
    pub async fn cart_lines(&self, cart_id: Uuid, user_id: Uuid) -> Result<Vec<LineItem>, ServiceError> {
        let cart = Cart::find_by_id(cart_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("cart {}", cart_id)))?;
        if cart.user_id != user_id {
            return Err(ServiceError::Forbidden("cart belongs to another user".to_string()));
        }

        let items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .all(&self.db)
            .await?;
        if items.is_empty() {
            return Err(ServiceError::BadRequest("cart is empty".to_string()));
        }

        let product_ids: Vec<Uuid> = items.iter().map(|i| i.product_id).collect();
        let products: HashMap<Uuid, product::Model> = Product::find()
            .filter(product::Column::Id.is_in(product_ids))
            .all(&self.db)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        items
            .into_iter()
            .map(|item| {
                let product = products
                    .get(&item.product_id)
                    .filter(|p| p.is_active)
                    .ok_or_else(|| {
                        ServiceError::BadRequest(format!(
                            "product {} is not available",
                            item.product_id
                        ))
                    })?;
                if item.quantity < 1 {
                    return Err(ServiceError::BadRequest(format!(
                        "invalid quantity for product {}",
                        item.product_id
                    )));
                }
                Ok(LineItem {
                    item_id: product.id,
                    kind: match product.kind {
                        ProductKind::Course => ItemKind::Course,
                        ProductKind::Physical => ItemKind::Physical,
                    },
                    title: product.title.clone(),
                    unit_price: product.effective_price(),
                    quantity: item.quantity,
                })
            })
            .collect()
    }

    pub fn program_lines(program: &ClassProgramModel) -> Vec<LineItem> {
        vec![LineItem {
            item_id: program.id,
            kind: ItemKind::Program,
            title: program.title.clone(),
            unit_price: program.effective_price(),
            quantity: 1,
        }]
    }

    /// Resolves package ids; every id must be distinct, known and active
    pub async fn resolve_add_ons(&self, ids: &[Uuid]) -> Result<Vec<AddOn>, ServiceError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let distinct: HashSet<Uuid> = ids.iter().copied().collect();
        if distinct.len() != ids.len() {
            return Err(ServiceError::BadRequest("duplicate package ids".to_string()));
        }

        let packages: HashMap<Uuid, package::Model> = Package::find()
            .filter(package::Column::Id.is_in(ids.to_vec()))
            .filter(package::Column::IsActive.eq(true))
            .all(&self.db)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        ids.iter()
            .map(|id| {
                packages
                    .get(id)
                    .map(|p| AddOn {
                        package_id: p.id,
                        title: p.title.clone(),
                        price: p.price,
                    })
                    .ok_or_else(|| ServiceError::BadRequest(format!("unknown package {}", id)))
            })
            .collect()
    }

    async fn wallet_balance(&self, user_id: Uuid) -> Result<i64, ServiceError> {
        Ok(Profile::find_by_id(user_id)
            .one(&self.db)
            .await?
            .map(|p| p.wallet_balance)
            .unwrap_or(0))
    }

    /// Runs the calculator for already resolved lines
    #[instrument(skip(self, lines, options, coupon_targets), fields(lines = lines.len()))]
    pub async fn calculate_summary(
        &self,
        kind: OrderKind,
        lines: Vec<LineItem>,
        coupon_targets: &[CouponTarget],
        options: &PricingOptions,
        user_id: Uuid,
    ) -> Result<PriceSummary, ServiceError> {
        let add_ons = self.resolve_add_ons(&options.add_on_ids).await?;
        let original = original_amount(&lines);
        let application = self
            .coupons
            .apply_multiple(&options.coupon_codes, original, coupon_targets)
            .await?;
        let wallet = if options.use_wallet {
            Some(self.wallet_balance(user_id).await?)
        } else {
            None
        };

        let summary = compose_summary(
            lines,
            add_ons,
            application.valid,
            application.invalid,
            self.tax_policy(kind),
            self.config.shipping_flat_rate,
            wallet,
        );
        debug!(
            original = summary.original_amount,
            discount = summary.total_discount,
            payable = summary.payable_amount,
            "price summary computed"
        );
        Ok(summary)
    }

    /// Prices a cart for its owner
    pub async fn price_cart(
        &self,
        cart_id: Uuid,
        user_id: Uuid,
        options: &PricingOptions,
    ) -> Result<PricedTarget, ServiceError> {
        let lines = self.cart_lines(cart_id, user_id).await?;
        let targets: Vec<CouponTarget> = lines
            .iter()
            .map(|line| CouponTarget::product(line.item_id))
            .collect();
        let summary = self
            .calculate_summary(OrderKind::Shop, lines, &targets, options, user_id)
            .await?;
        Ok(PricedTarget {
            target: CheckoutTarget::Cart(cart_id),
            summary,
        })
    }

    /// Prices a class program seat
    pub async fn price_program(
        &self,
        program: &ClassProgramModel,
        user_id: Uuid,
        options: &PricingOptions,
    ) -> Result<PricedTarget, ServiceError> {
        let lines = Self::program_lines(program);
        let summary = self
            .calculate_summary(
                OrderKind::CourseSession,
                lines,
                &[CouponTarget::program(program.id)],
                options,
                user_id,
            )
            .await?;
        Ok(PricedTarget {
            target: CheckoutTarget::Program(program.id),
            summary,
        })
    }

    /// Compares captured line prices with the catalog. Read-only.
    #[instrument(skip(self))]
    pub async fn inspect_price_drift(&self, order_id: Uuid) -> Result<PriceDriftReport, ServiceError> {
        Order::find_by_id(order_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_id)))?;

        let items = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&self.db)
            .await?;

        let mut lines = Vec::with_capacity(items.len());
        for item in items {
            let current = match item.kind {
                ItemKind::Course | ItemKind::Physical => Product::find_by_id(item.item_id)
                    .one(&self.db)
                    .await?
                    .map(|p| p.effective_price()),
                ItemKind::Program => ClassProgram::find_by_id(item.item_id)
                    .one(&self.db)
                    .await?
                    .map(|p| p.effective_price()),
                ItemKind::Package => Package::find_by_id(item.item_id)
                    .one(&self.db)
                    .await?
                    .map(|p| p.price),
            };
            lines.push(LineDrift {
                item_id: item.item_id,
                kind: item.kind,
                title: item.title,
                captured_unit_price: item.unit_price,
                current_unit_price: current,
                difference: current.map(|price| price - item.unit_price),
            });
        }

        let has_drift = lines
            .iter()
            .any(|line| line.difference != Some(0));
        Ok(PriceDriftReport {
            order_id,
            lines,
            has_drift,
        })
    }
}
