use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Catalog product sold through the shop cart
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "products")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub title: String,
    pub kind: ProductKind,
    /// Regular unit price
    pub price: i64,
    /// Fire-sale unit price; only honoured when greater than zero
    #[sea_orm(nullable)]
    pub discount_price: Option<i64>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    /// Price a buyer pays for one unit right now
    pub fn effective_price(&self) -> i64 {
        effective_price(self.price, self.discount_price)
    }
}

/// Fire-sale price when set and positive, otherwise the regular price
pub fn effective_price(price: i64, discount_price: Option<i64>) -> i64 {
    match discount_price {
        Some(discounted) if discounted > 0 => discounted,
        _ => price,
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum ProductKind {
    #[sea_orm(string_value = "course")]
    Course,
    #[sea_orm(string_value = "physical")]
    Physical,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fire_sale_price_wins_only_when_positive() {
        assert_eq!(effective_price(1000, Some(800)), 800);
        assert_eq!(effective_price(1000, Some(0)), 1000);
        assert_eq!(effective_price(1000, Some(-5)), 1000);
        assert_eq!(effective_price(1000, None), 1000);
    }
}
