use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scheduled cohort of a course with one coach
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "class_programs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub title: String,
    pub coach_id: Uuid,
    pub price: i64,
    #[sea_orm(nullable)]
    pub discount_price: Option<i64>,
    pub capacity: i32,
    /// Maintained only through guarded increments
    pub member_count: i32,
    pub is_active: bool,
    #[sea_orm(nullable)]
    pub registration_deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    pub fn effective_price(&self) -> i64 {
        super::product::effective_price(self.price, self.discount_price)
    }

    pub fn is_full(&self) -> bool {
        self.member_count >= self.capacity
    }

    pub fn registration_closed(&self, now: DateTime<Utc>) -> bool {
        self.registration_deadline.is_some_and(|deadline| now > deadline)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::program_session::Entity")]
    Sessions,
    #[sea_orm(has_many = "super::program_member::Entity")]
    Members,
}

impl Related<super::program_session::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Sessions.def()
    }
}

impl Related<super::program_member::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Members.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
