use chrono::{DateTime, Utc};
use sea_orm::{
    sea_query::Expr, ColumnTrait, Condition, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::Actor,
    entities::{
        order::{self, Entity as Order, Model as OrderModel, OrderKind, OrderStatus, PaymentStatus},
        order_coupon::{self, Entity as OrderCoupon, Model as OrderCouponModel},
        order_item::{self, Entity as OrderItem, Model as OrderItemModel},
        transaction::{self, Entity as Transaction, Model as TransactionModel},
    },
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Accepted order list filters; anything else in the query string is rejected
#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct OrderFilter {
    /// Admins only; users always see their own orders
    pub user_id: Option<Uuid>,
    pub status: Option<OrderStatus>,
    pub payment_status: Option<PaymentStatus>,
    pub kind: Option<OrderKind>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    /// Admins only
    #[serde(default)]
    pub include_deleted: bool,
    #[validate(range(min = 1))]
    pub page: Option<u64>,
    #[validate(range(min = 1, max = 100))]
    pub limit: Option<u64>,
}

impl OrderFilter {
    pub fn page(&self) -> u64 {
        self.page.unwrap_or(1)
    }

    pub fn limit(&self) -> u64 {
        self.limit.unwrap_or(20)
    }

    fn condition(&self, owner: Option<Uuid>) -> Condition {
        let mut condition = Condition::all();
        if let Some(owner) = owner {
            condition = condition.add(order::Column::UserId.eq(owner));
        }
        if let Some(status) = self.status {
            condition = condition.add(order::Column::Status.eq(status));
        }
        if let Some(payment_status) = self.payment_status {
            condition = condition.add(order::Column::PaymentStatus.eq(payment_status));
        }
        if let Some(kind) = self.kind {
            condition = condition.add(order::Column::Kind.eq(kind));
        }
        if let Some(from) = self.created_from {
            condition = condition.add(order::Column::CreatedAt.gte(from));
        }
        if let Some(to) = self.created_to {
            condition = condition.add(order::Column::CreatedAt.lte(to));
        }
        if !self.include_deleted {
            condition = condition.add(order::Column::IsDeleted.eq(false));
        }
        condition
    }
}

/// Order with everything captured at checkout
#[derive(Debug, Clone, Serialize)]
pub struct OrderDetails {
    pub order: OrderModel,
    pub items: Vec<OrderItemModel>,
    pub coupons: Vec<OrderCouponModel>,
    pub transactions: Vec<TransactionModel>,
}

/// Order queries and admin state changes
#[derive(Clone)]
pub struct OrderService {
    db: DatabaseConnection,
    events: EventSender,
}

impl OrderService {
    pub fn new(db: DatabaseConnection, events: EventSender) -> Self {
        Self { db, events }
    }

    async fn visible_order(&self, actor: &Actor, order_id: Uuid) -> Result<OrderModel, ServiceError> {
        let order = Order::find_by_id(order_id)
            .one(&self.db)
            .await?
            .filter(|o| actor.is_admin() || (o.user_id == actor.user_id && !o.is_deleted))
            .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_id)))?;
        Ok(order)
    }

    /// Paginated order list scoped to the actor
    #[instrument(skip(self, actor), fields(user_id = %actor.user_id))]
    pub async fn list_orders(
        &self,
        actor: &Actor,
        filter: &OrderFilter,
    ) -> Result<(Vec<OrderModel>, u64), ServiceError> {
        filter.validate()?;
        if let (Some(from), Some(to)) = (filter.created_from, filter.created_to) {
            if from > to {
                return Err(ServiceError::ValidationError(
                    "created_from must not be after created_to".to_string(),
                ));
            }
        }

        let owner = if actor.is_admin() {
            filter.user_id
        } else {
            if filter.user_id.is_some_and(|id| id != actor.user_id) || filter.include_deleted {
                return Err(ServiceError::Forbidden(
                    "filter is restricted to admins".to_string(),
                ));
            }
            Some(actor.user_id)
        };

        let paginator = Order::find()
            .filter(filter.condition(owner))
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&self.db, filter.limit());

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(filter.page() - 1).await?;
        Ok((orders, total))
    }

    pub async fn get_order(&self, actor: &Actor, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let order = self.visible_order(actor, order_id).await?;
        let items = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&self.db)
            .await?;
        let coupons = OrderCoupon::find()
            .filter(order_coupon::Column::OrderId.eq(order_id))
            .all(&self.db)
            .await?;
        let transactions = Transaction::find()
            .filter(transaction::Column::OrderId.eq(order_id))
            .order_by_asc(transaction::Column::CreatedAt)
            .all(&self.db)
            .await?;
        Ok(OrderDetails {
            order,
            items,
            coupons,
            transactions,
        })
    }

    /// Cancels a pending, unpaid order
    #[instrument(skip(self, actor))]
    pub async fn cancel_order(&self, actor: &Actor, order_id: Uuid) -> Result<OrderModel, ServiceError> {
        self.visible_order(actor, order_id).await?;
        let result = Order::update_many()
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Cancelled))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .filter(order::Column::PaymentStatus.eq(PaymentStatus::Unpaid))
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict(format!(
                "order {} can no longer be cancelled",
                order_id
            )));
        }

        info!(%order_id, "order cancelled");
        self.events.send_or_log(Event::OrderCancelled(order_id));
        self.visible_order(actor, order_id).await
    }

    /// Flags the order deleted; rows are never removed
    #[instrument(skip(self, actor))]
    pub async fn soft_delete_order(&self, actor: &Actor, order_id: Uuid) -> Result<OrderModel, ServiceError> {
        if !actor.is_admin() {
            return Err(ServiceError::Forbidden("only admins can delete orders".to_string()));
        }
        self.visible_order(actor, order_id).await?;
        let now = Utc::now();
        let result = Order::update_many()
            .col_expr(order::Column::IsDeleted, Expr::value(true))
            .col_expr(order::Column::DeletedAt, Expr::value(Some(now)))
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::IsDeleted.eq(false))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 1 {
            info!(%order_id, "order soft-deleted");
            self.events.send_or_log(Event::OrderDeleted(order_id));
        }
        self.visible_order(actor, order_id).await
    }
}
