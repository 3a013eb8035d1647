//! Records for every table in the schema.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{CommentId, Money, OrderId, OrderItemId, PostId, ProductId, TagId, UserId};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::memory::MemoryTables;
use crate::record::{Insert, Record, Reference, Table, narrow};

/// Pattern enforced on `users.email` by the `chk_email_format` constraint.
pub const EMAIL_PATTERN: &str = r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$";

/// Foreign key from `orders.user_id` to `users`.
pub const FK_ORDERS_USER: &str = "fk_orders_user";
/// Foreign key from `order_items.order_id` to `orders`.
pub const FK_ORDER_ITEMS_ORDER: &str = "fk_order_items_order";
/// Foreign key from `order_items.product_id` to `products`.
pub const FK_ORDER_ITEMS_PRODUCT: &str = "fk_order_items_product";
/// Foreign key from `posts.user_id` to `users`.
pub const FK_POSTS_USER: &str = "fk_posts_user";
/// Foreign key from `posts.parent_id` to `posts`.
pub const FK_POSTS_PARENT: &str = "fk_posts_parent";
/// Foreign key from `comments.post_id` to `posts`.
pub const FK_COMMENTS_POST: &str = "fk_comments_post";
/// Foreign key from `comments.user_id` to `users`.
pub const FK_COMMENTS_USER: &str = "fk_comments_user";
/// Foreign key from `post_tags.added_by` to `users`.
pub const FK_POST_TAGS_ADDED_BY: &str = "fk_post_tags_added_by";

/// Access level of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Member,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Member => "member",
            Role::Admin => "admin",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown role name.
#[derive(Debug, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "member" => Ok(Role::Member),
            "admin" => Ok(Role::Admin),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// A row in `users`. The `credits` column is the account balance used by
/// credit transfers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub uuid: Uuid,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: String,
    pub username: String,
    pub role: Role,
    pub is_active: bool,
    pub credits: i64,
    pub login_count: i64,
    pub last_login_at: Option<DateTime<Utc>>,
    pub preferences: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

impl Record for User {
    const TABLE: Table = Table::Users;

    fn id(&self) -> i64 {
        self.id.as_i64()
    }

    fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    fn int_column(&self, column: &str) -> Option<i64> {
        match column {
            "id" => Some(self.id.as_i64()),
            "credits" => Some(self.credits),
            "login_count" => Some(self.login_count),
            _ => None,
        }
    }

    fn set_int_column(&mut self, column: &str, value: i64) -> bool {
        let slot = match column {
            "credits" => &mut self.credits,
            "login_count" => &mut self.login_count,
            _ => return false,
        };
        *slot = value;
        self.updated_at = Utc::now();
        true
    }

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let role: String = row.try_get("role")?;
        Ok(User {
            id: UserId::new(row.try_get("id")?),
            uuid: row.try_get("uuid")?,
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            email: row.try_get("email")?,
            username: row.try_get("username")?,
            role: role.parse().map_err(|e| sqlx::Error::ColumnDecode {
                index: "role".to_string(),
                source: Box::new(e),
            })?,
            is_active: row.try_get("is_active")?,
            credits: row.try_get("credits")?,
            login_count: row.try_get("login_count")?,
            last_login_at: row.try_get("last_login_at")?,
            preferences: row.try_get("preferences")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }

    fn rows(tables: &MemoryTables) -> &BTreeMap<i64, Self> {
        &tables.users
    }

    fn rows_mut(tables: &mut MemoryTables) -> &mut BTreeMap<i64, Self> {
        &mut tables.users
    }
}

/// Values for a new user. Build with [`NewUser::new`] and the `with_*`
/// methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUser {
    pub uuid: Uuid,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: String,
    pub username: String,
    pub role: Role,
    pub is_active: bool,
    pub credits: i64,
    pub preferences: serde_json::Value,
}

impl NewUser {
    /// A new active member with no credits. The UUID is left nil; the
    /// user service assigns one before insert.
    pub fn new(email: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::nil(),
            first_name: None,
            last_name: None,
            email: email.into(),
            username: username.into(),
            role: Role::Member,
            is_active: true,
            credits: 0,
            preferences: serde_json::json!({}),
        }
    }

    pub fn with_name(mut self, first: impl Into<String>, last: impl Into<String>) -> Self {
        self.first_name = Some(first.into());
        self.last_name = Some(last.into());
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_credits(mut self, credits: i64) -> Self {
        self.credits = credits;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    pub fn with_preferences(mut self, preferences: serde_json::Value) -> Self {
        self.preferences = preferences;
        self
    }
}

impl Insert for NewUser {
    type Output = User;

    const COLUMNS: &'static [&'static str] = &[
        "uuid",
        "first_name",
        "last_name",
        "email",
        "username",
        "role",
        "is_active",
        "credits",
        "preferences",
    ];

    fn push_values(&self, query: &mut QueryBuilder<'static, Postgres>) {
        let mut values = query.separated(", ");
        values.push_bind(self.uuid);
        values.push_bind(self.first_name.clone());
        values.push_bind(self.last_name.clone());
        values.push_bind(self.email.clone());
        values.push_bind(self.username.clone());
        values.push_bind(self.role.as_str());
        values.push_bind(self.is_active);
        values.push_bind(self.credits);
        values.push_bind(self.preferences.clone());
    }

    fn into_record(self, id: i64, now: DateTime<Utc>) -> User {
        User {
            id: UserId::new(id),
            uuid: self.uuid,
            first_name: self.first_name,
            last_name: self.last_name,
            email: self.email,
            username: self.username,
            role: self.role,
            is_active: self.is_active,
            credits: self.credits,
            login_count: 0,
            last_login_at: None,
            preferences: self.preferences,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// A row in `audit_logs`, written alongside user creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: i64,
    pub action: String,
    pub entity_id: i64,
    pub created_at: DateTime<Utc>,
}

impl Record for AuditLog {
    const TABLE: Table = Table::AuditLogs;

    fn id(&self) -> i64 {
        self.id
    }

    fn int_column(&self, column: &str) -> Option<i64> {
        match column {
            "id" => Some(self.id),
            "entity_id" => Some(self.entity_id),
            _ => None,
        }
    }

    fn set_int_column(&mut self, _column: &str, _value: i64) -> bool {
        false
    }

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(AuditLog {
            id: row.try_get("id")?,
            action: row.try_get("action")?,
            entity_id: row.try_get("entity_id")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn rows(tables: &MemoryTables) -> &BTreeMap<i64, Self> {
        &tables.audit_logs
    }

    fn rows_mut(tables: &mut MemoryTables) -> &mut BTreeMap<i64, Self> {
        &mut tables.audit_logs
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAuditLog {
    pub action: String,
    pub entity_id: i64,
}

impl NewAuditLog {
    pub fn user_created(user_id: UserId) -> Self {
        Self {
            action: "user_created".to_string(),
            entity_id: user_id.as_i64(),
        }
    }
}

impl Insert for NewAuditLog {
    type Output = AuditLog;

    const COLUMNS: &'static [&'static str] = &["action", "entity_id"];

    fn push_values(&self, query: &mut QueryBuilder<'static, Postgres>) {
        let mut values = query.separated(", ");
        values.push_bind(self.action.clone());
        values.push_bind(self.entity_id);
    }

    fn into_record(self, id: i64, now: DateTime<Utc>) -> AuditLog {
        AuditLog {
            id,
            action: self.action,
            entity_id: self.entity_id,
            created_at: now,
        }
    }
}

/// A row in `products`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub price: Money,
    pub stock: i64,
    pub created_at: DateTime<Utc>,
}

impl Record for Product {
    const TABLE: Table = Table::Products;

    fn id(&self) -> i64 {
        self.id.as_i64()
    }

    fn int_column(&self, column: &str) -> Option<i64> {
        match column {
            "id" => Some(self.id.as_i64()),
            "stock" => Some(self.stock),
            "price_cents" => Some(self.price.cents()),
            _ => None,
        }
    }

    fn set_int_column(&mut self, column: &str, value: i64) -> bool {
        match column {
            "stock" => self.stock = value,
            "price_cents" => self.price = Money::from_cents(value),
            _ => return false,
        }
        true
    }

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Product {
            id: ProductId::new(row.try_get("id")?),
            name: row.try_get("name")?,
            price: Money::from_cents(row.try_get("price_cents")?),
            stock: row.try_get("stock")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn rows(tables: &MemoryTables) -> &BTreeMap<i64, Self> {
        &tables.products
    }

    fn rows_mut(tables: &mut MemoryTables) -> &mut BTreeMap<i64, Self> {
        &mut tables.products
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProduct {
    pub name: String,
    pub price: Money,
    pub stock: i64,
}

impl NewProduct {
    pub fn new(name: impl Into<String>, price: Money, stock: i64) -> Self {
        Self {
            name: name.into(),
            price,
            stock,
        }
    }
}

impl Insert for NewProduct {
    type Output = Product;

    const COLUMNS: &'static [&'static str] = &["name", "price_cents", "stock"];

    fn push_values(&self, query: &mut QueryBuilder<'static, Postgres>) {
        let mut values = query.separated(", ");
        values.push_bind(self.name.clone());
        values.push_bind(self.price.cents());
        values.push_bind(self.stock);
    }

    fn into_record(self, id: i64, now: DateTime<Utc>) -> Product {
        Product {
            id: ProductId::new(id),
            name: self.name,
            price: self.price,
            stock: self.stock,
            created_at: now,
        }
    }
}

/// An order header. `total` tracks the sum of its persisted lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub total: Money,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Record for Order {
    const TABLE: Table = Table::Orders;

    fn id(&self) -> i64 {
        self.id.as_i64()
    }

    fn int_column(&self, column: &str) -> Option<i64> {
        match column {
            "id" => Some(self.id.as_i64()),
            "user_id" => Some(self.user_id.as_i64()),
            "total_cents" => Some(self.total.cents()),
            _ => None,
        }
    }

    fn set_int_column(&mut self, column: &str, value: i64) -> bool {
        match column {
            "total_cents" => {
                self.total = Money::from_cents(value);
                true
            }
            _ => false,
        }
    }

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Order {
            id: OrderId::new(row.try_get("id")?),
            user_id: UserId::new(row.try_get("user_id")?),
            total: Money::from_cents(row.try_get("total_cents")?),
            note: row.try_get("note")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn rows(tables: &MemoryTables) -> &BTreeMap<i64, Self> {
        &tables.orders
    }

    fn rows_mut(tables: &mut MemoryTables) -> &mut BTreeMap<i64, Self> {
        &mut tables.orders
    }
}

/// Header values for a new order; the total starts at zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    pub user_id: UserId,
    pub note: Option<String>,
}

impl NewOrder {
    pub fn for_user(user_id: UserId) -> Self {
        Self {
            user_id,
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

impl Insert for NewOrder {
    type Output = Order;

    const COLUMNS: &'static [&'static str] = &["user_id", "total_cents", "note"];

    fn push_values(&self, query: &mut QueryBuilder<'static, Postgres>) {
        let mut values = query.separated(", ");
        values.push_bind(self.user_id.as_i64());
        values.push_bind(0_i64);
        values.push_bind(self.note.clone());
    }

    fn references(&self) -> Vec<Reference> {
        vec![Reference::new(FK_ORDERS_USER, Table::Users, self.user_id)]
    }

    fn into_record(self, id: i64, now: DateTime<Utc>) -> Order {
        Order {
            id: OrderId::new(id),
            user_id: self.user_id,
            total: Money::zero(),
            note: self.note,
            created_at: now,
        }
    }
}

/// An order line. `unit_price` is the product price when the line was
/// written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: OrderItemId,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub unit_price: Money,
    pub created_at: DateTime<Utc>,
}

impl OrderItem {
    pub fn line_total(&self) -> Money {
        self.unit_price.times(self.quantity)
    }
}

impl Record for OrderItem {
    const TABLE: Table = Table::OrderItems;

    fn id(&self) -> i64 {
        self.id.as_i64()
    }

    fn int_column(&self, column: &str) -> Option<i64> {
        match column {
            "id" => Some(self.id.as_i64()),
            "order_id" => Some(self.order_id.as_i64()),
            "product_id" => Some(self.product_id.as_i64()),
            "quantity" => Some(i64::from(self.quantity)),
            _ => None,
        }
    }

    fn set_int_column(&mut self, _column: &str, _value: i64) -> bool {
        false
    }

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(OrderItem {
            id: OrderItemId::new(row.try_get("id")?),
            order_id: OrderId::new(row.try_get("order_id")?),
            product_id: ProductId::new(row.try_get("product_id")?),
            quantity: narrow("quantity", row.try_get("quantity")?)?,
            unit_price: Money::from_cents(row.try_get("unit_price_cents")?),
            created_at: row.try_get("created_at")?,
        })
    }

    fn rows(tables: &MemoryTables) -> &BTreeMap<i64, Self> {
        &tables.order_items
    }

    fn rows_mut(tables: &mut MemoryTables) -> &mut BTreeMap<i64, Self> {
        &mut tables.order_items
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrderItem {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub unit_price: Money,
}

impl Insert for NewOrderItem {
    type Output = OrderItem;

    const COLUMNS: &'static [&'static str] =
        &["order_id", "product_id", "quantity", "unit_price_cents"];

    fn push_values(&self, query: &mut QueryBuilder<'static, Postgres>) {
        let mut values = query.separated(", ");
        values.push_bind(self.order_id.as_i64());
        values.push_bind(self.product_id.as_i64());
        values.push_bind(i64::from(self.quantity));
        values.push_bind(self.unit_price.cents());
    }

    fn references(&self) -> Vec<Reference> {
        vec![
            Reference::new(FK_ORDER_ITEMS_ORDER, Table::Orders, self.order_id),
            Reference::new(FK_ORDER_ITEMS_PRODUCT, Table::Products, self.product_id),
        ]
    }

    fn into_record(self, id: i64, now: DateTime<Utc>) -> OrderItem {
        OrderItem {
            id: OrderItemId::new(id),
            order_id: self.order_id,
            product_id: self.product_id,
            quantity: self.quantity,
            unit_price: self.unit_price,
            created_at: now,
        }
    }
}

/// A post. Replies point at their parent through `parent_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub user_id: UserId,
    pub parent_id: Option<PostId>,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Record for Post {
    const TABLE: Table = Table::Posts;

    fn id(&self) -> i64 {
        self.id.as_i64()
    }

    fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    fn int_column(&self, column: &str) -> Option<i64> {
        match column {
            "id" => Some(self.id.as_i64()),
            "user_id" => Some(self.user_id.as_i64()),
            "parent_id" => self.parent_id.map(|p| p.as_i64()),
            _ => None,
        }
    }

    fn set_int_column(&mut self, _column: &str, _value: i64) -> bool {
        false
    }

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Post {
            id: PostId::new(row.try_get("id")?),
            user_id: UserId::new(row.try_get("user_id")?),
            parent_id: row.try_get::<Option<i64>, _>("parent_id")?.map(PostId::new),
            title: row.try_get("title")?,
            content: row.try_get("content")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }

    fn rows(tables: &MemoryTables) -> &BTreeMap<i64, Self> {
        &tables.posts
    }

    fn rows_mut(tables: &mut MemoryTables) -> &mut BTreeMap<i64, Self> {
        &mut tables.posts
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPost {
    pub user_id: UserId,
    pub parent_id: Option<PostId>,
    pub title: String,
    pub content: String,
}

impl NewPost {
    pub fn new(user_id: UserId, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            user_id,
            parent_id: None,
            title: title.into(),
            content: content.into(),
        }
    }

    /// Makes this post a reply in `parent`'s thread.
    pub fn reply_to(mut self, parent: PostId) -> Self {
        self.parent_id = Some(parent);
        self
    }
}

impl Insert for NewPost {
    type Output = Post;

    const COLUMNS: &'static [&'static str] = &["user_id", "parent_id", "title", "content"];

    fn push_values(&self, query: &mut QueryBuilder<'static, Postgres>) {
        let mut values = query.separated(", ");
        values.push_bind(self.user_id.as_i64());
        values.push_bind(self.parent_id.map(|p| p.as_i64()));
        values.push_bind(self.title.clone());
        values.push_bind(self.content.clone());
    }

    fn references(&self) -> Vec<Reference> {
        let mut references = vec![Reference::new(FK_POSTS_USER, Table::Users, self.user_id)];
        if let Some(parent) = self.parent_id {
            references.push(Reference::new(FK_POSTS_PARENT, Table::Posts, parent));
        }
        references
    }

    fn into_record(self, id: i64, now: DateTime<Utc>) -> Post {
        Post {
            id: PostId::new(id),
            user_id: self.user_id,
            parent_id: self.parent_id,
            title: self.title,
            content: self.content,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// A comment on a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub post_id: PostId,
    pub user_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Record for Comment {
    const TABLE: Table = Table::Comments;

    fn id(&self) -> i64 {
        self.id.as_i64()
    }

    fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    fn int_column(&self, column: &str) -> Option<i64> {
        match column {
            "id" => Some(self.id.as_i64()),
            "post_id" => Some(self.post_id.as_i64()),
            "user_id" => Some(self.user_id.as_i64()),
            _ => None,
        }
    }

    fn set_int_column(&mut self, _column: &str, _value: i64) -> bool {
        false
    }

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Comment {
            id: CommentId::new(row.try_get("id")?),
            post_id: PostId::new(row.try_get("post_id")?),
            user_id: UserId::new(row.try_get("user_id")?),
            content: row.try_get("content")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }

    fn rows(tables: &MemoryTables) -> &BTreeMap<i64, Self> {
        &tables.comments
    }

    fn rows_mut(tables: &mut MemoryTables) -> &mut BTreeMap<i64, Self> {
        &mut tables.comments
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewComment {
    pub post_id: PostId,
    pub user_id: UserId,
    pub content: String,
}

impl NewComment {
    pub fn new(post_id: PostId, user_id: UserId, content: impl Into<String>) -> Self {
        Self {
            post_id,
            user_id,
            content: content.into(),
        }
    }
}

impl Insert for NewComment {
    type Output = Comment;

    const COLUMNS: &'static [&'static str] = &["post_id", "user_id", "content"];

    fn push_values(&self, query: &mut QueryBuilder<'static, Postgres>) {
        let mut values = query.separated(", ");
        values.push_bind(self.post_id.as_i64());
        values.push_bind(self.user_id.as_i64());
        values.push_bind(self.content.clone());
    }

    fn references(&self) -> Vec<Reference> {
        vec![
            Reference::new(FK_COMMENTS_POST, Table::Posts, self.post_id),
            Reference::new(FK_COMMENTS_USER, Table::Users, self.user_id),
        ]
    }

    fn into_record(self, id: i64, now: DateTime<Utc>) -> Comment {
        Comment {
            id: CommentId::new(id),
            post_id: self.post_id,
            user_id: self.user_id,
            content: self.content,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// A tag. Name and slug are each unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: TagId,
    pub name: String,
    pub slug: String,
    pub created_at: DateTime<Utc>,
}

impl Record for Tag {
    const TABLE: Table = Table::Tags;

    fn id(&self) -> i64 {
        self.id.as_i64()
    }

    fn int_column(&self, column: &str) -> Option<i64> {
        match column {
            "id" => Some(self.id.as_i64()),
            _ => None,
        }
    }

    fn set_int_column(&mut self, _column: &str, _value: i64) -> bool {
        false
    }

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Tag {
            id: TagId::new(row.try_get("id")?),
            name: row.try_get("name")?,
            slug: row.try_get("slug")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn rows(tables: &MemoryTables) -> &BTreeMap<i64, Self> {
        &tables.tags
    }

    fn rows_mut(tables: &mut MemoryTables) -> &mut BTreeMap<i64, Self> {
        &mut tables.tags
    }
}

/// A tag to attach. Tags are matched by slug; an existing slug is reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTag {
    pub name: String,
    pub slug: String,
}

impl NewTag {
    pub fn new(name: impl Into<String>, slug: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slug: slug.into(),
        }
    }
}

impl Insert for NewTag {
    type Output = Tag;

    const COLUMNS: &'static [&'static str] = &["name", "slug"];

    fn push_values(&self, query: &mut QueryBuilder<'static, Postgres>) {
        let mut values = query.separated(", ");
        values.push_bind(self.name.clone());
        values.push_bind(self.slug.clone());
    }

    fn into_record(self, id: i64, now: DateTime<Utc>) -> Tag {
        Tag {
            id: TagId::new(id),
            name: self.name,
            slug: self.slug,
            created_at: now,
        }
    }
}

/// A row in the `post_tags` join table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostTag {
    pub post_id: PostId,
    pub tag_id: TagId,
    /// Who attached the tag, when known.
    pub added_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}
