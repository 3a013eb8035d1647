pub mod error;
pub mod gateway;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod posts;
pub mod record;
pub mod transaction;
pub mod users;

pub use common::{CommentId, Money, OrderId, OrderItemId, PostId, ProductId, TagId, UserId};
pub use error::{Result, StoreError, TAGS_NAME_KEY, USERS_EMAIL_KEY, USERS_USERNAME_KEY};
pub use gateway::{Adjustment, Counter, Savepoint, Scope, Store};
pub use memory::{
    InMemoryPostRepository, InMemoryStore, InMemoryUserRepository, MemoryScope, MemoryTables,
};
pub use model::{
    AuditLog, Comment, EMAIL_PATTERN, NewAuditLog, NewComment, NewOrder, NewOrderItem, NewPost,
    NewProduct, NewTag, NewUser, Order, OrderItem, Post, PostTag, Product, Role, Tag, User,
};
pub use postgres::{
    PgScope, PoolStats, PostgresPostRepository, PostgresStore, PostgresUserRepository,
};
pub use posts::{
    CommentWithAuthor, PopularPost, PostDetails, PostRepository, PostSummary, PostWithAuthor,
    PostWithComments,
};
pub use record::{Filter, Insert, Record, Reference, Table};
pub use transaction::{nested, with_deadline, with_transaction};
pub use users::{
    CREATE_BATCH_SIZE, Page, UserFilters, UserRepository, UserRepositoryExt, UserStream,
    UserUpdate,
};
