//! Shared types for the relational reference workspace.
//!
//! Row identifiers are database-assigned `BIGSERIAL` values; each table gets
//! its own newtype so a product id can never be passed where a user id is
//! expected.

mod money;
mod types;

pub use money::Money;
pub use types::{CommentId, OrderId, OrderItemId, PostId, ProductId, TagId, UserId};
