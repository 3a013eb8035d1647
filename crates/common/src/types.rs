use serde::{Deserialize, Serialize};

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wraps a raw database id.
            pub fn new(id: i64) -> Self {
                Self(id)
            }

            /// Returns the raw database id.
            pub fn as_i64(&self) -> i64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

row_id!(
    /// Identifier of a row in `users`. Users double as credit accounts.
    UserId
);
row_id!(
    /// Identifier of a row in `products`.
    ProductId
);
row_id!(
    /// Identifier of an order header.
    OrderId
);
row_id!(
    /// Identifier of an order line.
    OrderItemId
);
row_id!(
    /// Identifier of a row in `posts`.
    PostId
);
row_id!(
    /// Identifier of a row in `comments`.
    CommentId
);
row_id!(
    /// Identifier of a row in `tags`.
    TagId
);
