//! Transactional workflows over the persistence gateway.
//!
//! - [`OrderWorkflow`] creates an order and adds each item inside its own
//!   savepoint, accepting partial success but never an empty order.
//! - [`CreditTransfer`] moves credits between two locked accounts in one
//!   transaction.
//!
//! Both take an optional timeout; on expiry the in-flight transaction is
//! dropped and rolled back.

pub mod error;
pub mod order;
pub mod transfer;

pub use error::{ErrorKind, ItemError, Result, WorkflowError};
pub use order::{ItemRequest, OrderReceipt, OrderWithItems, OrderWorkflow, RejectedItem};
pub use transfer::{CreditTransfer, TransferReceipt};
