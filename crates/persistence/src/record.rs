//! Row mapping shared by both back ends.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Postgres, QueryBuilder};

use crate::StoreError;
use crate::memory::MemoryTables;

/// Tables known to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Users,
    AuditLogs,
    Products,
    Orders,
    OrderItems,
    Posts,
    Comments,
    Tags,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Users => "users",
            Table::AuditLogs => "audit_logs",
            Table::Products => "products",
            Table::Orders => "orders",
            Table::OrderItems => "order_items",
            Table::Posts => "posts",
            Table::Comments => "comments",
            Table::Tags => "tags",
        }
    }

    /// Tables whose rows carry `deleted_at` and are hidden once it is set.
    pub fn soft_deletes(&self) -> bool {
        matches!(self, Table::Users | Table::Posts | Table::Comments)
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted row.
///
/// Implementations map the row to and from PostgreSQL and expose their
/// integer columns by name so the in-memory back end can evaluate filters
/// and counter updates the same way the SQL does.
pub trait Record: Clone + Send + Sync + Unpin + 'static {
    const TABLE: Table;

    fn id(&self) -> i64;

    /// False once the row has been soft-deleted.
    fn is_live(&self) -> bool {
        true
    }

    /// Reads an integer column; `None` for unknown or non-integer columns.
    fn int_column(&self, column: &str) -> Option<i64>;

    /// Writes an integer column. Returns false for unknown columns.
    fn set_int_column(&mut self, column: &str, value: i64) -> bool;

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error>;

    #[doc(hidden)]
    fn rows(tables: &MemoryTables) -> &BTreeMap<i64, Self>;

    #[doc(hidden)]
    fn rows_mut(tables: &mut MemoryTables) -> &mut BTreeMap<i64, Self>;
}

/// Values for a row that has not been inserted yet.
pub trait Insert: Send + Sync + 'static {
    type Output: Record;

    /// Columns written by [`Insert::push_values`], in the same order.
    const COLUMNS: &'static [&'static str];

    fn push_values(&self, query: &mut QueryBuilder<'static, Postgres>);

    /// Rows this one points at through a foreign key.
    fn references(&self) -> Vec<Reference> {
        Vec::new()
    }

    /// Builds the stored row once the store has assigned an id.
    fn into_record(self, id: i64, now: DateTime<Utc>) -> Self::Output;
}

/// A foreign key held by a row that is about to be inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    /// Name of the schema constraint enforcing the key.
    pub constraint: &'static str,
    pub table: Table,
    pub id: i64,
}

impl Reference {
    pub fn new(constraint: &'static str, table: Table, id: impl Into<i64>) -> Self {
        Self {
            constraint,
            table,
            id: id.into(),
        }
    }

    /// The error reported when the referenced row is absent.
    pub fn missing(&self) -> StoreError {
        StoreError::not_found(self.table, self.id)
    }
}

/// Maps a foreign-key violation raised by PostgreSQL to `NotFound` for the
/// reference whose constraint it names.
pub(crate) fn missing_reference(references: &[Reference], err: &sqlx::Error) -> Option<StoreError> {
    let sqlx::Error::Database(db_err) = err else {
        return None;
    };
    if !db_err.is_foreign_key_violation() {
        return None;
    }
    let constraint = db_err.constraint()?;
    references
        .iter()
        .find(|r| r.constraint == constraint)
        .map(Reference::missing)
}

/// Equality conditions on integer columns, joined with `AND`.
///
/// Soft-deleted rows never match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    conditions: Vec<(&'static str, i64)>,
}

impl Filter {
    /// A filter matching every live row.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &'static str, value: impl Into<i64>) -> Self {
        self.conditions.push((column, value.into()));
        self
    }

    pub fn conditions(&self) -> &[(&'static str, i64)] {
        &self.conditions
    }

    pub fn matches<R: Record>(&self, record: &R) -> bool {
        record.is_live()
            && self
                .conditions
                .iter()
                .all(|(column, value)| record.int_column(column) == Some(*value))
    }

    pub(crate) fn push_where(&self, table: Table, query: &mut QueryBuilder<'static, Postgres>) {
        query.push(" WHERE TRUE");
        for (column, value) in &self.conditions {
            query.push(format!(" AND {column} = ")).push_bind(*value);
        }
        if table.soft_deletes() {
            query.push(" AND deleted_at IS NULL");
        }
    }
}

/// Converts a value read from an `i64` column into a narrower type.
pub(crate) fn narrow<T: TryFrom<i64>>(column: &str, value: i64) -> Result<T, sqlx::Error>
where
    T::Error: std::error::Error + Send + Sync + 'static,
{
    T::try_from(value).map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_match_schema() {
        assert_eq!(Table::OrderItems.to_string(), "order_items");
        assert_eq!(Table::Users.as_str(), "users");
        assert!(Table::Users.soft_deletes());
        assert!(!Table::Products.soft_deletes());
        assert!(Table::Comments.soft_deletes());
        assert!(!Table::Tags.soft_deletes());
    }

    #[test]
    fn filter_builds_conditions_in_order() {
        let filter = Filter::all().eq("order_id", 5).eq("product_id", 8);
        assert_eq!(filter.conditions(), &[("order_id", 5), ("product_id", 8)]);
    }

    #[test]
    fn narrow_rejects_out_of_range_values() {
        assert_eq!(narrow::<u32>("quantity", 12).unwrap(), 12);
        assert!(narrow::<u32>("quantity", -1).is_err());
    }
}
