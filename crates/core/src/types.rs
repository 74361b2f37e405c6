//! Identifier types for the DXL layer
//!
//! This module defines the foundational identifiers:
//! - SessionId: identity of one caller / logical unit of work
//! - TableId, IndexId, GroupId: schema object identifiers
//! - TableName: schema-qualified name
//! - CursorId: (session, global counter, table) triple, never reused

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a raw id
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Allocate the next process-unique id
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Table identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub u32);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index identifier, unique across the schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexId(pub u32);

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Group identifier
///
/// A group is a hierarchy of tables rooted at one table and sharing storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Schema-qualified table (or group) name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName {
    /// Schema name
    pub schema: String,
    /// Table name within the schema
    pub table: String,
}

impl TableName {
    /// Create a new table name
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Opaque cursor identifier
///
/// The counter component comes from a service-wide monotonically increasing
/// sequence, so ids are never reused even across sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CursorId {
    session: SessionId,
    counter: u64,
    table: TableId,
}

impl CursorId {
    /// Create a cursor id
    pub fn new(session: SessionId, counter: u64, table: TableId) -> Self {
        Self {
            session,
            counter,
            table,
        }
    }

    /// Owning session
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Global counter value
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Scanned table
    pub fn table_id(&self) -> TableId {
        self.table
    }
}

impl fmt::Display for CursorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@t{}", self.session, self.counter, self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_cursor_id_accessors() {
        let id = CursorId::new(SessionId::new(9), 42, TableId(5));
        assert_eq!(id.session(), SessionId::new(9));
        assert_eq!(id.counter(), 42);
        assert_eq!(id.table_id(), TableId(5));
        assert_eq!(id.to_string(), "s9#42@t5");
    }

    #[test]
    fn test_table_name_display() {
        assert_eq!(TableName::new("test", "customers").to_string(), "test.customers");
    }
}
