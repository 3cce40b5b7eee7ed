//! Domain identifiers (strongly-typed IDs).
//!
//! IDs are ULIDs wrapped in a phantom-typed `Id<T>`, so an `OperationId`
//! can never be passed where a `ManagerId` is expected. The marker type costs
//! nothing at runtime.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait for each ID kind.
///
/// Supplies the prefix used by `Display` ("op-", "manager-").
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed identifier.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// Generate a fresh ID from the wall clock and random bits.
    pub fn generate() -> Self {
        let timestamp_ms = Utc::now().timestamp_millis() as u64;
        Self::from_ulid(Ulid::from_parts(timestamp_ms, rand::random()))
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Marker for operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Op {}

impl IdMarker for Op {
    fn prefix() -> &'static str {
        "op-"
    }
}

/// Marker for queue managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Manager {}

impl IdMarker for Manager {
    fn prefix() -> &'static str {
        "manager-"
    }
}

/// Identifier of an operation (one schedulable unit of work).
pub type OperationId = Id<Op>;

/// Identifier of a queue manager. Used as the subscriber key for
/// terminal-state hooks.
pub type ManagerId = Id<Manager>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_prefix() {
        let op = OperationId::generate();
        let manager = ManagerId::generate();

        assert!(op.to_string().starts_with("op-"));
        assert!(manager.to_string().starts_with("manager-"));
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = OperationId::generate();
        let b = OperationId::generate();
        let c = OperationId::generate();

        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn ids_are_sortable_by_creation_time() {
        let id1 = OperationId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = OperationId::generate();

        assert!(id1 < id2);
    }

    #[test]
    fn from_trait_works() {
        let ulid = Ulid::new();
        let op: OperationId = ulid.into();
        assert_eq!(op.as_ulid(), ulid);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<OperationId>(), size_of::<Ulid>());
        assert_eq!(size_of::<ManagerId>(), 16);
    }
}
