//! Object catalog.
//!
//! Per-context table of live verbs objects indexed by kernel-assigned
//! handle, consulted during restore to resolve cross-object references
//! (an MR's `pd_handle`, a QP's `pd_handle`/`scq_handle`/`rcq_handle`).
//! Handles are dense small integers bounded by a ceiling, matching the
//! `ELEM_COUNT` table in the original source; this implementation grows
//! the ceiling at construction time instead of hard-coding it.

use crate::error::CrError;
use crate::model::ObjectKind;
use std::sync::Arc;

/// Default handle ceiling, matching `ELEM_COUNT` in the original source.
pub const DEFAULT_CEILING: usize = 10;

/// One slot table per [`ObjectKind`], indexed by handle.
pub struct Catalog<T> {
    tables: [Vec<Option<Arc<T>>>; 4],
    ceiling: usize,
}

impl<T> Catalog<T> {
    pub fn new() -> Self {
        Self::with_ceiling(DEFAULT_CEILING)
    }

    pub fn with_ceiling(ceiling: usize) -> Self {
        Catalog {
            tables: [
                (0..ceiling).map(|_| None).collect(),
                (0..ceiling).map(|_| None).collect(),
                (0..ceiling).map(|_| None).collect(),
                (0..ceiling).map(|_| None).collect(),
            ],
            ceiling,
        }
    }

    fn table(&self, kind: ObjectKind) -> &[Option<Arc<T>>] {
        &self.tables[kind as usize]
    }

    fn table_mut(&mut self, kind: ObjectKind) -> &mut [Option<Arc<T>>] {
        &mut self.tables[kind as usize]
    }

    /// Record a live object at `(kind, handle)`. Fails if the slot is
    /// already occupied or the handle exceeds the ceiling.
    pub fn remember(&mut self, kind: ObjectKind, handle: u32, object: T) -> Result<Arc<T>, CrError> {
        let idx = handle as usize;
        if idx >= self.ceiling {
            return Err(CrError::CatalogClash {
                kind,
                handle,
                reason: "handle exceeds catalog ceiling",
            });
        }
        if self.table(kind)[idx].is_some() {
            return Err(CrError::CatalogClash {
                kind,
                handle,
                reason: "handle already occupied",
            });
        }
        let arc = Arc::new(object);
        self.table_mut(kind)[idx] = Some(Arc::clone(&arc));
        Ok(arc)
    }

    /// Resolve a previously remembered object, or `None` if absent or out
    /// of range (unlike the original C `ibverbs_get_object`, the
    /// out-of-range case is checked here rather than read out of bounds).
    pub fn lookup(&self, kind: ObjectKind, handle: u32) -> Option<Arc<T>> {
        let idx = handle as usize;
        self.table(kind).get(idx).and_then(|slot| slot.clone())
    }

    pub fn contains(&self, kind: ObjectKind, handle: u32) -> bool {
        self.lookup(kind, handle).is_some()
    }
}

impl<T> Default for Catalog<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remember_then_lookup_round_trips() {
        let mut cat: Catalog<&'static str> = Catalog::new();
        cat.remember(ObjectKind::Pd, 0, "pd0").unwrap();
        assert_eq!(cat.lookup(ObjectKind::Pd, 0).map(|a| *a), Some("pd0"));
        assert!(cat.lookup(ObjectKind::Mr, 0).is_none());
    }

    #[test]
    fn remember_rejects_duplicate_handle() {
        let mut cat: Catalog<u32> = Catalog::new();
        cat.remember(ObjectKind::Qp, 3, 1).unwrap();
        let err = cat.remember(ObjectKind::Qp, 3, 2).unwrap_err();
        assert!(matches!(err, CrError::CatalogClash { .. }));
    }

    #[test]
    fn remember_rejects_handle_past_ceiling() {
        let mut cat: Catalog<u32> = Catalog::with_ceiling(4);
        let err = cat.remember(ObjectKind::Cq, 10, 1).unwrap_err();
        assert!(matches!(err, CrError::CatalogClash { .. }));
    }
}
