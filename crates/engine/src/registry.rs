//! Cursor registry
//!
//! Open cursors are kept in a `DashMap` keyed by [`CursorId`]. Iteration is
//! weakly consistent: cursors registered or removed by other sessions during
//! an invalidation pass may or may not be visited.
//!
//! Cursor ids embed the owning session; lookups from any other session
//! behave as if the cursor did not exist.

use crate::cursor::ScanData;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_core::row::{ColumnSelector, NewRow};
use strata_core::schema::{Ais, Table};
use strata_core::types::{CursorId, GroupId, SessionId, TableId};
use tracing::debug;

/// Process-wide cursor counter; ids are never reused
static CURSOR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Open cursors of one service instance
#[derive(Debug, Default)]
pub struct CursorRegistry {
    cursors: DashMap<CursorId, Arc<ScanData>>,
}

impl CursorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh id
    pub fn next_id(&self, session: SessionId, table: TableId) -> CursorId {
        let counter = CURSOR_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
        CursorId::new(session, counter, table)
    }

    /// Register an entry; returns the entry it replaced, if any
    pub fn insert(&self, data: Arc<ScanData>) -> Option<Arc<ScanData>> {
        self.cursors.insert(data.id(), data)
    }

    /// Entry owned by `session`
    pub fn get(&self, session: SessionId, id: CursorId) -> Option<Arc<ScanData>> {
        if id.session() != session {
            return None;
        }
        self.cursors.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove the entry owned by `session`
    pub fn remove(&self, session: SessionId, id: CursorId) -> Option<Arc<ScanData>> {
        if id.session() != session {
            return None;
        }
        self.cursors.remove(&id).map(|(_, data)| data)
    }

    /// Ids of the session's cursors, oldest first
    pub fn ids_for_session(&self, session: SessionId) -> Vec<CursorId> {
        let mut ids: Vec<CursorId> = self
            .cursors
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| id.session() == session)
            .collect();
        ids.sort_by_key(|id| id.counter());
        ids
    }

    /// Number of open cursors
    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    /// No open cursors
    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    fn mark_ddl(&self, matches: impl Fn(&ScanData) -> bool) -> usize {
        let mut marked = 0;
        for entry in self.cursors.iter() {
            let data = entry.value();
            if matches(data) && data.cursor().set_ddl_modified() {
                debug!(target: "strata::cursor", cursor = %data.id(), "marked DDL modification");
                marked += 1;
            }
        }
        marked
    }

    /// Invalidate cursors scanning `table` after a definition change
    pub fn mark_ddl_table(&self, table: TableId) -> usize {
        self.mark_ddl(|data| data.id().table_id() == table)
    }

    /// Invalidate cursors scanning any table of `group`
    pub fn mark_ddl_group(&self, group: GroupId) -> usize {
        self.mark_ddl(|data| data.group() == group)
    }

    /// Invalidate cursors affected by a row update
    ///
    /// When the update changes the row's hKey, every cursor scanning the
    /// table or one of its descendants is marked. Otherwise only cursors on
    /// the table whose index columns changed, were selected by the update,
    /// and are among the requested columns are marked.
    pub fn mark_updated(
        &self,
        ais: &Ais,
        table: &Table,
        old: &NewRow,
        new: &NewRow,
        selector: &ColumnSelector,
    ) -> usize {
        let changed = |p: usize| selector.includes(p) && old.get(p) != new.get(p);
        let hkey_modified = table.hkey_positions().into_iter().any(changed);

        let mut marked = 0;
        for entry in self.cursors.iter() {
            let data = entry.value();
            let scanned = data.id().table_id();
            let hit = if hkey_modified {
                ais.ancestry(scanned).contains(&table.id)
            } else if scanned == table.id {
                let columns = data.scan_columns(table.column_count());
                data.index_positions()
                    .iter()
                    .any(|p| changed(*p) && columns.contains(*p))
            } else {
                false
            };
            if hit && data.cursor().set_scan_modified() {
                debug!(target: "strata::cursor", cursor = %data.id(), hkey_modified, "marked concurrent modification");
                marked += 1;
            }
        }
        marked
    }

    /// Close and remove every cursor
    pub fn close_all(&self) -> usize {
        let ids: Vec<CursorId> = self.cursors.iter().map(|entry| *entry.key()).collect();
        let mut closed = 0;
        for id in ids {
            if let Some((_, data)) = self.cursors.remove(&id) {
                data.cursor().close();
                closed += 1;
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{Cursor, CursorState};
    use std::collections::BTreeMap;
    use strata_core::error::Result;
    use strata_core::row::ColumnSet;
    use strata_core::scan::{ColumnRequest, MessageBuffer, ScanRequest};
    use strata_core::schema::{Column, Group, Index, IndexColumn, IndexScope, Join, JoinColumn};
    use strata_core::traits::RowCollector;
    use strata_core::types::{IndexId, TableName};
    use strata_core::value::Value;

    struct Empty(TableId);

    impl RowCollector for Empty {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }
        fn has_more(&self) -> bool {
            false
        }
        fn collect_next_row(&mut self) -> Result<Option<NewRow>> {
            Ok(None)
        }
        fn collect_next_row_into(&mut self, _buffer: &mut MessageBuffer) -> Result<bool> {
            Ok(false)
        }
        fn checks_limit(&self) -> bool {
            false
        }
        fn table_id(&self) -> TableId {
            self.0
        }
        fn index_id(&self) -> Option<IndexId> {
            None
        }
        fn close(&mut self) {}
    }

    fn table(id: u32, parent: Option<u32>) -> Table {
        let t = TableId(id);
        Table {
            id: t,
            name: TableName::new("s", format!("t{}", id)),
            columns: (0..3)
                .map(|position| Column {
                    name: format!("c{}", position),
                    position,
                    nullable: position != 0,
                })
                .collect(),
            indexes: vec![
                Index {
                    id: IndexId(id * 10),
                    name: "PRIMARY".to_string(),
                    scope: IndexScope::Table(t),
                    columns: vec![IndexColumn { table: t, position: 0 }],
                    unique: true,
                    primary: true,
                },
                Index {
                    id: IndexId(id * 10 + 1),
                    name: "c2".to_string(),
                    scope: IndexScope::Table(t),
                    columns: vec![IndexColumn { table: t, position: 2 }],
                    unique: false,
                    primary: false,
                },
            ],
            parent: parent.map(|p| Join {
                parent: TableId(p),
                columns: vec![JoinColumn { child: 1, parent: 0 }],
            }),
            children: Vec::new(),
            group: GroupId(1),
        }
    }

    fn ais() -> Ais {
        let mut tables = BTreeMap::new();
        tables.insert(TableId(1), table(1, None));
        tables.insert(TableId(2), table(2, Some(1)));
        tables.insert(TableId(3), table(3, None));
        let mut groups = BTreeMap::new();
        groups.insert(
            GroupId(1),
            Group {
                id: GroupId(1),
                name: TableName::new("s", "t1"),
                root: TableId(1),
                indexes: Vec::new(),
            },
        );
        Ais::new(1, tables, groups)
    }

    fn open(reg: &CursorRegistry, table: u32, group: u32, index_positions: Vec<usize>, columns: ColumnRequest) -> CursorId {
        let t = TableId(table);
        let id = reg.next_id(SessionId::new(1), t);
        let request = ScanRequest::new(t).with_columns(columns);
        let data = ScanData::new(
            id,
            Cursor::new(Box::new(Empty(t)), request),
            1,
            GroupId(group),
            index_positions,
        );
        reg.insert(Arc::new(data));
        id
    }

    fn state(reg: &CursorRegistry, id: CursorId) -> CursorState {
        reg.get(id.session(), id).unwrap().cursor().state()
    }

    fn row(t: u32, values: [i64; 3]) -> NewRow {
        NewRow::from_values(TableId(t), values.iter().map(|v| Value::Int(*v)).collect())
    }

    #[test]
    fn test_ids_unique_and_owned() {
        let reg = CursorRegistry::new();
        let a = open(&reg, 1, 1, vec![0], ColumnRequest::All);
        let b = open(&reg, 1, 1, vec![0], ColumnRequest::All);
        assert_ne!(a, b);
        assert!(reg.get(SessionId::new(2), a).is_none());
        assert!(reg.remove(SessionId::new(2), a).is_none());
        assert_eq!(reg.ids_for_session(SessionId::new(1)), vec![a, b]);
        assert!(reg.ids_for_session(SessionId::new(2)).is_empty());
    }

    #[test]
    fn test_ddl_marks_table_and_group() {
        let reg = CursorRegistry::new();
        let a = open(&reg, 1, 1, vec![0], ColumnRequest::All);
        let b = open(&reg, 2, 1, vec![0], ColumnRequest::All);
        let c = open(&reg, 3, 3, vec![0], ColumnRequest::All);
        assert_eq!(reg.mark_ddl_table(TableId(2)), 1);
        assert_eq!(state(&reg, b), CursorState::DdlModification);
        assert_eq!(state(&reg, a), CursorState::Fresh);

        assert_eq!(reg.mark_ddl_group(GroupId(1)), 1);
        assert_eq!(state(&reg, a), CursorState::DdlModification);
        assert_eq!(state(&reg, c), CursorState::Fresh);
    }

    #[test]
    fn test_hkey_update_marks_descendant_scans() {
        let ais = ais();
        let reg = CursorRegistry::new();
        let parent_scan = open(&reg, 1, 1, vec![0], ColumnRequest::All);
        let child_scan = open(&reg, 2, 1, vec![0], ColumnRequest::All);
        let other = open(&reg, 3, 3, vec![0], ColumnRequest::All);

        let t1 = ais.table(TableId(1)).unwrap();
        let marked = reg.mark_updated(&ais, t1, &row(1, [1, 0, 0]), &row(1, [9, 0, 0]), &ColumnSelector::All);
        assert_eq!(marked, 2);
        assert_eq!(state(&reg, parent_scan), CursorState::ConcurrentModification);
        assert_eq!(state(&reg, child_scan), CursorState::ConcurrentModification);
        assert_eq!(state(&reg, other), CursorState::Fresh);
    }

    #[test]
    fn test_child_hkey_update_leaves_parent_scan() {
        let ais = ais();
        let reg = CursorRegistry::new();
        let parent_scan = open(&reg, 1, 1, vec![0], ColumnRequest::All);
        let t2 = ais.table(TableId(2)).unwrap();
        // Column 1 is the join column, part of the child's hKey
        reg.mark_updated(&ais, t2, &row(2, [1, 1, 0]), &row(2, [1, 2, 0]), &ColumnSelector::All);
        assert_eq!(state(&reg, parent_scan), CursorState::Fresh);
    }

    #[test]
    fn test_index_column_update_needs_selector_and_request() {
        let ais = ais();
        let t1 = ais.table(TableId(1)).unwrap();
        let reg = CursorRegistry::new();
        let with_col = open(&reg, 1, 1, vec![2], ColumnRequest::columns(&[0, 2]));
        let without_col = open(&reg, 1, 1, vec![2], ColumnRequest::columns(&[0, 1]));
        let on_pk = open(&reg, 1, 1, vec![0], ColumnRequest::All);

        let not_selected = ColumnSelector::Columns([1usize].into_iter().collect::<ColumnSet>());
        assert_eq!(
            reg.mark_updated(&ais, t1, &row(1, [1, 0, 0]), &row(1, [1, 5, 5]), &not_selected),
            0
        );

        let marked = reg.mark_updated(&ais, t1, &row(1, [1, 0, 0]), &row(1, [1, 0, 5]), &ColumnSelector::All);
        assert_eq!(marked, 1);
        assert_eq!(state(&reg, with_col), CursorState::ConcurrentModification);
        assert_eq!(state(&reg, without_col), CursorState::Fresh);
        assert_eq!(state(&reg, on_pk), CursorState::Fresh);
    }

    #[test]
    fn test_close_all() {
        let reg = CursorRegistry::new();
        let a = open(&reg, 1, 1, vec![0], ColumnRequest::All);
        let data = reg.get(a.session(), a).unwrap();
        open(&reg, 2, 1, vec![0], ColumnRequest::All);
        assert_eq!(reg.close_all(), 2);
        assert!(reg.is_empty());
        assert!(data.cursor().is_closed());
    }
}
