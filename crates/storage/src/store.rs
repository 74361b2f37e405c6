//! In-memory row store
//!
//! Rows live in one ordered map per table, keyed by primary key values.
//! Tables without a primary key get a hidden counter key. Index order is
//! computed when a collector is created rather than kept in separate trees.
//!
//! Row changes made inside a transaction register undo actions with the
//! [`MemoryTransactionService`], so a rollback restores the maps.

use crate::collector::MemoryRowCollector;
use crate::transaction::MemoryTransactionService;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use strata_core::error::{DxlError, Result};
use strata_core::row::{ColumnSelector, NewRow};
use strata_core::scan::{check_bitmap, ScanBound, ScanRequest};
use strata_core::schema::{Ais, Index, Table};
use strata_core::session::Session;
use strata_core::traits::{RowCollector, Store};
use strata_core::types::{GroupId, IndexId, TableId};
use strata_core::value::Value;
use tracing::{debug, trace};

type Rows = BTreeMap<Vec<Value>, NewRow>;
type TableMap = FxHashMap<TableId, Rows>;

/// Counters for tests and diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// `truncate_group` calls
    pub truncate_group_calls: u64,
    /// Rows removed by `delete_row`
    pub row_deletes: u64,
    /// Collectors created
    pub collectors: u64,
}

/// Row store keeping every table in memory
#[derive(Debug)]
pub struct MemoryStore {
    data: Arc<RwLock<TableMap>>,
    txn: Arc<MemoryTransactionService>,
    hidden_key: AtomicI64,
    scan_rollback: Mutex<Option<(TableId, usize)>>,
    truncate_group_calls: AtomicU64,
    row_deletes: AtomicU64,
    collectors: AtomicU64,
}

fn check_row(table: &Table, row: &NewRow) -> Result<()> {
    if row.len() != table.column_count() {
        return Err(DxlError::TableDefinitionMismatch {
            table: table.id,
            reason: format!("row has {} columns, table has {}", row.len(), table.column_count()),
        });
    }
    if let Some(col) = table
        .columns
        .iter()
        .find(|c| !c.nullable && row.get(c.position).is_null())
    {
        return Err(DxlError::TableDefinitionMismatch {
            table: table.id,
            reason: format!("column {} is not nullable", col.name),
        });
    }
    Ok(())
}

fn unique_indexes(table: &Table) -> impl Iterator<Item = &Index> {
    table.indexes.iter().filter(|i| i.unique && !i.primary)
}

/// Check unique secondary indexes; keys containing NULL never conflict
fn check_unique(table: &Table, rows: &Rows, row: &NewRow, skip: Option<&Vec<Value>>) -> Result<()> {
    for index in unique_indexes(table) {
        let positions: Vec<usize> = index.positions_for(table.id).collect();
        let key = row.key(&positions);
        if key.iter().any(Value::is_null) {
            continue;
        }
        let clash = rows
            .iter()
            .any(|(k, existing)| Some(k) != skip && existing.key(&positions) == key);
        if clash {
            return Err(DxlError::DuplicateKey {
                table: table.id,
                index: index.id,
            });
        }
    }
    Ok(())
}

/// Whether `row` lies on the correct side of `bound`
///
/// The bound applies to the leading index positions it selects.
fn within(row: &NewRow, bound: Option<&ScanBound>, order: &[usize], lower: bool) -> bool {
    let Some(bound) = bound else {
        return true;
    };
    let positions: Vec<usize> = order
        .iter()
        .copied()
        .take_while(|p| bound.columns.contains(*p))
        .collect();
    if positions.is_empty() {
        return true;
    }
    let ord = row.key(&positions).cmp(&bound.row.key(&positions));
    match (lower, bound.inclusive) {
        (true, true) => ord != CmpOrdering::Less,
        (true, false) => ord == CmpOrdering::Greater,
        (false, true) => ord != CmpOrdering::Greater,
        (false, false) => ord == CmpOrdering::Less,
    }
}

impl MemoryStore {
    /// Empty store recording undo actions with `txn`
    pub fn new(txn: Arc<MemoryTransactionService>) -> Self {
        Self {
            data: Arc::new(RwLock::new(TableMap::default())),
            txn,
            hidden_key: AtomicI64::new(1),
            scan_rollback: Mutex::new(None),
            truncate_group_calls: AtomicU64::new(0),
            row_deletes: AtomicU64::new(0),
            collectors: AtomicU64::new(0),
        }
    }

    /// Make the next collector on `table` fail with a rollback after `rows` rows
    pub fn inject_scan_rollback(&self, table: TableId, rows: usize) {
        *self.scan_rollback.lock() = Some((table, rows));
    }

    /// Counters
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            truncate_group_calls: self.truncate_group_calls.load(Ordering::Relaxed),
            row_deletes: self.row_deletes.load(Ordering::Relaxed),
            collectors: self.collectors.load(Ordering::Relaxed),
        }
    }

    /// Every row of a table in primary key order
    pub fn rows(&self, table: TableId) -> Vec<NewRow> {
        self.data
            .read()
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    fn key_of(&self, table: &Table, row: &NewRow) -> Vec<Value> {
        let pk = table.primary_key_positions();
        if pk.is_empty() {
            vec![Value::Int(self.hidden_key.fetch_add(1, Ordering::Relaxed))]
        } else {
            row.key(&pk)
        }
    }

    /// Stored key of an existing row
    fn find_key(table: &Table, rows: &Rows, row: &NewRow) -> Option<Vec<Value>> {
        let pk = table.primary_key_positions();
        if pk.is_empty() {
            rows.iter().find(|(_, r)| *r == row).map(|(k, _)| k.clone())
        } else {
            let key = row.key(&pk);
            rows.contains_key(&key).then_some(key)
        }
    }

    fn record_undo(&self, session: &Session, undo: impl FnOnce(&mut TableMap) + Send + Sync + 'static) {
        let data = Arc::clone(&self.data);
        self.txn
            .record_undo(session.id(), Box::new(move || undo(&mut data.write())));
    }

    fn index_order(ais: &Ais, table: &Table, index: Option<IndexId>) -> Result<Vec<usize>> {
        let Some(id) = index else {
            return Ok(table.primary_key_positions());
        };
        let index = table
            .index(id)
            .or_else(|| {
                ais.group(table.group)
                    .and_then(|g| g.indexes.iter().find(|i| i.id == id))
            })
            .ok_or_else(|| DxlError::NoSuchIndex {
                index: id.to_string(),
            })?;
        Ok(index.positions_for(table.id).collect())
    }
}

impl Store for MemoryStore {
    fn new_row_collector(
        &self,
        session: &Session,
        ais: &Ais,
        request: &ScanRequest,
    ) -> Result<Box<dyn RowCollector>> {
        let table = ais.table(request.table_id()).ok_or_else(|| DxlError::NoSuchTable {
            table: request.table_id().to_string(),
        })?;
        let order = Self::index_order(ais, table, request.index_id())?;
        let pk = table.primary_key_positions();
        let columns = request.columns().resolve(table.column_count());
        check_bitmap(table.id, &columns, table.column_count())?;

        let mut rows: Vec<NewRow> = self.rows(table.id);
        rows.sort_by(|a, b| {
            a.key(&order)
                .cmp(&b.key(&order))
                .then_with(|| a.key(&pk).cmp(&b.key(&pk)))
        });
        rows.retain(|r| within(r, request.start(), &order, true) && within(r, request.end(), &order, false));
        if request.is_descending() {
            rows.reverse();
        }
        let native_limit = request.limit().row_count_limit();
        if let Some(n) = native_limit {
            rows.truncate(usize::try_from(n).unwrap_or(usize::MAX));
        }
        let rows: Vec<NewRow> = rows.iter().map(|r| r.project(&columns)).collect();

        trace!(target: "strata::store", session = %session.id(), table = %table.id, rows = rows.len(), "new collector");
        self.collectors.fetch_add(1, Ordering::Relaxed);
        let mut collector = MemoryRowCollector::new(table.id, request.index_id(), rows, native_limit.is_some());

        let mut armed = self.scan_rollback.lock();
        if let Some((t, after)) = *armed {
            if t == table.id {
                collector = collector.fail_after(after);
                *armed = None;
            }
        }
        Ok(Box::new(collector))
    }

    fn write_row(&self, session: &Session, table: &Table, row: &NewRow) -> Result<()> {
        check_row(table, row)?;
        let key = self.key_of(table, row);
        {
            let mut data = self.data.write();
            let rows = data.entry(table.id).or_default();
            if rows.contains_key(&key) {
                return Err(DxlError::DuplicateKey {
                    table: table.id,
                    index: table.primary_key().map_or(IndexId(0), |i| i.id),
                });
            }
            check_unique(table, rows, row, None)?;
            rows.insert(key.clone(), row.clone());
        }
        let table_id = table.id;
        self.record_undo(session, move |data| {
            if let Some(rows) = data.get_mut(&table_id) {
                rows.remove(&key);
            }
        });
        Ok(())
    }

    fn update_row(
        &self,
        session: &Session,
        table: &Table,
        old: &NewRow,
        new: &NewRow,
        selector: &ColumnSelector,
    ) -> Result<()> {
        let (old_key, previous, new_key) = {
            let mut data = self.data.write();
            let rows = data.entry(table.id).or_default();
            let old_key = Self::find_key(table, rows, old).ok_or(DxlError::NoSuchRow { table: table.id })?;
            let previous = rows
                .get(&old_key)
                .cloned()
                .ok_or(DxlError::NoSuchRow { table: table.id })?;

            let mut merged = previous.clone();
            for position in 0..table.column_count() {
                if selector.includes(position) {
                    merged.put(position, new.get(position).clone());
                }
            }
            check_row(table, &merged)?;

            let pk = table.primary_key_positions();
            let new_key = if pk.is_empty() { old_key.clone() } else { merged.key(&pk) };
            if new_key != old_key && rows.contains_key(&new_key) {
                return Err(DxlError::DuplicateKey {
                    table: table.id,
                    index: table.primary_key().map_or(IndexId(0), |i| i.id),
                });
            }
            check_unique(table, rows, &merged, Some(&old_key))?;
            rows.remove(&old_key);
            rows.insert(new_key.clone(), merged);
            (old_key, previous, new_key)
        };
        let table_id = table.id;
        self.record_undo(session, move |data| {
            if let Some(rows) = data.get_mut(&table_id) {
                rows.remove(&new_key);
                rows.insert(old_key, previous);
            }
        });
        Ok(())
    }

    fn delete_row(&self, session: &Session, table: &Table, row: &NewRow) -> Result<()> {
        let (key, removed) = {
            let mut data = self.data.write();
            let rows = data.get_mut(&table.id).ok_or(DxlError::NoSuchRow { table: table.id })?;
            let key = Self::find_key(table, rows, row).ok_or(DxlError::NoSuchRow { table: table.id })?;
            let removed = rows.remove(&key).ok_or(DxlError::NoSuchRow { table: table.id })?;
            (key, removed)
        };
        self.row_deletes.fetch_add(1, Ordering::Relaxed);
        let table_id = table.id;
        self.record_undo(session, move |data| {
            data.entry(table_id).or_default().insert(key, removed);
        });
        Ok(())
    }

    fn build_indexes(&self, _session: &Session, ais: &Ais, indexes: &[IndexId]) -> Result<()> {
        let data = self.data.read();
        for id in indexes {
            let index = ais.index(*id).ok_or_else(|| DxlError::NoSuchIndex {
                index: id.to_string(),
            })?;
            let Some(table) = index.leaf_most_table().and_then(|t| ais.table(t)) else {
                continue;
            };
            if !index.unique {
                continue;
            }
            let positions: Vec<usize> = index.positions_for(table.id).collect();
            let mut seen = std::collections::HashSet::new();
            for row in data.get(&table.id).into_iter().flat_map(|r| r.values()) {
                let key = row.key(&positions);
                if !key.iter().any(Value::is_null) && !seen.insert(key) {
                    return Err(DxlError::DuplicateKey {
                        table: table.id,
                        index: index.id,
                    });
                }
            }
        }
        debug!(target: "strata::store", count = indexes.len(), "built indexes");
        Ok(())
    }

    fn delete_indexes(&self, _session: &Session, indexes: &[IndexId]) -> Result<()> {
        // Index order is derived at scan time; nothing is stored per index
        debug!(target: "strata::store", count = indexes.len(), "deleted indexes");
        Ok(())
    }

    fn remove_trees(&self, _session: &Session, tables: &[TableId]) -> Result<()> {
        let mut data = self.data.write();
        for t in tables {
            data.remove(t);
        }
        debug!(target: "strata::store", ?tables, "removed trees");
        Ok(())
    }

    fn truncate_group(&self, session: &Session, ais: &Ais, group: GroupId) -> Result<()> {
        let removed: Vec<(TableId, Rows)> = {
            let mut data = self.data.write();
            ais.group_tables(group)
                .filter_map(|t| data.remove(&t.id).map(|rows| (t.id, rows)))
                .collect()
        };
        self.truncate_group_calls.fetch_add(1, Ordering::Relaxed);
        debug!(target: "strata::store", %group, tables = removed.len(), "truncated group");
        self.record_undo(session, move |data| {
            for (t, rows) in removed {
                data.insert(t, rows);
            }
        });
        Ok(())
    }

    fn alter_table_rows(&self, _session: &Session, old: &Table, new: &Table) -> Result<()> {
        let mut data = self.data.write();
        let Some(rows) = data.get(&old.id) else {
            return Ok(());
        };
        let mapping: Vec<Option<usize>> = new
            .columns
            .iter()
            .map(|c| old.column(&c.name).map(|oc| oc.position))
            .collect();

        let mut rebuilt = Rows::new();
        for row in rows.values() {
            let values = mapping
                .iter()
                .map(|m| m.map_or(Value::Null, |p| row.get(p).clone()))
                .collect();
            let converted = NewRow::from_values(new.id, values);
            check_row(new, &converted)?;
            let key = self.key_of(new, &converted);
            if rebuilt.contains_key(&key) {
                return Err(DxlError::DuplicateKey {
                    table: new.id,
                    index: new.primary_key().map_or(IndexId(0), |i| i.id),
                });
            }
            check_unique(new, &rebuilt, &converted, None)?;
            rebuilt.insert(key, converted);
        }
        data.insert(new.id, rebuilt);
        Ok(())
    }

    fn row_count(&self, _session: &Session, table: TableId) -> Result<u64> {
        Ok(self.data.read().get(&table).map_or(0, |r| r.len() as u64))
    }
}
