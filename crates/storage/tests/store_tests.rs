//! Integration tests for the in-memory storage backend
//!
//! Covers grouped tables, group index scans, tables without a primary key,
//! definition changes that rewrite rows, and transactional undo across
//! several tables.

use std::sync::Arc;

use strata_core::{
    ColumnRequest, DxlError, IndexDefinition, NewRow, RowCollector, ScanRequest, SchemaManager,
    Session, Store, TableDefinition, TableName, TransactionService, Value,
};
use strata_storage::{MemorySchemaManager, MemoryStore, MemoryTransactionService};

// ============================================================================
// Helpers
// ============================================================================

struct Env {
    sm: MemorySchemaManager,
    txn: Arc<MemoryTransactionService>,
    store: MemoryStore,
}

fn env() -> Env {
    let txn = Arc::new(MemoryTransactionService::new());
    Env {
        sm: MemorySchemaManager::new(),
        store: MemoryStore::new(Arc::clone(&txn)),
        txn,
    }
}

fn customers() -> TableName {
    TableName::new("shop", "customers")
}

fn orders() -> TableName {
    TableName::new("shop", "orders")
}

fn create_hierarchy(env: &Env) {
    env.sm
        .create_table_definition(
            &TableDefinition::new(customers())
                .column("cid", false)
                .column("name", true)
                .primary_key(&["cid"]),
        )
        .unwrap();
    env.sm
        .create_table_definition(
            &TableDefinition::new(orders())
                .column("oid", false)
                .column("cid", false)
                .column("total", true)
                .primary_key(&["oid"])
                .parent(customers(), &[("cid", "cid")]),
        )
        .unwrap();
}

fn collect(env: &Env, request: &ScanRequest) -> Vec<NewRow> {
    let ais = env.sm.ais();
    let mut collector = env
        .store
        .new_row_collector(&Session::new(), &ais, request)
        .unwrap();
    collector.open().unwrap();
    let mut rows = Vec::new();
    while let Some(row) = collector.collect_next_row().unwrap() {
        rows.push(row);
    }
    collector.close();
    rows
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_group_index_orders_by_scanned_table_columns() {
    let env = env();
    create_hierarchy(&env);
    let ais = env.sm.ais();
    let order_table = ais.table_by_name(&orders()).unwrap().clone();
    let s = Session::new();
    for (oid, total) in [(1, 50), (2, 10), (3, 30)] {
        let row = NewRow::from_values(
            order_table.id,
            vec![Value::Int(oid), Value::Int(7), Value::Int(total)],
        );
        env.store.write_row(&s, &order_table, &row).unwrap();
    }

    let ids = env
        .sm
        .create_indexes(&[IndexDefinition::group(
            customers(),
            "name_total",
            &[(customers(), "name"), (orders(), "total")],
        )])
        .unwrap();
    let ais = env.sm.ais();
    env.store.build_indexes(&s, &ais, &ids).unwrap();

    let rows = collect(
        &env,
        &ScanRequest::new(order_table.id)
            .with_index(ids[0])
            .with_columns(ColumnRequest::columns(&[0])),
    );
    let oids: Vec<_> = rows.iter().map(|r| r.get(0).as_int().unwrap()).collect();
    assert_eq!(oids, vec![2, 3, 1]);
}

#[test]
fn test_unknown_index_for_table_is_rejected() {
    let env = env();
    create_hierarchy(&env);
    let ais = env.sm.ais();
    let customer = ais.table_by_name(&customers()).unwrap();
    let order_pk = ais.table_by_name(&orders()).unwrap().primary_key().unwrap().id;

    let result = env.store.new_row_collector(
        &Session::new(),
        &ais,
        &ScanRequest::new(customer.id).with_index(order_pk),
    );
    assert!(matches!(result, Err(DxlError::NoSuchIndex { .. })));
}

#[test]
fn test_table_without_primary_key_keeps_duplicates() {
    let env = env();
    let id = env
        .sm
        .create_table_definition(&TableDefinition::new(TableName::new("shop", "log")).column("msg", true))
        .unwrap();
    let ais = env.sm.ais();
    let table = ais.table(id).unwrap();
    let s = Session::new();
    let row = NewRow::from_values(id, vec![Value::from("hello")]);
    env.store.write_row(&s, table, &row).unwrap();
    env.store.write_row(&s, table, &row).unwrap();
    assert_eq!(env.store.row_count(&s, id).unwrap(), 2);

    env.store.delete_row(&s, table, &row).unwrap();
    assert_eq!(env.store.row_count(&s, id).unwrap(), 1);
}

#[test]
fn test_alter_rewrites_rows_by_column_name() {
    let env = env();
    create_hierarchy(&env);
    let old = env.sm.ais().table_by_name(&customers()).unwrap().clone();
    let s = Session::new();
    env.store
        .write_row(&s, &old, &NewRow::from_values(old.id, vec![Value::Int(1), Value::from("ann")]))
        .unwrap();

    env.sm
        .alter_table_definition(
            &customers(),
            &TableDefinition::new(customers())
                .column("cid", false)
                .column("tier", true)
                .column("name", true)
                .primary_key(&["cid"]),
        )
        .unwrap();
    let new = env.sm.ais().table_by_name(&customers()).unwrap().clone();
    env.store.alter_table_rows(&s, &old, &new).unwrap();

    let rows = env.store.rows(new.id);
    assert_eq!(
        rows[0].values(),
        &[Value::Int(1), Value::Null, Value::from("ann")]
    );
}

#[test]
fn test_alter_to_non_null_column_fails_on_existing_rows() {
    let env = env();
    create_hierarchy(&env);
    let old = env.sm.ais().table_by_name(&customers()).unwrap().clone();
    let s = Session::new();
    env.store
        .write_row(&s, &old, &NewRow::from_values(old.id, vec![Value::Int(1), Value::Null]))
        .unwrap();

    let mut new = old.clone();
    new.columns[1].nullable = false;
    assert!(matches!(
        env.store.alter_table_rows(&s, &old, &new),
        Err(DxlError::TableDefinitionMismatch { .. })
    ));
}

#[test]
fn test_rollback_spans_tables_in_group() {
    let env = env();
    create_hierarchy(&env);
    let ais = env.sm.ais();
    let customer = ais.table_by_name(&customers()).unwrap();
    let order = ais.table_by_name(&orders()).unwrap();
    let s = Session::new();

    env.txn.begin_transaction(&s).unwrap();
    env.store
        .write_row(&s, customer, &NewRow::from_values(customer.id, vec![Value::Int(1), Value::from("a")]))
        .unwrap();
    env.store
        .write_row(
            &s,
            order,
            &NewRow::from_values(order.id, vec![Value::Int(10), Value::Int(1), Value::Int(5)]),
        )
        .unwrap();
    env.txn.rollback_transaction(&s).unwrap();
    env.txn.end_transaction(&s).unwrap();

    assert_eq!(env.store.row_count(&s, customer.id).unwrap(), 0);
    assert_eq!(env.store.row_count(&s, order.id).unwrap(), 0);
    assert_eq!(env.txn.stats().rolled_back, 1);
}

#[test]
fn test_truncate_group_clears_every_table() {
    let env = env();
    create_hierarchy(&env);
    let ais = env.sm.ais();
    let customer = ais.table_by_name(&customers()).unwrap();
    let order = ais.table_by_name(&orders()).unwrap();
    let s = Session::new();
    env.store
        .write_row(&s, customer, &NewRow::from_values(customer.id, vec![Value::Int(1), Value::Null]))
        .unwrap();
    env.store
        .write_row(
            &s,
            order,
            &NewRow::from_values(order.id, vec![Value::Int(10), Value::Int(1), Value::Null]),
        )
        .unwrap();

    env.store.truncate_group(&s, &ais, customer.group).unwrap();
    assert_eq!(env.store.row_count(&s, customer.id).unwrap(), 0);
    assert_eq!(env.store.row_count(&s, order.id).unwrap(), 0);
    assert_eq!(env.store.stats().truncate_group_calls, 1);
}

static_assertions::assert_impl_all!(MemoryStore: Send, Sync);
static_assertions::assert_impl_all!(MemorySchemaManager: Send, Sync);
static_assertions::assert_impl_all!(MemoryTransactionService: Send, Sync);

// ============================================================================
// Properties
// ============================================================================

mod properties {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    proptest! {
        /// Scans return rows in key order whatever the insertion order
        #[test]
        fn prop_scan_is_key_ordered(keys in proptest::collection::vec(-1000i64..1000, 0..40)) {
            let env = env();
            create_hierarchy(&env);
            let ais = env.sm.ais();
            let customer = ais.table_by_name(&customers()).unwrap();
            let s = Session::new();

            let mut unique = BTreeSet::new();
            for k in &keys {
                let row = NewRow::from_values(customer.id, vec![Value::Int(*k), Value::Null]);
                let written = env.store.write_row(&s, customer, &row);
                prop_assert_eq!(written.is_ok(), unique.insert(*k));
            }

            let scanned: Vec<i64> = collect(&env, &ScanRequest::new(customer.id))
                .iter()
                .map(|r| match r.get(0) {
                    Value::Int(v) => *v,
                    other => panic!("unexpected key {:?}", other),
                })
                .collect();
            prop_assert_eq!(scanned, unique.into_iter().collect::<Vec<_>>());
        }

        /// Rolling back restores the committed rows exactly
        #[test]
        fn prop_rollback_restores_committed_rows(
            committed in proptest::collection::btree_set(0i64..50, 0..10),
            attempted in proptest::collection::btree_set(0i64..50, 0..10),
        ) {
            let env = env();
            create_hierarchy(&env);
            let ais = env.sm.ais();
            let customer = ais.table_by_name(&customers()).unwrap();
            let s = Session::new();

            for k in &committed {
                env.store
                    .write_row(&s, customer, &NewRow::from_values(customer.id, vec![Value::Int(*k), Value::Null]))
                    .unwrap();
            }
            let before = env.store.rows(customer.id);

            env.txn.begin_transaction(&s).unwrap();
            for k in &attempted {
                let row = NewRow::from_values(customer.id, vec![Value::Int(*k), Value::from("new")]);
                if committed.contains(k) {
                    let old = NewRow::from_values(customer.id, vec![Value::Int(*k), Value::Null]);
                    env.store.delete_row(&s, customer, &old).unwrap();
                } else {
                    env.store.write_row(&s, customer, &row).unwrap();
                }
            }
            env.txn.rollback_transaction(&s).unwrap();
            env.txn.end_transaction(&s).unwrap();

            prop_assert_eq!(env.store.rows(customer.id), before);
        }
    }
}
