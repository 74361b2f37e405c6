//! In-memory schema manager
//!
//! The catalog is mutated under a mutex; after every change a fresh
//! [`Ais`] snapshot is published and the generation is bumped. Readers only
//! ever see complete snapshots.
//!
//! Table, index and group ids come from counters and are never reused.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use strata_core::error::{DxlError, Result};
use strata_core::schema::{
    Ais, Column, Group, Index, IndexColumn, IndexDefinition, IndexScope, IndexTarget, Join,
    JoinColumn, Table, TableDefinition,
};
use strata_core::traits::SchemaManager;
use strata_core::types::{GroupId, IndexId, TableId, TableName};
use tracing::debug;

/// Name of every primary key index
pub const PRIMARY_KEY_NAME: &str = "PRIMARY";

#[derive(Debug, Default)]
struct Catalog {
    generation: u64,
    tables: BTreeMap<TableId, Table>,
    groups: BTreeMap<GroupId, Group>,
    next_table: u32,
    next_index: u32,
    next_group: u32,
}

impl Catalog {
    fn table_by_name(&self, name: &TableName) -> Option<&Table> {
        self.tables.values().find(|t| &t.name == name)
    }

    fn require(&self, name: &TableName) -> Result<&Table> {
        self.table_by_name(name).ok_or_else(|| DxlError::NoSuchTable {
            table: name.to_string(),
        })
    }

    fn index_id(&mut self) -> IndexId {
        self.next_index += 1;
        IndexId(self.next_index)
    }

    fn snapshot(&self) -> Ais {
        Ais::new(self.generation, self.tables.clone(), self.groups.clone())
    }

    /// Build a table index from a definition naming this table's columns
    fn table_index(&mut self, table: TableId, columns: &[Column], def: &IndexDefinition) -> Result<Index> {
        let mut key = Vec::with_capacity(def.columns.len());
        for c in &def.columns {
            let col = columns.iter().find(|col| col.name == c.column).ok_or_else(|| {
                DxlError::NoSuchColumn {
                    table,
                    column: c.column.clone(),
                }
            })?;
            key.push(IndexColumn {
                table,
                position: col.position,
            });
        }
        Ok(Index {
            id: self.index_id(),
            name: def.name.clone(),
            scope: IndexScope::Table(table),
            columns: key,
            unique: def.unique,
            primary: false,
        })
    }
}

fn build_columns(def: &TableDefinition) -> Result<Vec<Column>> {
    if def.columns.is_empty() {
        return Err(DxlError::invalid_operation(format!("table {} has no columns", def.name)));
    }
    let mut columns: Vec<Column> = Vec::with_capacity(def.columns.len());
    for (position, c) in def.columns.iter().enumerate() {
        if columns.iter().any(|existing| existing.name == c.name) {
            return Err(DxlError::invalid_operation(format!(
                "duplicate column {} in table {}",
                c.name, def.name
            )));
        }
        // Primary key columns are never nullable
        let nullable = c.nullable && !def.primary_key.contains(&c.name);
        columns.push(Column {
            name: c.name.clone(),
            position,
            nullable,
        });
    }
    Ok(columns)
}

fn position_of(columns: &[Column], table: TableId, name: &str) -> Result<usize> {
    columns
        .iter()
        .find(|c| c.name == name)
        .map(|c| c.position)
        .ok_or_else(|| DxlError::NoSuchColumn {
            table,
            column: name.to_string(),
        })
}

/// Schema manager keeping the catalog in memory
#[derive(Debug, Default)]
pub struct MemorySchemaManager {
    catalog: Mutex<Catalog>,
    current: RwLock<Arc<Ais>>,
}

impl MemorySchemaManager {
    /// Empty schema at generation 0
    pub fn new() -> Self {
        Self::default()
    }

    fn publish(&self, catalog: &mut Catalog, what: &str) {
        catalog.generation += 1;
        let ais = Arc::new(catalog.snapshot());
        *self.current.write() = ais;
        debug!(target: "strata::schema", generation = catalog.generation, what, "published schema");
    }

    fn primary_index(catalog: &mut Catalog, table: TableId, columns: &[Column], pk: &[String]) -> Result<Option<Index>> {
        if pk.is_empty() {
            return Ok(None);
        }
        let positions = pk
            .iter()
            .map(|name| position_of(columns, table, name))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(Index {
            id: catalog.index_id(),
            name: PRIMARY_KEY_NAME.to_string(),
            scope: IndexScope::Table(table),
            columns: positions
                .into_iter()
                .map(|position| IndexColumn { table, position })
                .collect(),
            unique: true,
            primary: true,
        }))
    }

    fn parent_join(catalog: &Catalog, def: &TableDefinition, table: TableId, columns: &[Column]) -> Result<Option<(Join, GroupId)>> {
        let Some(parent_def) = &def.parent else {
            return Ok(None);
        };
        let parent = catalog.require(&parent_def.table)?;
        let parent_pk = parent.primary_key_positions();
        if parent_pk.is_empty() || parent_pk.len() != parent_def.columns.len() {
            return Err(DxlError::invalid_operation(format!(
                "join from {} must cover the primary key of {}",
                def.name, parent.name
            )));
        }
        let mut join_columns = Vec::with_capacity(parent_def.columns.len());
        for (child_name, parent_name) in &parent_def.columns {
            let child = position_of(columns, table, child_name)?;
            let parent_pos = position_of(&parent.columns, parent.id, parent_name)?;
            if !parent_pk.contains(&parent_pos) {
                return Err(DxlError::invalid_operation(format!(
                    "join column {} of {} is not in its primary key",
                    parent_name, parent.name
                )));
            }
            join_columns.push(JoinColumn {
                child,
                parent: parent_pos,
            });
        }
        Ok(Some((
            Join {
                parent: parent.id,
                columns: join_columns,
            },
            parent.group,
        )))
    }
}

impl SchemaManager for MemorySchemaManager {
    fn ais(&self) -> Arc<Ais> {
        Arc::clone(&self.current.read())
    }

    fn schema_generation(&self) -> u64 {
        self.current.read().generation()
    }

    fn create_table_definition(&self, def: &TableDefinition) -> Result<TableId> {
        let mut catalog = self.catalog.lock();
        if catalog.table_by_name(&def.name).is_some() {
            return Err(DxlError::DuplicateTableName {
                table: def.name.clone(),
            });
        }
        let id = TableId(catalog.next_table + 1);
        let columns = build_columns(def)?;
        let parent = Self::parent_join(&catalog, def, id, &columns)?;

        let mut indexes = Vec::new();
        if let Some(pk) = Self::primary_index(&mut catalog, id, &columns, &def.primary_key)? {
            indexes.push(pk);
        }
        for index_def in &def.indexes {
            if index_def.target != IndexTarget::Table(def.name.clone()) {
                return Err(DxlError::invalid_operation(format!(
                    "index {} does not target table {}",
                    index_def.name, def.name
                )));
            }
            if indexes.iter().any(|i: &Index| i.name == index_def.name) {
                return Err(DxlError::DuplicateIndexName {
                    table: def.name.clone(),
                    index: index_def.name.clone(),
                });
            }
            let index = catalog.table_index(id, &columns, index_def)?;
            indexes.push(index);
        }

        // Nothing can fail past this point
        catalog.next_table += 1;
        let (join, group) = match parent {
            Some((join, group)) => {
                if let Some(p) = catalog.tables.get_mut(&join.parent) {
                    p.children.push(id);
                }
                (Some(join), group)
            }
            None => {
                catalog.next_group += 1;
                let group = GroupId(catalog.next_group);
                catalog.groups.insert(
                    group,
                    Group {
                        id: group,
                        name: def.name.clone(),
                        root: id,
                        indexes: Vec::new(),
                    },
                );
                (None, group)
            }
        };
        catalog.tables.insert(
            id,
            Table {
                id,
                name: def.name.clone(),
                columns,
                indexes,
                parent: join,
                children: Vec::new(),
                group,
            },
        );
        self.publish(&mut catalog, "create table");
        Ok(id)
    }

    fn rename_table(&self, current: &TableName, new_name: &TableName) -> Result<()> {
        let mut catalog = self.catalog.lock();
        let id = catalog.require(current)?.id;
        if catalog.table_by_name(new_name).is_some() {
            return Err(DxlError::DuplicateTableName {
                table: new_name.clone(),
            });
        }
        if let Some(t) = catalog.tables.get_mut(&id) {
            t.name = new_name.clone();
        }
        self.publish(&mut catalog, "rename table");
        Ok(())
    }

    fn alter_table_definition(&self, name: &TableName, def: &TableDefinition) -> Result<()> {
        let mut catalog = self.catalog.lock();
        let old = catalog.require(name)?.clone();
        let columns = build_columns(def)?;

        // Parent join keeps its meaning; columns are matched by name
        let parent = match &old.parent {
            Some(join) => {
                let mut remapped = Vec::with_capacity(join.columns.len());
                for jc in &join.columns {
                    let old_name = &old.columns[jc.child].name;
                    let child = position_of(&columns, old.id, old_name).map_err(|_| {
                        DxlError::invalid_operation(format!(
                            "alter of {} removes join column {}",
                            old.name, old_name
                        ))
                    })?;
                    remapped.push(JoinColumn {
                        child,
                        parent: jc.parent,
                    });
                }
                Some(Join {
                    parent: join.parent,
                    columns: remapped,
                })
            }
            None => None,
        };

        let old_pk: Vec<&str> = old
            .primary_key_positions()
            .iter()
            .map(|p| old.columns[*p].name.as_str())
            .collect();
        if !old.children.is_empty() && old_pk != def.primary_key.iter().map(String::as_str).collect::<Vec<_>>() {
            return Err(DxlError::invalid_operation(format!(
                "alter of {} changes the primary key referenced by child tables",
                old.name
            )));
        }

        let mut indexes = Vec::new();
        if let Some(mut pk) = Self::primary_index(&mut catalog, old.id, &columns, &def.primary_key)? {
            if let Some(old_pk_index) = old.primary_key() {
                pk.id = old_pk_index.id;
            }
            indexes.push(pk);
        }
        for index_def in &def.indexes {
            let mut index = catalog.table_index(old.id, &columns, index_def)?;
            if let Some(existing) = old.index_by_name(&index_def.name) {
                index.id = existing.id;
            }
            indexes.push(index);
        }

        // Group indexes over this table follow the columns by name
        let group_id = old.group;
        let mut group = catalog.groups.get(&group_id).cloned();
        if let Some(g) = group.as_mut() {
            for index in &mut g.indexes {
                for ic in index.columns.iter_mut().filter(|ic| ic.table == old.id) {
                    let old_name = &old.columns[ic.position].name;
                    ic.position = position_of(&columns, old.id, old_name).map_err(|_| {
                        DxlError::invalid_operation(format!(
                            "alter of {} removes column {} used by group index {}",
                            old.name, old_name, index.name
                        ))
                    })?;
                }
            }
        }

        // Children join to our primary key positions
        let mut children = Vec::new();
        for child_id in &old.children {
            if let Some(child) = catalog.tables.get(child_id) {
                let mut child = child.clone();
                if let Some(join) = child.parent.as_mut() {
                    for jc in &mut join.columns {
                        let parent_name = &old.columns[jc.parent].name;
                        jc.parent = position_of(&columns, old.id, parent_name)?;
                    }
                }
                children.push(child);
            }
        }

        let table = Table {
            id: old.id,
            name: old.name.clone(),
            columns,
            indexes,
            parent,
            children: old.children.clone(),
            group: old.group,
        };
        catalog.tables.insert(old.id, table);
        for child in children {
            catalog.tables.insert(child.id, child);
        }
        if let Some(g) = group {
            catalog.groups.insert(group_id, g);
        }
        self.publish(&mut catalog, "alter table");
        Ok(())
    }

    fn drop_table_definition(&self, name: &TableName) -> Result<()> {
        let mut catalog = self.catalog.lock();
        let table = catalog.require(name)?.clone();
        if !table.children.is_empty() {
            return Err(DxlError::UnsupportedDrop {
                table: name.clone(),
                reason: "table has child tables".to_string(),
            });
        }
        if let Some(join) = &table.parent {
            if let Some(parent) = catalog.tables.get_mut(&join.parent) {
                parent.children.retain(|c| *c != table.id);
            }
        }
        catalog.tables.remove(&table.id);
        if table.is_root() {
            catalog.groups.remove(&table.group);
        } else if let Some(group) = catalog.groups.get_mut(&table.group) {
            group
                .indexes
                .retain(|i| i.columns.iter().all(|c| c.table != table.id));
        }
        self.publish(&mut catalog, "drop table");
        Ok(())
    }

    fn create_indexes(&self, defs: &[IndexDefinition]) -> Result<Vec<IndexId>> {
        let mut catalog = self.catalog.lock();
        let mut built: Vec<Index> = Vec::with_capacity(defs.len());

        for def in defs {
            match &def.target {
                IndexTarget::Table(name) => {
                    let table = catalog.require(name)?.clone();
                    let duplicate = table.index_by_name(&def.name).is_some()
                        || built.iter().any(|i| i.scope == IndexScope::Table(table.id) && i.name == def.name);
                    if duplicate {
                        return Err(DxlError::DuplicateIndexName {
                            table: name.clone(),
                            index: def.name.clone(),
                        });
                    }
                    if let Some(c) = def.columns.iter().find(|c| &c.table != name) {
                        return Err(DxlError::invalid_operation(format!(
                            "column {}.{} is not in table {}",
                            c.table, c.column, name
                        )));
                    }
                    let index = catalog.table_index(table.id, &table.columns, def)?;
                    built.push(index);
                }
                IndexTarget::Group(group_name) => {
                    let group = catalog
                        .groups
                        .values()
                        .find(|g| &g.name == group_name)
                        .cloned()
                        .ok_or_else(|| DxlError::NoSuchGroup {
                            group: group_name.clone(),
                        })?;
                    let duplicate = group.index_by_name(&def.name).is_some()
                        || built.iter().any(|i| i.scope == IndexScope::Group(group.id) && i.name == def.name);
                    if duplicate {
                        return Err(DxlError::DuplicateIndexName {
                            table: group_name.clone(),
                            index: def.name.clone(),
                        });
                    }
                    let mut key = Vec::with_capacity(def.columns.len());
                    for c in &def.columns {
                        let table = catalog.require(&c.table)?;
                        if table.group != group.id {
                            return Err(DxlError::NotInGroup {
                                table: table.id,
                                group: group.id,
                            });
                        }
                        key.push(IndexColumn {
                            table: table.id,
                            position: position_of(&table.columns, table.id, &c.column)?,
                        });
                    }
                    built.push(Index {
                        id: catalog.index_id(),
                        name: def.name.clone(),
                        scope: IndexScope::Group(group.id),
                        columns: key,
                        unique: def.unique,
                        primary: false,
                    });
                }
            }
        }

        let ids = built.iter().map(|i| i.id).collect();
        for index in built {
            match index.scope {
                IndexScope::Table(t) => {
                    if let Some(table) = catalog.tables.get_mut(&t) {
                        table.indexes.push(index);
                    }
                }
                IndexScope::Group(g) => {
                    if let Some(group) = catalog.groups.get_mut(&g) {
                        group.indexes.push(index);
                    }
                }
            }
        }
        self.publish(&mut catalog, "create indexes");
        Ok(ids)
    }

    fn drop_indexes(&self, ids: &[IndexId]) -> Result<()> {
        let mut catalog = self.catalog.lock();
        for id in ids {
            let ais = catalog.snapshot();
            let index = ais.index(*id).ok_or_else(|| DxlError::NoSuchIndex {
                index: id.to_string(),
            })?;
            if index.primary {
                let table = match index.scope {
                    IndexScope::Table(t) => ais.table(t).map(|t| t.name.clone()),
                    IndexScope::Group(_) => None,
                };
                return Err(DxlError::ProtectedIndex {
                    table: table.unwrap_or_else(|| TableName::new("", "")),
                    index: index.name.clone(),
                });
            }
        }
        for table in catalog.tables.values_mut() {
            table.indexes.retain(|i| !ids.contains(&i.id));
        }
        for group in catalog.groups.values_mut() {
            group.indexes.retain(|i| !ids.contains(&i.id));
        }
        self.publish(&mut catalog, "drop indexes");
        Ok(())
    }

    fn force_new_generation(&self) -> u64 {
        let mut catalog = self.catalog.lock();
        self.publish(&mut catalog, "forced");
        catalog.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customers() -> TableDefinition {
        TableDefinition::new(TableName::new("test", "c"))
            .column("cid", false)
            .column("name", true)
            .primary_key(&["cid"])
            .index("name", &["name"], false)
    }

    fn orders() -> TableDefinition {
        TableDefinition::new(TableName::new("test", "o"))
            .column("oid", false)
            .column("cid", false)
            .column("amount", true)
            .primary_key(&["oid"])
            .parent(TableName::new("test", "c"), &[("cid", "cid")])
    }

    #[test]
    fn test_create_bumps_generation_and_groups_children() {
        let sm = MemorySchemaManager::new();
        assert_eq!(sm.schema_generation(), 0);
        let c = sm.create_table_definition(&customers()).unwrap();
        let o = sm.create_table_definition(&orders()).unwrap();
        assert_eq!(sm.schema_generation(), 2);

        let ais = sm.ais();
        let ct = ais.table(c).unwrap();
        let ot = ais.table(o).unwrap();
        assert_eq!(ct.children, vec![o]);
        assert_eq!(ot.group, ct.group);
        assert_eq!(ot.parent.as_ref().unwrap().columns, vec![JoinColumn { child: 1, parent: 0 }]);
        assert_eq!(ct.primary_key().unwrap().name, PRIMARY_KEY_NAME);
        assert!(!ct.columns[0].nullable);
    }

    #[test]
    fn test_duplicate_and_unknown_names() {
        let sm = MemorySchemaManager::new();
        sm.create_table_definition(&customers()).unwrap();
        assert!(matches!(
            sm.create_table_definition(&customers()),
            Err(DxlError::DuplicateTableName { .. })
        ));
        let orphan = TableDefinition::new(TableName::new("test", "x"))
            .column("id", false)
            .parent(TableName::new("test", "nope"), &[("id", "cid")]);
        assert!(matches!(
            sm.create_table_definition(&orphan),
            Err(DxlError::NoSuchTable { .. })
        ));
        let bad_pk = TableDefinition::new(TableName::new("test", "y"))
            .column("id", false)
            .primary_key(&["missing"]);
        assert!(matches!(
            sm.create_table_definition(&bad_pk),
            Err(DxlError::NoSuchColumn { .. })
        ));
        // Failed creates do not publish
        assert_eq!(sm.schema_generation(), 1);
    }

    #[test]
    fn test_drop_requires_leaf() {
        let sm = MemorySchemaManager::new();
        sm.create_table_definition(&customers()).unwrap();
        sm.create_table_definition(&orders()).unwrap();
        assert!(matches!(
            sm.drop_table_definition(&TableName::new("test", "c")),
            Err(DxlError::UnsupportedDrop { .. })
        ));
        sm.drop_table_definition(&TableName::new("test", "o")).unwrap();
        sm.drop_table_definition(&TableName::new("test", "c")).unwrap();
        assert_eq!(sm.ais().tables().count(), 0);
        assert_eq!(sm.ais().groups().count(), 0);
    }

    #[test]
    fn test_index_lifecycle() {
        let sm = MemorySchemaManager::new();
        sm.create_table_definition(&customers()).unwrap();
        sm.create_table_definition(&orders()).unwrap();
        let c = TableName::new("test", "c");
        let o = TableName::new("test", "o");

        let ids = sm
            .create_indexes(&[
                IndexDefinition::table(o.clone(), "amount", &["amount"]),
                IndexDefinition::group(c.clone(), "name_amount", &[(c.clone(), "name"), (o.clone(), "amount")]),
            ])
            .unwrap();
        assert_eq!(ids.len(), 2);
        let ais = sm.ais();
        assert_eq!(ais.group_by_name(&c).unwrap().indexes.len(), 1);
        assert!(matches!(
            sm.create_indexes(&[IndexDefinition::table(o.clone(), "amount", &["amount"])]),
            Err(DxlError::DuplicateIndexName { .. })
        ));

        let pk = ais.table_by_name(&c).unwrap().primary_key().unwrap().id;
        assert!(matches!(sm.drop_indexes(&[pk]), Err(DxlError::ProtectedIndex { .. })));
        assert!(matches!(sm.drop_indexes(&[IndexId(999)]), Err(DxlError::NoSuchIndex { .. })));
        sm.drop_indexes(&ids).unwrap();
        assert!(sm.ais().group_by_name(&c).unwrap().indexes.is_empty());
    }

    #[test]
    fn test_alter_keeps_identity_and_remaps_join() {
        let sm = MemorySchemaManager::new();
        sm.create_table_definition(&customers()).unwrap();
        let o = sm.create_table_definition(&orders()).unwrap();
        let name = TableName::new("test", "o");
        let altered = TableDefinition::new(name.clone())
            .column("note", true)
            .column("oid", false)
            .column("cid", false)
            .primary_key(&["oid"]);
        sm.alter_table_definition(&name, &altered).unwrap();

        let ais = sm.ais();
        let t = ais.table(o).unwrap();
        assert_eq!(t.columns.len(), 3);
        assert_eq!(t.parent.as_ref().unwrap().columns[0].child, 2);
        assert_eq!(t.primary_key_positions(), vec![1]);
    }

    #[test]
    fn test_rename_and_force_generation() {
        let sm = MemorySchemaManager::new();
        let c = sm.create_table_definition(&customers()).unwrap();
        sm.rename_table(&TableName::new("test", "c"), &TableName::new("test", "customers"))
            .unwrap();
        assert_eq!(sm.ais().table(c).unwrap().name.table, "customers");
        let before = sm.schema_generation();
        assert_eq!(sm.force_new_generation(), before + 1);
    }
}
