//! Schema operations
//!
//! ## Operations
//!
//! - `create_table`, `rename_table`, `alter_table`
//! - `drop_table`, `drop_group`, `drop_schema`
//! - `create_indexes`, `drop_table_indexes`, `drop_group_indexes`
//! - snapshot reads: `get_ais`, `get_table_*`, `get_ddls`, `get_generation`
//! - `force_generation_update`
//!
//! Every change that can affect an open scan marks the cursors of the
//! touched tables or groups with `DdlModification`, across all sessions.

use crate::dml::{require_table, DmlFunctions};
use crate::registry::CursorRegistry;
use std::collections::BTreeSet;
use std::sync::Arc;
use strata_core::error::{DxlError, Result};
use strata_core::schema::{
    Ais, ColumnDefinition, Index, IndexColumnDefinition, IndexDefinition, IndexScope, IndexTarget,
    ParentDefinition, Table, TableDefinition,
};
use strata_core::session::Session;
use strata_core::traits::{SchemaManager, Store};
use strata_core::types::{GroupId, IndexId, TableId, TableName};
use tracing::{debug, error, trace, warn};

fn column_name(table: &Table, position: usize) -> Result<String> {
    table
        .columns
        .get(position)
        .map(|c| c.name.clone())
        .ok_or_else(|| DxlError::NoSuchColumn {
            table: table.id,
            column: position.to_string(),
        })
}

/// Rebuild the definition a table was created from
pub fn table_definition(ais: &Ais, table: &Table) -> Result<TableDefinition> {
    let columns = table
        .columns
        .iter()
        .map(|c| ColumnDefinition {
            name: c.name.clone(),
            nullable: c.nullable,
        })
        .collect();
    let primary_key = table
        .primary_key_positions()
        .into_iter()
        .map(|p| column_name(table, p))
        .collect::<Result<Vec<_>>>()?;

    let parent = match &table.parent {
        Some(join) => {
            let parent = require_table(ais, join.parent)?;
            let columns = join
                .columns
                .iter()
                .map(|jc| Ok((column_name(table, jc.child)?, column_name(parent, jc.parent)?)))
                .collect::<Result<Vec<_>>>()?;
            Some(ParentDefinition {
                table: parent.name.clone(),
                columns,
            })
        }
        None => None,
    };

    let indexes = table
        .indexes
        .iter()
        .filter(|i| !i.primary)
        .map(|i| index_definition(ais, i))
        .collect::<Result<Vec<_>>>()?;

    Ok(TableDefinition {
        name: table.name.clone(),
        columns,
        primary_key,
        parent,
        indexes,
    })
}

/// Rebuild the definition of a table or group index
pub fn index_definition(ais: &Ais, index: &Index) -> Result<IndexDefinition> {
    let target = match index.scope {
        IndexScope::Table(t) => IndexTarget::Table(require_table(ais, t)?.name.clone()),
        IndexScope::Group(g) => IndexTarget::Group(
            ais.group(g)
                .map(|group| group.name.clone())
                .ok_or_else(|| DxlError::internal(format!("index {} names missing group {}", index.name, g)))?,
        ),
    };
    let columns = index
        .columns
        .iter()
        .map(|ic| {
            let table = require_table(ais, ic.table)?;
            Ok(IndexColumnDefinition {
                table: table.name.clone(),
                column: column_name(table, ic.position)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(IndexDefinition {
        name: index.name.clone(),
        target,
        columns,
        unique: index.unique,
    })
}

/// DDL entry points
pub struct DdlFunctions {
    schema: Arc<dyn SchemaManager>,
    store: Arc<dyn Store>,
    cursors: Arc<CursorRegistry>,
    dml: Arc<DmlFunctions>,
}

impl DdlFunctions {
    /// Functions over the given collaborators
    pub fn new(
        schema: Arc<dyn SchemaManager>,
        store: Arc<dyn Store>,
        cursors: Arc<CursorRegistry>,
        dml: Arc<DmlFunctions>,
    ) -> Self {
        Self {
            schema,
            store,
            cursors,
            dml,
        }
    }

    fn require_by_name<'a>(ais: &'a Ais, name: &TableName) -> Result<&'a Table> {
        ais.table_by_name(name).ok_or_else(|| DxlError::NoSuchTable {
            table: name.to_string(),
        })
    }

    /// Create a table; returns its id
    ///
    /// A child joining an existing group changes that group's layout, so
    /// cursors scanning any of its tables are invalidated.
    pub fn create_table(&self, _session: &Session, definition: &TableDefinition) -> Result<TableId> {
        trace!(target: "strata::dxl", table = %definition.name, "creating table");
        let id = self.schema.create_table_definition(definition)?;
        let marked = match self.schema.ais().table(id) {
            Some(table) => self.cursors.mark_ddl_group(table.group),
            None => self.cursors.mark_ddl_table(id),
        };
        debug!(target: "strata::schema", table = %definition.name, %id, marked, "created table");
        Ok(id)
    }

    /// Rename a table
    pub fn rename_table(&self, _session: &Session, current: &TableName, new_name: &TableName) -> Result<()> {
        trace!(target: "strata::dxl", %current, %new_name, "renaming table");
        self.schema.rename_table(current, new_name)?;
        if let Some(table) = self.schema.ais().table_by_name(new_name) {
            self.cursors.mark_ddl_table(table.id);
        }
        Ok(())
    }

    /// Drop a leaf table
    ///
    /// A missing table is not an error. A group root has its storage removed
    /// outright; any other table is truncated and its index trees deleted.
    pub fn drop_table(&self, session: &Session, name: &TableName) -> Result<()> {
        trace!(target: "strata::dxl", table = %name, "dropping table");
        let ais = self.schema.ais();
        let Some(table) = ais.table_by_name(name) else {
            return Ok(());
        };
        if !table.children.is_empty() {
            return Err(DxlError::UnsupportedDrop {
                table: name.clone(),
                reason: "cannot drop non-leaf table".to_string(),
            });
        }

        if table.is_root() {
            self.store.remove_trees(session, &[table.id])?;
        } else {
            self.dml.truncate_table(session, table.id)?;
            let mut indexes: Vec<IndexId> = table.indexes.iter().map(|i| i.id).collect();
            if let Some(group) = ais.group(table.group) {
                indexes.extend(
                    group
                        .indexes
                        .iter()
                        .filter(|i| i.columns.iter().any(|c| c.table == table.id))
                        .map(|i| i.id),
                );
            }
            self.store.delete_indexes(session, &indexes)?;
        }
        self.schema.drop_table_definition(name)?;
        let marked = self.cursors.mark_ddl_table(table.id);
        debug!(target: "strata::schema", table = %name, marked, "dropped table");
        Ok(())
    }

    /// Drop every table of a schema
    ///
    /// Fails with `ForeignConstraint` if a table of the schema has a child
    /// elsewhere. Tables joined to a parent in another schema are dropped one
    /// by one, deepest first; every other group is dropped whole.
    pub fn drop_schema(&self, session: &Session, schema: &str) -> Result<()> {
        trace!(target: "strata::dxl", schema, "dropping schema");
        let ais = self.schema.ais();
        let mut groups: BTreeSet<GroupId> = BTreeSet::new();
        let mut tables: Vec<&Table> = Vec::new();

        for table in ais.tables_in_schema(schema) {
            groups.insert(table.group);
            if let Some(join) = &table.parent {
                let parent = require_table(&ais, join.parent)?;
                if parent.name.schema != schema {
                    tables.push(table);
                }
            }
            for child in &table.children {
                let child = require_table(&ais, *child)?;
                if child.name.schema != schema {
                    return Err(DxlError::ForeignConstraint {
                        parent: table.name.clone(),
                        child: child.name.clone(),
                    });
                }
            }
        }
        for table in &tables {
            groups.remove(&table.group);
        }

        tables.sort_by(|a, b| b.id.cmp(&a.id));
        for table in tables {
            self.drop_table(session, &table.name)?;
        }
        for group in groups {
            if let Some(group) = ais.group(group) {
                self.drop_group(session, &group.name)?;
            }
        }
        Ok(())
    }

    /// Drop a group with all of its tables; a missing group is not an error
    pub fn drop_group(&self, session: &Session, name: &TableName) -> Result<()> {
        trace!(target: "strata::dxl", group = %name, "dropping group");
        let ais = self.schema.ais();
        let Some(group) = ais.group_by_name(name) else {
            return Ok(());
        };
        self.store.truncate_group(session, &ais, group.id)?;

        // Children always have larger ids than their parents
        let mut members: Vec<&Table> = ais.group_tables(group.id).collect();
        members.sort_by(|a, b| b.id.cmp(&a.id));
        for table in &members {
            self.schema.drop_table_definition(&table.name)?;
        }
        let marked = self.cursors.mark_ddl_group(group.id);
        debug!(target: "strata::schema", group = %name, tables = members.len(), marked, "dropped group");
        Ok(())
    }

    /// Replace a table definition and rewrite its rows
    ///
    /// If the rows cannot be rewritten the previous definition is restored.
    pub fn alter_table(&self, session: &Session, name: &TableName, definition: &TableDefinition) -> Result<()> {
        trace!(target: "strata::dxl", table = %name, "altering table");
        let before = self.schema.ais();
        let old = Self::require_by_name(&before, name)?;
        let previous = table_definition(&before, old)?;

        self.schema.alter_table_definition(name, definition)?;
        let after = self.schema.ais();
        let new = require_table(&after, old.id)?;
        if let Err(e) = self.store.alter_table_rows(session, old, new) {
            if let Err(revert) = self.schema.alter_table_definition(name, &previous) {
                error!(target: "strata::schema", table = %name, error = %revert, "failed to restore definition");
            }
            self.cursors.mark_ddl_table(old.id);
            return Err(e);
        }
        let marked = self.cursors.mark_ddl_table(old.id);
        debug!(target: "strata::schema", table = %name, marked, "altered table");
        Ok(())
    }

    /// Create and build indexes; returns the new ids
    ///
    /// When the build fails the new indexes are dropped again.
    pub fn create_indexes(&self, session: &Session, definitions: &[IndexDefinition]) -> Result<Vec<IndexId>> {
        trace!(target: "strata::dxl", count = definitions.len(), "creating indexes");
        if definitions.is_empty() {
            return Ok(Vec::new());
        }
        let ids = self.schema.create_indexes(definitions)?;
        let ais = self.schema.ais();
        for id in &ids {
            if let Some(table) = ais.index(*id).and_then(Index::leaf_most_table) {
                self.cursors.mark_ddl_table(table);
            }
        }
        if let Err(e) = self.store.build_indexes(session, &ais, &ids) {
            warn!(target: "strata::schema", error = %e, "index build failed, dropping new indexes");
            if let Err(drop) = self.schema.drop_indexes(&ids) {
                error!(target: "strata::schema", error = %drop, "failed to drop unbuilt indexes");
            }
            return Err(e);
        }
        debug!(target: "strata::schema", ?ids, "created indexes");
        Ok(ids)
    }

    /// Drop secondary indexes of a table by name
    pub fn drop_table_indexes(&self, session: &Session, table: &TableName, names: &[String]) -> Result<()> {
        trace!(target: "strata::dxl", %table, ?names, "dropping table indexes");
        if names.is_empty() {
            return Ok(());
        }
        let ais = self.schema.ais();
        let table = Self::require_by_name(&ais, table)?;
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            let index = table.index_by_name(name).ok_or_else(|| DxlError::NoSuchIndex {
                index: name.clone(),
            })?;
            if index.primary {
                return Err(DxlError::ProtectedIndex {
                    table: table.name.clone(),
                    index: name.clone(),
                });
            }
            ids.push(index.id);
        }
        self.store.delete_indexes(session, &ids)?;
        self.schema.drop_indexes(&ids)?;
        self.cursors.mark_ddl_table(table.id);
        Ok(())
    }

    /// Drop group indexes by name
    pub fn drop_group_indexes(&self, session: &Session, group: &TableName, names: &[String]) -> Result<()> {
        trace!(target: "strata::dxl", %group, ?names, "dropping group indexes");
        if names.is_empty() {
            return Ok(());
        }
        let ais = self.schema.ais();
        let group = ais.group_by_name(group).ok_or_else(|| DxlError::NoSuchGroup {
            group: group.clone(),
        })?;
        let ids = names
            .iter()
            .map(|name| {
                group.index_by_name(name).map(|i| i.id).ok_or_else(|| DxlError::NoSuchIndex {
                    index: name.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.store.delete_indexes(session, &ids)?;
        self.schema.drop_indexes(&ids)?;
        self.cursors.mark_ddl_group(group.id);
        Ok(())
    }

    /// Current schema snapshot
    pub fn get_ais(&self) -> Arc<Ais> {
        trace!(target: "strata::dxl", "getting AIS");
        self.schema.ais()
    }

    /// Id of a table
    pub fn get_table_id(&self, name: &TableName) -> Result<TableId> {
        trace!(target: "strata::dxl", table = %name, "getting table id");
        Self::require_by_name(&self.schema.ais(), name).map(|t| t.id)
    }

    /// Table by id
    pub fn get_table_by_id(&self, id: TableId) -> Result<Table> {
        require_table(&self.schema.ais(), id).cloned()
    }

    /// Table by name
    pub fn get_table_by_name(&self, name: &TableName) -> Result<Table> {
        Self::require_by_name(&self.schema.ais(), name).cloned()
    }

    /// Name of a table
    pub fn get_table_name(&self, id: TableId) -> Result<TableName> {
        require_table(&self.schema.ais(), id).map(|t| t.name.clone())
    }

    /// JSON rendering of every table definition, then every group index
    pub fn get_ddls(&self) -> Result<Vec<String>> {
        trace!(target: "strata::dxl", "getting DDLs");
        let ais = self.schema.ais();
        let render = |value: serde_json::Result<String>| {
            value.map_err(|e| DxlError::internal(format!("cannot render definition: {}", e)))
        };
        let mut ddls = Vec::new();
        for table in ais.tables() {
            ddls.push(render(serde_json::to_string(&table_definition(&ais, table)?))?);
        }
        for group in ais.groups() {
            for index in &group.indexes {
                ddls.push(render(serde_json::to_string(&index_definition(&ais, index)?))?);
            }
        }
        Ok(ddls)
    }

    /// Current schema generation
    pub fn get_generation(&self) -> u64 {
        self.schema.schema_generation()
    }

    /// Bump the schema generation without a schema change
    pub fn force_generation_update(&self) -> u64 {
        let generation = self.schema.force_new_generation();
        debug!(target: "strata::schema", generation, "forced generation update");
        generation
    }
}

impl std::fmt::Debug for DdlFunctions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DdlFunctions")
            .field("generation", &self.schema.schema_generation())
            .finish()
    }
}
