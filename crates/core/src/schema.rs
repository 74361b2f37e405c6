//! Schema snapshot model
//!
//! An [`Ais`] is an immutable snapshot of every table, index and group at one
//! schema generation. The schema manager hands out `Arc<Ais>`; a DDL operation
//! publishes a new snapshot and bumps the generation.
//!
//! Tables form hierarchies (groups): every table but the root of a group has a
//! parent join. The hierarchical key (hKey) of a row is made of the primary
//! keys along the path from the group root, so the hKey columns *owned by a
//! table* are its parent-join columns plus its primary key columns.
//!
//! Definitions (`TableDefinition`, `IndexDefinition`) are the caller-facing
//! requests from which the schema manager builds the model types.

use crate::types::{GroupId, IndexId, TableId, TableName};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A column of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Zero-based position in the row
    pub position: usize,
    /// Whether NULL is allowed
    pub nullable: bool,
}

/// One column pair of a parent join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinColumn {
    /// Column position in the child table
    pub child: usize,
    /// Column position in the parent table
    pub parent: usize,
}

/// Join from a child table to its parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    /// Parent table
    pub parent: TableId,
    /// Column pairs, child to parent primary key
    pub columns: Vec<JoinColumn>,
}

/// What an index covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexScope {
    /// Single-table index
    Table(TableId),
    /// Cross-table index over a group
    Group(GroupId),
}

/// A column of an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexColumn {
    /// Table owning the column
    pub table: TableId,
    /// Column position within that table
    pub position: usize,
}

/// Index definition inside a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    /// Index id
    pub id: IndexId,
    /// Index name, unique per table or group
    pub name: String,
    /// Table or group scope
    pub scope: IndexScope,
    /// Key columns in key order
    pub columns: Vec<IndexColumn>,
    /// Unique constraint
    pub unique: bool,
    /// Primary key index
    pub primary: bool,
}

impl Index {
    /// Key positions belonging to `table`
    pub fn positions_for(&self, table: TableId) -> impl Iterator<Item = usize> + '_ {
        self.columns
            .iter()
            .filter(move |c| c.table == table)
            .map(|c| c.position)
    }

    /// Deepest table referenced by the index
    ///
    /// For table indexes this is the table itself; for group indexes it is
    /// the table of the last key column, which is the leaf-most by
    /// construction.
    pub fn leaf_most_table(&self) -> Option<TableId> {
        match self.scope {
            IndexScope::Table(t) => Some(t),
            IndexScope::Group(_) => self.columns.last().map(|c| c.table),
        }
    }
}

/// User table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Table id
    pub id: TableId,
    /// Qualified name
    pub name: TableName,
    /// Columns by position
    pub columns: Vec<Column>,
    /// Table indexes, primary key first when present
    pub indexes: Vec<Index>,
    /// Join to the parent table, `None` for group roots
    pub parent: Option<Join>,
    /// Direct children
    pub children: Vec<TableId>,
    /// Owning group
    pub group: GroupId,
}

impl Table {
    /// Primary key index
    pub fn primary_key(&self) -> Option<&Index> {
        self.indexes.iter().find(|i| i.primary)
    }

    /// Primary key positions, empty when the table has no primary key
    pub fn primary_key_positions(&self) -> Vec<usize> {
        self.primary_key()
            .map(|pk| pk.positions_for(self.id).collect())
            .unwrap_or_default()
    }

    /// Index by id
    pub fn index(&self, id: IndexId) -> Option<&Index> {
        self.indexes.iter().find(|i| i.id == id)
    }

    /// Index by name
    pub fn index_by_name(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Column by name
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Number of columns
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Root of its group
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// hKey columns owned by this table
    ///
    /// Parent-join columns followed by primary key columns, without duplicates.
    pub fn hkey_positions(&self) -> Vec<usize> {
        let mut positions: Vec<usize> = Vec::new();
        if let Some(join) = &self.parent {
            positions.extend(join.columns.iter().map(|c| c.child));
        }
        for p in self.primary_key_positions() {
            if !positions.contains(&p) {
                positions.push(p);
            }
        }
        positions
    }

    /// Every column referenced by any table index
    pub fn key_positions(&self) -> Vec<usize> {
        let mut positions: Vec<usize> = self
            .indexes
            .iter()
            .flat_map(|i| i.positions_for(self.id))
            .chain(self.hkey_positions())
            .collect();
        positions.sort_unstable();
        positions.dedup();
        positions
    }
}

/// Group of tables sharing storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Group id
    pub id: GroupId,
    /// Group name (same as the root table name)
    pub name: TableName,
    /// Root table
    pub root: TableId,
    /// Group indexes
    pub indexes: Vec<Index>,
}

impl Group {
    /// Group index by name
    pub fn index_by_name(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|i| i.name == name)
    }
}

/// Immutable schema snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ais {
    generation: u64,
    tables: BTreeMap<TableId, Table>,
    groups: BTreeMap<GroupId, Group>,
    #[serde(skip)]
    names: HashMap<TableName, TableId>,
}

impl Ais {
    /// Build a snapshot from its parts
    pub fn new(
        generation: u64,
        tables: BTreeMap<TableId, Table>,
        groups: BTreeMap<GroupId, Group>,
    ) -> Self {
        let names = tables
            .values()
            .map(|t| (t.name.clone(), t.id))
            .collect();
        Self {
            generation,
            tables,
            groups,
            names,
        }
    }

    /// Schema generation of this snapshot
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Table by id
    pub fn table(&self, id: TableId) -> Option<&Table> {
        self.tables.get(&id)
    }

    /// Table by name
    pub fn table_by_name(&self, name: &TableName) -> Option<&Table> {
        self.names.get(name).and_then(|id| self.tables.get(id))
    }

    /// Every table, ordered by id
    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    /// Tables of one schema, ordered by id
    pub fn tables_in_schema<'a>(&'a self, schema: &'a str) -> impl Iterator<Item = &'a Table> + 'a {
        self.tables.values().filter(move |t| t.name.schema == schema)
    }

    /// Group by id
    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    /// Group by name
    pub fn group_by_name(&self, name: &TableName) -> Option<&Group> {
        self.groups.values().find(|g| &g.name == name)
    }

    /// Every group, ordered by id
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Tables belonging to a group, ordered by id
    pub fn group_tables(&self, group: GroupId) -> impl Iterator<Item = &Table> {
        self.tables.values().filter(move |t| t.group == group)
    }

    /// Table and its ancestors, starting with the table itself
    pub fn ancestry(&self, table: TableId) -> Vec<TableId> {
        let mut chain = Vec::new();
        let mut current = self.tables.get(&table);
        while let Some(t) = current {
            chain.push(t.id);
            current = t.parent.as_ref().and_then(|j| self.tables.get(&j.parent));
        }
        chain
    }

    /// Index by id, searching tables and groups
    pub fn index(&self, id: IndexId) -> Option<&Index> {
        self.tables
            .values()
            .flat_map(|t| t.indexes.iter())
            .chain(self.groups.values().flat_map(|g| g.indexes.iter()))
            .find(|i| i.id == id)
    }

    /// Largest table id in use
    pub fn max_table_id(&self) -> Option<TableId> {
        self.tables.keys().next_back().copied()
    }

    /// Largest index id in use
    pub fn max_index_id(&self) -> Option<IndexId> {
        self.tables
            .values()
            .flat_map(|t| t.indexes.iter())
            .chain(self.groups.values().flat_map(|g| g.indexes.iter()))
            .map(|i| i.id)
            .max()
    }
}

// ============================================================================
// Definitions
// ============================================================================

/// Column in a table definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    /// Column name
    pub name: String,
    /// Whether NULL is allowed
    pub nullable: bool,
}

/// Parent join in a table definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentDefinition {
    /// Parent table
    pub table: TableName,
    /// (child column, parent primary key column) pairs
    pub columns: Vec<(String, String)>,
}

/// Table creation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    /// Table name
    pub name: TableName,
    /// Columns in position order
    pub columns: Vec<ColumnDefinition>,
    /// Primary key column names
    pub primary_key: Vec<String>,
    /// Parent join
    pub parent: Option<ParentDefinition>,
    /// Secondary indexes
    pub indexes: Vec<IndexDefinition>,
}

impl TableDefinition {
    /// Start a definition
    pub fn new(name: TableName) -> Self {
        Self {
            name,
            columns: Vec::new(),
            primary_key: Vec::new(),
            parent: None,
            indexes: Vec::new(),
        }
    }

    /// Add a column
    pub fn column(mut self, name: &str, nullable: bool) -> Self {
        self.columns.push(ColumnDefinition {
            name: name.to_string(),
            nullable,
        });
        self
    }

    /// Set the primary key
    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Join to a parent table
    pub fn parent(mut self, table: TableName, columns: &[(&str, &str)]) -> Self {
        self.parent = Some(ParentDefinition {
            table,
            columns: columns
                .iter()
                .map(|(c, p)| (c.to_string(), p.to_string()))
                .collect(),
        });
        self
    }

    /// Add a secondary index over this table's columns
    pub fn index(mut self, name: &str, columns: &[&str], unique: bool) -> Self {
        let mut def = IndexDefinition::table(self.name.clone(), name, columns);
        def.unique = unique;
        self.indexes.push(def);
        self
    }
}

/// Table or group targeted by an index definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexTarget {
    /// Index on one table
    Table(TableName),
    /// Index on a group, named by the group
    Group(TableName),
}

/// Index column reference in a definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexColumnDefinition {
    /// Owning table
    pub table: TableName,
    /// Column name
    pub column: String,
}

/// Index creation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Index name
    pub name: String,
    /// Target
    pub target: IndexTarget,
    /// Key columns in key order
    pub columns: Vec<IndexColumnDefinition>,
    /// Unique constraint
    pub unique: bool,
}

impl IndexDefinition {
    /// Non-unique index on one table
    pub fn table(table: TableName, name: &str, columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            columns: columns
                .iter()
                .map(|c| IndexColumnDefinition {
                    table: table.clone(),
                    column: c.to_string(),
                })
                .collect(),
            target: IndexTarget::Table(table),
            unique: false,
        }
    }

    /// Non-unique group index over columns of several tables
    pub fn group(group: TableName, name: &str, columns: &[(TableName, &str)]) -> Self {
        Self {
            name: name.to_string(),
            target: IndexTarget::Group(group),
            columns: columns
                .iter()
                .map(|(t, c)| IndexColumnDefinition {
                    table: t.clone(),
                    column: c.to_string(),
                })
                .collect(),
            unique: false,
        }
    }

    /// Make the index unique
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}
