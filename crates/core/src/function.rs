//! Operation catalogue
//!
//! Every operation exposed by the DXL layer is one [`DxlFunction`]. Each is
//! tagged with a [`FunctionClass`], which is what the lock coordinator uses
//! to pick lock modes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lock-relevant classification of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FunctionClass {
    /// Changes the schema
    DdlWrite,
    /// Reads the schema
    DdlRead,
    /// Changes rows
    DmlWrite,
    /// Reads rows or cursor state
    DmlRead,
}

impl FunctionClass {
    /// DDL class
    pub fn is_ddl(&self) -> bool {
        matches!(self, FunctionClass::DdlWrite | FunctionClass::DdlRead)
    }

    /// Write class
    pub fn is_write(&self) -> bool {
        matches!(self, FunctionClass::DdlWrite | FunctionClass::DmlWrite)
    }
}

macro_rules! dxl_functions {
    ($($variant:ident => $class:ident, $name:literal;)*) => {
        /// Closed enumeration of DXL operations
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum DxlFunction {
            $(
                #[doc = $name]
                $variant,
            )*
        }

        impl DxlFunction {
            /// Every operation
            pub const ALL: &'static [DxlFunction] = &[$(DxlFunction::$variant),*];

            /// Lock class
            pub fn class(&self) -> FunctionClass {
                match self {
                    $(DxlFunction::$variant => FunctionClass::$class,)*
                }
            }

            /// Operation name as used in logs
            pub fn name(&self) -> &'static str {
                match self {
                    $(DxlFunction::$variant => $name,)*
                }
            }
        }
    };
}

dxl_functions! {
    // DDL write
    CreateTable => DdlWrite, "create_table";
    RenameTable => DdlWrite, "rename_table";
    DropTable => DdlWrite, "drop_table";
    DropSchema => DdlWrite, "drop_schema";
    DropGroup => DdlWrite, "drop_group";
    AlterTable => DdlWrite, "alter_table";
    CreateIndexes => DdlWrite, "create_indexes";
    DropTableIndexes => DdlWrite, "drop_table_indexes";
    DropGroupIndexes => DdlWrite, "drop_group_indexes";
    ForceGenerationUpdate => DdlWrite, "force_generation_update";
    // DDL read
    GetAis => DdlRead, "get_ais";
    GetTableId => DdlRead, "get_table_id";
    GetTableById => DdlRead, "get_table_by_id";
    GetTableByName => DdlRead, "get_table_by_name";
    GetTableName => DdlRead, "get_table_name";
    GetDdls => DdlRead, "get_ddls";
    GetSchemaGeneration => DdlRead, "get_generation";
    // DML write
    WriteRow => DmlWrite, "write_row";
    DeleteRow => DmlWrite, "delete_row";
    UpdateRow => DmlWrite, "update_row";
    TruncateTable => DmlWrite, "truncate_table";
    // DML read
    OpenCursor => DmlRead, "open_cursor";
    GetCursorState => DmlRead, "get_cursor_state";
    ScanSome => DmlRead, "scan_some";
    CloseCursor => DmlRead, "close_cursor";
    GetCursors => DmlRead, "get_cursors";
    ConvertNewRow => DmlRead, "convert_new_row";
    ConvertRowData => DmlRead, "convert_row_data";
    ConvertRowDatas => DmlRead, "convert_row_datas";
    GetTableStatistics => DmlRead, "get_table_statistics";
}

impl fmt::Display for DxlFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_classes() {
        assert_eq!(DxlFunction::DropTable.class(), FunctionClass::DdlWrite);
        assert_eq!(DxlFunction::GetAis.class(), FunctionClass::DdlRead);
        assert_eq!(DxlFunction::TruncateTable.class(), FunctionClass::DmlWrite);
        assert_eq!(DxlFunction::ScanSome.class(), FunctionClass::DmlRead);
        assert!(FunctionClass::DdlRead.is_ddl());
        assert!(FunctionClass::DmlWrite.is_write());
        assert!(!FunctionClass::DmlRead.is_write());
    }

    #[test]
    fn test_names_unique() {
        let names: HashSet<_> = DxlFunction::ALL.iter().map(|f| f.name()).collect();
        assert_eq!(names.len(), DxlFunction::ALL.len());
        assert_eq!(DxlFunction::ALL.len(), 30);
    }
}
