//! Row representations
//!
//! - [`NewRow`]: row as positional values, used by DML and row-object scans
//! - [`RowData`]: encoded row frame, used by message-buffer scans
//! - [`ColumnSet`]: set of column positions, packed as a little-endian bitmap
//! - [`ColumnSelector`]: which columns an update touches
//!
//! ## RowData frame layout
//!
//! ```text
//! +-----------+-----------+-----------+------------------------+
//! | frame len | table id  | columns   | bincode(Vec<Value>)    |
//! | u32 LE    | u32 LE    | u16 LE    | frame len - 10 bytes   |
//! +-----------+-----------+-----------+------------------------+
//! ```
//!
//! The frame length counts every byte of the frame, header included, so
//! frames can be concatenated in a buffer and walked without decoding.

use crate::error::{DxlError, Result};
use crate::types::TableId;
use crate::value::Value;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Size of the fixed RowData header
pub const ROW_HEADER_LEN: usize = 10;

// ============================================================================
// NewRow
// ============================================================================

/// Row as positional column values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRow {
    table: TableId,
    values: Vec<Value>,
}

impl NewRow {
    /// Row with `columns` NULL values
    pub fn new(table: TableId, columns: usize) -> Self {
        Self {
            table,
            values: vec![Value::Null; columns],
        }
    }

    /// Row from values in position order
    pub fn from_values(table: TableId, values: Vec<Value>) -> Self {
        Self { table, values }
    }

    /// Owning table
    pub fn table_id(&self) -> TableId {
        self.table
    }

    /// Value at `position`; missing positions read as NULL
    pub fn get(&self, position: usize) -> &Value {
        static NULL: Value = Value::Null;
        self.values.get(position).unwrap_or(&NULL)
    }

    /// Set the value at `position`, growing the row with NULLs if needed
    pub fn put(&mut self, position: usize, value: impl Into<Value>) {
        if position >= self.values.len() {
            self.values.resize(position + 1, Value::Null);
        }
        self.values[position] = value.into();
    }

    /// Values in position order
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Consume into values
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Number of positions
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// No positions at all
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Values at `positions`, in that order
    pub fn key(&self, positions: &[usize]) -> Vec<Value> {
        positions.iter().map(|p| self.get(*p).clone()).collect()
    }

    /// Copy keeping only `columns`; other positions become NULL
    pub fn project(&self, columns: &ColumnSet) -> NewRow {
        let values = self
            .values
            .iter()
            .enumerate()
            .map(|(i, v)| if columns.contains(i) { v.clone() } else { Value::Null })
            .collect();
        NewRow {
            table: self.table,
            values,
        }
    }
}

// ============================================================================
// RowData
// ============================================================================

/// Encoded row frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowData {
    bytes: Vec<u8>,
}

impl RowData {
    /// Encode a row into a frame
    pub fn encode(row: &NewRow) -> Result<Self> {
        let columns = u16::try_from(row.len()).map_err(|_| {
            DxlError::Serialization(format!("row has {} columns, limit is {}", row.len(), u16::MAX))
        })?;
        let payload = bincode::serialize(&row.values)?;
        let total = ROW_HEADER_LEN + payload.len();
        let frame_len = u32::try_from(total)
            .map_err(|_| DxlError::Serialization(format!("row frame of {} bytes too large", total)))?;

        let mut bytes = vec![0u8; ROW_HEADER_LEN];
        LittleEndian::write_u32(&mut bytes[0..4], frame_len);
        LittleEndian::write_u32(&mut bytes[4..8], row.table.0);
        LittleEndian::write_u16(&mut bytes[8..10], columns);
        bytes.extend_from_slice(&payload);
        Ok(Self { bytes })
    }

    /// Wrap an existing frame, validating its header
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < ROW_HEADER_LEN {
            return Err(DxlError::Serialization(format!(
                "row frame of {} bytes is shorter than its header",
                bytes.len()
            )));
        }
        let declared = LittleEndian::read_u32(&bytes[0..4]) as usize;
        if declared != bytes.len() {
            return Err(DxlError::Serialization(format!(
                "row frame declares {} bytes but has {}",
                declared,
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    /// Decode back into a row
    pub fn decode(&self) -> Result<NewRow> {
        let values: Vec<Value> = bincode::deserialize(&self.bytes[ROW_HEADER_LEN..])?;
        if values.len() != self.column_count() {
            return Err(DxlError::Serialization(format!(
                "row frame declares {} columns but holds {}",
                self.column_count(),
                values.len()
            )));
        }
        Ok(NewRow::from_values(self.table_id(), values))
    }

    /// Table id from the header
    pub fn table_id(&self) -> TableId {
        TableId(LittleEndian::read_u32(&self.bytes[4..8]))
    }

    /// Column count from the header
    pub fn column_count(&self) -> usize {
        LittleEndian::read_u16(&self.bytes[8..10]) as usize
    }

    /// Frame bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Frame length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false; a frame has at least its header
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Split concatenated frames
    pub fn split_frames(mut buf: &[u8]) -> Result<Vec<RowData>> {
        let mut frames = Vec::new();
        while !buf.is_empty() {
            if buf.len() < 4 {
                return Err(DxlError::Serialization("truncated row frame".to_string()));
            }
            let len = LittleEndian::read_u32(&buf[0..4]) as usize;
            if len < ROW_HEADER_LEN || len > buf.len() {
                return Err(DxlError::Serialization(format!(
                    "bad row frame length {} with {} bytes left",
                    len,
                    buf.len()
                )));
            }
            frames.push(RowData::from_bytes(buf[..len].to_vec())?);
            buf = &buf[len..];
        }
        Ok(frames)
    }
}

// ============================================================================
// Column sets
// ============================================================================

/// Set of column positions
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ColumnSet {
    words: SmallVec<[u64; 2]>,
}

impl ColumnSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Positions `0..count`
    pub fn all(count: usize) -> Self {
        (0..count).collect()
    }

    /// Unpack a bitmap: bit `j` of byte `i` is column `8 * i + j`
    pub fn from_bitmap(bitmap: &[u8]) -> Self {
        let mut set = Self::new();
        for (i, byte) in bitmap.iter().enumerate() {
            for j in 0..8 {
                if byte & (1 << j) != 0 {
                    set.insert(i * 8 + j);
                }
            }
        }
        set
    }

    /// Pack into a bitmap, trailing zero bytes trimmed
    pub fn to_bitmap(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.max().map_or(0, |m| m / 8 + 1)];
        for p in self.iter() {
            bytes[p / 8] |= 1 << (p % 8);
        }
        bytes
    }

    /// Add a position
    pub fn insert(&mut self, position: usize) {
        let word = position / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (position % 64);
    }

    /// Membership
    pub fn contains(&self, position: usize) -> bool {
        self.words
            .get(position / 64)
            .map_or(false, |w| w & (1 << (position % 64)) != 0)
    }

    /// Positions in ascending order
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, w)| {
            (0..64).filter(move |b| w & (1u64 << b) != 0).map(move |b| i * 64 + b)
        })
    }

    /// Number of positions
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// No positions
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Largest position
    pub fn max(&self) -> Option<usize> {
        self.iter().last()
    }
}

impl FromIterator<usize> for ColumnSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = Self::new();
        for p in iter {
            set.insert(p);
        }
        set
    }
}

/// Columns affected by an update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSelector {
    /// Every column
    All,
    /// Only the listed positions
    Columns(ColumnSet),
}

impl ColumnSelector {
    /// Whether `position` is selected
    pub fn includes(&self, position: usize) -> bool {
        match self {
            ColumnSelector::All => true,
            ColumnSelector::Columns(set) => set.contains(position),
        }
    }
}
