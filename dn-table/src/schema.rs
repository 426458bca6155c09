//! Table schema and column filtering.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ColumnSchema {
    pub name: String,
    /// Values of this column longer than the threshold are written
    /// out-of-line into a hunk chunk; shorter ones stay inline. `None`
    /// disables hunk encoding for the column entirely.
    #[serde(default)]
    pub max_inline_hunk_size: Option<u64>,
}

impl ColumnSchema {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            max_inline_hunk_size: None,
        }
    }

    pub fn with_max_inline_hunk_size(mut self, size: u64) -> Self {
        self.max_inline_hunk_size = Some(size);
        self
    }
}

/// Schema of a sorted table: the first `key_column_count` columns form the
/// key, the rest hold versioned values addressed by their column index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TableSchema {
    pub columns: Vec<ColumnSchema>,
    pub key_column_count: usize,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnSchema>, key_column_count: usize) -> Self {
        assert!(key_column_count <= columns.len());
        Self {
            columns,
            key_column_count,
        }
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, id: u16) -> &ColumnSchema {
        &self.columns[id as usize]
    }

    pub fn has_hunk_columns(&self) -> bool {
        self.columns
            .iter()
            .any(|column| column.max_inline_hunk_size.is_some())
    }

    pub fn hunk_column_ids(&self) -> Vec<u16> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, column)| column.max_inline_hunk_size.is_some())
            .map(|(id, _)| id as u16)
            .collect()
    }
}

/// Which value columns a read should materialize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnFilter {
    Universal,
    Indexes(Vec<u16>),
}

impl ColumnFilter {
    pub fn is_universal(&self) -> bool {
        matches!(self, ColumnFilter::Universal)
    }

    pub fn contains(&self, id: u16) -> bool {
        match self {
            ColumnFilter::Universal => true,
            ColumnFilter::Indexes(ids) => ids.contains(&id),
        }
    }
}

impl Default for ColumnFilter {
    fn default() -> Self {
        ColumnFilter::Universal
    }
}
