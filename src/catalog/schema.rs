//! Schema definitions for QuarryDB
//!
//! This module defines column metadata and its on-disk line format.

use super::types::ColumnType;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Column definition in a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name, unique within its table
    pub name: String,
    /// Data type
    pub column_type: ColumnType,
    /// Is this the primary key?
    #[serde(default)]
    pub primary: bool,
    /// Rejects NULL values; always true for the primary key
    #[serde(default)]
    pub not_null: bool,
    /// Maximum string length (STRING columns only)
    #[serde(default)]
    pub max_length: usize,
}

impl Column {
    /// Create a new nullable, non-key column
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            primary: false,
            not_null: false,
            max_length: 0,
        }
    }

    /// Create a STRING column with the given length limit
    pub fn string(name: impl Into<String>, max_length: usize) -> Self {
        Self::new(name, ColumnType::String).max_length(max_length)
    }

    /// Set primary key flag
    pub fn primary_key(mut self, primary: bool) -> Self {
        self.primary = primary;
        if primary {
            self.not_null = true;
        }
        self
    }

    /// Set not-null flag
    pub fn not_null(mut self, not_null: bool) -> Self {
        self.not_null = not_null || self.primary;
        self
    }

    /// Set the maximum string length
    pub fn max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Check the definition is usable in a table
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains([',', '\n']) {
            return Err(Error::InvalidColumn(format!(
                "illegal column name '{}'",
                self.name
            )));
        }
        if self.column_type == ColumnType::String && self.max_length == 0 {
            return Err(Error::InvalidColumn(format!(
                "string column '{}' must have a positive max length",
                self.name
            )));
        }
        Ok(())
    }

    /// Serialize as a metadata line: `name,TYPE,primary,notNull,maxLength`
    pub fn to_meta_line(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.name, self.column_type, self.primary, self.not_null, self.max_length
        )
    }

    /// Parse a metadata line written by [`Column::to_meta_line`]
    pub fn parse_meta_line(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.trim_end().split(',').collect();
        if parts.len() != 5 {
            return Err(Error::InvalidColumn(format!("malformed metadata '{}'", line)));
        }
        let flag = |s: &str| {
            s.parse::<bool>()
                .map_err(|_| Error::InvalidColumn(format!("malformed flag '{}'", s)))
        };
        let column = Column {
            name: parts[0].to_string(),
            column_type: parts[1].parse()?,
            primary: flag(parts[2])?,
            not_null: flag(parts[3])?,
            max_length: parts[4]
                .parse()
                .map_err(|_| Error::InvalidColumn(format!("malformed length '{}'", parts[4])))?,
        };
        column.validate()?;
        Ok(column)
    }

    /// Human readable form, e.g. `name STRING(10) Not Null`
    pub fn representation(&self) -> String {
        let mut s = format!("{} {}", self.name, self.column_type);
        if self.column_type == ColumnType::String {
            s.push_str(&format!("({})", self.max_length));
        }
        if self.primary {
            s.push_str(" Primary Key");
        } else if self.not_null {
            s.push_str(" Not Null");
        }
        s
    }
}
