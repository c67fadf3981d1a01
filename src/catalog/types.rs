//! Column types for QuarryDB
//!
//! This module defines the scalar types a column can hold.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Column data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    /// 32-bit integer
    Int,
    /// 64-bit integer
    Long,
    /// Single-precision floating point
    Float,
    /// Double-precision floating point
    Double,
    /// Bounded-length string
    String,
}

impl ColumnType {
    /// Name as written in table metadata files
    pub fn name(&self) -> &'static str {
        match self {
            ColumnType::Int => "INT",
            ColumnType::Long => "LONG",
            ColumnType::Float => "FLOAT",
            ColumnType::Double => "DOUBLE",
            ColumnType::String => "STRING",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ColumnType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INT" => Ok(ColumnType::Int),
            "LONG" => Ok(ColumnType::Long),
            "FLOAT" => Ok(ColumnType::Float),
            "DOUBLE" => Ok(ColumnType::Double),
            "STRING" => Ok(ColumnType::String),
            other => Err(Error::InvalidColumn(format!("unknown column type '{}'", other))),
        }
    }
}
