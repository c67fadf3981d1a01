//! Cell and Row types for QuarryDB
//!
//! This module defines how data values are represented in memory.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::catalog::ColumnType;
use crate::error::{Error, Result};

/// A single typed scalar stored in a row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Cell {
    /// NULL value
    Null,
    /// 32-bit integer
    Int(i32),
    /// 64-bit integer
    Long(i64),
    /// 32-bit float
    Float(f32),
    /// 64-bit float
    Double(f64),
    /// String value
    String(String),
}

/// Relational operators understood by [`Cell::satisfies`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn accepts(&self, ord: Ordering) -> bool {
        match self {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Le => ord != Ordering::Greater,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Ge => ord != Ordering::Less,
        }
    }
}

/// Arithmetic operators understood by [`Cell::arithmetic`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

// Equality follows the total order below so cells can key a B+ tree.
impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Cell {}

impl PartialOrd for Cell {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Total order used by the primary index. Cells of different types are
/// ordered by type rank; only same-typed keys meet in a real table.
impl Ord for Cell {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Cell::Int(a), Cell::Int(b)) => a.cmp(b),
            (Cell::Long(a), Cell::Long(b)) => a.cmp(b),
            (Cell::Float(a), Cell::Float(b)) => a.total_cmp(b),
            (Cell::Double(a), Cell::Double(b)) => a.total_cmp(b),
            (Cell::String(a), Cell::String(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl std::hash::Hash for Cell {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Cell::Null => {}
            Cell::Int(v) => v.hash(state),
            Cell::Long(v) => v.hash(state),
            Cell::Float(v) => v.to_bits().hash(state),
            Cell::Double(v) => v.to_bits().hash(state),
            Cell::String(v) => v.hash(state),
        }
    }
}

impl Cell {
    fn rank(&self) -> u8 {
        match self {
            Cell::Null => 0,
            Cell::Int(_) => 1,
            Cell::Long(_) => 2,
            Cell::Float(_) => 3,
            Cell::Double(_) => 4,
            Cell::String(_) => 5,
        }
    }

    /// Check if this value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// The column type this cell belongs to; `None` for NULL
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Cell::Null => None,
            Cell::Int(_) => Some(ColumnType::Int),
            Cell::Long(_) => Some(ColumnType::Long),
            Cell::Float(_) => Some(ColumnType::Float),
            Cell::Double(_) => Some(ColumnType::Double),
            Cell::String(_) => Some(ColumnType::String),
        }
    }

    /// Get the type name of this value
    pub fn type_name(&self) -> &'static str {
        self.column_type().map_or("NULL", |t| t.name())
    }

    /// Try to convert to string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::String(s) => Some(s),
            _ => None,
        }
    }

    /// Only finite floats survive the JSON row and log formats
    pub fn check_storable(&self) -> Result<()> {
        let finite = match self {
            Cell::Float(v) => v.is_finite(),
            Cell::Double(v) => v.is_finite(),
            _ => true,
        };
        if !finite {
            return Err(Error::NonFiniteFloat(self.to_string()));
        }
        Ok(())
    }

    fn mismatch(&self, other: &Cell) -> Error {
        Error::TypeMismatch {
            from: self.type_name().to_string(),
            to: other.type_name().to_string(),
        }
    }

    /// SQL comparison. `Ok(None)` when either side is NULL (or a float is NaN);
    /// an error when the two sides have different types.
    pub fn compare(&self, other: &Cell) -> Result<Option<Ordering>> {
        match (self, other) {
            (Cell::Null, _) | (_, Cell::Null) => Ok(None),
            (Cell::Int(a), Cell::Int(b)) => Ok(Some(a.cmp(b))),
            (Cell::Long(a), Cell::Long(b)) => Ok(Some(a.cmp(b))),
            (Cell::Float(a), Cell::Float(b)) => Ok(a.partial_cmp(b)),
            (Cell::Double(a), Cell::Double(b)) => Ok(a.partial_cmp(b)),
            (Cell::String(a), Cell::String(b)) => Ok(Some(a.cmp(b))),
            _ => Err(self.mismatch(other)),
        }
    }

    /// Evaluate `self <op> other`; NULL never satisfies any operator
    pub fn satisfies(&self, op: CompareOp, other: &Cell) -> Result<bool> {
        Ok(self.compare(other)?.map_or(false, |ord| op.accepts(ord)))
    }

    /// Apply an arithmetic operator. NULL propagates; strings and mixed
    /// types are rejected.
    pub fn arithmetic(&self, op: ArithOp, other: &Cell) -> Result<Cell> {
        match (self, other) {
            (Cell::Null, _) | (_, Cell::Null) => Ok(Cell::Null),
            (Cell::Int(a), Cell::Int(b)) => {
                let v = match op {
                    ArithOp::Add => a.checked_add(*b),
                    ArithOp::Sub => a.checked_sub(*b),
                    ArithOp::Mul => a.checked_mul(*b),
                    ArithOp::Div if *b == 0 => return Err(Error::DivisionByZero),
                    ArithOp::Div => a.checked_div(*b),
                };
                v.map(Cell::Int).ok_or(Error::ArithmeticOverflow)
            }
            (Cell::Long(a), Cell::Long(b)) => {
                let v = match op {
                    ArithOp::Add => a.checked_add(*b),
                    ArithOp::Sub => a.checked_sub(*b),
                    ArithOp::Mul => a.checked_mul(*b),
                    ArithOp::Div if *b == 0 => return Err(Error::DivisionByZero),
                    ArithOp::Div => a.checked_div(*b),
                };
                v.map(Cell::Long).ok_or(Error::ArithmeticOverflow)
            }
            (Cell::Float(a), Cell::Float(b)) => Ok(Cell::Float(match op {
                ArithOp::Add => a + b,
                ArithOp::Sub => a - b,
                ArithOp::Mul => a * b,
                ArithOp::Div if *b == 0.0 => return Err(Error::DivisionByZero),
                ArithOp::Div => a / b,
            })),
            (Cell::Double(a), Cell::Double(b)) => Ok(Cell::Double(match op {
                ArithOp::Add => a + b,
                ArithOp::Sub => a - b,
                ArithOp::Mul => a * b,
                ArithOp::Div if *b == 0.0 => return Err(Error::DivisionByZero),
                ArithOp::Div => a / b,
            })),
            _ => Err(self.mismatch(other)),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => write!(f, "null"),
            Cell::Int(v) => write!(f, "{}", v),
            Cell::Long(v) => write!(f, "{}", v),
            Cell::Float(v) => write!(f, "{}", v),
            Cell::Double(v) => write!(f, "{}", v),
            Cell::String(s) => write!(f, "'{}'", s),
        }
    }
}

impl From<i32> for Cell {
    fn from(v: i32) -> Self {
        Cell::Int(v)
    }
}

impl From<i64> for Cell {
    fn from(v: i64) -> Self {
        Cell::Long(v)
    }
}

impl From<f32> for Cell {
    fn from(v: f32) -> Self {
        Cell::Float(v)
    }
}

impl From<f64> for Cell {
    fn from(v: f64) -> Self {
        Cell::Double(v)
    }
}

impl From<String> for Cell {
    fn from(v: String) -> Self {
        Cell::String(v)
    }
}

impl From<&str> for Cell {
    fn from(v: &str) -> Self {
        Cell::String(v.to_string())
    }
}

impl<T: Into<Cell>> From<Option<T>> for Cell {
    fn from(v: Option<T>) -> Self {
        v.map_or(Cell::Null, Into::into)
    }
}

/// A row: one cell per column, in column order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    cells: Vec<Cell>,
}

impl Row {
    /// Create a new row from cells
    pub fn new(cells: Vec<Cell>) -> Self {
        Self { cells }
    }

    /// Get a cell by index
    pub fn get(&self, index: usize) -> Option<&Cell> {
        self.cells.get(index)
    }

    /// Get all cells
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Get number of cells
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Check if row is empty
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Cells rendered for display
    pub fn to_strings(&self) -> Vec<String> {
        self.cells.iter().map(|c| c.to_string()).collect()
    }
}

impl From<Vec<Cell>> for Row {
    fn from(cells: Vec<Cell>) -> Self {
        Row::new(cells)
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.to_strings().join(", "))
    }
}

/// Build a [`Row`] from a list of values convertible into cells
#[macro_export]
macro_rules! row {
    ($($value:expr),* $(,)?) => {
        $crate::storage::Row::new(vec![$($crate::storage::Cell::from($value)),*])
    };
}
