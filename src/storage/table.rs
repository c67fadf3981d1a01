//! Table storage for QuarryDB
//!
//! A table owns its columns, a B+ tree primary index from key cell to row,
//! and a [`SessionLock`]. The table never takes its own session lock: the
//! statement handler acquires it once per statement before calling in here.
//!
//! Every mutation validates the whole batch before touching the index, so a
//! failed insert, delete or update leaves the table unchanged.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use super::btree::BPlusTree;
use super::tuple::{Cell, Row};
use crate::catalog::{Column, ColumnType};
use crate::error::{Error, Result};
use crate::transaction::SessionLock;

/// Suffix of the per-table metadata file
pub const META_SUFFIX: &str = ".meta";

/// A table combining schema and storage
#[derive(Debug)]
pub struct Table {
    name: String,
    columns: Vec<Column>,
    /// Position of the primary key column
    primary_index: usize,
    /// Primary index: key cell -> row
    index: RwLock<BPlusTree<Cell, Row>>,
    lock: SessionLock,
    data_path: PathBuf,
    meta_path: PathBuf,
}

impl Table {
    /// Open a table stored under `dir`, loading any rows already on disk.
    /// A missing data file means an empty table.
    pub fn open(dir: &Path, name: impl Into<String>, columns: Vec<Column>) -> Result<Self> {
        let name = name.into();
        let columns: Vec<Column> = columns
            .into_iter()
            .map(|c| {
                let not_null = c.not_null;
                c.not_null(not_null)
            })
            .collect();
        for column in &columns {
            column.validate()?;
        }
        let mut seen = BTreeSet::new();
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(Error::InvalidColumn(format!(
                    "duplicate column '{}' in table '{}'",
                    column.name, name
                )));
            }
        }

        let primaries: Vec<usize> = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.primary)
            .map(|(i, _)| i)
            .collect();
        if primaries.len() != 1 {
            return Err(Error::PrimaryKeyCount {
                table: name,
                found: primaries.len(),
            });
        }

        fs::create_dir_all(dir)?;
        let table = Self {
            data_path: dir.join(&name),
            meta_path: dir.join(format!("{}{}", name, META_SUFFIX)),
            lock: SessionLock::new(name.clone()),
            name,
            columns,
            primary_index: primaries[0],
            index: RwLock::new(BPlusTree::new()),
        };
        table.load()?;
        Ok(table)
    }

    fn load(&self) -> Result<()> {
        let file = match File::open(&self.data_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut index = self.index.write();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let row: Row = serde_json::from_str(&line)?;
            self.check_row(&row)?;
            let key = self.key_of(&row).clone();
            if index.contains_key(&key) {
                return Err(Error::DuplicateKey(format!(
                    "{} in {}",
                    key,
                    self.data_path.display()
                )));
            }
            index.insert(key, row);
        }
        tracing::debug!("loaded {} rows into table '{}'", index.len(), self.name);
        Ok(())
    }

    /// Get table name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Position of the primary key column
    pub fn primary_index(&self) -> usize {
        self.primary_index
    }

    /// The table's session lock
    pub fn lock(&self) -> &SessionLock {
        &self.lock
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    /// Primary key cell of a row already checked against the schema
    fn key_of<'r>(&self, row: &'r Row) -> &'r Cell {
        &row.cells()[self.primary_index]
    }

    /// Point lookup by primary key
    pub fn get(&self, key: &Cell) -> Result<Row> {
        self.index
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))
    }

    pub fn contains(&self, key: &Cell) -> bool {
        self.index.read().contains_key(key)
    }

    /// All rows in primary key order
    pub fn scan(&self) -> Vec<Row> {
        self.index.read().values().cloned().collect()
    }

    /// Rows with primary key in `[start, end]`, in key order
    pub fn range(&self, start: Option<&Cell>, end: Option<&Cell>) -> Vec<Row> {
        self.index
            .read()
            .range_scan(start, end)
            .map(|(_, row)| row.clone())
            .collect()
    }

    /// Get row count
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a batch of rows, all or nothing
    pub fn insert(&self, rows: Vec<Row>) -> Result<()> {
        let mut index = self.index.write();
        self.check_insert(&index, &rows, &BTreeSet::new())?;
        for row in rows {
            let key = self.key_of(&row).clone();
            index.insert(key, row);
        }
        Ok(())
    }

    /// Delete a batch of keys, all or nothing
    pub fn delete(&self, keys: &[Cell]) -> Result<()> {
        let mut index = self.index.write();
        self.check_delete(&index, keys)?;
        for key in keys {
            index.remove(key);
        }
        Ok(())
    }

    /// Replace the rows at `old_keys` with `new_rows`. Keys vacated by this
    /// call may be reused by the new rows.
    pub fn update(&self, old_keys: &[Cell], new_rows: Vec<Row>) -> Result<()> {
        let mut index = self.index.write();
        let vacated = self.check_delete(&index, old_keys)?;
        self.check_insert(&index, &new_rows, &vacated)?;
        for key in old_keys {
            index.remove(key);
        }
        for row in new_rows {
            let key = self.key_of(&row).clone();
            index.insert(key, row);
        }
        Ok(())
    }

    fn check_insert(
        &self,
        index: &BPlusTree<Cell, Row>,
        rows: &[Row],
        vacated: &BTreeSet<&Cell>,
    ) -> Result<()> {
        let mut batch = BTreeSet::new();
        for row in rows {
            self.check_row(row)?;
            let key = self.key_of(row);
            if index.contains_key(key) && !vacated.contains(key) {
                return Err(Error::DuplicateKey(key.to_string()));
            }
            if !batch.insert(key) {
                return Err(Error::DuplicateKey(key.to_string()));
            }
        }
        Ok(())
    }

    fn check_delete<'k>(
        &self,
        index: &BPlusTree<Cell, Row>,
        keys: &'k [Cell],
    ) -> Result<BTreeSet<&'k Cell>> {
        let mut set = BTreeSet::new();
        for key in keys {
            // Deleting the same key twice fails the same way as a missing key
            if !set.insert(key) || !index.contains_key(key) {
                return Err(Error::KeyNotFound(key.to_string()));
            }
        }
        Ok(set)
    }

    /// Check arity, types, NULLs and string lengths
    fn check_row(&self, row: &Row) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(Error::ColumnCountMismatch {
                expected: self.columns.len(),
                found: row.len(),
            });
        }
        for (cell, column) in row.cells().iter().zip(&self.columns) {
            cell.check_storable()?;
            let Some(cell_type) = cell.column_type() else {
                if column.not_null {
                    return Err(Error::NullNotAllowed(column.name.clone()));
                }
                continue;
            };
            if cell_type != column.column_type {
                return Err(Error::TypeMismatch {
                    from: cell_type.to_string(),
                    to: format!("{} column '{}'", column.column_type, column.name),
                });
            }
            if let (ColumnType::String, Some(s)) = (column.column_type, cell.as_str()) {
                let length = s.chars().count();
                if length > column.max_length {
                    return Err(Error::ValueTooLarge {
                        column: column.name.clone(),
                        length,
                        max: column.max_length,
                    });
                }
            }
        }
        Ok(())
    }

    /// Write every row to the data file, replacing its previous content
    pub fn persist(&self) -> Result<()> {
        let tmp_path = self.data_path.with_extension("tmp");
        {
            let index = self.index.read();
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for row in index.values() {
                serde_json::to_writer(&mut writer, row)?;
                writeln!(writer)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.data_path)?;
        Ok(())
    }

    /// Write the column definitions, one metadata line per column
    pub fn persist_meta(&self) -> Result<()> {
        let mut writer = BufWriter::new(File::create(&self.meta_path)?);
        for column in &self.columns {
            writeln!(writer, "{}", column.to_meta_line())?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Read a metadata file written by [`Table::persist_meta`]
    pub fn read_meta(path: &Path) -> Result<Vec<Column>> {
        let file = File::open(path)?;
        let mut columns = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if !line.trim().is_empty() {
                columns.push(Column::parse_meta_line(&line)?);
            }
        }
        Ok(columns)
    }

    /// Remove the table's data file
    pub fn drop_data(&self) -> Result<()> {
        remove_if_exists(&self.data_path)
    }
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn columns() -> Vec<Column> {
        vec![
            Column::new("id", ColumnType::Int).primary_key(true),
            Column::string("name", 10).not_null(true),
            Column::new("score", ColumnType::Double),
        ]
    }

    fn create_test_table(dir: &TempDir) -> Table {
        Table::open(dir.path(), "users", columns()).unwrap()
    }

    #[test]
    fn test_table_insert_and_get() {
        let dir = TempDir::new().unwrap();
        let table = create_test_table(&dir);

        let rows = vec![row![1, "Alice", 9.5], row![2, "Bob", Option::<f64>::None]];
        table.insert(rows.clone()).unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&Cell::Int(1)).unwrap(), rows[0]);
        assert_eq!(table.get(&Cell::Int(2)).unwrap(), rows[1]);
        assert!(matches!(table.get(&Cell::Int(3)), Err(Error::KeyNotFound(_))));
    }

    #[test]
    fn test_primary_key_count() {
        let dir = TempDir::new().unwrap();
        let none = vec![Column::new("id", ColumnType::Int)];
        assert!(matches!(
            Table::open(dir.path(), "t", none),
            Err(Error::PrimaryKeyCount { found: 0, .. })
        ));

        let two = vec![
            Column::new("a", ColumnType::Int).primary_key(true),
            Column::new("b", ColumnType::Int).primary_key(true),
        ];
        assert!(matches!(
            Table::open(dir.path(), "t", two),
            Err(Error::PrimaryKeyCount { found: 2, .. })
        ));
    }

    #[test]
    fn test_table_not_null_constraint() {
        let dir = TempDir::new().unwrap();
        let table = create_test_table(&dir);

        let result = table.insert(vec![row![1, Option::<String>::None, 1.0]]);
        assert!(matches!(result, Err(Error::NullNotAllowed(_))));
        assert!(table.is_empty());
    }

    #[test]
    fn test_table_schema_checks() {
        let dir = TempDir::new().unwrap();
        let table = create_test_table(&dir);

        let result = table.insert(vec![row![1, "Alice"]]);
        assert!(matches!(result, Err(Error::ColumnCountMismatch { .. })));

        let result = table.insert(vec![row![1i64, "Alice", 1.0]]);
        assert!(matches!(result, Err(Error::TypeMismatch { .. })));

        let result = table.insert(vec![row![1, "Bartholomew", 1.0]]);
        assert!(matches!(result, Err(Error::ValueTooLarge { length: 11, .. })));
    }

    #[test]
    fn test_duplicate_key_in_batch_leaves_table_unchanged() {
        let dir = TempDir::new().unwrap();
        let table = create_test_table(&dir);
        table.insert(vec![row![1, "a", 0.0]]).unwrap();

        let result = table.insert(vec![row![2, "b", 0.0], row![2, "c", 0.0]]);
        assert!(matches!(result, Err(Error::DuplicateKey(_))));
        assert_eq!(table.len(), 1);

        let result = table.insert(vec![row![3, "d", 0.0], row![1, "e", 0.0]]);
        assert!(matches!(result, Err(Error::DuplicateKey(_))));
        assert_eq!(table.len(), 1);
        assert!(!table.contains(&Cell::Int(3)));
    }

    #[test]
    fn test_delete_validates_first() {
        let dir = TempDir::new().unwrap();
        let table = create_test_table(&dir);
        table
            .insert(vec![row![1, "a", 0.0], row![2, "b", 0.0]])
            .unwrap();

        let result = table.delete(&[Cell::Int(1), Cell::Int(9)]);
        assert!(matches!(result, Err(Error::KeyNotFound(_))));
        assert_eq!(table.len(), 2);

        let result = table.delete(&[Cell::Int(1), Cell::Int(1)]);
        assert!(matches!(result, Err(Error::KeyNotFound(_))));
        assert_eq!(table.len(), 2);

        table.delete(&[Cell::Int(1)]).unwrap();
        assert_eq!(table.scan(), vec![row![2, "b", 0.0]]);
    }

    #[test]
    fn test_update_own_key() {
        let dir = TempDir::new().unwrap();
        let table = create_test_table(&dir);
        table.insert(vec![row![1, "a", 0.0]]).unwrap();

        table.update(&[Cell::Int(1)], vec![row![1, "z", 1.0]]).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&Cell::Int(1)).unwrap(), row![1, "z", 1.0]);
    }

    #[test]
    fn test_update_swaps_keys() {
        let dir = TempDir::new().unwrap();
        let table = create_test_table(&dir);
        table
            .insert(vec![row![1, "a", 0.0], row![2, "b", 0.0]])
            .unwrap();

        table
            .update(
                &[Cell::Int(1), Cell::Int(2)],
                vec![row![2, "a", 0.0], row![1, "b", 0.0]],
            )
            .unwrap();
        assert_eq!(table.scan(), vec![row![1, "b", 0.0], row![2, "a", 0.0]]);

        // Moving onto a key that is not vacated fails and changes nothing
        let result = table.update(&[Cell::Int(1)], vec![row![2, "x", 0.0]]);
        assert!(matches!(result, Err(Error::DuplicateKey(_))));
        assert_eq!(table.scan(), vec![row![1, "b", 0.0], row![2, "a", 0.0]]);
    }

    #[test]
    fn test_scan_in_key_order() {
        let dir = TempDir::new().unwrap();
        let table = create_test_table(&dir);
        for i in [5, 3, 9, 1] {
            table.insert(vec![row![i, format!("u{}", i), 0.0]]).unwrap();
        }
        let keys: Vec<Cell> = table.scan().iter().map(|r| r.cells()[0].clone()).collect();
        assert_eq!(keys, vec![Cell::Int(1), Cell::Int(3), Cell::Int(5), Cell::Int(9)]);

        let mid = table.range(Some(&Cell::Int(3)), Some(&Cell::Int(5)));
        assert_eq!(mid.len(), 2);
    }

    #[test]
    fn test_persist_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let table = create_test_table(&dir);
            table
                .insert(vec![row![1, "a", 0.5], row![2, "b", Option::<f64>::None]])
                .unwrap();
            table.persist().unwrap();
            table.persist_meta().unwrap();
        }

        let columns = Table::read_meta(&dir.path().join("users.meta")).unwrap();
        assert_eq!(columns, self::columns());
        let table = Table::open(dir.path(), "users", columns).unwrap();
        assert_eq!(
            table.scan(),
            vec![row![1, "a", 0.5], row![2, "b", Option::<f64>::None]]
        );

        table.drop_data().unwrap();
        assert!(!table.data_path().exists());
    }

    #[test]
    fn test_non_finite_floats_are_rejected() {
        let dir = TempDir::new().unwrap();
        let table = create_test_table(&dir);

        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let result = table.insert(vec![row![1, "a", value]]);
            assert!(matches!(result, Err(Error::NonFiniteFloat(_))));
        }
        assert!(table.is_empty());

        table.insert(vec![row![1, "a", 1.0]]).unwrap();
        let result = table.update(&[Cell::Int(1)], vec![row![1, "a", f64::NAN]]);
        assert!(matches!(result, Err(Error::NonFiniteFloat(_))));
        assert_eq!(table.get(&Cell::Int(1)).unwrap(), row![1, "a", 1.0]);
    }

    #[test]
    fn test_negative_zero_persists() {
        let dir = TempDir::new().unwrap();
        {
            let table = create_test_table(&dir);
            table.insert(vec![row![1, "a", -0.0]]).unwrap();
            table.persist().unwrap();
        }

        let table = create_test_table(&dir);
        let row = table.get(&Cell::Int(1)).unwrap();
        let Some(Cell::Double(score)) = row.get(2) else {
            panic!("expected a double score in {}", row);
        };
        assert!(*score == 0.0 && score.is_sign_negative());
    }

    #[test]
    fn test_duplicate_key_in_data_file() {
        let dir = TempDir::new().unwrap();
        let line = serde_json::to_string(&row![1, "a", 0.0]).unwrap();
        fs::write(dir.path().join("users"), format!("{}\n{}\n", line, line)).unwrap();

        let result = Table::open(dir.path(), "users", columns());
        assert!(matches!(result, Err(Error::DuplicateKey(_))));
    }

    /// Rows with distinct keys, valid for [`columns`]
    fn valid_batch() -> impl Strategy<Value = Vec<Row>> {
        prop::collection::btree_map(
            any::<i32>(),
            ("[a-z]{0,10}", prop::option::of(-1.0e9f64..1.0e9)),
            0..40,
        )
        .prop_map(|entries: BTreeMap<i32, (String, Option<f64>)>| {
            entries
                .into_iter()
                .map(|(id, (name, score))| row![id, name, score])
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_insert_then_get_round_trips(rows in valid_batch()) {
            let dir = TempDir::new().unwrap();
            let table = create_test_table(&dir);

            table.insert(rows.clone()).unwrap();
            prop_assert_eq!(table.len(), rows.len());
            for row in &rows {
                prop_assert_eq!(&table.get(&row.cells()[0]).unwrap(), row);
            }
        }

        #[test]
        fn prop_duplicate_key_batch_changes_nothing(
            existing in valid_batch(),
            batch in valid_batch(),
            pick in any::<prop::sample::Index>(),
        ) {
            prop_assume!(!batch.is_empty());
            let dir = TempDir::new().unwrap();
            let table = create_test_table(&dir);
            table.insert(existing.clone()).unwrap();

            // Repeat one key of the batch with different content
            let mut batch = batch;
            let dup = pick.get(&batch).cells()[0].clone();
            batch.push(Row::new(vec![dup, Cell::from("dup"), Cell::Null]));

            let result = table.insert(batch);
            prop_assert!(matches!(result, Err(Error::DuplicateKey(_))));
            prop_assert_eq!(table.len(), existing.len());
            prop_assert_eq!(table.scan(), existing);
        }
    }
}
