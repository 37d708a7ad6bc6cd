//! Decoded result rows and their column names.

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Column names of one result set.
///
/// Rows of one result set share it through an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    names: Vec<String>,
    /// Name -> index of the first column with that name
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    pub fn new(names: Vec<String>) -> Self {
        let mut name_to_index = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            name_to_index.entry(name.clone()).or_insert(i);
        }
        Self {
            names,
            name_to_index,
        }
    }

    /// Column names with duplicates disambiguated.
    ///
    /// The first occurrence keeps its name; later ones get `.1`, `.2`, ...
    /// (`id`, `id` becomes `id`, `id.1`).
    pub fn unique_names(&self) -> Vec<String> {
        let mut seen: HashMap<&str, usize> = HashMap::new();
        let mut taken: Vec<String> = Vec::with_capacity(self.names.len());
        for name in &self.names {
            let count = seen.entry(name.as_str()).or_insert(0);
            let mut candidate = if *count == 0 {
                name.clone()
            } else {
                format!("{name}.{count}")
            };
            while taken.contains(&candidate) {
                *count += 1;
                candidate = format!("{name}.{count}");
            }
            *count += 1;
            taken.push(candidate);
        }
        taken
    }
}

/// A single row returned from a query.
///
/// Values are positionally aligned with the result set's columns; SQL NULL is
/// [`Value::Null`]. A row owns its values and holds no reference back to the
/// connection that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Value>,
    columns: Arc<ColumnInfo>,
}

impl Row {
    /// A row with its own column list.
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        let columns = Arc::new(ColumnInfo::new(column_names));
        Self { values, columns }
    }

    /// A row pointing at its result set's shared columns.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value of the first column called `name`.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        let index = *self.columns.name_to_index.get(name)?;
        self.values.get(index)
    }

    /// Convert the value at `index`; a missing column is a type error.
    pub fn get_as<T>(&self, index: usize) -> Result<T>
    where
        T: TryFrom<Value, Error = Error>,
    {
        match self.get(index) {
            Some(value) => T::try_from(value.clone()),
            None => Err(Error::Type(TypeError {
                expected: std::any::type_name::<T>(),
                actual: format!("no column {index} in a row of {}", self.len()),
                column: None,
            })),
        }
    }

    /// Columns paired with their values, in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    /// Convert into a name -> value map, suffixing duplicate column names.
    pub fn to_map(&self) -> HashMap<String, Value> {
        self.columns
            .unique_names()
            .into_iter()
            .zip(self.values.iter().cloned())
            .collect()
    }
}
