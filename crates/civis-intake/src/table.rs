//! In-memory tables and the schema value object reported by sources

use std::sync::Arc;

use arrow::compute::concat_batches;
use arrow::datatypes::{DataType, Schema as ArrowSchema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use serde_json::{Map, Value};

/// A fully materialized result: one Arrow schema plus the batches read for it.
#[derive(Debug, Clone)]
pub struct Table {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
}

impl Table {
    /// Build a table, checking every batch has the schema's column count
    pub fn try_new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Result<Self, ArrowError> {
        let width = schema.fields().len();
        if let Some(bad) = batches.iter().find(|b| b.num_columns() != width) {
            return Err(ArrowError::SchemaError(format!(
                "batch has {} columns, table schema has {}",
                bad.num_columns(),
                width
            )));
        }
        Ok(Self { schema, batches })
    }

    pub fn from_batch(batch: RecordBatch) -> Self {
        Self {
            schema: batch.schema(),
            batches: vec![batch],
        }
    }

    pub fn empty(schema: SchemaRef) -> Self {
        Self {
            schema,
            batches: Vec::new(),
        }
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    pub fn num_columns(&self) -> usize {
        self.schema.fields().len()
    }

    /// (rows, columns)
    pub fn shape(&self) -> (usize, usize) {
        (self.num_rows(), self.num_columns())
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.schema.fields().iter().map(|f| f.name().as_str()).collect()
    }

    /// Per-column data types in column order
    pub fn dtypes(&self) -> Vec<(String, DataType)> {
        self.schema
            .fields()
            .iter()
            .map(|f| (f.name().clone(), f.data_type().clone()))
            .collect()
    }

    /// Collapse all batches into one
    pub fn concat(&self) -> Result<RecordBatch, ArrowError> {
        concat_batches(&self.schema, &self.batches)
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::empty(Arc::new(ArrowSchema::empty()))
    }
}

/// Description of a loaded source.
///
/// Mirrors what catalog browsers expect from any data source: column types,
/// the overall shape, and how many partitions a reader can request.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    /// Symbolic shape description; never populated for tabular sources
    pub datashape: Option<String>,
    /// Column names and types
    pub dtype: SchemaRef,
    /// (rows, columns)
    pub shape: (usize, usize),
    pub npartitions: usize,
    pub extra_metadata: Map<String, Value>,
}

impl Schema {
    /// Describe a table as a single partition
    pub fn from_table(table: &Table) -> Self {
        Self {
            datashape: None,
            dtype: table.schema(),
            shape: table.shape(),
            npartitions: 1,
            extra_metadata: Map::new(),
        }
    }

    pub fn dtypes(&self) -> Vec<(&str, &DataType)> {
        self.dtype
            .fields()
            .iter()
            .map(|f| (f.name().as_str(), f.data_type()))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use arrow::array::{Int32Array, StringArray};
    use arrow::datatypes::Field;

    pub(crate) fn people(rows: &[(i32, &str)]) -> Table {
        let schema = Arc::new(ArrowSchema::new(vec![
            Field::new("id", DataType::Int32, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        let ids = Int32Array::from(rows.iter().map(|(id, _)| *id).collect::<Vec<_>>());
        let names = StringArray::from(rows.iter().map(|(_, n)| *n).collect::<Vec<_>>());
        let batch = RecordBatch::try_new(schema, vec![Arc::new(ids), Arc::new(names)]).unwrap();
        Table::from_batch(batch)
    }

    #[test]
    fn test_shape_and_dtypes() {
        let table = people(&[(1, "Alice"), (2, "Bob"), (3, "Carol")]);
        assert_eq!(table.shape(), (3, 2));
        assert_eq!(table.column_names(), vec!["id", "name"]);
        assert_eq!(table.dtypes()[1], ("name".to_string(), DataType::Utf8));
    }

    #[test]
    fn test_rows_summed_across_batches() {
        let a = people(&[(1, "Alice")]);
        let b = people(&[(2, "Bob"), (3, "Carol")]);
        let batches = a.batches().iter().chain(b.batches()).cloned().collect();
        let table = Table::try_new(a.schema(), batches).unwrap();

        assert_eq!(table.num_rows(), 3);
        assert_eq!(table.concat().unwrap().num_rows(), 3);
    }

    #[test]
    fn test_mismatched_batch_rejected() {
        let wide = people(&[(1, "Alice")]);
        let narrow = Arc::new(ArrowSchema::new(vec![Field::new("id", DataType::Int32, false)]));
        assert!(Table::try_new(narrow, wide.batches().to_vec()).is_err());
    }

    #[test]
    fn test_schema_is_single_partition() {
        let table = people(&[(1, "Alice"), (2, "Bob")]);
        let schema = Schema::from_table(&table);

        assert_eq!(schema.shape, (2, 2));
        assert_eq!(schema.npartitions, 1);
        assert!(schema.datashape.is_none());
        assert!(schema.extra_metadata.is_empty());
        assert_eq!(schema.dtypes()[0], ("id", &DataType::Int32));
    }

    #[test]
    fn test_empty_table() {
        let table = Table::default();
        assert_eq!(table.shape(), (0, 0));
    }
}
