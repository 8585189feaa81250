use rusqlite::Connection;
use rusqlite::types::Value;
use tracing::debug;

use crate::error::LoadError;
use crate::store::batch::safe_batch_size;

type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// A destination table and the columns written for every row.
#[derive(Debug)]
pub struct Table {
    pub name: &'static str,
    pub columns: &'static [&'static str],
}

impl Table {
    pub fn fields_per_row(&self) -> usize {
        self.columns.len()
    }

    /// Multi-row INSERT statement for `rows` rows.
    pub fn insert_sql(&self, rows: usize) -> String {
        let placeholders = vec!["?"; self.columns.len()].join(",");
        let tuple = format!("({placeholders})");
        let values = vec![tuple.as_str(); rows].join(",");
        format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.name,
            self.columns.join(","),
            values
        )
    }
}

/// Something that accepts one multi-row insert at a time.
pub trait BatchSink {
    /// `values` holds `rows * table.fields_per_row()` parameters, row-major.
    fn insert_batch(
        &mut self,
        table: &Table,
        rows: usize,
        values: Vec<Value>,
    ) -> Result<(), SinkError>;
}

pub struct SqliteSink<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteSink<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

impl BatchSink for SqliteSink<'_> {
    fn insert_batch(
        &mut self,
        table: &Table,
        rows: usize,
        values: Vec<Value>,
    ) -> Result<(), SinkError> {
        let mut stmt = self.conn.prepare_cached(&table.insert_sql(rows))?;
        stmt.execute(rusqlite::params_from_iter(values.iter()))?;
        Ok(())
    }
}

/// Writes `records` into `table` in consecutive batches sized by
/// `safe_batch_size`. The first failing batch aborts the load; earlier
/// batches are left in place for the caller's transaction to decide on.
pub fn load_table<S, T, I, F>(
    sink: &mut S,
    table: &Table,
    records: I,
    mut to_values: F,
) -> Result<usize, LoadError>
where
    S: BatchSink,
    I: IntoIterator<Item = T>,
    F: FnMut(&T, &mut Vec<Value>),
{
    let fields = table.fields_per_row();
    let batch_rows = safe_batch_size(fields as i64);
    let mut values = Vec::with_capacity(batch_rows * fields);
    let mut rows = 0usize;
    let mut batch_index = 0usize;
    let mut total = 0usize;

    for record in records {
        to_values(&record, &mut values);
        debug_assert_eq!(values.len(), (rows + 1) * fields, "row shape for {}", table.name);
        rows += 1;
        if rows == batch_rows {
            let full = std::mem::replace(&mut values, Vec::with_capacity(batch_rows * fields));
            flush(sink, table, batch_index, rows, full)?;
            total += rows;
            batch_index += 1;
            rows = 0;
        }
    }
    if rows > 0 {
        flush(sink, table, batch_index, rows, values)?;
        total += rows;
        batch_index += 1;
    }

    debug!(table = table.name, rows = total, batches = batch_index, "bulk load complete");
    Ok(total)
}

fn flush<S: BatchSink>(
    sink: &mut S,
    table: &Table,
    batch_index: usize,
    rows: usize,
    values: Vec<Value>,
) -> Result<(), LoadError> {
    sink.insert_batch(table, rows, values)
        .map_err(|source| LoadError::Batch {
            table: table.name,
            batch_index,
            source,
        })
}
