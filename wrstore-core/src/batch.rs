//! Batched insert lifecycle shared by the writers.
//!
//! A batch is an in-memory row buffer bound to one target table. The
//! lifecycle is prepare -> append xN -> send -> re-prepare, with close
//! sending any residue exactly once. Appends never touch the network; a
//! send performs a single binary COPY of the whole buffer. An aborted
//! batch is discarded without a send, which is how a reset recovers from a
//! previous incomplete ingest.

use chrono::NaiveDate;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::binary_copy::BinaryCopyInWriter;
use tokio_postgres::Client;
use uuid::Uuid;

use crate::db::quote_ident;
use crate::error::{Result, StoreError};

/// Owned column value buffered for a later COPY.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Value {
    Text(String),
    Int(i64),
    Uuid(Uuid),
    Date(NaiveDate),
    IntArray(Vec<i64>),
}

impl Value {
    fn as_sql(&self) -> &(dyn ToSql + Sync) {
        match self {
            Value::Text(v) => v,
            Value::Int(v) => v,
            Value::Uuid(v) => v,
            Value::Date(v) => v,
            Value::IntArray(v) => v,
        }
    }
}

/// Convert an unsigned input to the signed wire representation, surfacing
/// overflow instead of panicking.
pub(crate) fn bind_u64(field: &'static str, value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| StoreError::IntConversion {
        field,
        value: value.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchState {
    Idle,
    Open,
    Closed,
}

/// Row batch bound to one target table.
pub(crate) struct Batch {
    table: &'static str,
    columns: &'static [&'static str],
    types: &'static [Type],
    rows: Vec<Vec<Value>>,
    capacity: usize,
    state: BatchState,
    sends: u64,
    appended_total: u64,
}

impl Batch {
    pub(crate) fn new(
        table: &'static str,
        columns: &'static [&'static str],
        types: &'static [Type],
        capacity: usize,
    ) -> Self {
        debug_assert_eq!(columns.len(), types.len());
        Self {
            table,
            columns,
            types,
            rows: Vec::new(),
            capacity,
            state: BatchState::Idle,
            sends: 0,
            appended_total: 0,
        }
    }

    /// Open the batch for appends. A pre-existing open buffer from a prior
    /// incomplete run is aborted, never sent.
    pub(crate) fn prepare(&mut self) {
        if self.state == BatchState::Open && !self.rows.is_empty() {
            log::warn!(
                "Aborting stale open batch; table={}, rows={}",
                self.table,
                self.rows.len()
            );
        }
        self.rows.clear();
        self.state = BatchState::Open;
    }

    /// Discard the buffer without sending.
    pub(crate) fn abort(&mut self) {
        self.rows.clear();
        self.state = BatchState::Idle;
    }

    /// Buffer one row. Returns true when the batch reached capacity and
    /// the caller should send.
    pub(crate) fn append(&mut self, row: Vec<Value>) -> Result<bool> {
        if self.state != BatchState::Open {
            return Err(StoreError::Precondition(format!(
                "batch for {} is not open",
                self.table
            )));
        }
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
        self.appended_total += 1;
        Ok(self.rows.len() >= self.capacity)
    }

    pub(crate) fn buffered(&self) -> usize {
        self.rows.len()
    }

    /// Total rows appended across the batch's lifetime.
    pub(crate) fn appended_total(&self) -> u64 {
        self.appended_total
    }

    /// COPY the buffer to the server and re-prepare for further appends.
    pub(crate) async fn send(&mut self, client: &Client) -> Result<()> {
        if self.state != BatchState::Open {
            return Err(StoreError::Precondition(format!(
                "batch for {} is not open",
                self.table
            )));
        }

        if !self.rows.is_empty() {
            copy_rows(client, self.table, self.columns, self.types, &self.rows).await?;
            self.sends += 1;
            log::debug!(
                "Batch sent; table={}, rows={}, sends={}",
                self.table,
                self.rows.len(),
                self.sends
            );
        }

        self.rows.clear();
        Ok(())
    }

    /// Send any residue and close. A closed batch refuses further appends
    /// until the next prepare.
    pub(crate) async fn close(&mut self, client: &Client) -> Result<()> {
        if self.state == BatchState::Open {
            self.send(client).await?;
        }
        self.state = BatchState::Closed;
        Ok(())
    }
}

/// Perform one binary COPY of buffered rows into a table.
pub(crate) async fn copy_rows(
    client: &Client,
    table: &str,
    columns: &[&str],
    types: &[Type],
    rows: &[Vec<Value>],
) -> Result<()> {
    let sql = format!(
        "COPY {} ({}) FROM STDIN BINARY",
        quote_ident(table),
        columns.join(", ")
    );

    let sink = client.copy_in(&sql).await?;
    let writer = BinaryCopyInWriter::new(sink, types);
    tokio::pin!(writer);

    for row in rows {
        let refs: Vec<&(dyn ToSql + Sync)> = row.iter().map(Value::as_sql).collect();
        writer.as_mut().write(&refs).await?;
    }

    writer.finish().await?;
    Ok(())
}
