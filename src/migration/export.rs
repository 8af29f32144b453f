// ABOUTME: Streaming SQL export of one environment into a single dump artifact
// ABOUTME: Emits DDL, sequences, batched inserts, sequence values, indexes, and foreign keys in order

use super::codec::{decode_row, is_native_type, tuple_literal, SqlValue};
use super::filter::TableFilter;
use super::schema::{self, ColumnDefinition, ForeignKey, SequenceOwner};
use crate::utils::{join_quoted, quote_ident, quote_literal};
use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use deadpool_postgres::Pool;
use futures::stream::{BoxStream, StreamExt};
use std::collections::BTreeSet;
use std::future::Future;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

/// Rows per `INSERT` statement
pub const INSERT_BATCH_SIZE: usize = 500;

const WRITE_BUFFER_CAPACITY: usize = 256 * 1024;

/// Rows of one table, decoded in column order
pub type RowStream = BoxStream<'static, Result<Vec<SqlValue>>>;

/// Catalog and row access needed by the exporter
///
/// Implemented for [`deadpool_postgres::Pool`]; tests substitute in-memory sources.
pub trait ExportSource: Sync {
    fn list_tables(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn get_columns(&self, table: &str)
        -> impl Future<Output = Result<Vec<ColumnDefinition>>> + Send;

    fn list_sequences(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn list_sequence_owners(&self) -> impl Future<Output = Result<Vec<SequenceOwner>>> + Send;

    fn list_indexes(&self, table: &str) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn list_foreign_keys(&self, table: &str)
        -> impl Future<Output = Result<Vec<ForeignKey>>> + Send;

    fn max_column_value(
        &self,
        table: &str,
        column: &str,
    ) -> impl Future<Output = Result<i64>> + Send;

    /// Open a cursor over every row of `table`, selecting `columns` in order
    fn stream_rows(
        &self,
        table: &str,
        columns: &[ColumnDefinition],
    ) -> impl Future<Output = Result<RowStream>> + Send;
}

impl ExportSource for Pool {
    async fn list_tables(&self) -> Result<Vec<String>> {
        schema::list_tables(self).await
    }

    async fn get_columns(&self, table: &str) -> Result<Vec<ColumnDefinition>> {
        schema::get_columns(self, table).await
    }

    async fn list_sequences(&self) -> Result<Vec<String>> {
        schema::list_sequences(self).await
    }

    async fn list_sequence_owners(&self) -> Result<Vec<SequenceOwner>> {
        schema::list_sequence_owners(self).await
    }

    async fn list_indexes(&self, table: &str) -> Result<Vec<String>> {
        schema::list_indexes(self, table).await
    }

    async fn list_foreign_keys(&self, table: &str) -> Result<Vec<ForeignKey>> {
        schema::list_foreign_keys(self, table).await
    }

    async fn max_column_value(&self, table: &str, column: &str) -> Result<i64> {
        schema::max_column_value(self, table, column).await
    }

    async fn stream_rows(&self, table: &str, columns: &[ColumnDefinition]) -> Result<RowStream> {
        let client = self
            .get()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to acquire connection: {}", e))?;
        let query = select_statement(table, columns);
        let rows = client
            .query_raw(query.as_str(), Vec::<String>::new())
            .await
            .with_context(|| format!("Failed to select rows from {}", table))?;

        // The pooled client travels with the cursor so the connection stays
        // checked out until the last row has been read.
        let stream = futures::stream::unfold(
            (client, Box::pin(rows)),
            |(client, mut rows)| async move {
                let item = match rows.next().await? {
                    Ok(row) => decode_row(&row),
                    Err(e) => Err(anyhow::Error::new(e).context("Failed to fetch row")),
                };
                Some((item, (client, rows)))
            },
        );
        Ok(stream.boxed())
    }
}

/// `SELECT` listing columns in introspection order; non-native types are read as text
pub fn select_statement(table: &str, columns: &[ColumnDefinition]) -> String {
    let exprs: Vec<String> = columns
        .iter()
        .map(|c| {
            if is_native_type(&c.udt_name) {
                quote_ident(&c.name)
            } else {
                format!("{}::text", quote_ident(&c.name))
            }
        })
        .collect();
    format!("SELECT {} FROM {}", exprs.join(", "), quote_ident(table))
}

/// Progress after each flushed batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportProgress {
    /// 1-based index of the table being exported
    pub table_index: usize,
    pub table_count: usize,
    pub table: String,
    /// Rows written so far for this table
    pub rows: u64,
}

impl ExportProgress {
    /// Whole-job percentage: table index over table count, clamped to 100
    pub fn percent(&self) -> u8 {
        if self.table_count == 0 {
            return 100;
        }
        let pct = self.table_index as f64 / self.table_count as f64 * 100.0;
        pct.clamp(0.0, 100.0) as u8
    }
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Environment name written into the header
    pub source_label: String,
    pub filter: TableFilter,
    pub batch_size: usize,
}

impl ExportOptions {
    pub fn new(source_label: impl Into<String>, filter: TableFilter) -> Self {
        Self {
            source_label: source_label.into(),
            filter,
            batch_size: INSERT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub tables: usize,
    pub rows: u64,
}

/// Export the filtered tables of `source` as one SQL artifact
///
/// Sections are written in this order: table DDL, sequences, table data,
/// sequence values, indexes, foreign keys. Loading data before indexes and
/// constraints exist keeps the import fast, and sequence values can only be
/// computed once the data is present.
///
/// Rows are never collected: each table is read through a cursor and written
/// in `INSERT` batches of `options.batch_size` rows, flushing after each one.
/// `cancel` is checked between tables.
pub async fn export<S, W, F>(
    source: &S,
    out: W,
    options: &ExportOptions,
    cancel: &CancellationToken,
    mut on_progress: F,
) -> Result<ExportSummary>
where
    S: ExportSource,
    W: AsyncWrite + Unpin + Send,
    F: FnMut(&ExportProgress) + Send,
{
    let batch_size = options.batch_size.max(1);
    let mut out = BufWriter::with_capacity(WRITE_BUFFER_CAPACITY, out);

    out.write_all(
        format!(
            "-- SQL export\n-- Database: {}\n-- Generated: {}\n\n",
            options.source_label,
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        )
        .as_bytes(),
    )
    .await
    .context("Failed to write dump header")?;

    let discovered = source.list_tables().await.context("Failed to list tables")?;
    let tables = options.filter.apply(discovered);
    let total = tables.len();
    tracing::info!(
        "Exporting {} table(s) from '{}'",
        total,
        options.source_label
    );

    // Step 1: table DDL
    let mut table_columns: Vec<(String, Vec<ColumnDefinition>)> = Vec::with_capacity(total);
    for table in &tables {
        check_cancelled(cancel)?;
        let columns = source
            .get_columns(table)
            .await
            .with_context(|| format!("create table for {}", table))?;
        write_create_table(&mut out, table, &columns).await?;
        table_columns.push((table.clone(), columns));
    }

    // Step 2: sequences
    let sequences = source.list_sequences().await.context("Failed to list sequences")?;
    if !sequences.is_empty() {
        out.write_all(b"--\n-- Sequences\n--\n").await?;
        for sequence in &sequences {
            out.write_all(
                format!("CREATE SEQUENCE IF NOT EXISTS {};\n", quote_ident(sequence)).as_bytes(),
            )
            .await?;
        }
        out.write_all(b"\n").await?;
    }

    // Step 3: data
    let mut summary = ExportSummary {
        tables: total,
        rows: 0,
    };
    for (i, (table, columns)) in table_columns.iter().enumerate() {
        check_cancelled(cancel)?;
        tracing::debug!("Exporting data for {} ({}/{})", table, i + 1, total);

        let rows = source
            .stream_rows(table, columns)
            .await
            .with_context(|| format!("data for {}", table))?;
        let exported = write_table_rows(&mut out, table, columns, rows, batch_size, |rows| {
            on_progress(&ExportProgress {
                table_index: i + 1,
                table_count: total,
                table: table.clone(),
                rows,
            })
        })
        .await
        .with_context(|| format!("data for {}", table))?;

        if exported == 0 {
            on_progress(&ExportProgress {
                table_index: i + 1,
                table_count: total,
                table: table.clone(),
                rows: 0,
            });
        }
        summary.rows += exported;
        tracing::debug!("✓ {} row(s) exported from {}", exported, table);
    }

    // Step 4: sequence values
    let exported_tables: BTreeSet<&str> = tables.iter().map(String::as_str).collect();
    let owners = source
        .list_sequence_owners()
        .await
        .context("Failed to read sequence ownership")?;
    let owned: Vec<&SequenceOwner> = owners
        .iter()
        .filter(|o| exported_tables.contains(o.table.as_str()))
        .collect();
    if !owned.is_empty() {
        out.write_all(b"--\n-- Sequence values\n--\n").await?;
        for owner in owned {
            let max = source
                .max_column_value(&owner.table, &owner.column)
                .await
                .with_context(|| format!("sequence value for {}", owner.sequence))?;
            out.write_all(setval_statement(&owner.sequence, max).as_bytes())
                .await?;
        }
        out.write_all(b"\n").await?;
    }

    // Step 5: indexes
    out.write_all(b"--\n-- Indexes\n--\n").await?;
    for table in &tables {
        let indexes = source
            .list_indexes(table)
            .await
            .with_context(|| format!("indexes for {}", table))?;
        for index in indexes {
            out.write_all(format!("{};\n", index.trim_end_matches(';')).as_bytes())
                .await?;
        }
    }
    out.write_all(b"\n").await?;

    // Step 6: foreign keys
    out.write_all(b"--\n-- Foreign keys\n--\n").await?;
    for table in &tables {
        let foreign_keys = source
            .list_foreign_keys(table)
            .await
            .with_context(|| format!("constraints for {}", table))?;
        for fk in foreign_keys {
            out.write_all(
                format!(
                    "ALTER TABLE {} ADD CONSTRAINT {} {};\n",
                    quote_ident(table),
                    quote_ident(&fk.name),
                    fk.definition
                )
                .as_bytes(),
            )
            .await?;
        }
    }

    out.flush().await.context("Failed to flush dump")?;
    tracing::info!(
        "✓ Exported {} row(s) across {} table(s)",
        summary.rows,
        summary.tables
    );
    Ok(summary)
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        bail!("export cancelled");
    }
    Ok(())
}

async fn write_create_table<W>(
    out: &mut BufWriter<W>,
    table: &str,
    columns: &[ColumnDefinition],
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let qt = quote_ident(table);
    let mut ddl = format!("--\n-- Table: {}\n--\nDROP TABLE IF EXISTS {} CASCADE;\n", qt, qt);

    // Defaults resolve their sequence when the table is created
    let referenced: BTreeSet<String> = columns.iter().filter_map(|c| c.default_sequence()).collect();
    for sequence in referenced {
        ddl.push_str(&format!(
            "CREATE SEQUENCE IF NOT EXISTS {};\n",
            quote_ident(&sequence)
        ));
    }

    ddl.push_str(&format!("CREATE TABLE {} (\n", qt));
    for (i, column) in columns.iter().enumerate() {
        let sep = if i + 1 == columns.len() { "" } else { "," };
        ddl.push_str(&format!("  {}{}\n", column.to_ddl(), sep));
    }
    ddl.push_str(");\n\n");

    out.write_all(ddl.as_bytes())
        .await
        .with_context(|| format!("Failed to write DDL for {}", table))
}

/// Stream rows into batched `INSERT` statements, returning the row count
async fn write_table_rows<W, F>(
    out: &mut BufWriter<W>,
    table: &str,
    columns: &[ColumnDefinition],
    mut rows: RowStream,
    batch_size: usize,
    mut on_batch: F,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    let mut batch: Vec<String> = Vec::with_capacity(batch_size);
    let mut total: u64 = 0;

    while let Some(row) = rows.next().await {
        let values = row?;
        batch.push(tuple_literal(&values));
        total += 1;

        if batch.len() >= batch_size {
            write_insert(out, table, &names, &batch).await?;
            out.flush().await?;
            batch.clear();
            on_batch(total);
        }
    }

    if !batch.is_empty() {
        write_insert(out, table, &names, &batch).await?;
        out.flush().await?;
        on_batch(total);
    }

    if total > 0 {
        out.write_all(b"\n").await?;
    }
    Ok(total)
}

async fn write_insert<W>(
    out: &mut BufWriter<W>,
    table: &str,
    columns: &[&str],
    tuples: &[String],
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if tuples.is_empty() {
        return Ok(());
    }
    let mut stmt = format!(
        "INSERT INTO {} ({}) VALUES\n",
        quote_ident(table),
        join_quoted(columns)
    );
    for (i, tuple) in tuples.iter().enumerate() {
        let sep = if i + 1 == tuples.len() { ";" } else { "," };
        stmt.push_str("  ");
        stmt.push_str(tuple);
        stmt.push_str(sep);
        stmt.push('\n');
    }
    out.write_all(stmt.as_bytes())
        .await
        .with_context(|| format!("Failed to write rows for {}", table))
}

/// `setval` restoring a sequence after data load; an empty table restarts at 1
pub fn setval_statement(sequence: &str, max: i64) -> String {
    format!(
        "SELECT setval({}, {}, {});\n",
        quote_literal(&quote_ident(sequence)),
        max.max(1),
        max > 0
    )
}
