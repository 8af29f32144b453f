// ABOUTME: Schema introspection for streaming exports
// ABOUTME: Reads tables, columns, sequences, indexes, and foreign keys from catalog metadata

use crate::error::SyncError;
use crate::utils::quote_ident;
use anyhow::{Context, Result};
use deadpool_postgres::{Object, Pool};

/// Schema every introspection query is scoped to
pub const EXPORT_SCHEMA: &str = "public";

/// One column as it must be redeclared in `CREATE TABLE`
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefinition {
    pub name: String,
    /// Canonical SQL type, valid to redeclare verbatim
    pub data_type: String,
    /// Catalog type name (e.g. `int4`, `_text`), used to pick a decoder
    pub udt_name: String,
    pub is_nullable: bool,
    pub default: Option<String>,
}

impl ColumnDefinition {
    /// Column line for a `CREATE TABLE` body, without separator
    pub fn to_ddl(&self) -> String {
        let null_str = if self.is_nullable { "NULL" } else { "NOT NULL" };
        match self.default.as_deref().filter(|d| !d.is_empty()) {
            Some(default) => format!(
                "{} {} {} DEFAULT {}",
                quote_ident(&self.name),
                self.data_type,
                null_str,
                default
            ),
            None => format!("{} {} {}", quote_ident(&self.name), self.data_type, null_str),
        }
    }

    /// Sequence consumed by this column's default, if it is a `nextval(...)` call
    pub fn default_sequence(&self) -> Option<String> {
        self.default.as_deref().and_then(parse_nextval_sequence)
    }
}

/// A sequence that generates values for a specific table column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceOwner {
    pub sequence: String,
    pub table: String,
    pub column: String,
}

/// A named foreign-key constraint and its definition text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub name: String,
    pub definition: String,
}

async fn client(pool: &Pool) -> Result<Object> {
    pool.get()
        .await
        .map_err(|e| SyncError::Introspection(format!("failed to acquire connection: {}", e)).into())
}

/// List base tables in the export schema, alphabetically
///
/// Views and foreign tables are excluded by filtering on the base-table type.
pub async fn list_tables(pool: &Pool) -> Result<Vec<String>> {
    let client = client(pool).await?;
    let rows = client
        .query(
            "SELECT table_name::text
             FROM information_schema.tables
             WHERE table_schema = $1 AND table_type = 'BASE TABLE'
             ORDER BY table_name",
            &[&EXPORT_SCHEMA],
        )
        .await
        .map_err(|e| SyncError::Introspection(format!("failed to list tables: {}", e)))?;

    Ok(rows.iter().map(|row| row.get(0)).collect())
}

/// Columns of a table in ordinal order, with normalized type names
pub async fn get_columns(pool: &Pool, table: &str) -> Result<Vec<ColumnDefinition>> {
    let client = client(pool).await?;
    let rows = client
        .query(
            "SELECT c.column_name::text,
                    c.data_type::text,
                    c.udt_name::text,
                    c.character_maximum_length::int,
                    c.numeric_precision::int,
                    c.numeric_scale::int,
                    c.is_nullable = 'YES',
                    c.column_default::text
             FROM information_schema.columns c
             WHERE c.table_schema = $1 AND c.table_name = $2
             ORDER BY c.ordinal_position",
            &[&EXPORT_SCHEMA, &table],
        )
        .await
        .map_err(|e| {
            SyncError::Introspection(format!("failed to read columns of {}: {}", table, e))
        })?;

    let columns = rows
        .iter()
        .map(|row| {
            let data_type: String = row.get(1);
            let udt_name: String = row.get(2);
            let rendered = render_type(&data_type, &udt_name, row.get(3), row.get(4), row.get(5));
            ColumnDefinition {
                name: row.get(0),
                data_type: rendered,
                udt_name,
                is_nullable: row.get(6),
                default: row.get(7),
            }
        })
        .collect();

    Ok(columns)
}

/// Names of all sequences in the export schema
pub async fn list_sequences(pool: &Pool) -> Result<Vec<String>> {
    let client = client(pool).await?;
    let rows = client
        .query(
            "SELECT sequence_name::text
             FROM information_schema.sequences
             WHERE sequence_schema = $1
             ORDER BY sequence_name",
            &[&EXPORT_SCHEMA],
        )
        .await
        .map_err(|e| SyncError::Introspection(format!("failed to list sequences: {}", e)))?;

    Ok(rows.iter().map(|row| row.get(0)).collect())
}

/// Sequences named as generators by some column's `nextval(...)` default
pub async fn list_sequence_owners(pool: &Pool) -> Result<Vec<SequenceOwner>> {
    let client = client(pool).await?;
    let rows = client
        .query(
            "SELECT c.table_name::text, c.column_name::text, c.column_default::text
             FROM information_schema.columns c
             WHERE c.table_schema = $1 AND c.column_default LIKE 'nextval(%'
             ORDER BY c.table_name, c.column_name",
            &[&EXPORT_SCHEMA],
        )
        .await
        .map_err(|e| {
            SyncError::Introspection(format!("failed to read sequence ownership: {}", e))
        })?;

    let owners = rows
        .iter()
        .filter_map(|row| {
            let default: String = row.get(2);
            parse_nextval_sequence(&default).map(|sequence| SequenceOwner {
                sequence,
                table: row.get(0),
                column: row.get(1),
            })
        })
        .collect();

    Ok(owners)
}

/// Index definitions for a table, verbatim from `pg_indexes`
pub async fn list_indexes(pool: &Pool, table: &str) -> Result<Vec<String>> {
    let client = client(pool).await?;
    let rows = client
        .query(
            "SELECT indexdef
             FROM pg_catalog.pg_indexes
             WHERE schemaname = $1 AND tablename = $2
             ORDER BY indexname",
            &[&EXPORT_SCHEMA, &table],
        )
        .await
        .map_err(|e| {
            SyncError::Introspection(format!("failed to read indexes of {}: {}", table, e))
        })?;

    Ok(rows.iter().map(|row| row.get(0)).collect())
}

/// Foreign-key constraints declared on a table
pub async fn list_foreign_keys(pool: &Pool, table: &str) -> Result<Vec<ForeignKey>> {
    let client = client(pool).await?;
    let rows = client
        .query(
            "SELECT con.conname::text, pg_catalog.pg_get_constraintdef(con.oid)
             FROM pg_catalog.pg_constraint con
             JOIN pg_catalog.pg_class rel ON rel.oid = con.conrelid
             JOIN pg_catalog.pg_namespace nsp ON nsp.oid = rel.relnamespace
             WHERE nsp.nspname = $1 AND rel.relname = $2 AND con.contype = 'f'
             ORDER BY con.conname",
            &[&EXPORT_SCHEMA, &table],
        )
        .await
        .map_err(|e| {
            SyncError::Introspection(format!("failed to read constraints of {}: {}", table, e))
        })?;

    Ok(rows
        .iter()
        .map(|row| ForeignKey {
            name: row.get(0),
            definition: row.get(1),
        })
        .collect())
}

/// Largest value currently stored in a column, 0 for an empty table
pub async fn max_column_value(pool: &Pool, table: &str, column: &str) -> Result<i64> {
    let client = client(pool).await?;
    let query = format!(
        "SELECT COALESCE(MAX({}), 0)::bigint FROM {}",
        quote_ident(column),
        quote_ident(table)
    );
    let row = client
        .query_one(query.as_str(), &[])
        .await
        .with_context(|| format!("Failed to compute MAX({}) of {}", column, table))?;
    Ok(row.get(0))
}

/// Render the catalog's type description as redeclarable SQL
///
/// The wire-level `data_type` is not always valid in `CREATE TABLE`
/// (e.g. `character varying` loses its length, `ARRAY` names no element type).
pub fn render_type(
    data_type: &str,
    udt_name: &str,
    char_max_length: Option<i32>,
    numeric_precision: Option<i32>,
    numeric_scale: Option<i32>,
) -> String {
    match data_type {
        "USER-DEFINED" => quote_ident_if_needed(udt_name),
        "ARRAY" => format!("{}[]", quote_ident_if_needed(udt_name.trim_start_matches('_'))),
        "timestamp without time zone" => "timestamp".to_string(),
        "timestamp with time zone" => "timestamptz".to_string(),
        "character varying" => match char_max_length {
            Some(len) => format!("varchar({})", len),
            None => "varchar".to_string(),
        },
        // Without an explicit length these mean length 1
        "character" => with_length("character", char_max_length),
        "bit" => with_length("bit", char_max_length),
        "bit varying" => with_length("varbit", char_max_length),
        "numeric" => match numeric_precision {
            Some(precision) => format!("numeric({},{})", precision, numeric_scale.unwrap_or(0)),
            None => "numeric".to_string(),
        },
        other => other.to_string(),
    }
}

fn with_length(base: &str, length: Option<i32>) -> String {
    match length {
        Some(len) => format!("{}({})", base, len),
        None => base.to_string(),
    }
}

fn quote_ident_if_needed(name: &str) -> String {
    let plain = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if plain {
        name.to_string()
    } else {
        quote_ident(name)
    }
}

/// Extract the bare sequence name from a `nextval('...'::regclass)` default
///
/// ```
/// # use postgres_env_sync::migration::schema::parse_nextval_sequence;
/// assert_eq!(
///     parse_nextval_sequence("nextval('\"Part_id_seq\"'::regclass)"),
///     Some("Part_id_seq".to_string())
/// );
/// assert_eq!(parse_nextval_sequence("now()"), None);
/// ```
pub fn parse_nextval_sequence(default: &str) -> Option<String> {
    let rest = default.trim().strip_prefix("nextval('")?;
    let end = rest.find("'::regclass").or_else(|| rest.find("')"))?;
    let regclass = rest[..end].replace("''", "'");
    last_identifier(&regclass)
}

/// Last dotted component of a possibly schema-qualified identifier, unquoted
fn last_identifier(text: &str) -> Option<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            '.' if !quoted => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);

    parts.pop().filter(|name| !name.is_empty())
}
