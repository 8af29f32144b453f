// ABOUTME: Export and import engines plus the pieces they share
// ABOUTME: Schema introspection, table filtering, value codec, and dump artifact handling

pub mod codec;
pub mod dumps;
pub mod export;
pub mod filter;
pub mod import;
pub mod schema;

pub use codec::{Numeric, SqlValue};
pub use dumps::{latest_dump, prune_backups, DumpFile};
pub use export::{export, ExportOptions, ExportProgress, ExportSource, ExportSummary};
pub use filter::TableFilter;
pub use import::{import, ImportProgress, ImportSummary, StatementExecutor};
pub use schema::{ColumnDefinition, ForeignKey, SequenceOwner};
