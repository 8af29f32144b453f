// ABOUTME: Streams a SQL dump into a target database one statement at a time
// ABOUTME: Reports byte-based progress, throttled, and stops at the first failing statement

use crate::error::SyncError;
use crate::utils::truncate_statement;
use anyhow::{Context, Result};
use deadpool_postgres::Pool;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::time::Instant;

/// Longest statement prefix carried in an execution error
pub const STATEMENT_ERROR_PREFIX: usize = 500;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Runs one SQL statement outside any explicit transaction
pub trait StatementExecutor: Sync {
    fn execute(&self, statement: &str) -> impl Future<Output = Result<()>> + Send;
}

impl StatementExecutor for Pool {
    async fn execute(&self, statement: &str) -> Result<()> {
        let client = self
            .get()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to acquire connection: {}", e))?;
        client
            .batch_execute(statement)
            .await
            .map_err(|e| anyhow::anyhow!(describe_pg_error(&e)))
    }
}

fn describe_pg_error(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => format!("{} (SQLSTATE {})", db.message(), db.code().code()),
        None => err.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportProgress {
    pub bytes_read: u64,
    pub total_bytes: u64,
    pub percent: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub statements: u64,
    pub bytes_read: u64,
}

/// Splits a line stream into executable statements
///
/// Quote state is carried across lines so a terminator or comment marker
/// inside a multi-line string literal or quoted identifier is not mistaken
/// for the end of a statement.
#[derive(Debug, Default)]
struct StatementSplitter {
    buffer: String,
    in_single: bool,
    in_double: bool,
}

impl StatementSplitter {
    fn in_quote(&self) -> bool {
        self.in_single || self.in_double
    }

    /// Feed one line (with its newline); returns a complete statement if one ended here
    fn push_line(&mut self, line: &str) -> Option<String> {
        if !self.in_quote() && line.trim_start().starts_with("--") {
            return None;
        }

        for ch in line.chars() {
            match ch {
                '\'' if !self.in_double => self.in_single = !self.in_single,
                '"' if !self.in_single => self.in_double = !self.in_double,
                _ => {}
            }
        }
        self.buffer.push_str(line);
        if !line.ends_with('\n') {
            self.buffer.push('\n');
        }

        if !self.in_quote() && line.trim_end().ends_with(';') {
            return self.take();
        }
        None
    }

    /// Whatever remains once the stream ends
    fn take(&mut self) -> Option<String> {
        let statement = self.buffer.trim().to_string();
        self.buffer.clear();
        if statement.is_empty() {
            None
        } else {
            Some(statement)
        }
    }
}

fn percent_of(bytes_read: u64, total_bytes: u64) -> u8 {
    if total_bytes == 0 {
        return 0;
    }
    let pct = (bytes_read as f64 / total_bytes as f64 * 100.0) as u64;
    pct.min(99) as u8
}

/// Execute every statement in `reader` against `executor`
///
/// `total_bytes` is the declared dump size; when it is zero, progress is not
/// reported until completion. Reported percentages never decrease and stay
/// below 100 until every statement has succeeded, at which point a final
/// report of 100 is made.
///
/// Each statement commits on its own. The first failure aborts the import with
/// [`SyncError::Execution`] carrying the statement's leading text.
pub async fn import<E, R, F>(
    executor: &E,
    mut reader: R,
    total_bytes: u64,
    mut on_progress: F,
) -> Result<ImportSummary>
where
    E: StatementExecutor,
    R: AsyncBufRead + Unpin + Send,
    F: FnMut(ImportProgress) + Send,
{
    let mut splitter = StatementSplitter::default();
    let mut summary = ImportSummary::default();
    let mut line = String::new();
    let mut last_report = Instant::now();
    let mut last_percent = 0u8;

    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .context("Failed to read dump")?;
        if n == 0 {
            break;
        }
        summary.bytes_read += n as u64;

        if let Some(statement) = splitter.push_line(&line) {
            run_statement(executor, &statement).await?;
            summary.statements += 1;
        }

        if total_bytes > 0 && last_report.elapsed() >= PROGRESS_INTERVAL {
            let percent = percent_of(summary.bytes_read, total_bytes).max(last_percent);
            last_percent = percent;
            last_report = Instant::now();
            on_progress(ImportProgress {
                bytes_read: summary.bytes_read,
                total_bytes,
                percent,
            });
        }
    }

    if let Some(statement) = splitter.take() {
        tracing::debug!("Executing trailing statement without terminator");
        run_statement(executor, &statement).await?;
        summary.statements += 1;
    }

    on_progress(ImportProgress {
        bytes_read: summary.bytes_read,
        total_bytes,
        percent: 100,
    });
    tracing::info!(
        "✓ Imported {} statement(s) from {} byte(s)",
        summary.statements,
        summary.bytes_read
    );
    Ok(summary)
}

async fn run_statement<E: StatementExecutor>(executor: &E, statement: &str) -> Result<()> {
    executor.execute(statement).await.map_err(|e| {
        SyncError::Execution {
            statement: truncate_statement(statement, STATEMENT_ERROR_PREFIX),
            reason: format!("{:#}", e),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingExecutor {
        executed: Mutex<Vec<String>>,
    }

    impl RecordingExecutor {
        fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
    }

    impl StatementExecutor for RecordingExecutor {
        async fn execute(&self, statement: &str) -> Result<()> {
            self.executed.lock().unwrap().push(statement.to_string());
            if statement.contains("SELEC ") {
                anyhow::bail!("syntax error at or near \"SELEC\"");
            }
            Ok(())
        }
    }

    async fn run(dump: &str) -> (RecordingExecutor, Result<ImportSummary>, Vec<ImportProgress>) {
        let executor = RecordingExecutor::default();
        let mut reports = Vec::new();
        let result = import(&executor, dump.as_bytes(), dump.len() as u64, |p| {
            reports.push(p)
        })
        .await;
        (executor, result, reports)
    }

    #[tokio::test]
    async fn test_comments_skipped_and_statements_split() {
        let dump = "-- header\nCREATE TABLE \"A\" (\n  \"id\" integer NOT NULL\n);\nINSERT INTO \"A\" (\"id\") VALUES\n  (1),\n  (2);\n";
        let (executor, result, reports) = run(dump).await;

        let summary = result.unwrap();
        assert_eq!(summary.statements, 2);
        assert_eq!(summary.bytes_read, dump.len() as u64);
        assert_eq!(
            executor.executed(),
            vec![
                "CREATE TABLE \"A\" (\n  \"id\" integer NOT NULL\n);".to_string(),
                "INSERT INTO \"A\" (\"id\") VALUES\n  (1),\n  (2);".to_string(),
            ]
        );
        assert_eq!(reports.last().map(|p| p.percent), Some(100));
    }

    #[tokio::test]
    async fn test_invalid_residual_fails_with_statement_text() {
        let dump = "-- comment\nCREATE TABLE t (id int);\nSELEC broken";
        let (executor, result, reports) = run(dump).await;

        let executed = executor.executed();
        assert_eq!(executed[0], "CREATE TABLE t (id int);");
        assert_eq!(executed[1], "SELEC broken");

        let err = result.unwrap_err();
        match err.downcast_ref::<SyncError>() {
            Some(SyncError::Execution { statement, .. }) => assert_eq!(statement, "SELEC broken"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.to_string().contains("SELEC broken"));
        assert!(reports.iter().all(|p| p.percent < 100));
    }

    #[tokio::test]
    async fn test_valid_residual_is_executed() {
        let dump = "CREATE TABLE t (id int);\nSELECT 1";
        let (executor, result, _) = run(dump).await;

        assert_eq!(result.unwrap().statements, 2);
        assert_eq!(executor.executed()[1], "SELECT 1");
    }

    #[tokio::test]
    async fn test_terminator_inside_multiline_literal() {
        let dump = "INSERT INTO \"t\" (\"body\") VALUES\n  ('first;\n-- not a comment\nlast');\n";
        let (executor, result, _) = run(dump).await;

        assert_eq!(result.unwrap().statements, 1);
        assert_eq!(
            executor.executed(),
            vec!["INSERT INTO \"t\" (\"body\") VALUES\n  ('first;\n-- not a comment\nlast');".to_string()]
        );
    }

    #[tokio::test]
    async fn test_doubled_quotes_keep_state() {
        let dump = "INSERT INTO \"t\" (\"a\") VALUES\n  ('it''s');\nSELECT 2;\n";
        let (executor, result, _) = run(dump).await;

        assert_eq!(result.unwrap().statements, 2);
        assert_eq!(executor.executed()[1], "SELECT 2;");
    }

    #[tokio::test]
    async fn test_long_statement_truncated_in_error() {
        let long = format!("SELEC {};\n", "x".repeat(2000));
        let (_, result, _) = run(&long).await;

        let err = result.unwrap_err();
        match err.downcast_ref::<SyncError>() {
            Some(SyncError::Execution { statement, .. }) => {
                assert_eq!(statement.chars().count(), STATEMENT_ERROR_PREFIX)
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_size_reports_only_completion() {
        let executor = RecordingExecutor::default();
        let mut reports = Vec::new();
        import(&executor, "SELECT 1;\n".as_bytes(), 0, |p| reports.push(p))
            .await
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].percent, 100);
    }

    /// Each statement takes 200ms of (paused) clock time
    struct SlowExecutor;

    impl StatementExecutor for SlowExecutor {
        async fn execute(&self, _statement: &str) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_is_throttled_and_monotonic() {
        let dump: String = (1..=20).map(|i| format!("SELECT {};\n", i)).collect();
        let mut reports: Vec<(Instant, ImportProgress)> = Vec::new();

        let summary = import(&SlowExecutor, dump.as_bytes(), dump.len() as u64, |p| {
            reports.push((Instant::now(), p))
        })
        .await
        .unwrap();
        assert_eq!(summary.statements, 20);

        // 500ms throttle over 200ms statements: a report every third statement, plus the final one
        assert_eq!(reports.len(), 7);
        let (last, intermediate) = reports.split_last().unwrap();
        assert_eq!(last.1.percent, 100);

        let mut previous_percent = 0;
        for pair in intermediate.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= PROGRESS_INTERVAL);
        }
        for (_, progress) in intermediate {
            assert!(progress.percent <= 99);
            assert!(progress.percent >= previous_percent);
            previous_percent = progress.percent;
        }
        assert!(previous_percent > 50);
    }

    #[test]
    fn test_percent_capped_below_completion() {
        assert_eq!(percent_of(50, 100), 50);
        assert_eq!(percent_of(100, 100), 99);
        assert_eq!(percent_of(150, 100), 99);
        assert_eq!(percent_of(10, 0), 0);
    }
}
