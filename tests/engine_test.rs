// ABOUTME: Export and import engine tests driven by in-memory catalog and executor fakes
// ABOUTME: Checks dump section ordering and replays a generated dump statement by statement

use anyhow::Result;
use futures::StreamExt;
use postgres_env_sync::migration::export::RowStream;
use postgres_env_sync::migration::{
    export, import, ColumnDefinition, ExportOptions, ExportSource, ForeignKey, Numeric,
    SequenceOwner, SqlValue, StatementExecutor, TableFilter,
};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

struct Table {
    columns: Vec<ColumnDefinition>,
    rows: Vec<Vec<SqlValue>>,
    indexes: Vec<String>,
    foreign_keys: Vec<ForeignKey>,
}

/// Catalog with a parts table, a tags table, and an excluded profile table
struct Catalog {
    tables: HashMap<String, Table>,
    owners: Vec<SequenceOwner>,
}

fn column(name: &str, data_type: &str, udt: &str, nullable: bool, default: Option<&str>) -> ColumnDefinition {
    ColumnDefinition {
        name: name.to_string(),
        data_type: data_type.to_string(),
        udt_name: udt.to_string(),
        is_nullable: nullable,
        default: default.map(str::to_string),
    }
}

fn catalog() -> Catalog {
    let mut tables = HashMap::new();
    tables.insert(
        "Part".to_string(),
        Table {
            columns: vec![
                column("id", "integer", "int4", false, Some("nextval('\"Part_id_seq\"'::regclass)")),
                column("name", "text", "text", false, None),
                column("price", "numeric(10,2)", "numeric", true, None),
                column("tagId", "integer", "int4", true, None),
            ],
            rows: (1..=7)
                .map(|i| {
                    vec![
                        SqlValue::Int(i),
                        SqlValue::Text(format!("O'Part {}", i)),
                        SqlValue::Decimal(Numeric::new(1000 + i as i128, -2)),
                        if i % 2 == 0 { SqlValue::Int(1) } else { SqlValue::Null },
                    ]
                })
                .collect(),
            indexes: vec!["CREATE UNIQUE INDEX \"Part_pkey\" ON public.\"Part\" USING btree (id)".into()],
            foreign_keys: vec![ForeignKey {
                name: "Part_tagId_fkey".into(),
                definition: "FOREIGN KEY (\"tagId\") REFERENCES \"Tag\"(id)".into(),
            }],
        },
    );
    tables.insert(
        "Tag".to_string(),
        Table {
            columns: vec![
                column("id", "integer", "int4", false, Some("nextval('\"Tag_id_seq\"'::regclass)")),
                column("label", "varchar(64)", "varchar", false, None),
            ],
            rows: vec![vec![SqlValue::Int(1), SqlValue::Text("multi\nline; value".into())]],
            indexes: vec![],
            foreign_keys: vec![],
        },
    );
    tables.insert(
        "Profile".to_string(),
        Table {
            columns: vec![column("id", "integer", "int4", false, Some("nextval('\"Profile_id_seq\"'::regclass)"))],
            rows: vec![vec![SqlValue::Int(1)]],
            indexes: vec![],
            foreign_keys: vec![],
        },
    );

    let owners = ["Part", "Tag", "Profile"]
        .iter()
        .map(|t| SequenceOwner {
            sequence: format!("{}_id_seq", t),
            table: t.to_string(),
            column: "id".to_string(),
        })
        .collect();

    Catalog { tables, owners }
}

impl ExportSource for Catalog {
    async fn list_tables(&self) -> Result<Vec<String>> {
        Ok(self.tables.keys().cloned().collect())
    }

    async fn get_columns(&self, table: &str) -> Result<Vec<ColumnDefinition>> {
        Ok(self.tables[table].columns.clone())
    }

    async fn list_sequences(&self) -> Result<Vec<String>> {
        Ok(self.owners.iter().map(|o| o.sequence.clone()).collect())
    }

    async fn list_sequence_owners(&self) -> Result<Vec<SequenceOwner>> {
        Ok(self.owners.clone())
    }

    async fn list_indexes(&self, table: &str) -> Result<Vec<String>> {
        Ok(self.tables[table].indexes.clone())
    }

    async fn list_foreign_keys(&self, table: &str) -> Result<Vec<ForeignKey>> {
        Ok(self.tables[table].foreign_keys.clone())
    }

    async fn max_column_value(&self, table: &str, _column: &str) -> Result<i64> {
        Ok(self.tables[table].rows.len() as i64)
    }

    async fn stream_rows(&self, table: &str, _columns: &[ColumnDefinition]) -> Result<RowStream> {
        let rows: Vec<Result<Vec<SqlValue>>> =
            self.tables[table].rows.iter().cloned().map(Ok).collect();
        Ok(futures::stream::iter(rows).boxed())
    }
}

#[derive(Default)]
struct Recorder {
    statements: Mutex<Vec<String>>,
}

impl StatementExecutor for Recorder {
    async fn execute(&self, statement: &str) -> Result<()> {
        self.statements.lock().unwrap().push(statement.to_string());
        Ok(())
    }
}

async fn export_catalog(batch_size: usize) -> String {
    let filter = TableFilter::new(vec!["Part", "Tag", "Profile"], vec!["Profile"]);
    let mut options = ExportOptions::new("staging", filter);
    options.batch_size = batch_size;

    let mut out = Vec::new();
    export(&catalog(), &mut out, &options, &CancellationToken::new(), |_| {})
        .await
        .unwrap();
    String::from_utf8(out).unwrap()
}

fn position(dump: &str, needle: &str) -> usize {
    dump.find(needle)
        .unwrap_or_else(|| panic!("missing {:?} in dump:\n{}", needle, dump))
}

#[tokio::test]
async fn test_sections_are_ordered_per_table() {
    let dump = export_catalog(3).await;

    for table in ["Part", "Tag"] {
        let create = position(&dump, &format!("CREATE TABLE \"{}\" (", table));
        let first_insert = position(&dump, &format!("INSERT INTO \"{}\"", table));
        let last_insert = dump.rfind(&format!("INSERT INTO \"{}\"", table)).unwrap();
        let setval = position(&dump, &format!("SELECT setval('\"{}_id_seq\"'", table));
        assert!(create < first_insert);
        assert!(last_insert < setval);
    }

    let last_insert = dump.rfind("INSERT INTO").unwrap();
    let first_setval = position(&dump, "SELECT setval(");
    let index = position(&dump, "CREATE UNIQUE INDEX \"Part_pkey\"");
    let fk = position(&dump, "ALTER TABLE \"Part\" ADD CONSTRAINT \"Part_tagId_fkey\"");
    assert!(last_insert < first_setval);
    assert!(first_setval < index);
    assert!(index < fk);

    // Filtered table: no DDL, no data, no sequence value
    assert!(!dump.contains("CREATE TABLE \"Profile\""));
    assert!(!dump.contains("setval('\"Profile_id_seq\"'"));
    // 7 rows at 3 per batch
    assert_eq!(dump.matches("INSERT INTO \"Part\"").count(), 3);
}

#[tokio::test]
async fn test_dump_contents() {
    let dump = export_catalog(500).await;

    assert!(dump.contains("SELECT setval('\"Part_id_seq\"', 7, true);"));
    assert!(dump.contains("(2, 'O''Part 2', 10.02, 1),"));
    assert!(dump.contains("(7, 'O''Part 7', 10.07, NULL);"));
    assert!(dump.contains("CREATE SEQUENCE IF NOT EXISTS \"Part_id_seq\";\nCREATE TABLE \"Part\" ("));
    assert!(dump.contains("\"label\" varchar(64) NOT NULL"));
}

#[tokio::test]
async fn test_export_replays_statement_by_statement() {
    let dump = export_catalog(4).await;
    let recorder = Recorder::default();
    let mut last_percent = 0;

    let summary = import(&recorder, dump.as_bytes(), dump.len() as u64, |p| {
        assert!(p.percent >= last_percent);
        last_percent = p.percent;
    })
    .await
    .unwrap();

    assert_eq!(summary.bytes_read, dump.len() as u64);
    assert_eq!(last_percent, 100);

    let statements = recorder.statements.into_inner().unwrap();
    assert_eq!(summary.statements as usize, statements.len());
    assert!(statements.iter().all(|s| !s.starts_with("--")));
    assert!(statements.iter().all(|s| s.ends_with(';')));

    // The multi-line literal stays inside a single statement
    let tag_insert = statements
        .iter()
        .find(|s| s.starts_with("INSERT INTO \"Tag\""))
        .unwrap();
    assert!(tag_insert.contains("'multi\nline; value'"));

    // Part: 2 inserts (4 + 3 rows); Tag: 1 insert
    let inserts = statements.iter().filter(|s| s.starts_with("INSERT INTO")).count();
    assert_eq!(inserts, 3);
}
