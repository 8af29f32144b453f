// ABOUTME: End-to-end export and import against real PostgreSQL databases
// ABOUTME: Requires TEST_SOURCE_URL and TEST_TARGET_URL; run with --ignored

use postgres_env_sync::config::{Environments, PoolSettings};
use postgres_env_sync::migration::{export, import, ExportOptions, TableFilter};
use postgres_env_sync::postgres::ConnectionManager;
use std::env;
use tokio_util::sync::CancellationToken;

/// Helper to get test database URLs from environment
fn get_test_urls() -> Option<(String, String)> {
    let source = env::var("TEST_SOURCE_URL").ok()?;
    let target = env::var("TEST_TARGET_URL").ok()?;
    Some((source, target))
}

fn manager(source: &str, target: &str) -> ConnectionManager {
    let mut environments = Environments::new();
    environments.insert("dev", source);
    environments.insert("localhost", target);
    ConnectionManager::new(environments, PoolSettings::default())
}

#[tokio::test]
#[ignore]
async fn test_export_then_import_round_trip() {
    let (source_url, target_url) =
        get_test_urls().expect("TEST_SOURCE_URL and TEST_TARGET_URL must be set");
    let manager = manager(&source_url, &target_url);
    let cancel = CancellationToken::new();

    let source = manager.pool("dev", &cancel).await.unwrap();
    let target = manager.pool("localhost", &cancel).await.unwrap();

    source
        .get()
        .await
        .unwrap()
        .batch_execute(
            r#"
            DROP TABLE IF EXISTS "SyncPart" CASCADE;
            DROP TABLE IF EXISTS "SyncTag" CASCADE;
            CREATE TABLE "SyncTag" (id serial PRIMARY KEY, label varchar(64) NOT NULL);
            CREATE TABLE "SyncPart" (
                id serial PRIMARY KEY,
                name text NOT NULL,
                price numeric(10,2),
                weight double precision,
                payload bytea,
                created timestamptz DEFAULT now(),
                tags text[],
                "tagId" integer REFERENCES "SyncTag"(id)
            );
            INSERT INTO "SyncTag" (label) VALUES ('first'), ('multi
line; label');
            INSERT INTO "SyncPart" (name, price, weight, payload, tags, "tagId")
            SELECT 'part ' || g || ' o''clock', g * 1.25, g / 3.0, '\x00ff'::bytea, ARRAY['a', 'b'], 1
            FROM generate_series(1, 1200) g;
            "#,
        )
        .await
        .unwrap();

    let options = ExportOptions::new(
        "dev",
        TableFilter::new(vec!["SyncPart", "SyncTag"], Vec::<&str>::new()),
    );
    let mut dump = Vec::new();
    let mut batches = 0;
    let summary = export(&source, &mut dump, &options, &cancel, |p| {
        if p.table == "SyncPart" {
            batches += 1;
        }
    })
    .await
    .unwrap();
    assert_eq!(summary.rows, 1202);
    assert_eq!(batches, 3);

    let size = dump.len() as u64;
    let imported = import(&target, dump.as_slice(), size, |_| {}).await.unwrap();
    assert_eq!(imported.bytes_read, size);

    let client = target.get().await.unwrap();
    let count: i64 = client
        .query_one(r#"SELECT count(*) FROM "SyncPart""#, &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(count, 1200);

    let label: String = client
        .query_one(r#"SELECT label FROM "SyncTag" WHERE id = 2"#, &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(label, "multi\nline; label");

    // Sequence continues after the imported rows
    let next: i32 = client
        .query_one(
            r#"INSERT INTO "SyncPart" (name) VALUES ('new') RETURNING id"#,
            &[],
        )
        .await
        .unwrap()
        .get(0);
    assert_eq!(next, 1201);

    manager.close();
}

#[tokio::test]
#[ignore]
async fn test_connection_reports_version() {
    let (source_url, target_url) =
        get_test_urls().expect("TEST_SOURCE_URL and TEST_TARGET_URL must be set");
    let manager = manager(&source_url, &target_url);

    let version = manager
        .test_connection("dev", &CancellationToken::new())
        .await
        .unwrap();
    println!("✓ Connected: {}", version);
    assert!(version.starts_with("PostgreSQL"));
}
