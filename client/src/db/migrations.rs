//! Versioned, fenced schema migrations.
//!
//! The schema version lives in `PRAGMA user_version`. Each step runs in its
//! own transaction together with the version bump, so a step either lands
//! completely or not at all.
//!
//! Outbound rows are user data that has not necessarily reached the server,
//! so every step is fenced: the outbound `(key, value)` rows are copied aside
//! before the step and compared after it, inside the same transaction, and a
//! step that loses or rewrites any row is rolled back and refused. Only [`MigrationKind::RebuildInbound`] may empty
//! the inbound cache.

use sqlx::{Sqlite, SqlitePool, Transaction};
use tally_engine::{Partition, SchemaVersion};

use crate::error::StorageError;

/// Schema version this build expects.
pub const CURRENT_SCHEMA_VERSION: SchemaVersion = 3;

/// What a migration step is allowed to do to existing rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationKind {
    /// Adds tables, columns or indexes; both partitions keep every row
    Additive,
    /// Drops and recreates the inbound cache; outbound keeps every row
    RebuildInbound,
    /// Copies outbound into a new table shape; outbound keeps every row
    RebuildOutbound,
}

impl MigrationKind {
    fn may_discard(&self, partition: Partition) -> bool {
        matches!(self, MigrationKind::RebuildInbound) && partition.is_disposable()
    }
}

/// One step of the schema history.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: SchemaVersion,
    pub description: &'static str,
    pub kind: MigrationKind,
    pub statements: &'static [&'static str],
}

/// The schema history, oldest first.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create outbound and inbound partitions",
        kind: MigrationKind::Additive,
        statements: &[
            "CREATE TABLE IF NOT EXISTS outbound (key TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL)",
            "CREATE TABLE IF NOT EXISTS inbound (key TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL)",
        ],
    },
    Migration {
        version: 2,
        description: "rebuild inbound cache with capture time column",
        kind: MigrationKind::RebuildInbound,
        statements: &[
            "DROP TABLE IF EXISTS inbound",
            "CREATE TABLE inbound (key TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL, ts INTEGER NOT NULL)",
            "CREATE INDEX inbound_ts ON inbound (ts, key)",
        ],
    },
    Migration {
        version: 3,
        description: "rebuild outbound with creation time column",
        kind: MigrationKind::RebuildOutbound,
        statements: &[
            "CREATE TABLE outbound_next (key TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL, ts INTEGER NOT NULL)",
            "INSERT INTO outbound_next (key, value, ts) \
             SELECT key, value, COALESCE(json_extract(value, '$.createdAt'), 0) FROM outbound",
            "DROP TABLE outbound",
            "ALTER TABLE outbound_next RENAME TO outbound",
            "CREATE INDEX outbound_ts ON outbound (ts, key)",
        ],
    },
];

/// Read the schema version of a database.
pub async fn schema_version(pool: &SqlitePool) -> Result<SchemaVersion, StorageError> {
    let (version,): (i64,) = sqlx::query_as("PRAGMA user_version").fetch_one(pool).await?;
    Ok(version.max(0) as SchemaVersion)
}

/// Bring the database up to the last version in `steps`.
///
/// Refuses to touch a database newer than `steps` knows about. Returns the
/// resulting version.
pub async fn migrate(pool: &SqlitePool, steps: &[Migration]) -> Result<SchemaVersion, StorageError> {
    let target = steps.last().map(|m| m.version).unwrap_or(0);
    let current = schema_version(pool).await?;

    if current > target {
        return Err(StorageError::SchemaMismatch(format!(
            "store is at version {current}, this build only knows up to {target}"
        )));
    }
    if steps.windows(2).any(|w| w[1].version <= w[0].version) {
        return Err(StorageError::SchemaMismatch(
            "migration versions must be strictly increasing".into(),
        ));
    }

    let mut version = current;
    for step in steps.iter().filter(|m| m.version > current) {
        tracing::info!(
            from = version,
            to = step.version,
            kind = ?step.kind,
            "Running migration: {}",
            step.description
        );
        run_step(pool, step).await?;
        version = step.version;
    }

    Ok(version)
}

async fn run_step(pool: &SqlitePool, step: &Migration) -> Result<(), StorageError> {
    let mut tx = pool.begin().await?;

    let mut fenced = Vec::with_capacity(Partition::ALL.len());
    for partition in Partition::ALL {
        if step.kind.may_discard(partition) {
            continue;
        }
        if let Some(rows) = raise_fence(&mut tx, partition).await? {
            fenced.push((partition, rows));
        }
    }

    for statement in step.statements {
        sqlx::query(statement).execute(&mut *tx).await?;
    }

    for (partition, rows_before) in fenced {
        let breach = check_fence(&mut tx, partition, rows_before).await?;
        if let Some(reason) = breach {
            // dropping `tx` rolls the step back, fence tables included
            tracing::error!(
                version = step.version,
                partition = %partition,
                %reason,
                "Migration would alter existing rows, refusing"
            );
            return Err(StorageError::MigrationRefused {
                version: step.version,
                reason,
            });
        }
    }

    // user_version is part of the transaction
    sqlx::query(&format!("PRAGMA user_version = {}", step.version))
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

fn fence_table(partition: Partition) -> String {
    format!("temp.fence_{}", partition.name())
}

/// Copy a partition's `(key, value)` rows aside. Returns the row count, or
/// `None` if the table does not exist yet.
async fn raise_fence(
    tx: &mut Transaction<'_, Sqlite>,
    partition: Partition,
) -> Result<Option<i64>, StorageError> {
    let (exists,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1")
            .bind(partition.name())
            .fetch_one(&mut **tx)
            .await?;
    if exists == 0 {
        return Ok(None);
    }

    sqlx::query(&format!(
        "CREATE TABLE {} AS SELECT key, value FROM {}",
        fence_table(partition),
        partition.name()
    ))
    .execute(&mut **tx)
    .await?;

    Ok(Some(row_count(tx, partition).await?))
}

/// Compare a partition against its fence copy and drop the copy.
///
/// Keys are unique, so equal counts plus no fenced row missing means the
/// rows are exactly the same. Returns why they differ, if they do.
async fn check_fence(
    tx: &mut Transaction<'_, Sqlite>,
    partition: Partition,
    rows_before: i64,
) -> Result<Option<String>, StorageError> {
    let rows_after = row_count(tx, partition).await?;
    let (changed,): (i64,) = sqlx::query_as(&format!(
        "SELECT COUNT(*) FROM (SELECT key, value FROM {} EXCEPT SELECT key, value FROM {})",
        fence_table(partition),
        partition.name()
    ))
    .fetch_one(&mut **tx)
    .await?;

    sqlx::query(&format!("DROP TABLE {}", fence_table(partition)))
        .execute(&mut **tx)
        .await?;

    Ok(if rows_after != rows_before {
        Some(format!(
            "{partition} would go from {rows_before} to {rows_after} rows"
        ))
    } else if changed > 0 {
        Some(format!("{partition} would have {changed} rows rewritten"))
    } else {
        None
    })
}

async fn row_count(
    tx: &mut Transaction<'_, Sqlite>,
    partition: Partition,
) -> Result<i64, StorageError> {
    let (rows,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", partition.name()))
        .fetch_one(&mut **tx)
        .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool;

    async fn memory_pool() -> SqlitePool {
        create_pool("sqlite::memory:").await.unwrap()
    }

    async fn insert_raw(pool: &SqlitePool, table: &str, key: &str, value: &str) {
        sqlx::query(&format!("INSERT INTO {table} (key, value) VALUES (?1, ?2)"))
            .bind(key)
            .bind(value)
            .execute(pool)
            .await
            .unwrap();
    }

    async fn count(pool: &SqlitePool, table: &str) -> i64 {
        let (n,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(pool)
            .await
            .unwrap();
        n
    }

    #[tokio::test]
    async fn fresh_database_reaches_current_version() {
        let pool = memory_pool().await;
        let version = migrate(&pool, MIGRATIONS).await.unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
        assert_eq!(schema_version(&pool).await.unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let pool = memory_pool().await;
        migrate(&pool, MIGRATIONS).await.unwrap();
        let version = migrate(&pool, MIGRATIONS).await.unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn upgrade_keeps_outbound_and_drops_inbound() {
        let pool = memory_pool().await;
        migrate(&pool, &MIGRATIONS[..1]).await.unwrap();

        insert_raw(&pool, "outbound", "c-1", r#"{"clientId":"c-1","createdAt":42}"#).await;
        insert_raw(&pool, "outbound", "c-2", r#"{"clientId":"c-2"}"#).await;
        insert_raw(&pool, "inbound", "k", r#"{"cacheKey":"k"}"#).await;

        migrate(&pool, MIGRATIONS).await.unwrap();

        assert_eq!(count(&pool, "outbound").await, 2);
        assert_eq!(count(&pool, "inbound").await, 0);

        let (ts,): (i64,) = sqlx::query_as("SELECT ts FROM outbound WHERE key = 'c-1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(ts, 42);
    }

    #[tokio::test]
    async fn step_losing_outbound_rows_is_refused() {
        const CARELESS: &[Migration] = &[Migration {
            version: 2,
            description: "recreate outbound without copying",
            kind: MigrationKind::RebuildOutbound,
            statements: &[
                "DROP TABLE outbound",
                "CREATE TABLE outbound (key TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL)",
            ],
        }];

        let pool = memory_pool().await;
        migrate(&pool, &MIGRATIONS[..1]).await.unwrap();
        insert_raw(&pool, "outbound", "c-1", r#"{"clientId":"c-1"}"#).await;

        let steps: Vec<Migration> = MIGRATIONS[..1].iter().chain(CARELESS).copied().collect();
        let result = migrate(&pool, &steps).await;

        assert!(matches!(
            result,
            Err(StorageError::MigrationRefused { version: 2, .. })
        ));
        // rolled back: row and version untouched
        assert_eq!(count(&pool, "outbound").await, 1);
        assert_eq!(schema_version(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn step_rewriting_outbound_rows_is_refused() {
        const REWRITE: &[Migration] = &[Migration {
            version: 2,
            description: "blank every payload",
            kind: MigrationKind::Additive,
            statements: &["UPDATE outbound SET value = '{}'"],
        }];

        let pool = memory_pool().await;
        migrate(&pool, &MIGRATIONS[..1]).await.unwrap();
        let original = r#"{"clientId":"c-1","status":"pending"}"#;
        insert_raw(&pool, "outbound", "c-1", original).await;

        let steps: Vec<Migration> = MIGRATIONS[..1].iter().chain(REWRITE).copied().collect();
        assert!(matches!(
            migrate(&pool, &steps).await,
            Err(StorageError::MigrationRefused { version: 2, .. })
        ));

        let (value,): (String,) = sqlx::query_as("SELECT value FROM outbound WHERE key = 'c-1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(value, original);
        assert_eq!(schema_version(&pool).await.unwrap(), 1);

        // the fence copy went with the rollback
        let (leftover,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM temp.sqlite_master WHERE name = 'fence_outbound'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(leftover, 0);
    }

    #[tokio::test]
    async fn step_swapping_outbound_keys_is_refused() {
        const SWAP: &[Migration] = &[Migration {
            version: 2,
            description: "replace rows with lookalikes",
            kind: MigrationKind::RebuildOutbound,
            statements: &[
                "DELETE FROM outbound",
                "INSERT INTO outbound (key, value) VALUES ('c-9', '{}')",
            ],
        }];

        let pool = memory_pool().await;
        migrate(&pool, &MIGRATIONS[..1]).await.unwrap();
        insert_raw(&pool, "outbound", "c-1", r#"{"clientId":"c-1"}"#).await;

        let steps: Vec<Migration> = MIGRATIONS[..1].iter().chain(SWAP).copied().collect();
        assert!(matches!(
            migrate(&pool, &steps).await,
            Err(StorageError::MigrationRefused { .. })
        ));
        assert_eq!(count(&pool, "outbound").await, 1);
    }

    #[tokio::test]
    async fn additive_step_may_not_empty_inbound() {
        const SNEAKY: &[Migration] = &[Migration {
            version: 2,
            description: "claims to be additive",
            kind: MigrationKind::Additive,
            statements: &["DELETE FROM inbound"],
        }];

        let pool = memory_pool().await;
        migrate(&pool, &MIGRATIONS[..1]).await.unwrap();
        insert_raw(&pool, "inbound", "k", r#"{"cacheKey":"k"}"#).await;

        let steps: Vec<Migration> = MIGRATIONS[..1].iter().chain(SNEAKY).copied().collect();
        assert!(matches!(
            migrate(&pool, &steps).await,
            Err(StorageError::MigrationRefused { .. })
        ));
        assert_eq!(count(&pool, "inbound").await, 1);
    }

    #[tokio::test]
    async fn newer_database_is_refused() {
        let pool = memory_pool().await;
        migrate(&pool, MIGRATIONS).await.unwrap();
        sqlx::query("PRAGMA user_version = 99")
            .execute(&pool)
            .await
            .unwrap();

        assert!(matches!(
            migrate(&pool, MIGRATIONS).await,
            Err(StorageError::SchemaMismatch(_))
        ));
    }
}
