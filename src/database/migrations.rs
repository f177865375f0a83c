//! # Database Migration Runner
//!
//! Embedded-SQL migrations with version tracking and a PostgreSQL advisory
//! lock so several worker processes booting at once cannot race each other
//! through schema setup.
//!
//! Migrations live under `migrations/` with a `YYYYMMDDHHMMSS_description.sql`
//! naming convention and are compiled into the binary with `include_str!`,
//! so deployed workers never depend on the source tree being present.

use sqlx::PgPool;
use tracing::info;

/// (version, name, sql) triples, applied in order
const MIGRATIONS: &[(&str, &str, &str)] = &[
    (
        "20250301120000",
        "create_outbox_tables",
        include_str!("../../migrations/20250301120000_create_outbox_tables.sql"),
    ),
    (
        "20250301120100",
        "create_queue_tables",
        include_str!("../../migrations/20250301120100_create_queue_tables.sql"),
    ),
];

// Advisory lock key guarding concurrent schema setup
const SCHEMA_LOCK_KEY: i64 = 7_216_339_417_880_021;

/// Manages database schema migrations with concurrency safety
pub struct DatabaseMigrations;

impl DatabaseMigrations {
    /// Apply all outstanding migrations, serialized across processes via an
    /// advisory lock
    pub async fn run_all(pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(SCHEMA_LOCK_KEY)
            .execute(pool)
            .await?;

        let result = Self::run_outstanding(pool).await;

        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(SCHEMA_LOCK_KEY)
            .execute(pool)
            .await?;

        result
    }

    async fn run_outstanding(pool: &PgPool) -> Result<(), sqlx::Error> {
        Self::ensure_migration_table(pool).await?;
        let applied = Self::applied_versions(pool).await?;

        for (version, name, sql) in MIGRATIONS {
            if applied.iter().any(|v| v == version) {
                continue;
            }
            info!(version = version, name = name, "Applying migration");
            sqlx::raw_sql(sql).execute(pool).await?;
            sqlx::query("INSERT INTO courier_schema_migrations (version) VALUES ($1)")
                .bind(version)
                .execute(pool)
                .await?;
        }

        Ok(())
    }

    async fn ensure_migration_table(pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS courier_schema_migrations (
                version VARCHAR(32) PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
        "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn applied_versions(pool: &PgPool) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar("SELECT version FROM courier_schema_migrations ORDER BY version")
            .fetch_all(pool)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered_and_unique() {
        let mut versions: Vec<&str> = MIGRATIONS.iter().map(|(v, _, _)| *v).collect();
        let sorted = {
            let mut s = versions.clone();
            s.sort_unstable();
            s
        };
        assert_eq!(versions, sorted, "migrations must be listed in order");
        versions.dedup();
        assert_eq!(versions.len(), MIGRATIONS.len(), "versions must be unique");
    }

    #[test]
    fn test_migration_sql_is_nonempty() {
        for (version, name, sql) in MIGRATIONS {
            assert!(
                sql.contains("CREATE TABLE"),
                "migration {version} ({name}) looks empty"
            );
        }
    }
}
