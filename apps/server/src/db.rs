use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Apply the bundled schema. Statements are executed one by one and
/// individual failures are ignored so re-runs against an existing database
/// are harmless (the DDL guards itself with IF NOT EXISTS where Postgres
/// supports it).
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    let migration_sql = include_str!("../migrations/001_init.sql");

    for statement in migration_sql.split(';') {
        let trimmed = statement.trim();
        if !trimmed.is_empty() {
            sqlx::query(trimmed).execute(pool).await.ok();
        }
    }

    tracing::info!("database migrations applied");
    Ok(())
}
