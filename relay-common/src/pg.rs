//! Postgres helpers used next to the consumers: apply migrations once at
//! startup, open a pool, and run queries with their SQL and duration logged.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgQueryResult, PgRow};
use sqlx::query::Query;
use sqlx::{Execute, Postgres};
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::error::{ConfigError, DatabaseError};

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Falls back to `POSTGRES_URL` when unset or empty.
    pub dsn: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    /// Run `SET TIME ZONE 'UTC'` on every new connection
    pub force_utc: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            dsn: None,
            max_connections: 10,
            min_connections: 0,
            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(1800),
            force_utc: true,
        }
    }
}

impl From<&DatabaseConfig> for ConnectOptions {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            dsn: config.database_url.clone(),
            max_connections: config.max_pg_connections,
            min_connections: config.max_idle_pg_connections,
            idle_timeout: config.pg_connection_max_idle.0,
            max_lifetime: config.pg_connection_max_lifetime.0,
            force_utc: config.pg_force_utc,
            ..Default::default()
        }
    }
}

fn absolute(path: &str) -> Result<PathBuf, std::io::Error> {
    let path = Path::new(path);
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

/// Apply every pending migration found in `migration_path`. Does nothing
/// when the database is already up to date.
pub async fn migrate(dsn: &str, migration_path: &str) -> Result<(), DatabaseError> {
    if dsn.trim().is_empty() {
        return Err(ConfigError::Missing("POSTGRES_URL").into());
    }
    if migration_path.trim().is_empty() {
        return Err(ConfigError::Missing("MIGRATION_PATH").into());
    }

    let path = absolute(migration_path)?;
    let migrator = Migrator::new(path.as_path()).await?;
    info!(
        path = %path.display(),
        migrations = migrator.iter().count(),
        "applying pending migrations"
    );

    let pool = PgPoolOptions::new().max_connections(1).connect(dsn).await?;
    let result = migrator.run(&pool).await;
    pool.close().await;
    result?;

    info!("database schema is up to date");
    Ok(())
}

/// Open a connection pool and check it with a round trip.
pub async fn open_connection(options: ConnectOptions) -> Result<PgPool, DatabaseError> {
    let dsn = options
        .dsn
        .filter(|dsn| !dsn.trim().is_empty())
        .or_else(|| std::env::var("POSTGRES_URL").ok())
        .filter(|dsn| !dsn.trim().is_empty())
        .ok_or(ConfigError::Missing("POSTGRES_URL"))?;

    let force_utc = options.force_utc;
    let pool = PgPoolOptions::new()
        .max_connections(options.max_connections)
        .min_connections(options.min_connections)
        .acquire_timeout(options.acquire_timeout)
        .idle_timeout(options.idle_timeout)
        .max_lifetime(options.max_lifetime)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                if force_utc {
                    sqlx::query("SET TIME ZONE 'UTC'")
                        .execute(&mut *conn)
                        .await?;
                }
                Ok(())
            })
        })
        .connect(&dsn)
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;
    debug!(
        size = pool.size(),
        idle = pool.num_idle(),
        "connected to postgres"
    );

    Ok(pool)
}

fn log_query(sql: &str, start: Instant, outcome: Result<(), &sqlx::Error>) {
    let elapsed = start.elapsed().as_secs_f64();
    match outcome {
        Ok(()) => debug!(sql, elapsed, "query finished"),
        Err(err) => warn!(sql, elapsed, "query failed: {}", err),
    }
}

pub async fn execute_logged<'q>(
    pool: &PgPool,
    query: Query<'q, Postgres, PgArguments>,
) -> Result<PgQueryResult, sqlx::Error> {
    let sql = query.sql().to_owned();
    let start = Instant::now();
    let result = query.execute(pool).await;
    log_query(&sql, start, result.as_ref().map(|_| ()));
    result
}

pub async fn fetch_all_logged<'q>(
    pool: &PgPool,
    query: Query<'q, Postgres, PgArguments>,
) -> Result<Vec<PgRow>, sqlx::Error> {
    let sql = query.sql().to_owned();
    let start = Instant::now();
    let result = query.fetch_all(pool).await;
    log_query(&sql, start, result.as_ref().map(|_| ()));
    result
}

pub async fn fetch_optional_logged<'q>(
    pool: &PgPool,
    query: Query<'q, Postgres, PgArguments>,
) -> Result<Option<PgRow>, sqlx::Error> {
    let sql = query.sql().to_owned();
    let start = Instant::now();
    let result = query.fetch_optional(pool).await;
    log_query(&sql, start, result.as_ref().map(|_| ()));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvMsDuration;

    #[tokio::test]
    async fn migrate_requires_dsn_and_path() {
        assert!(matches!(
            migrate("", "migrations").await,
            Err(DatabaseError::Configuration(ConfigError::Missing("POSTGRES_URL")))
        ));
        assert!(matches!(
            migrate("postgres://localhost/relay", " ").await,
            Err(DatabaseError::Configuration(ConfigError::Missing("MIGRATION_PATH")))
        ));
    }

    #[tokio::test]
    async fn migrate_rejects_missing_directory() {
        let result = migrate(
            "postgres://localhost/relay",
            "/nonexistent/relay/migrations",
        )
        .await;
        assert!(matches!(result, Err(DatabaseError::Migrate(_))));
    }

    #[test]
    fn relative_paths_are_made_absolute() {
        assert!(absolute("migrations").unwrap().is_absolute());
        assert_eq!(absolute("/srv/migrations").unwrap(), PathBuf::from("/srv/migrations"));
    }

    #[test]
    fn options_follow_database_config() {
        let config = DatabaseConfig {
            database_url: Some("postgres://localhost/relay".to_string()),
            migration_path: None,
            max_pg_connections: 4,
            max_idle_pg_connections: 1,
            pg_connection_max_idle: EnvMsDuration(Duration::from_secs(60)),
            pg_connection_max_lifetime: EnvMsDuration(Duration::from_secs(600)),
            pg_force_utc: false,
        };

        let options = ConnectOptions::from(&config);

        assert_eq!(options.dsn.as_deref(), Some("postgres://localhost/relay"));
        assert_eq!(options.max_connections, 4);
        assert_eq!(options.min_connections, 1);
        assert_eq!(options.idle_timeout, Duration::from_secs(60));
        assert_eq!(options.max_lifetime, Duration::from_secs(600));
        assert!(!options.force_utc);
    }
}
