pub mod health;

use anyhow::{Context, Result};
use clickhouse_rs::Pool;

use crate::config::ClickHouseConfig;

/// Database every server has; the target database is created through it.
const BOOTSTRAP_DATABASE: &str = "default";

/// Pool options appended to every DSN.
const POOL_OPTIONS: &str = "compression=lz4&pool_min=2&pool_max=5";

/// Opens a pool on the configured database, creating the database first.
///
/// The first handle is pinged so an unreachable server fails here rather
/// than on the first flush.
pub async fn connect(cfg: &ClickHouseConfig) -> Result<Pool> {
    let bootstrap = Pool::new(dsn(cfg, BOOTSTRAP_DATABASE));
    let mut handle = bootstrap
        .get_handle()
        .await
        .with_context(|| format!("connecting to ClickHouse at {}", cfg.endpoint))?;
    handle
        .execute(create_database_sql(&cfg.database).as_str())
        .await
        .with_context(|| format!("creating database {}", cfg.database))?;
    drop(handle);

    let pool = Pool::new(dsn(cfg, &cfg.database));
    pool.get_handle()
        .await
        .context("opening ClickHouse connection")?
        .ping()
        .await
        .context("pinging ClickHouse")?;

    tracing::info!(
        endpoint = %cfg.endpoint,
        database = %cfg.database,
        "ClickHouse connected"
    );

    Ok(pool)
}

/// Quotes an identifier with backticks, escaping embedded backticks and
/// backslashes.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
}

fn create_database_sql(database: &str) -> String {
    format!("CREATE DATABASE IF NOT EXISTS {}", quote_ident(database))
}

/// `tcp://[user[:pass]@]endpoint/database?options` for clickhouse-rs.
fn dsn(cfg: &ClickHouseConfig, database: &str) -> String {
    let credentials = match (cfg.username.as_str(), cfg.password.as_str()) {
        ("", _) => String::new(),
        (user, "") => format!("{user}@"),
        (user, pass) => format!("{user}:{pass}@"),
    };
    format!("tcp://{credentials}{}/{database}?{POOL_OPTIONS}", cfg.endpoint)
}
