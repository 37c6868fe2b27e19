//! Result-table schema for the ClickHouse sink.
//!
//! The schema is built from the same column lists the sink inserts with and
//! is applied forward only. Each step is recorded in `schema_versions`; every
//! statement is idempotent, so a step interrupted halfway is simply replayed.

use std::fmt::Write;

use anyhow::{Context, Result};
use clickhouse_rs::{ClientHandle, Pool};

use crate::observation::StreamKind;
use crate::stats::FULL_PERCENTILES;

const VERSIONS_TABLE: &str = "schema_versions";

/// A column name (quoted where it clashes with a keyword) and its type.
pub type Column = (&'static str, &'static str);

const TRANSACTION_DETAIL_COLUMNS: &[Column] = &[
    ("tx_hash", "String"),
    ("fiber_timestamp", "Int64"),
    ("other_timestamp", "Int64"),
    ("difference", "Int64"),
    ("benchmark_id", "String"),
    ("`from`", "String"),
    ("`to`", "String"),
    ("calldata_size", "Int64"),
];

const BLOCK_DETAIL_COLUMNS: &[Column] = &[
    ("block_hash", "String"),
    ("fiber_timestamp", "Int64"),
    ("other_timestamp", "Int64"),
    ("difference", "Int64"),
    ("benchmark_id", "String"),
    ("transactions_len", "Int64"),
];

/// Stats columns present since the first step; the `pN` columns follow.
const STATS_BASE_COLUMNS: &[Column] = &[
    ("start_time", "DateTime64(3)"),
    ("end_time", "DateTime64(3)"),
    ("min", "Float64"),
    ("max", "Float64"),
    ("benchmark_id", "String"),
    ("mean", "Float64"),
    ("fiber_won", "Float64"),
];

/// Added after `mean` by the second step, in this order.
const DISPERSION_COLUMNS: &[Column] = &[
    ("median", "Float64"),
    ("std_dev", "Float64"),
    ("sample_count", "UInt64"),
];

/// Detail and stats table names for a stream kind.
pub fn tables(kind: StreamKind) -> (&'static str, &'static str) {
    match kind {
        StreamKind::Transactions => ("confirmed_observations", "observation_stats"),
        StreamKind::Blocks => ("confirmed_block_observations", "block_observation_stats"),
    }
}

/// Columns of the detail table, in insert order.
pub fn detail_columns(kind: StreamKind) -> &'static [Column] {
    match kind {
        StreamKind::Transactions => TRANSACTION_DETAIL_COLUMNS,
        StreamKind::Blocks => BLOCK_DETAIL_COLUMNS,
    }
}

struct Step {
    version: u32,
    name: &'static str,
    statements: fn() -> Vec<String>,
}

static STEPS: &[Step] = &[
    Step {
        version: 1,
        name: "result_tables",
        statements: result_tables,
    },
    Step {
        version: 2,
        name: "dispersion_columns",
        statements: dispersion_columns,
    },
];

/// Version reached once every step is applied.
pub fn latest_version() -> u32 {
    STEPS.last().map_or(0, |s| s.version)
}

fn result_tables() -> Vec<String> {
    let percentile_columns: Vec<(String, &str)> = FULL_PERCENTILES
        .iter()
        .map(|rank| (format!("p{}", *rank as u32), "Float64"))
        .collect();

    let mut statements = Vec::with_capacity(4);
    for kind in [StreamKind::Transactions, StreamKind::Blocks] {
        let (detail, stats) = tables(kind);
        let (key, _) = detail_columns(kind)[0];

        statements.push(create_table(
            detail,
            detail_columns(kind).iter().map(|(n, t)| (n.to_string(), *t)),
            &format!("({key}, difference)"),
        ));

        let stats_columns = STATS_BASE_COLUMNS
            .iter()
            .map(|(n, t)| (n.to_string(), *t))
            .chain(percentile_columns.iter().cloned());
        statements.push(create_table(stats, stats_columns, "(end_time)"));
    }
    statements
}

fn dispersion_columns() -> Vec<String> {
    [StreamKind::Transactions, StreamKind::Blocks]
        .into_iter()
        .map(|kind| {
            let (_, stats) = tables(kind);
            let mut after = "mean";
            let clauses: Vec<String> = DISPERSION_COLUMNS
                .iter()
                .map(|(name, ty)| {
                    let clause = format!("ADD COLUMN IF NOT EXISTS {name} {ty} AFTER {after}");
                    after = *name;
                    clause
                })
                .collect();
            format!("ALTER TABLE {stats} {}", clauses.join(", "))
        })
        .collect()
}

fn create_table(
    table: &str,
    columns: impl Iterator<Item = (String, &'static str)>,
    primary_key: &str,
) -> String {
    let mut sql = format!("CREATE TABLE IF NOT EXISTS {table} (");
    for (idx, (name, ty)) in columns.enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }
        let _ = write!(sql, "{name} {ty}");
    }
    let _ = write!(sql, ") ENGINE = MergeTree() PRIMARY KEY {primary_key}");
    sql
}

/// Brings the result tables of the pool's database up to the latest version.
///
/// Returns the version the schema is at afterwards.
pub async fn apply(pool: &Pool) -> Result<u32> {
    let mut handle = pool
        .get_handle()
        .await
        .context("getting ClickHouse handle for schema")?;

    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {VERSIONS_TABLE} (version UInt32, name String, \
         applied_at DateTime DEFAULT now()) ENGINE = MergeTree() ORDER BY version"
    );
    handle
        .execute(ddl.as_str())
        .await
        .context("creating schema version table")?;

    let current = applied_version(&mut handle).await?;

    for step in STEPS.iter().filter(|s| s.version > current) {
        for sql in (step.statements)() {
            handle
                .execute(sql.as_str())
                .await
                .with_context(|| format!("applying schema step {} ({})", step.version, step.name))?;
        }

        let record = format!(
            "INSERT INTO {VERSIONS_TABLE} (version, name) VALUES ({}, '{}')",
            step.version, step.name
        );
        handle
            .execute(record.as_str())
            .await
            .with_context(|| format!("recording schema step {}", step.version))?;

        tracing::info!(version = step.version, name = step.name, "applied schema step");
    }

    let latest = latest_version().max(current);
    if latest == current {
        tracing::info!(version = current, "result schema up to date");
    }

    Ok(latest)
}

async fn applied_version(handle: &mut ClientHandle) -> Result<u32> {
    let sql = format!("SELECT max(version) AS version FROM {VERSIONS_TABLE}");
    let block = handle
        .query(sql.as_str())
        .fetch_all()
        .await
        .context("querying schema version")?;

    match block.rows().next() {
        Some(row) => {
            let version: u32 = row.get("version").context("reading schema version")?;
            Ok(version)
        }
        None => Ok(0),
    }
}
