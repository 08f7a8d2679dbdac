use std::fs;

use anyhow::{anyhow, bail, Context};
use tracing_subscriber::EnvFilter;
use upsertree::config::{ConfigOverrides, FlushOverrides, StoreOverrides, UpsertConfig};
use upsertree::{
    reconcile, Accumulator, FlushOptions, Key, PersistentStore, SumRule, TableSchema, Triple,
    Value, VecSource,
};

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn print_help() {
    eprintln!(
        r#"upsertree_load - merge triples into a table and upsert them

USAGE:
    upsertree_load --table <NAME> --dimensions <A,B> --metrics <X,Y> --input <FILE> [OPTIONS]

OPTIONS:
    -c, --config <FILE>         Path to config file (TOML)
    -d, --data-dir <DIR>        Override store directory
    -t, --table <NAME>          Target table
        --dimensions <LIST>     Comma-separated dimension names, outermost first
        --metrics <LIST>        Comma-separated metric names
    -i, --input <FILE>          JSON lines: {{"path": [..], "metric": "..", "value": ..}}
        --max-placeholders <N>  Override the per-statement placeholder ceiling
        --sum <RULE>            Gap-fill after flush, e.g. total=a+b+c (separate rules with ;)
    -h, --help                  Print help

ENVIRONMENT:
    UPSERTREE_CONFIG                  Path to config file
    UPSERTREE_STORE__DATA_DIR         Store directory
    UPSERTREE_FLUSH__MAX_PLACEHOLDERS Placeholder ceiling
    RUST_LOG                          Log filter (default: info)
"#
    );
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_sum_rules(raw: &str) -> anyhow::Result<Vec<SumRule>> {
    raw.split(';')
        .filter(|r| !r.trim().is_empty())
        .map(|rule| {
            let (total, parts) = rule
                .split_once('=')
                .ok_or_else(|| anyhow!("sum rule {rule} must look like total=a+b"))?;
            let parts: Vec<&str> = parts.split('+').map(str::trim).collect();
            Ok(SumRule::new(total.trim(), parts))
        })
        .collect()
}

fn parse_triple(line_no: usize, line: &str) -> anyhow::Result<Triple> {
    let raw: serde_json::Value =
        serde_json::from_str(line).with_context(|| format!("line {line_no}: invalid JSON"))?;
    let path = raw
        .get("path")
        .and_then(|p| p.as_array())
        .ok_or_else(|| anyhow!("line {line_no}: missing path array"))?
        .iter()
        .map(|k| Key::from_json(k).ok_or_else(|| anyhow!("line {line_no}: bad key {k}")))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let metric = raw
        .get("metric")
        .and_then(|m| m.as_str())
        .ok_or_else(|| anyhow!("line {line_no}: missing metric"))?;
    let value = Value::from_json(raw.get("value").unwrap_or(&serde_json::Value::Null))
        .ok_or_else(|| anyhow!("line {line_no}: value must be a scalar"))?;
    Ok(Triple::new(path, metric, value))
}

fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Build CLI overrides
    let mut overrides = ConfigOverrides::default();
    if let Some(dir) = parse_arg("--data-dir").or_else(|| parse_arg("-d")) {
        overrides.store = Some(StoreOverrides {
            data_dir: Some(dir.into()),
            ..Default::default()
        });
    }
    if let Some(max) = parse_arg("--max-placeholders") {
        overrides.flush = Some(FlushOverrides {
            max_placeholders: Some(max.parse().context("--max-placeholders")?),
        });
    }

    // Load config: CLI > Env > File > Defaults
    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("UPSERTREE_CONFIG").ok());
    let config = UpsertConfig::load(config_path.as_deref(), overrides)?;

    let table = parse_arg("--table")
        .or_else(|| parse_arg("-t"))
        .ok_or_else(|| anyhow!("--table is required"))?;
    let dimensions = parse_arg("--dimensions")
        .map(|raw| split_list(&raw))
        .ok_or_else(|| anyhow!("--dimensions is required"))?;
    let metrics = parse_arg("--metrics")
        .map(|raw| split_list(&raw))
        .ok_or_else(|| anyhow!("--metrics is required"))?;
    let schema = TableSchema::new(table, dimensions, metrics)?;

    let input = parse_arg("--input")
        .or_else(|| parse_arg("-i"))
        .ok_or_else(|| anyhow!("--input is required"))?;
    let raw = fs::read_to_string(&input).with_context(|| format!("reading {input}"))?;
    let triples = raw
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| parse_triple(i + 1, line))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let rules = match parse_arg("--sum") {
        Some(raw) => parse_sum_rules(&raw)?,
        None => Vec::new(),
    };

    let mut acc = Accumulator::new(schema.clone());
    let gathered = acc.gather(&mut VecSource::new(input.clone(), triples))?;
    if gathered.rejected > 0 {
        tracing::warn!(rejected = gathered.rejected, "some input lines did not fit the table");
    }

    let store = PersistentStore::new(config.store.clone());
    let report = acc.flush(&store, &FlushOptions::from(&config.flush))?;
    println!(
        "{}: {} rows, {} updated, {} inserted in {} statements, {} failed",
        schema.table(),
        report.rows_visited,
        report.updated,
        report.inserted,
        report.insert_statements,
        report.failed_rows.len()
    );
    for failure in &report.failed_rows {
        eprintln!(
            "  {} failed at {}: {}",
            failure.row.identity(&schema),
            failure.stage,
            failure.message
        );
    }

    if !rules.is_empty() {
        let filled = reconcile(&store, &schema, &rules)?;
        println!(
            "reconcile: {} rows scanned, {} totals written, {} parts derived",
            filled.rows_scanned, filled.totals_written, filled.parts_derived
        );
    }

    if !report.is_clean() {
        bail!("{} rows were not reconciled", report.failed_rows.len());
    }
    Ok(())
}
