use serde_json::json;
use tempfile::tempdir;
use upsertree::persistence::PersistentConnection;
use upsertree::test_support::{generate_triples, ipmetrics_schema};
use upsertree::{
    reconcile, Accumulator, BatchLimits, FlushOptions, Key, NestedSource, PersistentStore,
    Predicate, RecordSource, SeriesSource, StoreConfig, StoreConnection, StoreConnector, SumRule,
    TableSchema, Value, VecSource,
};

#[test]
fn series_sources_flush_into_rocksdb() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let store = PersistentStore::new(StoreConfig::at(dir.path()));
    let schema = TableSchema::new("economy", ["date"], ["unemployment", "gdp"])?;

    let mut sources: Vec<Box<dyn RecordSource>> = vec![
        Box::new(SeriesSource::new(
            "LRUN64TTUSA156N",
            "unemployment",
            json!({"observations": [
                {"date": "2019-01-01", "value": "3.7"},
                {"date": "2020-01-01", "value": "8.1"}
            ]}),
        )),
        Box::new(SeriesSource::new(
            "GDPA",
            "gdp",
            json!({"observations": [
                {"date": "2019-01-01", "value": "21380.976"},
                {"date": "2020-01-01", "value": "."}
            ]}),
        )),
        Box::new(SeriesSource::new(
            "broken",
            "gdp",
            json!({"error_code": 400, "error_message": "Bad Request. Variable api_key is not set."}),
        )),
    ];

    let mut acc = Accumulator::new(schema.clone());
    let gathered = acc.gather_all(&mut sources);
    assert_eq!(gathered.merged, 3);
    assert_eq!(gathered.failed_sources.len(), 1);
    assert_eq!(acc.leaf_count(), 2);

    let report = acc.flush(&store, &FlushOptions::default())?;
    assert_eq!(report.inserted, 2);

    let mut conn = store.connect()?;
    let mut rows = conn.scan(&schema)?;
    rows.sort_by(|a, b| a.dimensions.cmp(&b.dimensions));
    assert_eq!(rows[0].metric("gdp"), Some(&Value::from("21380.976")));
    assert_eq!(rows[1].metric("gdp"), Some(&Value::Null));
    assert_eq!(rows[1].metric("unemployment"), Some(&Value::from("8.1")));
    Ok(())
}

#[test]
fn generated_dataset_is_idempotent_on_rocksdb() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let store = PersistentStore::new(StoreConfig::at(dir.path()));
    let schema = ipmetrics_schema();
    let triples = generate_triples(20, 12, 0.3, 5);
    let options = FlushOptions {
        limits: BatchLimits::with_max_placeholders(160),
    };

    let mut acc = Accumulator::new(schema.clone());
    acc.gather(&mut VecSource::new("bls", triples.clone()))?;
    let leaves = acc.leaf_count();
    let first = acc.flush(&store, &options)?;
    assert_eq!(first.inserted, leaves);
    assert_eq!(first.insert_statements, leaves.div_ceil(20));

    let mut acc = Accumulator::new(schema.clone());
    acc.gather(&mut VecSource::new("bls", triples))?;
    let second = acc.flush(&store, &options)?;
    assert_eq!(second.inserted, 0);
    assert_eq!(second.updated, leaves);

    let mut conn = store.connect()?;
    assert_eq!(conn.scan(&schema)?.len(), leaves);
    Ok(())
}

#[test]
fn reconcile_fills_cost_gaps_after_flush() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let store = PersistentStore::new(StoreConfig::at(dir.path()));
    let schema = ipmetrics_schema();

    let mut acc = Accumulator::new(schema.clone());
    acc.gather(&mut NestedSource::new(
        "bls",
        2,
        json!({
            "3111": {
                "2012-01-01": {"laborCostMil": "10", "capitalCostMil": "5", "intermediateCostMil": "5"},
                "2013-01-01": {"laborCostMil": "12", "intermediateCostMil": "6", "combinedCostMil": "25"}
            },
            "3112": {
                "2012-01-01": {"laborCostMil": "1"}
            }
        }),
    ))?;
    acc.flush(&store, &FlushOptions::default())?;

    let rule = SumRule::new(
        "combinedCostMil",
        ["laborCostMil", "capitalCostMil", "intermediateCostMil"],
    );
    let report = reconcile(&store, &schema, &[rule])?;
    assert_eq!(report.rows_scanned, 3);
    assert_eq!(report.totals_written, 1);
    assert_eq!(report.parts_derived, 1);

    let mut conn = store.connect()?;
    let find = |conn: &mut PersistentConnection, industry: &str, date: &str| {
        let predicate = Predicate::new(vec![
            ("industryCode".to_string(), Key::from(industry)),
            ("date".to_string(), Key::from(date)),
        ]);
        assert_eq!(conn.count_matching("ipmetrics", &predicate).unwrap(), 1);
        conn.scan(&schema)
            .unwrap()
            .into_iter()
            .find(|row| row.dimensions == vec![Key::from(industry), Key::from(date)])
            .unwrap()
    };

    let complete = find(&mut conn, "3111", "2012-01-01");
    assert_eq!(complete.metric("combinedCostMil"), Some(&Value::from("20")));
    let derived = find(&mut conn, "3111", "2013-01-01");
    assert_eq!(derived.metric("capitalCostMil"), Some(&Value::from("7")));
    let sparse = find(&mut conn, "3112", "2012-01-01");
    assert_eq!(sparse.metric("combinedCostMil"), Some(&Value::Null));
    Ok(())
}
