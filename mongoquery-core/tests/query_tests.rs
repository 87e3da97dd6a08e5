// Integration tests: fluent queries against the in-process driver
use chrono::{TimeZone, Utc};
use mongoquery_core::{
    CacheDirective, Connection, ConnectionConfig, Database, DriverError, Hook, ManualClock,
    MemoryConnector, MongoQueryError,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

fn config() -> ConnectionConfig {
    ConnectionConfig {
        database: "app".into(),
        debug: true,
        ..Default::default()
    }
}

fn open(config: ConnectionConfig) -> (Database, Arc<MemoryConnector>) {
    let connector = Arc::new(MemoryConnector::new());
    let db = Database::open(config, connector.clone()).unwrap();
    (db, connector)
}

fn row(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected an object"),
    }
}

fn seed(db: &Database, table: &str, rows: Vec<Value>) {
    let rows: Vec<Map<String, Value>> = rows.into_iter().map(row).collect();
    assert_eq!(db.table(table).insert_all(&rows).unwrap(), rows.len() as u64);
}

#[test]
fn test_insert_then_find_by_logical_id() {
    let (db, _) = open(ConnectionConfig {
        pk_convert_id: true,
        ..config()
    });

    let id = db
        .table("users")
        .insert_get_id(row(json!({"name": "a"})))
        .unwrap()
        .unwrap();
    let hex = id.as_str().unwrap().to_string();
    assert_eq!(hex.len(), 24);

    let rows = db.table("users").filter_eq("id", hex.as_str()).select().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], json!("a"));
    assert_eq!(rows[0]["id"], json!(hex));
    assert!(rows[0].get("_id").is_none());

    let found = db.table("users").pk(hex.as_str()).find().unwrap().unwrap();
    assert_eq!(found["name"], json!("a"));
}

#[test]
fn test_count_before_and_after_inserts() {
    let (db, _) = open(config());
    assert_eq!(db.table("users").count(None).unwrap(), 0);

    seed(&db, "users", vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]);
    assert_eq!(db.table("users").count(None).unwrap(), 3);
    assert_eq!(db.table("users").filter("n", ">", 1).count(Some("n")).unwrap(), 2);
}

#[test]
fn test_select_order_page_and_projection() {
    let (db, _) = open(config());
    seed(
        &db,
        "items",
        (1..=5).map(|n| json!({"n": n, "label": format!("item{}", n)})).collect(),
    );

    let rows = db
        .table("items")
        .field("n")
        .order("n", "asc")
        .page(2, 2)
        .select()
        .unwrap();
    let ns: Vec<Value> = rows.iter().map(|r| r["n"].clone()).collect();
    assert_eq!(ns, vec![json!(3), json!(4)]);
    assert!(rows[0].get("label").is_none());

    let rows = db.table("items").order("n", "desc").limit(2).select().unwrap();
    assert_eq!(rows[0]["n"], json!(5));
    assert_eq!(rows.len(), 2);
}

#[test]
fn test_or_group_and_between() {
    let (db, _) = open(config());
    seed(
        &db,
        "items",
        vec![
            json!({"n": 1, "kind": "a"}),
            json!({"n": 5, "kind": "b"}),
            json!({"n": 9, "kind": "c"}),
        ],
    );

    let rows = db.table("items").filter("n", "between", json!([4, 6])).select().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["kind"], json!("b"));

    let rows = db
        .table("items")
        .filter_or("kind", "=", "a")
        .filter_or("n", ">", 8)
        .order("n", "asc")
        .select()
        .unwrap();
    let kinds: Vec<Value> = rows.iter().map(|r| r["kind"].clone()).collect();
    assert_eq!(kinds, vec![json!("a"), json!("c")]);
}

#[test]
fn test_value_column_and_distinct() {
    let (db, _) = open(config());
    seed(
        &db,
        "users",
        vec![
            json!({"name": "a", "city": "x", "age": 20}),
            json!({"name": "b", "city": "y", "age": 30}),
            json!({"name": "c", "city": "x", "age": 40}),
        ],
    );

    assert_eq!(
        db.table("users").filter_eq("name", "b").value("age", 0).unwrap(),
        json!(30)
    );
    assert_eq!(
        db.table("users").filter_eq("name", "zz").value("age", -1).unwrap(),
        json!(-1)
    );

    let names = db.table("users").order("name", "asc").column("name", "").unwrap();
    assert_eq!(names, json!(["a", "b", "c"]));

    let by_name = db.table("users").column("age", "name").unwrap();
    assert_eq!(by_name, json!({"a": 20, "b": 30, "c": 40}));

    let mut cities = db.table("users").distinct("city").unwrap();
    cities.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
    assert_eq!(cities, vec![json!("x"), json!("y")]);
}

#[test]
fn test_aggregates() {
    let (db, _) = open(config());
    assert_eq!(db.table("scores").sum("v").unwrap(), json!(0));

    seed(
        &db,
        "scores",
        vec![
            json!({"team": "r", "v": 2}),
            json!({"team": "r", "v": 4}),
            json!({"team": "b", "v": 10}),
        ],
    );
    assert_eq!(db.table("scores").sum("v").unwrap(), json!(16));
    assert_eq!(db.table("scores").max("v").unwrap(), json!(10));
    assert_eq!(db.table("scores").min("v").unwrap(), json!(2));
    assert_eq!(db.table("scores").filter_eq("team", "r").avg("v").unwrap(), json!(3.0));

    let mut rows = db
        .table("scores")
        .group("team")
        .multi_aggregate(&[("sum", "v"), ("max", "v")], &[])
        .unwrap();
    rows.sort_by(|a, b| a["team"].as_str().cmp(&b["team"].as_str()));
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["team"], json!("b"));
    assert_eq!(rows[0]["v_sum"], json!(10));
    assert_eq!(rows[1]["v_sum"], json!(6));
    assert_eq!(rows[1]["v_max"], json!(4));
}

#[test]
fn test_update_and_delete() {
    let (db, _) = open(config());
    seed(
        &db,
        "users",
        vec![json!({"name": "a", "hits": 1}), json!({"name": "b", "hits": 1})],
    );

    let modified = db
        .table("users")
        .filter_eq("name", "a")
        .inc("hits", 2)
        .update(row(json!({"seen": true})))
        .unwrap();
    assert_eq!(modified, 1);
    let a = db.table("users").filter_eq("name", "a").find().unwrap().unwrap();
    assert_eq!(a["hits"], json!(3));
    assert_eq!(a["seen"], json!(true));

    let err = db.table("users").filter_eq("name", "a").update(Map::new()).unwrap_err();
    assert!(matches!(err, MongoQueryError::Precondition(_)));

    let err = db.table("users").delete(None).unwrap_err();
    assert!(matches!(err, MongoQueryError::Precondition(_)));

    assert_eq!(db.table("users").filter_eq("name", "b").delete(None).unwrap(), 1);
    assert_eq!(db.table("users").delete(Some(json!(true))).unwrap(), 1);
    assert_eq!(db.table("users").count(None).unwrap(), 0);
}

#[test]
fn test_lazy_increment_flushes_accumulated_total() {
    let connector = Arc::new(MemoryConnector::new());
    let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
    let connection = Connection::new(config(), connector)
        .unwrap()
        .with_clock(clock.clone());
    let db = Database::from_connection(connection);
    seed(&db, "users", vec![json!({"name": "a", "score": 0})]);

    let window = Some(Duration::from_secs(60));
    let target = || db.table("users").filter_eq("name", "a");

    assert_eq!(target().set_inc("score", 3, window).unwrap(), None);
    clock.advance(Duration::from_secs(10));
    assert_eq!(target().set_inc("score", 4, window).unwrap(), None);
    assert_eq!(target().value("score", -1).unwrap(), json!(0));

    clock.advance(Duration::from_secs(61));
    assert_eq!(target().set_inc("score", 0, window).unwrap(), Some(1));
    assert_eq!(target().value("score", -1).unwrap(), json!(7));

    assert_eq!(target().set_dec("score", 2, None).unwrap(), Some(1));
    assert_eq!(target().value("score", -1).unwrap(), json!(5));
}

#[test]
fn test_set_inc_requires_filter() {
    let (db, _) = open(config());
    let err = db.table("users").set_inc("score", 1, None).unwrap_err();
    assert!(matches!(err, MongoQueryError::Precondition(_)));
}

#[test]
fn test_driver_errors_pass_through() {
    let dsn = "mongodb://db.example:27017";
    let (db, connector) = open(ConnectionConfig {
        dsn: dsn.into(),
        ..config()
    });
    connector.refuse(dsn, DriverError::Authentication("bad credentials".into()));

    let err = db.table("users").select().unwrap_err();
    assert!(matches!(
        err,
        MongoQueryError::Driver(DriverError::Authentication(ref msg)) if msg == "bad credentials"
    ));

    connector.allow(dsn);
    assert!(db.table("users").select().unwrap().is_empty());
    assert_eq!(connector.connect_count(), 1);
}

#[test]
fn test_duplicate_key_is_driver_error() {
    let (db, _) = open(config());
    seed(&db, "users", vec![json!({"_id": 1, "name": "a"})]);
    let err = db
        .table("users")
        .insert(row(json!({"_id": 1, "name": "b"})))
        .unwrap_err();
    assert!(matches!(err, MongoQueryError::Driver(DriverError::BulkWrite(_))));
}

#[test]
fn test_cached_reads_and_invalidation() {
    let (db, _) = open(config());
    seed(&db, "users", vec![json!({"name": "a"})]);
    let directive = CacheDirective::new().with_key("users:all");

    assert_eq!(db.table("users").cache(directive.clone()).select().unwrap().len(), 1);
    seed(&db, "users", vec![json!({"name": "b"})]);
    assert_eq!(db.table("users").cache(directive.clone()).select().unwrap().len(), 1);
    assert!(db.connection().cache().has("users:all"));

    db.table("users")
        .cache(directive.clone())
        .filter_eq("name", "b")
        .update(row(json!({"seen": true})))
        .unwrap();
    assert!(!db.connection().cache().has("users:all"));
    assert_eq!(db.table("users").cache(directive).select().unwrap().len(), 2);
}

#[test]
fn test_before_hooks_replace_reads_and_after_hooks_fire() {
    let (db, _) = open(config());
    db.listen(Hook::BeforeFind, |opts, _| {
        (opts.table_name() == "stub").then(|| json!({"stub": true}))
    });
    let inserted = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = inserted.clone();
    db.listen(Hook::AfterInsert, move |_, id| {
        sink.lock().push(id.cloned());
        None
    });

    assert_eq!(db.table("stub").find().unwrap(), Some(json!({"stub": true})));
    assert_eq!(db.table("users").find().unwrap(), None);

    db.table("users").insert(row(json!({"name": "a"}))).unwrap();
    assert_eq!(inserted.lock().len(), 1);
}

#[test]
fn test_chunk_walks_every_row() {
    let (db, _) = open(config());
    seed(&db, "items", (1..=7).map(|n| json!({"n": n})).collect());

    let mut seen = Vec::new();
    let completed = db
        .table("items")
        .chunk(3, Some("n"), |rows| {
            seen.push(rows.len());
            true
        })
        .unwrap();
    assert!(completed);
    assert_eq!(seen, vec![3, 3, 1]);

    let mut calls = 0;
    let completed = db
        .table("items")
        .chunk(3, Some("n"), |_| {
            calls += 1;
            false
        })
        .unwrap();
    assert!(!completed);
    assert_eq!(calls, 1);
}

#[test]
fn test_prefixed_names_and_last_query() {
    let (db, _) = open(ConnectionConfig {
        prefix: "tp_".into(),
        ..config()
    });
    db.name("UserLog").insert(row(json!({"event": "login"}))).unwrap();
    assert_eq!(db.table("tp_user_log").count(None).unwrap(), 1);
    assert_eq!(db.list_collections().unwrap(), vec!["tp_user_log".to_string()]);

    db.name("UserLog").filter_eq("event", "login").select().unwrap();
    let last = db.last_query().unwrap();
    assert!(last.contains("tp_user_log"));
    assert!(last.contains("find"));
}
