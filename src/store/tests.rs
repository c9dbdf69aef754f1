use super::*;
use crate::entity::{
    Arrival, Entity, EntityType, Payload, PlaceData, StreetData, TransitData, WeatherData,
};
use crate::persist::{MemoryPointStore, PointStore, SqlitePointStore, StoredPoint};
use chrono::{Duration, Utc};
use std::sync::Arc;

fn memory_store() -> EntityStore {
    EntityStore::open(Arc::new(MemoryPointStore::new())).unwrap()
}

fn place(name: &str, lat: f64, lon: f64, category: &str) -> Entity {
    Entity::new(
        EntityType::Place,
        name,
        lat,
        lon,
        Payload::Place(PlaceData {
            category: category.to_string(),
            ..Default::default()
        }),
    )
}

fn weather(lat: f64, lon: f64, ttl: Duration) -> Entity {
    Entity::new(
        EntityType::Weather,
        "weather",
        lat,
        lon,
        Payload::Weather(WeatherData {
            temperature_c: 14.0,
            condition: "Overcast".to_string(),
            ..Default::default()
        }),
    )
    .with_ttl(ttl)
}

fn arrivals(stop_id: &str, lat: f64, lon: f64) -> Entity {
    Entity::new(
        EntityType::Arrival,
        format!("Stop {}", stop_id),
        lat,
        lon,
        Payload::Arrivals(TransitData {
            stop_id: stop_id.to_string(),
            stop_name: format!("Stop {}", stop_id),
            mode: "bus".to_string(),
            arrivals: vec![Arrival {
                line: "71".to_string(),
                destination: "Richmond".to_string(),
                minutes: 4,
                expected_at: None,
            }],
        }),
    )
    .with_ttl(Duration::minutes(2))
}

#[test]
fn test_insert_is_idempotent_upsert() {
    let store = memory_store();

    let first = store.insert(place("Cafe Nero", 51.41, -0.30, "cafe")).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    let second = store.insert(place("Cafe Nero", 51.41, -0.30, "cafe")).unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(store.len(), 1);
    assert_eq!(second.created_at, first.created_at);
    assert!(second.updated_at > first.updated_at);

    assert_eq!(store.metrics.inserts(), 1);
    assert_eq!(store.metrics.updates(), 1);
}

#[test]
fn test_insert_assigns_missing_id() {
    let store = memory_store();
    let mut entity = place("Boots", 51.41, -0.30, "pharmacy");
    let expected = entity.id.clone();
    entity.id.clear();

    let stored = store.insert(entity).unwrap();
    assert_eq!(stored.id, expected);
    assert!(store.get(&expected).is_some());
}

#[test]
fn test_insert_rejects_degenerate_coordinates() {
    let store = memory_store();
    assert!(store.insert(place("Nowhere", f64::NAN, 0.0, "cafe")).is_err());
    assert!(store.insert(place("Off the map", 95.0, 0.0, "cafe")).is_err());
    assert!(store.is_empty());
}

#[test]
fn test_moving_entity_replaces_point() {
    let store = memory_store();
    let stored = store.insert(place("Walker", 51.41, -0.30, "cafe")).unwrap();

    let mut moved = stored.clone();
    moved.lat = 51.45;
    store.insert(moved).unwrap();

    assert_eq!(store.len(), 1);
    assert!(store
        .query(51.41, -0.30, 500.0, None, 10, Duration::zero())
        .is_empty());
    assert_eq!(
        store.query(51.45, -0.30, 500.0, None, 10, Duration::zero()).len(),
        1
    );
}

#[test]
fn test_query_orders_by_distance_and_filters_type() {
    let store = memory_store();
    store.insert(place("Far", 51.420, -0.30, "cafe")).unwrap();
    store.insert(place("Near", 51.4101, -0.30, "cafe")).unwrap();
    store.insert(weather(51.41, -0.30, Duration::minutes(10))).unwrap();

    let places = store.query(51.41, -0.30, 5000.0, Some(EntityType::Place), 10, Duration::zero());
    let names: Vec<&str> = places.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["Near", "Far"]);

    let limited = store.query(51.41, -0.30, 5000.0, None, 1, Duration::zero());
    assert_eq!(limited.len(), 1);
}

#[test]
fn test_expired_entities_are_invisible() {
    let store = memory_store();
    store.insert(weather(51.41, -0.30, Duration::seconds(-5))).unwrap();

    for radius in [10.0, 1_000.0, 100_000.0] {
        assert!(store
            .query(51.41, -0.30, radius, None, 10, Duration::zero())
            .is_empty());
    }
    assert!(store.list_by_type(EntityType::Weather).is_empty());

    // Still physically present and visible with enough staleness allowed
    assert_eq!(store.len(), 1);
    assert_eq!(
        store.query(51.41, -0.30, 1000.0, None, 10, Duration::minutes(1)).len(),
        1
    );
    assert_eq!(store.stats().expired, 1);
}

#[test]
fn test_category_and_name_queries() {
    let store = memory_store();
    store.insert(place("Cafe Nero", 51.41, -0.30, "cafe")).unwrap();
    store.insert(place("Boots", 51.411, -0.301, "pharmacy")).unwrap();
    store.insert(place("Costa Coffee", 51.412, -0.299, "Cafe")).unwrap();

    let cafes = store.query_by_category(51.41, -0.30, 1000.0, "CAFE", 10);
    assert_eq!(cafes.len(), 2);

    let found = store.query_by_name(51.41, -0.30, 1000.0, "nero", None, 10);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name, "Cafe Nero");

    assert!(store
        .query_by_name(51.41, -0.30, 1000.0, "nero", Some(EntityType::Weather), 10)
        .is_empty());
}

#[test]
fn test_extend_ttl_never_moves_backward() {
    let store = memory_store();
    let long = store.insert(weather(51.41, -0.30, Duration::hours(2))).unwrap();
    let short = store.insert(arrivals("490G", 51.4102, -0.3002)).unwrap();
    store.insert(place("Forever", 51.41, -0.30, "park")).unwrap();

    let extended = store.extend_ttl(51.41, -0.30, 1000.0, None, Duration::minutes(10));
    assert_eq!(extended, 1);

    let long_after = store.get(&long.id).unwrap();
    assert_eq!(long_after.expires_at, long.expires_at);

    let short_after = store.get(&short.id).unwrap();
    assert!(short_after.expires_at.unwrap() > short.expires_at.unwrap());
    assert!(short_after.expires_at.unwrap() > Utc::now() + Duration::minutes(9));

    // Places without expiry stay without expiry
    assert!(store.list_by_type(EntityType::Place)[0].expires_at.is_none());
}

#[test]
fn test_extend_ttl_revives_recently_expired_arrivals() {
    let store = memory_store();
    let mut stale = arrivals("490G", 51.41, -0.30);
    stale.expires_at = Some(Utc::now() - Duration::seconds(30));
    store.insert(stale).unwrap();

    let n = store.extend_ttl(51.41, -0.30, 500.0, Some(EntityType::Arrival), Duration::minutes(2));
    assert_eq!(n, 1);
    assert_eq!(
        store
            .query(51.41, -0.30, 500.0, Some(EntityType::Arrival), 10, Duration::zero())
            .len(),
        1
    );
}

#[test]
fn test_extend_ttl_leaves_long_expired_entities() {
    let store = memory_store();
    let mut dead = arrivals("490G", 51.41, -0.30);
    dead.expires_at = Some(Utc::now() - Duration::minutes(50));
    let dead = store.insert(dead).unwrap();

    let n = store.extend_ttl(51.41, -0.30, 500.0, Some(EntityType::Arrival), Duration::minutes(2));
    assert_eq!(n, 0);
    assert_eq!(store.get(&dead.id).unwrap().expires_at, dead.expires_at);
    assert!(store
        .query(51.41, -0.30, 500.0, Some(EntityType::Arrival), 10, Duration::zero())
        .is_empty());
}

#[test]
fn test_extend_ttl_where_filters_by_predicate() {
    let store = memory_store();
    let a = store.insert(arrivals("A", 51.41, -0.30).with_ttl(Duration::seconds(5))).unwrap();
    let b = store.insert(arrivals("B", 51.4101, -0.30).with_ttl(Duration::seconds(5))).unwrap();

    let n = store.extend_ttl_where(51.41, -0.30, 500.0, Duration::minutes(2), |e| e.id == a.id);
    assert_eq!(n, 1);
    assert!(store.get(&a.id).unwrap().expires_at > a.expires_at);
    assert_eq!(store.get(&b.id).unwrap().expires_at, b.expires_at);
}

#[test]
fn test_modify_preserves_identity() {
    let store = memory_store();
    let original = store.insert(place("Library", 51.41, -0.30, "library")).unwrap();

    let updated = store
        .modify(&original.id, |e| {
            e.id = "hijacked".to_string();
            e.lat = 51.42;
            if let Payload::Place(p) = &mut e.payload {
                p.category = "books".to_string();
            }
        })
        .unwrap()
        .unwrap();

    assert_eq!(updated.id, original.id);
    assert_eq!(updated.created_at, original.created_at);
    assert_eq!(store.get(&original.id).unwrap().lat, 51.42);
    assert_eq!(
        store.get(&original.id).unwrap().payload.as_place().unwrap().category,
        "books"
    );

    assert!(store.modify("missing", |_| {}).unwrap().is_none());
}

#[test]
fn test_remove_and_events() {
    let store = memory_store();
    let mut rx = store.subscribe();

    let stored = store.insert(place("Gym", 51.41, -0.30, "gym")).unwrap();
    store.insert(place("Gym", 51.41, -0.30, "gym")).unwrap();
    assert!(store.remove(&stored.id).is_some());
    assert!(store.remove(&stored.id).is_none());

    let kinds: Vec<EventKind> = (0..3).map(|_| rx.try_recv().unwrap().kind).collect();
    assert_eq!(kinds, vec![EventKind::Created, EventKind::Updated, EventKind::Deleted]);
    assert_eq!(store.recent_events(10).len(), 3);
}

#[test]
fn test_cleanup_expired_respects_grace() {
    let store = memory_store();
    store.insert(weather(51.41, -0.30, Duration::minutes(-30))).unwrap();
    store.insert(weather(52.41, -0.30, Duration::minutes(-1))).unwrap();
    store.insert(weather(53.41, -0.30, Duration::minutes(10))).unwrap();

    assert_eq!(store.cleanup_expired(Duration::minutes(5)), 1);
    assert_eq!(store.len(), 2);

    assert_eq!(store.cleanup_expired(Duration::zero()), 1);
    assert_eq!(store.len(), 1);

    let expired_events = store
        .recent_events(10)
        .into_iter()
        .filter(|e| e.kind == EventKind::Expired)
        .count();
    assert_eq!(expired_events, 2);
}

#[test]
fn test_cleanup_duplicates_keeps_newest() {
    let store = memory_store();

    // Same stop stored under two names (so two IDs)
    let mut old = arrivals("490G", 51.41, -0.30);
    old.name = "Old name".to_string();
    old.id = String::new();
    let old = store.insert(old).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    let new = store.insert(arrivals("490G", 51.4101, -0.3001)).unwrap();
    assert_ne!(old.id, new.id);

    // Different stop is untouched
    store.insert(arrivals("490H", 51.42, -0.30)).unwrap();

    let street = |from: &str| {
        Entity::new(
            EntityType::Street,
            format!("walk from {}", from),
            51.41,
            -0.30,
            Payload::Street(StreetData {
                points: vec![[51.41, -0.30], [51.42, -0.30]],
                length_m: 1100.0,
                from_agent: Some("a".to_string()),
                to_agent: Some("b".to_string()),
                source: "courier".to_string(),
            }),
        )
    };
    store.insert(street("x")).unwrap();
    store.insert(street("y")).unwrap();

    assert_eq!(store.cleanup_duplicates(), 2);
    assert!(store.get(&old.id).is_none());
    assert!(store.get(&new.id).is_some());
    assert_eq!(store.list_by_type(EntityType::Street).len(), 1);
    assert_eq!(store.cleanup_duplicates(), 0);
}

#[test]
fn test_persistence_round_trip_through_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("atlas.db");

    let id = {
        let store = EntityStore::open(Arc::new(SqlitePointStore::new(&path).unwrap())).unwrap();
        let cafe = store.insert(place("Cafe Nero", 51.41, -0.30, "cafe")).unwrap();
        store.insert(weather(51.41, -0.30, Duration::seconds(-1))).unwrap();
        store.close().unwrap();
        cafe.id
    };

    let store = EntityStore::open(Arc::new(SqlitePointStore::new(&path).unwrap())).unwrap();
    let report = store.load_report();
    assert_eq!(report.loaded, 1);
    assert_eq!(report.skipped_expired, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(store.get(&id).unwrap().payload.as_place().unwrap().category, "cafe");
}

#[test]
fn test_concurrent_writes_persist_last_in_memory_version() {
    let points = Arc::new(MemoryPointStore::new());
    let store = Arc::new(EntityStore::open(points.clone()).unwrap());

    let writers: Vec<_> = (0..8)
        .map(|t| {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    let category = format!("cafe-{}-{}", t, i);
                    store.insert(place("Cafe Nero", 51.41, -0.30, &category)).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let in_memory = store.query_by_name(51.41, -0.30, 100.0, "nero", None, 10);
    assert_eq!(in_memory.len(), 1);
    let durable = points.list().unwrap();
    assert_eq!(durable.len(), 1);
    assert_eq!(durable[&in_memory[0].id].record, in_memory[0].to_record().unwrap());
}

#[test]
fn test_load_migrates_legacy_and_counts_failures() {
    let points = Arc::new(MemoryPointStore::new());
    points
        .save(
            "legacy",
            &StoredPoint {
                lat: 51.41,
                lon: -0.30,
                record: r#"{"id":"legacy","type":"place","name":"Old Cafe","lat":51.41,"lon":-0.30,
                    "payload":{"category":"cafe","osm_id":123,"cuisine":"coffee_shop"}}"#
                    .to_string(),
            },
        )
        .unwrap();
    points
        .save(
            "broken",
            &StoredPoint {
                lat: 0.0,
                lon: 0.0,
                record: "{not json".to_string(),
            },
        )
        .unwrap();

    let store = EntityStore::open(points).unwrap();
    assert_eq!(store.load_report().loaded, 1);
    assert_eq!(store.load_report().failed, 1);

    let legacy = store.get("legacy").unwrap();
    let place = legacy.payload.as_place().unwrap();
    assert_eq!(place.poi_id.as_deref(), Some("123"));
    assert_eq!(place.tags["cuisine"], "coffee_shop");
    assert_eq!(store.query_by_category(51.41, -0.30, 100.0, "cafe", 5).len(), 1);
}

struct FailingPointStore;

impl PointStore for FailingPointStore {
    fn save(&self, _id: &str, _point: &StoredPoint) -> anyhow::Result<()> {
        anyhow::bail!("disk full")
    }
    fn delete(&self, _id: &str) -> anyhow::Result<()> {
        anyhow::bail!("disk full")
    }
    fn list(&self) -> anyhow::Result<std::collections::HashMap<String, StoredPoint>> {
        Ok(Default::default())
    }
    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[test]
fn test_persist_failure_does_not_fail_insert() {
    let store = EntityStore::open(Arc::new(FailingPointStore)).unwrap();
    assert!(store.insert(place("Cafe", 51.41, -0.30, "cafe")).is_ok());
    assert_eq!(store.len(), 1);
    assert_eq!(store.stats().persist_failures, 1);
}

#[tokio::test]
async fn test_maintenance_loop_stops_on_shutdown() {
    let store = Arc::new(memory_store());
    store.insert(weather(51.41, -0.30, Duration::minutes(-10))).unwrap();

    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(store.clone().run_maintenance(
        std::time::Duration::from_millis(10),
        Duration::zero(),
        rx,
    ));

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    tx.send(true).unwrap();
    handle.await.unwrap();

    assert!(store.is_empty());
}
