use super::*;
use crate::testing::{test_config, test_services, test_services_with, FakeGeo};
use atlas::entity::AgentData;
use std::time::Duration as StdDuration;

fn manager(geo: Arc<FakeGeo>) -> Arc<CourierManager> {
    let services = test_services(geo, None);
    let indexer = Arc::new(PoiIndexer::new(services.clone()));
    Arc::new(CourierManager::new(services, indexer))
}

fn add_agent(manager: &CourierManager, name: &str, lat: f64, lon: f64) -> Entity {
    manager
        .services
        .store
        .insert(Entity::new(
            EntityType::Agent,
            name,
            lat,
            lon,
            Payload::Agent(AgentData::default()),
        ))
        .unwrap()
}

fn add_street(manager: &CourierManager, from: &Entity, to: &Entity) {
    manager
        .services
        .store
        .insert(Entity::new(
            EntityType::Street,
            format!("{} to {}", from.name, to.name),
            from.lat,
            from.lon,
            Payload::Street(StreetData {
                points: vec![[from.lat, from.lon], [to.lat, to.lon]],
                length_m: 0.0,
                from_agent: Some(from.id.clone()),
                to_agent: Some(to.id.clone()),
                source: "courier".to_string(),
            }),
        ))
        .unwrap();
}

async fn tick_until_arrived(manager: &CourierManager, id: &str) -> usize {
    for ticks in 1..=200 {
        if manager.tick(id).await.unwrap() == TickOutcome::Arrived {
            return ticks;
        }
    }
    panic!("courier never arrived");
}

#[tokio::test]
async fn test_create_and_list() {
    let manager = manager(FakeGeo::new());
    let courier = manager.create_courier("Hermes", 51.41, -0.30).unwrap();
    manager.create_courier("", 51.42, -0.30).unwrap();

    assert!(courier.enabled);
    assert_eq!(manager.get(&courier.id).unwrap().name, "Hermes");
    let names: Vec<String> = manager.list().into_iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["Courier 2", "Hermes"]);
    assert_eq!(manager.enabled_count(), 2);

    assert!(manager.create_courier("Lost", 95.0, 0.0).is_err());
    assert!(manager.enable("missing").await.is_err());
}

#[tokio::test]
async fn test_idle_without_agents() {
    let geo = FakeGeo::new();
    let manager = manager(geo.clone());
    let courier = manager.create_courier("Hermes", 51.41, -0.30).unwrap();

    assert_eq!(manager.tick(&courier.id).await.unwrap(), TickOutcome::Idle);
    assert_eq!(geo.calls("walking_route"), 0);
}

#[tokio::test]
async fn test_disabled_courier_does_nothing() {
    let geo = FakeGeo::new();
    let manager = manager(geo.clone());
    let courier = manager.create_courier("Hermes", 51.41, -0.30).unwrap();
    manager.send_to(&courier.id, 51.42, -0.30, "North").await.unwrap();

    let disabled = manager.disable(&courier.id).await.unwrap();
    assert!(!disabled.enabled);
    assert_eq!(manager.enabled_count(), 0);
    assert_eq!(manager.tick(&courier.id).await.unwrap(), TickOutcome::Disabled);
    assert_eq!(geo.calls("walking_route"), 0);

    manager.enable(&courier.id).await.unwrap();
    assert_eq!(manager.tick(&courier.id).await.unwrap(), TickOutcome::Routed);
}

#[tokio::test]
async fn test_trip_bridges_isolated_agent() {
    let manager = manager(FakeGeo::new());
    let a = add_agent(&manager, "Kingston", 51.41, -0.30);
    let b = add_agent(&manager, "Norbiton", 51.42, -0.30);
    let c = add_agent(&manager, "Surbiton", 51.41, -0.28);
    add_street(&manager, &a, &b);

    let courier = manager.create_courier("Hermes", a.lat, a.lon).unwrap();
    assert_eq!(manager.tick(&courier.id).await.unwrap(), TickOutcome::Routed);

    let routed = manager.get(&courier.id).unwrap();
    let destination = routed.destination.clone().unwrap();
    assert_eq!(destination.agent_id.as_deref(), Some(c.id.as_str()));
    assert_eq!(destination.reason, SelectionReason::BridgeComponent);
    assert_eq!(routed.origin_agent.as_deref(), Some(a.id.as_str()));

    tick_until_arrived(&manager, &courier.id).await;

    let arrived = manager.get(&courier.id).unwrap();
    assert_eq!(arrived.trips, 1);
    assert!(!arrived.is_walking());
    assert!(arrived.destination.is_none());
    assert!((arrived.lat - c.lat).abs() < 1e-9 && (arrived.lon - c.lon).abs() < 1e-9);
    assert!(arrived.distance_m > 1000.0);

    let trip = manager
        .services
        .store
        .list_by_type(EntityType::Street)
        .into_iter()
        .find(|s| s.name == "Hermes trip 1")
        .unwrap();
    let street = trip.payload.as_street().unwrap();
    assert_eq!(street.from_agent.as_deref(), Some(a.id.as_str()));
    assert_eq!(street.to_agent.as_deref(), Some(c.id.as_str()));
    // Straight track collapses to its endpoints
    assert_eq!(street.points.len(), 2);

    let pending = manager.services.awareness.pending(&c.id);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, ObservationKind::CourierArrival);
}

#[tokio::test]
async fn test_send_to_overrides_current_route() {
    let manager = manager(FakeGeo::new());
    add_agent(&manager, "Kingston", 51.41, -0.30);
    add_agent(&manager, "Surbiton", 51.41, -0.28);
    let courier = manager.create_courier("Hermes", 51.41, -0.30).unwrap();

    assert_eq!(manager.tick(&courier.id).await.unwrap(), TickOutcome::Routed);
    manager.tick(&courier.id).await.unwrap();

    let sent = manager
        .send_to(&courier.id, 51.415, -0.30, "Market Place")
        .await
        .unwrap();
    assert!(!sent.is_walking());
    assert_eq!(sent.waypoints.len(), 1);

    assert_eq!(manager.tick(&courier.id).await.unwrap(), TickOutcome::Routed);
    let routed = manager.get(&courier.id).unwrap();
    let destination = routed.destination.unwrap();
    assert_eq!(destination.name, "Market Place");
    assert_eq!(destination.reason, SelectionReason::Manual);
    assert!(routed.waypoints.is_empty());
}

#[tokio::test]
async fn test_waypoints_consumed_in_order() {
    let manager = manager(FakeGeo::new());
    let courier = manager.create_courier("Hermes", 51.41, -0.30).unwrap();
    let waypoints = vec![
        Waypoint {
            lat: 51.411,
            lon: -0.30,
            name: "First".to_string(),
        },
        Waypoint {
            lat: 51.412,
            lon: -0.30,
            name: "Second".to_string(),
        },
    ];
    manager.set_waypoints(&courier.id, waypoints).await.unwrap();

    for expected in ["First", "Second"] {
        assert_eq!(manager.tick(&courier.id).await.unwrap(), TickOutcome::Routed);
        let state = manager.get(&courier.id).unwrap();
        assert_eq!(state.destination.unwrap().name, expected);
        tick_until_arrived(&manager, &courier.id).await;
    }

    // Queue drained and no agents: back to automatic selection
    assert_eq!(manager.tick(&courier.id).await.unwrap(), TickOutcome::Idle);
    assert_eq!(manager.get(&courier.id).unwrap().trips, 2);

    let bad = vec![Waypoint {
        lat: 0.0,
        lon: 200.0,
        name: "Nowhere".to_string(),
    }];
    assert!(manager.set_waypoints(&courier.id, bad).await.is_err());
}

#[tokio::test]
async fn test_route_error_keeps_waypoint() {
    let geo = FakeGeo::new();
    geo.fail("walking_route");
    let manager = manager(geo);
    let courier = manager.create_courier("Hermes", 51.41, -0.30).unwrap();
    manager.send_to(&courier.id, 51.42, -0.30, "North").await.unwrap();

    assert!(manager.tick(&courier.id).await.is_err());
    let cell = manager.cell(&courier.id).unwrap();
    let state = cell.lock().await;
    assert_eq!(state.waypoints.len(), 1);
    assert!(!state.is_walking());
}

#[tokio::test]
async fn test_snapshot_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.snapshot.enabled = true;
    config.snapshot.directory = dir.path().to_path_buf();

    let services = test_services_with(config.clone(), FakeGeo::new(), None);
    let indexer = Arc::new(PoiIndexer::new(services.clone()));
    let first = CourierManager::new(services, indexer);
    let courier = first.create_courier("Hermes", 51.41, -0.30).unwrap();
    first.disable(&courier.id).await.unwrap();
    first.persist().await;

    let services = test_services_with(config, FakeGeo::new(), None);
    let indexer = Arc::new(PoiIndexer::new(services.clone()));
    let second = CourierManager::new(services, indexer);
    assert_eq!(second.restore_from_snapshot().unwrap(), 1);

    let restored = second.get(&courier.id).unwrap();
    assert_eq!(restored.name, "Hermes");
    assert!(!restored.enabled);
}

#[tokio::test]
async fn test_restore_without_snapshot() {
    let manager = manager(FakeGeo::new());
    assert_eq!(manager.restore_from_snapshot().unwrap(), 0);
    assert!(manager.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_tick_loop_stops_on_shutdown() {
    let manager = manager(FakeGeo::new());
    let courier = manager.create_courier("Hermes", 51.41, -0.30).unwrap();
    manager.send_to(&courier.id, 51.411, -0.30, "Corner").await.unwrap();

    manager.start(&courier.id).unwrap();
    // Starting twice keeps a single loop
    manager.start(&courier.id).unwrap();
    assert_eq!(manager.running_count(), 1);

    tokio::time::sleep(StdDuration::from_secs(60)).await;
    manager.shutdown().await;

    assert_eq!(manager.running_count(), 0);
    assert_eq!(manager.get(&courier.id).unwrap().trips, 1);
}
