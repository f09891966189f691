//! End-to-end scenarios through the engine facade.

use chrono::{Duration, TimeZone, Utc};
use meridian_core::{Boundary, GeoEvent, GeoPoint, Geofence, TransitionKind, Value};
use meridian_runtime::sink::Output;
use meridian_runtime::tracker::TrackerConfig;
use meridian_runtime::{CollectSink, Engine, EngineConfig, RouterConfig, Sink};
use std::sync::Arc;

fn school_zone() -> Geofence {
    Geofence::new(
        "school-zone",
        "Lincoln Elementary",
        Boundary::Polygon {
            polygon: meridian_core::polygon_from_ring(&[
                [-122.41, 37.75],
                [-122.40, 37.75],
                [-122.40, 37.76],
                [-122.41, 37.76],
            ]),
        },
    )
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn engine_with_sink(dwell_secs: i64) -> (Engine, Arc<CollectSink>) {
    init_tracing();
    let sink = CollectSink::new();
    let sink_dyn: Arc<dyn Sink> = sink.clone();
    let engine = Engine::new(EngineConfig {
        router: RouterConfig {
            partitions: 2,
            tracker: TrackerConfig {
                dwell_threshold: Duration::seconds(dwell_secs),
                ..TrackerConfig::default()
            },
            ..RouterConfig::default()
        },
        sink: Some(sink_dyn),
        ..EngineConfig::default()
    })
    .unwrap();
    (engine, sink)
}

fn at(secs: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
}

fn position(id: &str, lon: f64, lat: f64, secs: i64) -> GeoEvent {
    GeoEvent::new(id, "v1", GeoPoint::new(lon, lat))
        .with_event_time(at(secs))
        .with_source("gps")
}

/// Vehicle crosses into a school zone, stays past the dwell threshold,
/// then leaves: Enter at t=10, Dwell at t=30 (20s inside), Exit at t=40,
/// and nothing at t=20.
#[tokio::test]
async fn test_school_zone_scenario() {
    let (engine, sink) = engine_with_sink(20);
    engine.upsert_geofence(school_zone()).unwrap();

    let inside = (-122.405, 37.755);
    let outside = (-122.3, 37.7);
    engine
        .ingest(position("e1", inside.0, inside.1, 10))
        .await
        .unwrap();
    engine
        .ingest(position("e2", inside.0, inside.1, 20))
        .await
        .unwrap();
    engine
        .ingest(position("e3", inside.0, inside.1, 30))
        .await
        .unwrap();
    engine
        .ingest(position("e4", outside.0, outside.1, 40))
        .await
        .unwrap();
    engine.shutdown().await;

    let transitions: Vec<_> = sink
        .take()
        .await
        .into_iter()
        .filter_map(|o| match o {
            Output::Transition(t) => Some(t),
            _ => None,
        })
        .collect();

    assert_eq!(transitions.len(), 3);

    assert_eq!(transitions[0].event_type, TransitionKind::Enter);
    assert_eq!(transitions[0].event_time, at(10));

    assert_eq!(transitions[1].event_type, TransitionKind::Dwell);
    assert_eq!(transitions[1].event_time, at(30));
    assert_eq!(transitions[1].dwell_time, Some(20.0));

    assert_eq!(transitions[2].event_type, TransitionKind::Exit);
    assert_eq!(transitions[2].event_time, at(40));
    assert_eq!(transitions[2].dwell_time, Some(30.0));

    // Nothing fired for the t=20 position.
    assert!(transitions.iter().all(|t| t.event_time != at(20)));
}

/// The emitted transition JSON is the wire shape downstream dashboards
/// parse; field names and the GeoJSON location literal are load-bearing.
#[tokio::test]
async fn test_transition_wire_format() {
    let (engine, sink) = engine_with_sink(20);
    engine.upsert_geofence(school_zone()).unwrap();
    engine
        .ingest(position("e1", -122.405, 37.755, 10))
        .await
        .unwrap();
    engine.shutdown().await;

    let outputs = sink.take().await;
    let enter = outputs
        .iter()
        .find_map(|o| match o {
            Output::Transition(t) => Some(t),
            _ => None,
        })
        .expect("enter transition");

    let json: serde_json::Value = serde_json::from_str(&serde_json::to_string(enter).unwrap()).unwrap();
    assert_eq!(json["eventType"], "Enter");
    assert_eq!(json["geofenceId"], "school-zone");
    assert_eq!(json["geofenceName"], "Lincoln Elementary");
    assert_eq!(json["entityId"], "v1");
    assert_eq!(json["location"]["type"], "Point");
    assert_eq!(json["location"]["coordinates"][0], -122.405);
    assert_eq!(json["location"]["coordinates"][1], 37.755);
    assert!(json["eventId"].is_string());
    assert!(json.get("dwellTime").is_some());
    assert!(json.get("entryPoint").is_some());
    assert!(json.get("distance").is_some());
}

/// A loaded workflow runs alongside transition detection: a filter keeps
/// only fast vehicles and a transform tags what survives.
#[tokio::test]
async fn test_workflow_alongside_tracking() {
    let (engine, sink) = engine_with_sink(20);
    engine.upsert_geofence(school_zone()).unwrap();

    engine
        .load_workflow(
            r#"{
                "name": "speeders",
                "nodes": [
                    {"id": "fast", "type": "filter",
                     "config": {"field": "speed", "op": ">", "value": 25.0}},
                    {"id": "tag", "type": "transform",
                     "config": {"set": {"alert": "school_zone_speeding"}}}
                ],
                "edges": [{"from": "fast", "to": "tag"}]
            }"#,
        )
        .await
        .unwrap();

    engine
        .ingest(position("e1", -122.405, 37.755, 10).with_property("speed", 40.0))
        .await
        .unwrap();
    engine
        .ingest(position("e2", -122.405, 37.755, 20).with_property("speed", 10.0))
        .await
        .unwrap();
    engine.shutdown().await;

    let outputs = sink.take().await;
    // Transition detection still ran.
    assert!(outputs
        .iter()
        .any(|o| matches!(o, Output::Transition(t) if t.event_type == TransitionKind::Enter)));
    // Only the fast event reached the transform.
    let tagged: Vec<_> = outputs
        .iter()
        .filter_map(|o| match o {
            Output::Workflow(w) if w.node == "tag" => Some(w),
            _ => None,
        })
        .collect();
    assert_eq!(tagged.len(), 1);
    assert_eq!(
        tagged[0].event.get("alert"),
        Some(&Value::Str("school_zone_speeding".to_string()))
    );
    assert_eq!(&*tagged[0].event.id, "e1");
}

/// A deleted fence is absent from the published index before the next
/// event is routed, so no transitions fire against it.
#[tokio::test]
async fn test_deleted_fence_produces_no_transitions() {
    let (engine, sink) = engine_with_sink(20);
    engine.upsert_geofence(school_zone()).unwrap();
    assert!(engine.delete_geofence("school-zone").unwrap());

    engine
        .ingest(position("e1", -122.405, 37.755, 10))
        .await
        .unwrap();
    engine.shutdown().await;

    let outputs = sink.take().await;
    assert!(outputs
        .iter()
        .all(|o| !matches!(o, Output::Transition(_))));
}
