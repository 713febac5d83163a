mod common;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use campus_devkit::wait_until;
use campus_protocol::{DetectionMode, EnvReading, Message, NodeId, NodeState};
use campus_terminal::error::{DetectionError, NodeError};
use common::*;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn env(temperature: f32, humidity: f32) -> EnvReading {
    EnvReading {
        temperature: Some(temperature),
        humidity: Some(humidity),
        co2_level: None,
    }
}

async fn pull_rig(max_errors: u32, failures: u32) -> (tempfile::TempDir, Rig) {
    let (dir, store) = config_store(|c| {
        with_data_nodes(c, &["1"]);
        c.interval = 1;
        c.detection.max_errors = max_errors;
    })
    .await;
    let source = Arc::new(ScriptedNodes::default());
    source.set("10.0.0.1", NodeScript { env: None, image: true });
    (dir, rig(store, source, ScriptedProbe::failing(failures), RecordingSink::new(true)))
}

#[tokio::test]
async fn mode_changes_keep_at_most_one_pull_loop() {
    let (_dir, rig) = pull_rig(5, 0).await;
    let scheduler = &rig.scheduler;

    for mode in [
        DetectionMode::Pull,
        DetectionMode::Both,
        DetectionMode::Pull,
        DetectionMode::Push,
        DetectionMode::Both,
    ] {
        scheduler.set_mode(mode).await.unwrap();
        assert!(scheduler.active_pull_loops() <= 1);
        assert_eq!(scheduler.mode(), mode);
    }

    scheduler.start(DetectionMode::Pull).await.unwrap();
    scheduler.set_interval(2).await.unwrap();
    scheduler.restart().await.unwrap();
    assert!(scheduler.active_pull_loops() <= 1);

    // overlapping requests are serialised
    let requests = (0..8).map(|i| {
        let scheduler = Arc::clone(scheduler);
        let mode = if i % 2 == 0 { DetectionMode::Pull } else { DetectionMode::Both };
        tokio::spawn(async move { scheduler.set_mode(mode).await })
    });
    for request in futures::future::join_all(requests).await {
        request.unwrap().unwrap();
    }
    assert!(wait_until(Duration::from_secs(1), || scheduler.active_pull_loops() == 1).await);

    scheduler.set_mode(DetectionMode::Push).await.unwrap();
    assert_eq!(scheduler.active_pull_loops(), 0);
    assert!(scheduler.push_running());
    assert_eq!(rig.store.snapshot().mode, DetectionMode::Push);
}

#[tokio::test]
async fn repeated_mode_is_a_no_op() {
    let (_dir, rig) = pull_rig(5, 0).await;
    assert!(rig.scheduler.set_mode(DetectionMode::Push).await.unwrap());
    assert!(!rig.scheduler.set_mode(DetectionMode::Push).await.unwrap());
    assert!(!rig.scheduler.set_interval(1).await.unwrap());
    assert!(matches!(
        rig.scheduler.set_interval(0).await,
        Err(DetectionError::InvalidInterval)
    ));
}

#[tokio::test]
async fn breaker_tolerates_one_failure_less_than_the_limit() {
    let (_dir, rig) = pull_rig(3, 2).await;
    rig.scheduler.set_mode(DetectionMode::Pull).await.unwrap();

    let sink = Arc::clone(&rig.sink);
    assert!(wait_until(Duration::from_secs(3), || !sink.sent_of("nodes_data").is_empty()).await);
    assert!(rig.probe.samples.load(Ordering::SeqCst) >= 3);
    assert!(!rig.scheduler.pull_tripped());
    assert!(rig.scheduler.pull_running());

    rig.scheduler.shutdown().await;
}

#[tokio::test]
async fn breaker_trips_at_the_limit_and_mode_restarts_it() {
    let (_dir, rig) = pull_rig(3, 3).await;
    rig.scheduler.set_mode(DetectionMode::Pull).await.unwrap();

    let scheduler = Arc::clone(&rig.scheduler);
    assert!(wait_until(Duration::from_secs(3), || scheduler.pull_tripped()).await);
    assert!(wait_until(Duration::from_secs(1), || scheduler.active_pull_loops() == 0).await);
    assert!(!scheduler.pull_running());
    assert_eq!(scheduler.mode(), DetectionMode::Idle);
    assert_eq!(rig.probe.samples.load(Ordering::SeqCst), 3);

    // the probe has recovered; switching back to pull starts a fresh loop
    assert!(scheduler.set_mode(DetectionMode::Pull).await.unwrap());
    assert!(!scheduler.pull_tripped());
    let sink = Arc::clone(&rig.sink);
    assert!(wait_until(Duration::from_secs(2), || !sink.sent_of("nodes_data").is_empty()).await);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn pull_cycle_isolates_node_failures() {
    let (_dir, store) = config_store(|c| with_data_nodes(c, &["1", "2", "3"])).await;
    let source = Arc::new(ScriptedNodes::default());
    source.set("10.0.0.1", NodeScript { env: Some(env(21.0, 40.0)), image: true });
    source.set("10.0.0.2", NodeScript { env: Some(env(19.5, 55.0)), image: false });
    let rig = rig(store, source, ScriptedProbe::failing(0), RecordingSink::new(true));

    let report = rig.scheduler.run_cycle().await.unwrap();
    assert_eq!(report.detections, 1);
    assert_eq!(report.environment_only, 1);
    assert_eq!(report.failed, 1);

    let reports: Vec<_> = rig
        .sink
        .sent_of("nodes_data")
        .into_iter()
        .flat_map(|m| match m {
            Message::NodesData { nodes, .. } => nodes,
            _ => Vec::new(),
        })
        .collect();
    assert_eq!(reports.len(), 2);
    let first = reports.iter().find(|r| r.id == NodeId::from("1")).unwrap();
    assert_eq!(first.detected_count, Some(3));
    assert_eq!(first.temperature, Some(21.0));
    let second = reports.iter().find(|r| r.id == NodeId::from("2")).unwrap();
    assert_eq!(second.detected_count, None);
    assert_eq!(second.humidity, Some(55.0));
    assert!(second.error.is_some());
    assert!(first.error.is_none());

    let details = rig.nodes.details();
    assert_eq!(details[&NodeId::from("1")].status, NodeState::Online);
    assert_eq!(details[&NodeId::from("1")].detection_count, 3);
    // readings arrived but the frame did not
    let image_failed = &details[&NodeId::from("2")];
    assert_eq!(image_failed.status, NodeState::Error);
    assert_eq!(image_failed.detection_count, 0);
    assert!(image_failed.error.is_some());
    assert_eq!(image_failed.humidity, Some(55.0));
    assert_eq!(details[&NodeId::from("3")].status, NodeState::Error);
    assert_eq!(rig.scheduler.stats().today_count, 1);
}

#[tokio::test]
async fn unavailable_model_fails_the_cycle() {
    let (_dir, rig) = pull_rig(5, 0).await;
    rig.loader.fail.store(true, Ordering::SeqCst);
    assert!(matches!(
        rig.scheduler.run_cycle().await,
        Err(DetectionError::ModelUnavailable)
    ));
}

#[tokio::test]
async fn pushed_frames_need_push_mode_and_a_known_node() {
    let (_dir, store) = config_store(|c| with_data_nodes(c, &["1"])).await;
    let rig = rig(
        store,
        Arc::new(ScriptedNodes::default()),
        ScriptedProbe::failing(0),
        RecordingSink::new(true),
    );
    let node = NodeId::from("1");

    assert!(matches!(
        rig.scheduler.process_pushed_frame(&node, JPEG.to_vec(), None).await,
        Err(DetectionError::PushInactive)
    ));

    rig.scheduler.set_mode(DetectionMode::Push).await.unwrap();
    let count = rig
        .scheduler
        .process_pushed_frame(&node, JPEG.to_vec(), Some(env(22.0, 35.0)))
        .await
        .unwrap();
    assert_eq!(count, 3);
    assert_eq!(rig.scheduler.frames_processed(), 1);

    let sent = rig.sink.sent_of("nodes_data");
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Message::NodesData { nodes, .. } => {
            assert_eq!(nodes[0].detected_count, Some(3));
            assert_eq!(nodes[0].temperature, Some(22.0));
        }
        other => panic!("unexpected frame {other:?}"),
    }

    assert!(matches!(
        rig.scheduler
            .process_pushed_frame(&NodeId::from("99"), JPEG.to_vec(), None)
            .await,
        Err(DetectionError::Node(NodeError::Unknown(_)))
    ));

    rig.scheduler
        .process_pushed_environment(&node, env(18.0, 60.0))
        .await
        .unwrap();
    assert_eq!(rig.nodes.detail(&node).unwrap().temperature, Some(18.0));
}

async fn upload_server() -> (String, Arc<Mutex<Vec<Value>>>) {
    async fn accept(State(received): State<Arc<Mutex<Vec<Value>>>>, Json(body): Json<Value>) -> StatusCode {
        received.lock().push(body);
        StatusCode::CREATED
    }

    let received = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/api/upload/", post(accept))
        .with_state(Arc::clone(&received));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/api/upload/"), received)
}

#[tokio::test]
async fn results_fall_back_to_http_when_the_link_is_down() {
    let (url, received) = upload_server().await;
    let (_dir, store) = config_store(|c| {
        with_data_nodes(c, &["1"]);
        c.api_url = url;
    })
    .await;
    let rig = rig(
        store,
        Arc::new(ScriptedNodes::default()),
        ScriptedProbe::failing(0),
        RecordingSink::new(false),
    );
    rig.scheduler.set_mode(DetectionMode::Push).await.unwrap();

    rig.scheduler
        .process_pushed_frame(&NodeId::from("1"), JPEG.to_vec(), Some(env(20.0, 45.0)))
        .await
        .unwrap();

    let bodies = received.lock().clone();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["id"], "1");
    assert_eq!(bodies[0]["detected_count"], 3);
    assert_eq!(bodies[0]["temperature"], 20.0);
    assert!(bodies[0]["timestamp"].is_string());
    assert!(rig.sink.sent.lock().is_empty());
}

#[tokio::test]
async fn failed_delivery_marks_the_node() {
    let (_dir, store) = config_store(|c| with_data_nodes(c, &["1"])).await;
    let rig = rig(
        store,
        Arc::new(ScriptedNodes::default()),
        ScriptedProbe::failing(0),
        RecordingSink::new(false),
    );
    rig.scheduler.set_mode(DetectionMode::Push).await.unwrap();

    let result = rig
        .scheduler
        .process_pushed_frame(&NodeId::from("1"), JPEG.to_vec(), None)
        .await;
    assert!(matches!(result, Err(DetectionError::Upload(_))));
    assert_eq!(rig.nodes.detail(&NodeId::from("1")).unwrap().status, NodeState::Error);
    assert_eq!(rig.scheduler.stats().total_count, 0);
}
