mod common;

use campus_protocol::DetectionMode;
use campus_terminal::ingest;
use common::*;
use serde_json::{json, Value};
use std::sync::Arc;

async fn serve(rig: &Rig) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = ingest::router(rig.scheduler.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn pushed_frames_are_detected_and_reported() {
    let (_dir, store) = config_store(|c| with_data_nodes(c, &["1"])).await;
    let rig = rig(store, Arc::new(ScriptedNodes::default()), ScriptedProbe::failing(0), RecordingSink::new(true));
    let base = serve(&rig).await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("{base}/frames/1"))
        .body(JPEG.to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 409);

    rig.scheduler.set_mode(DetectionMode::Push).await.unwrap();
    let response = http
        .post(format!("{base}/frames/1?temperature=23.5&humidity=41"))
        .body(JPEG.to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["detected_count"], 3);
    assert_eq!(rig.sink.sent_of("nodes_data").len(), 1);

    let response = http
        .post(format!("{base}/frames/42"))
        .body(JPEG.to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);

    let response = http.post(format!("{base}/frames/1")).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 400);

    let response = http
        .post(format!("{base}/environment/1"))
        .json(&json!({ "temperature": 19.0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 204);
    assert_eq!(rig.sink.sent_of("nodes_data").len(), 2);

    let response = http
        .post(format!("{base}/environment/1"))
        .json(&json!({ "humidity": 45.0, "co2_level": 1020 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 204);
    let detail = rig.nodes.detail(&campus_protocol::NodeId::from("1")).unwrap();
    assert_eq!(detail.co2_level, Some(1020));
    // a frame was detected earlier, readings keep that status
    assert_eq!(detail.status, campus_protocol::NodeState::Online);
    let sent = rig.sink.sent_of("nodes_data");
    assert!(matches!(sent.last(), Some(campus_protocol::Message::NodesData { nodes, .. })
        if nodes[0].co2_level == Some(1020) && nodes[0].detected_count.is_none()));
}
