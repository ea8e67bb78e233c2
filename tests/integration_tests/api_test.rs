//! Master HTTP API tests
//!
//! Serves a real master on an ephemeral port and talks to it with
//! [`MasterClient`], the same client remote workers use.

use std::net::SocketAddr;
use std::time::Duration;

use fleetdispatch::config::{DistributionConfig, RunMode};
use fleetdispatch::coordinator::api::ApiResponse;
use fleetdispatch::coordinator::{ClientConfig, ClientError, MasterClient, MasterServer};
use fleetdispatch::models::{Assignment, DeviceRegistration, HeartbeatMetrics, TaskStatus};
use fleetdispatch::scheduler::{StatusReport, SubmitTask};
use fleetdispatch::storage::create_memory_store;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct TestMaster {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    served: JoinHandle<()>,
}

impl TestMaster {
    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn client(&self) -> MasterClient {
        MasterClient::new(
            ClientConfig::new(self.url())
                .with_timeout(Duration::from_secs(5))
                .with_retry_count(0),
        )
        .expect("client builds")
    }

    async fn stop(self) {
        let _ = self.stop.send(());
        self.served.await.expect("server task");
    }
}

/// Master with the dispatch loop effectively idle, so placement is manual
async fn start_master() -> TestMaster {
    let mut config = DistributionConfig::default();
    config.mode = RunMode::Master;
    config.dispatch.dispatch_interval_secs = 3600;
    config.master.enable_request_logging = false;

    let server = MasterServer::new(config, create_memory_store()).expect("server builds");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stop_rx) = oneshot::channel::<()>();

    let served = tokio::spawn(async move {
        server
            .serve(listener, async move {
                let _ = stop_rx.await;
            })
            .await
            .expect("server runs");
    });

    TestMaster { addr, stop, served }
}

#[tokio::test]
async fn test_device_lifecycle_over_http() {
    let master = start_master().await;
    let client = master.client();
    assert!(client.health_check().await);

    let device = client
        .register(
            &DeviceRegistration::new("api-worker")
                .with_max_concurrent_tasks(2)
                .with_capabilities(["crawl"])
                .with_address("10.0.0.7:9000"),
        )
        .await
        .unwrap();
    assert_eq!(device.device_id, "api-worker");
    assert_eq!(device.current_task_count, 0);

    let metrics = HeartbeatMetrics {
        cpu_usage: 0.25,
        memory_usage: 0.5,
        ..Default::default()
    };
    let device = client.heartbeat("api-worker", &metrics).await.unwrap();
    assert_eq!(device.metrics.cpu_usage, 0.25);

    let listing = client.list_devices().await.unwrap();
    assert_eq!(listing.devices.len(), 1);
    assert_eq!(listing.stats.total_devices, 1);

    assert_eq!(client.available_devices(Some("crawl")).await.unwrap().len(), 1);
    assert!(client.available_devices(Some("render")).await.unwrap().is_empty());

    master.stop().await;
}

#[tokio::test]
async fn test_task_lifecycle_over_http() {
    let master = start_master().await;
    let client = master.client();
    client
        .register(&DeviceRegistration::new("api-worker").with_max_concurrent_tasks(2))
        .await
        .unwrap();

    let task = client
        .submit_task(&SubmitTask::new("crawl", json!({ "url": "https://example.com" })).with_priority(8))
        .await
        .unwrap();
    assert_eq!(task.status(), TaskStatus::Pending);
    assert_eq!(task.priority, 8);

    let assignment = client.force_dispatch(task.id, "api-worker").await.unwrap();
    assert_eq!(assignment.task_id, task.id);

    let pulled = client.pull_tasks("api-worker", 5).await.unwrap();
    assert_eq!(pulled.len(), 1);
    assert_eq!(pulled[0].assignment_id, assignment.id);
    assert_eq!(pulled[0].payload, json!({ "url": "https://example.com" }));

    let ack = client
        .report_status(&StatusReport::running(&pulled[0], "api-worker"))
        .await
        .unwrap();
    assert!(ack.accepted);
    assert_eq!(ack.task_status, Some(TaskStatus::Running));

    let ack = client
        .report_status(&StatusReport::completed(
            &pulled[0],
            "api-worker",
            Some(json!({ "bytes": 1024 })),
        ))
        .await
        .unwrap();
    assert!(ack.accepted);
    assert_eq!(ack.task_status, Some(TaskStatus::Completed));

    // redelivery of the same report is acknowledged but not applied
    let ack = client
        .report_status(&StatusReport::completed(&pulled[0], "api-worker", None))
        .await
        .unwrap();
    assert!(!ack.accepted);

    let finished = client.get_task(task.id).await.unwrap();
    assert_eq!(finished.status(), TaskStatus::Completed);

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.tasks.completed, 1);
    assert_eq!(stats.open_assignments, 0);

    let history: ApiResponse<Vec<Assignment>> = reqwest::get(format!(
        "{}/api/distribution/tasks/{}/assignments",
        master.url(),
        task.id
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    let history = history.data.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].result, Some(json!({ "bytes": 1024 })));

    master.stop().await;
}

#[tokio::test]
async fn test_error_statuses_over_http() {
    let master = start_master().await;
    let client = master.client();

    let err = client.get_task(9999).await.unwrap_err();
    assert!(matches!(err, ClientError::HttpError { status: 404, .. }), "{err}");

    let err = client
        .heartbeat("ghost", &HeartbeatMetrics::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::HttpError { status: 404, .. }), "{err}");

    let err = client
        .register(&DeviceRegistration::new("bad id with spaces"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::HttpError { status: 400, .. }), "{err}");

    let err = client
        .submit_task(&SubmitTask::new("crawl", json!({})).with_priority(42))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::HttpError { status: 400, .. }), "{err}");

    let response = reqwest::get(format!(
        "{}/api/distribution/tasks?status=sleeping",
        master.url()
    ))
    .await
    .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    master.stop().await;
}

#[tokio::test]
async fn test_health_and_metrics_endpoints() {
    let _ = fleetdispatch::metrics::init_metrics();
    let master = start_master().await;
    let client = master.client();
    client
        .register(&DeviceRegistration::new("ready-worker"))
        .await
        .unwrap();

    let ready = reqwest::get(format!("{}/health/ready", master.url()))
        .await
        .unwrap();
    assert!(ready.status().is_success());

    let body = reqwest::get(format!("{}/metrics", master.url()))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("fleetdispatch_"), "{body}");

    master.stop().await;
}
