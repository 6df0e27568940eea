//! End-to-end: dispatcher, worker nodes, event transport and master in one process

use axum::{Router, http::StatusCode, http::header, response::IntoResponse, routing::get};
use bytes::Bytes;
use harvester::config::Config;
use harvester::domain::{JobState, RetrievingState, StatisticsKey, TaskType, UrlSourceType};
use harvester::harvest::{self, JobsFile, RunSummary};
use harvester::ledger::FjallStore;
use harvester::storage::ResponseType;
use serde_json::json;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

async fn start_origin() -> String {
    let app = Router::new()
        .route("/image.jpg", get(serve_image))
        .route("/gone.jpg", get(|| async { StatusCode::NOT_FOUND }));

    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let bound_addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{bound_addr}")
}

async fn serve_image() -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "image/jpeg".to_string()),
            (header::CONTENT_LENGTH, "512".to_string()),
        ],
        Bytes::from(vec![9u8; 512]),
    )
}

fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.ledger.path = dir.join("ledger");
    config.ledger.queue_path = dir.join("queue");
    config.worker.response_type = ResponseType::Memory;
    config.worker.nodes = 2;
    config.worker.pool_size = 2;
    config.limits.connection_timeout_ms = 2_000;
    config.limits.max_retrieval_time_ms = 10_000;
    config
}

fn resource(id: &str, url: Option<String>) -> serde_json::Value {
    json!({
        "id": id,
        "url": url,
        "owner": {
            "provider_id": "provider",
            "collection_id": "collection",
            "record_id": id,
            "execution_id": "exec-1"
        }
    })
}

async fn run_harvest(config: &Config, jobs: serde_json::Value) -> RunSummary {
    let jobs: JobsFile = serde_json::from_value(jobs).unwrap();
    tokio::time::timeout(Duration::from_secs(30), harvest::run(config, jobs))
        .await
        .expect("harvest did not finish")
        .unwrap()
}

fn key(resource_id: &str, task_type: TaskType) -> StatisticsKey {
    StatisticsKey {
        resource_id: resource_id.into(),
        task_type,
        url_source_type: UrlSourceType::IsShownBy,
    }
}

#[tokio::test]
async fn test_harvest_finishes_jobs_and_records_statistics() {
    let origin = start_origin().await;
    let temp = TempDir::new().unwrap();
    let config = test_config(temp.path());

    let summary = run_harvest(
        &config,
        json!({
            "resources": [
                resource("res-ok", Some(format!("{origin}/image.jpg"))),
                resource("res-gone", Some(format!("{origin}/gone.jpg"))),
                resource("res-null", None),
                resource("res-link", Some(format!("{origin}/image.jpg"))),
            ],
            "jobs": [
                {
                    "id": "job-download",
                    "url_source_type": "IS_SHOWN_BY",
                    "tasks": [
                        {"task_type": "UNCONDITIONAL_DOWNLOAD", "resource_id": "res-ok",
                         "sub_tasks": ["THUMBNAIL_GENERATION"]},
                        {"task_type": "UNCONDITIONAL_DOWNLOAD", "resource_id": "res-gone"},
                        {"task_type": "UNCONDITIONAL_DOWNLOAD", "resource_id": "res-null"},
                        {"task_type": "CHECK_LINK", "resource_id": "res-link"}
                    ]
                },
                {"id": "job-empty", "url_source_type": "IS_SHOWN_BY", "tasks": []}
            ]
        }),
    )
    .await;

    assert!(!summary.interrupted);
    assert!(summary.unfinished.is_empty());
    assert_eq!(summary.jobs.get("job-download"), Some(&JobState::Finished));
    assert_eq!(summary.jobs.get("job-empty"), Some(&JobState::Finished));
    assert_eq!(summary.metrics.tasks_dispatched, 4);
    assert_eq!(summary.metrics.events_received, 4);
    assert_eq!(summary.metrics.statistics_recorded, 4);
    assert_eq!(summary.metrics.jobs_finished, 1);
    // The null URL never reached the network
    assert_eq!(summary.metrics.network_attempts, 3);

    let ledger = FjallStore::open(&config.ledger.path).unwrap();

    let ok = ledger
        .get_last_statistics(&key("res-ok", TaskType::UnconditionalDownload))
        .unwrap()
        .unwrap();
    assert_eq!(ok.measurements.retrieving_state, RetrievingState::Completed);
    assert_eq!(ok.measurements.content_size, 512);
    assert_eq!(
        ledger.get_resource("res-ok").unwrap().unwrap().last_stats_id.as_deref(),
        Some("res-ok-job-download-UNCONDITIONAL_DOWNLOAD")
    );

    let gone = ledger
        .get_last_statistics(&key("res-gone", TaskType::UnconditionalDownload))
        .unwrap()
        .unwrap();
    assert_eq!(gone.measurements.retrieving_state, RetrievingState::Error);
    assert_eq!(gone.measurements.http_status, Some(404));

    let null = ledger
        .get_last_statistics(&key("res-null", TaskType::UnconditionalDownload))
        .unwrap()
        .unwrap();
    assert_eq!(null.measurements.retrieving_state, RetrievingState::Error);

    let link = ledger
        .get_last_statistics(&key("res-link", TaskType::CheckLink))
        .unwrap()
        .unwrap();
    assert_eq!(link.measurements.http_status, Some(200));
    assert_eq!(link.measurements.content_size, 0);
}

#[tokio::test]
async fn test_conditional_rerun_skips_unchanged_resource() {
    let origin = start_origin().await;
    let temp = TempDir::new().unwrap();
    let config = test_config(temp.path());

    let job = |id: &str| {
        json!({
            "resources": [resource("res-ok", Some(format!("{origin}/image.jpg")))],
            "jobs": [{
                "id": id,
                "url_source_type": "IS_SHOWN_BY",
                "tasks": [{"task_type": "CONDITIONAL_DOWNLOAD", "resource_id": "res-ok"}]
            }]
        })
    };

    let first = run_harvest(&config, job("job-first")).await;
    assert_eq!(first.jobs.get("job-first"), Some(&JobState::Finished));

    let second = run_harvest(&config, job("job-second")).await;
    assert_eq!(second.jobs.get("job-second"), Some(&JobState::Finished));

    let ledger = FjallStore::open(&config.ledger.path).unwrap();
    let records = ledger.statistics_for_resource("res-ok").unwrap();
    assert_eq!(records.len(), 2);

    let last = ledger
        .get_last_statistics(&key("res-ok", TaskType::ConditionalDownload))
        .unwrap()
        .unwrap();
    assert_eq!(last.statistics_id, "res-ok-job-second-CONDITIONAL_DOWNLOAD");
    assert_eq!(last.measurements.retrieving_state, RetrievingState::Completed);
    // Same length as the first run, so the body was not transferred again
    assert_eq!(last.measurements.content_size, 0);

    let first_record = ledger
        .get_statistics("res-ok", "job-first", TaskType::ConditionalDownload)
        .unwrap()
        .unwrap();
    assert_eq!(first_record.measurements.content_size, 512);
    assert_eq!(last.created_at, first_record.created_at);
}
