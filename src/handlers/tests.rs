//! # Tests for Handlers

use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use chrono::Utc;
use sea_orm::{Database, DatabaseConnection};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use crate::bus::{DeadLetter, EventEnvelope, Stage, SyncMetadata};
use crate::config::AppConfig;
use crate::db::migrate;
use crate::repositories::{
    DataSourceRepository, FailedEventRepository, JobPayload, NewDataSource,
    ScheduledJobRepository,
};
use crate::server::{AppState, create_app};

async fn setup() -> (AppState, DatabaseConnection) {
    let db = Database::connect("sqlite::memory:")
        .await
        .expect("create in-memory db");
    migrate(&db).await.expect("apply migrations");
    let state = AppState {
        config: Arc::new(AppConfig::default()),
        db: db.clone(),
    };
    (state, db)
}

async fn get_json(state: AppState, uri: &str) -> (StatusCode, Value) {
    let response = create_app(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn root_returns_service_info() {
    let (state, _db) = setup().await;
    let (status, body) = get_json(state, "/").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "sync-pipeline");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn healthz_reports_ok_with_reachable_database() {
    let (state, _db) = setup().await;
    let (status, body) = get_json(state, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn jobs_can_be_listed_and_fetched() {
    let (state, db) = setup().await;
    let source = DataSourceRepository::new(db.clone())
        .create(NewDataSource {
            tenant_id: Uuid::new_v4(),
            integration_id: "acme-1".into(),
            integration_type: "acme".into(),
            config: json!({}),
            credential_expiration_at: None,
        })
        .await
        .unwrap();
    let jobs = ScheduledJobRepository::new(db.clone(), state.config.scheduler.clone());
    let job = jobs
        .enqueue(&db, &source, "sync.identities", &JobPayload::default(), Utc::now(), None)
        .await
        .unwrap();

    let (status, body) = get_json(
        state.clone(),
        &format!("/jobs?status=pending&data_source_id={}", source.id),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let listed = body["jobs"].as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["action"], "sync.identities");
    assert_eq!(listed[0]["attempts_max"], state.config.scheduler.default_attempts_max);

    let (status, body) = get_json(state, &format!("/jobs/{}", job.id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], job.id.to_string());
    assert_eq!(body["status"], "pending");
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let (state, _db) = setup().await;
    let (status, body) = get_json(state, &format!("/jobs/{}", Uuid::new_v4())).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn invalid_filters_are_rejected() {
    let (state, _db) = setup().await;

    let (status, body) = get_json(state.clone(), "/jobs?status=queued").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_FAILED");

    let (status, _) = get_json(state.clone(), "/jobs?limit=0").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = get_json(state, "/jobs/not-a-uuid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"]["id"], "Must be a valid UUID");
}

#[tokio::test]
async fn failed_events_are_listed_by_sync_run() {
    let (state, db) = setup().await;
    let source = DataSourceRepository::new(db.clone())
        .create(NewDataSource {
            tenant_id: Uuid::new_v4(),
            integration_id: "acme-1".into(),
            integration_type: "acme".into(),
            config: json!({}),
            credential_expiration_at: None,
        })
        .await
        .unwrap();
    let sync_id = Uuid::new_v4();
    let event = EventEnvelope::new(&source, "licenses", Stage::Processed, json!({}))
        .with_sync_metadata(SyncMetadata {
            sync_id,
            batch_number: 2,
            is_final_batch: true,
            cursor: None,
            sync_started_at: Utc::now(),
            total_processed: 150,
        });
    let repo = FailedEventRepository::new(db.clone());
    repo.insert(&DeadLetter {
        subscription_id: Uuid::new_v4(),
        handler: "sweeper",
        topic: event.topic(),
        event,
        error: "database error: connection reset".into(),
        attempts: 3,
        failed_at: Utc::now(),
    })
    .await
    .unwrap();

    let (status, body) = get_json(state.clone(), &format!("/failed-events?sync_id={sync_id}")).await;
    assert_eq!(status, StatusCode::OK);
    let listed = body["failed_events"].as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["handler"], "sweeper");
    assert_eq!(listed[0]["stage"], "processed");
    assert_eq!(listed[0]["batch_number"], 2);
    assert_eq!(listed[0]["attempts"], 3);
    assert_eq!(listed[0]["topic"], "acme-1.processed.licenses");

    let (status, body) = get_json(
        state.clone(),
        &format!("/failed-events?sync_id={}", Uuid::new_v4()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["failed_events"].as_array().unwrap().is_empty());

    let (status, _) = get_json(state, "/failed-events?limit=500").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
