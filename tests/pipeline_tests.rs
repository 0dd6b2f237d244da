//! End-to-end runs through scheduler, adapter, processor, sweeper, linker and
//! analyzer on an in-memory bus and database.

mod test_utils;

use chrono::{Duration, Utc};
use sea_orm::{EntityTrait, PaginatorTrait};
use serde_json::json;

use sync_pipeline::bus::{
    EventBus, EventEnvelope, FetchedPayload, LinkedPayload, ProcessedPayload, Stage, SyncMetadata,
    SyncRequest,
};
use sync_pipeline::connectors::{ConnectorError, Cursor};
use sync_pipeline::models::entity::STATE_NORMAL;
use sync_pipeline::models::scheduled_job::JobStatus;
use sync_pipeline::models::SyncBatch;
use sync_pipeline::normalization::EntityType;
use sync_pipeline::pipeline::analyzer::{STATE_WARN, TAG_STALE, TAG_UNLICENSED};
use sync_pipeline::pipeline::linker::FIREWALL_LICENSE;
use sync_pipeline::repositories::{FailedEventFilter, FailedEventRepository};
use uuid::Uuid;
use test_utils::{TestPipeline, companies, identities};

fn processed_payloads(events: &[EventEnvelope]) -> Vec<ProcessedPayload> {
    events
        .iter()
        .map(|event| event.decode_payload().expect("processed payload"))
        .collect()
}

#[tokio::test]
async fn paginated_run_fetches_every_page_under_one_sync_id() {
    let pipeline = TestPipeline::start(100).await.unwrap();
    let source = pipeline.create_data_source().await.unwrap();
    pipeline
        .connector
        .set_records(EntityType::Identities, identities(250))
        .await;

    pipeline.sync(&source, EntityType::Identities).await.unwrap();

    let fetched = pipeline.events("fetched").await;
    assert_eq!(fetched.len(), 3);
    let sizes: Vec<usize> = fetched
        .iter()
        .map(|e| e.decode_payload::<FetchedPayload>().unwrap().records.len())
        .collect();
    assert_eq!(sizes, vec![100, 100, 50]);

    let metadata: Vec<_> = fetched
        .iter()
        .map(|e| e.sync_metadata.clone().expect("sync metadata"))
        .collect();
    let sync_id = metadata[0].sync_id;
    assert!(metadata.iter().all(|m| m.sync_id == sync_id));
    assert!(metadata.iter().all(|m| m.sync_started_at == metadata[0].sync_started_at));
    assert_eq!(
        metadata.iter().map(|m| m.batch_number).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(
        metadata.iter().map(|m| m.is_final_batch).collect::<Vec<_>>(),
        vec![false, false, true]
    );
    assert_eq!(
        metadata.iter().map(|m| m.total_processed).collect::<Vec<_>>(),
        vec![100, 200, 250]
    );
    assert_eq!(metadata[0].cursor, Some(Cursor::from_string("100")));
    assert_eq!(metadata[2].cursor, None);

    let last: FetchedPayload = fetched[2].decode_payload().unwrap();
    assert!(!last.has_more);
    assert_eq!(last.total_processed, 250);

    let jobs = pipeline.jobs(source.id).await.unwrap();
    assert_eq!(jobs.len(), 3);
    assert!(jobs.iter().all(|j| j.job_status() == Some(JobStatus::Completed)));

    assert_eq!(
        pipeline.live_entities(source.id, EntityType::Identities).await.unwrap().len(),
        250
    );
    assert_eq!(SyncBatch::find().count(&pipeline.db).await.unwrap(), 3);

    let source = pipeline.reload_data_source(source.id).await.unwrap();
    assert_eq!(source.current_sync_id, None);
    assert!(pipeline.bus.dead_letters().await.is_empty());
}

#[tokio::test]
async fn rerunning_an_unchanged_source_changes_nothing() {
    let pipeline = TestPipeline::start(100).await.unwrap();
    let source = pipeline.create_data_source().await.unwrap();
    pipeline
        .connector
        .set_records(EntityType::Companies, companies(40))
        .await;

    pipeline.sync(&source, EntityType::Companies).await.unwrap();
    let first = pipeline.live_entities(source.id, EntityType::Companies).await.unwrap();

    pipeline.sync(&source, EntityType::Companies).await.unwrap();
    let second = pipeline.live_entities(source.id, EntityType::Companies).await.unwrap();

    let processed = processed_payloads(&pipeline.events("processed").await);
    assert_eq!(processed.len(), 2);
    let rerun = &processed[1];
    assert_eq!(rerun.metrics.created, 0);
    assert_eq!(rerun.metrics.updated, 0);
    assert_eq!(rerun.metrics.unchanged, 40);
    assert!(rerun.changed_entity_ids.is_empty());

    assert_eq!(first.len(), second.len());
    for (before, after) in first.iter().zip(&second) {
        assert_eq!(before.id, after.id);
        assert_eq!(before.data_hash, after.data_hash);
        assert_eq!(before.updated_at, after.updated_at);
        assert_ne!(before.sync_id, after.sync_id);
    }
}

#[tokio::test]
async fn processor_classifies_a_mixed_batch() {
    let pipeline = TestPipeline::start(100).await.unwrap();
    let source = pipeline.create_data_source().await.unwrap();
    pipeline
        .connector
        .set_records(EntityType::Companies, companies(15))
        .await;
    pipeline.sync(&source, EntityType::Companies).await.unwrap();

    // 10 untouched, 5 renamed, 85 new.
    let mut records = companies(100);
    for record in records.iter_mut().skip(10).take(5) {
        record["name"] = json!("Renamed");
    }
    pipeline
        .connector
        .set_records(EntityType::Companies, records)
        .await;
    pipeline.sync(&source, EntityType::Companies).await.unwrap();

    let processed = processed_payloads(&pipeline.events("processed").await);
    let metrics = &processed[1].metrics;
    assert_eq!(metrics.created, 85);
    assert_eq!(metrics.updated, 5);
    assert_eq!(metrics.unchanged, 10);
    assert_eq!(metrics.skipped, 0);
    assert_eq!(metrics.queries, 1);
    assert_eq!(metrics.mutations, 3);
    assert_eq!(processed[1].changed_entity_ids.len(), 90);

    let renamed = pipeline
        .entity_by_external_id(source.id, EntityType::Companies, "co-0012")
        .await
        .unwrap();
    assert_eq!(renamed.normalized_data["name"], "Renamed");
    assert!(renamed.updated_at > renamed.created_at);
    assert_eq!(
        pipeline.live_entities(source.id, EntityType::Companies).await.unwrap().len(),
        100
    );
}

#[tokio::test]
async fn invalid_records_are_skipped_without_failing_the_batch() {
    let pipeline = TestPipeline::start(100).await.unwrap();
    let source = pipeline.create_data_source().await.unwrap();
    let mut records = companies(3);
    records.insert(1, json!({"name": "no id"}));
    records.push(json!(["not", "an", "object"]));
    pipeline
        .connector
        .set_records(EntityType::Companies, records)
        .await;

    pipeline.sync(&source, EntityType::Companies).await.unwrap();

    let processed = processed_payloads(&pipeline.events("processed").await);
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].metrics.created, 3);
    assert_eq!(processed[0].metrics.skipped, 2);
    let skipped_at: Vec<usize> = processed[0].skipped.iter().map(|s| s.index).collect();
    assert_eq!(skipped_at, vec![1, 4]);

    let jobs = pipeline.jobs(source.id).await.unwrap();
    assert_eq!(jobs[0].job_status(), Some(JobStatus::Completed));
}

#[tokio::test]
async fn records_missing_from_a_complete_run_are_soft_deleted() {
    let pipeline = TestPipeline::start(2).await.unwrap();
    let source = pipeline.create_data_source().await.unwrap();
    let all = companies(5);
    pipeline
        .connector
        .set_records(EntityType::Companies, all.clone())
        .await;
    pipeline.sync(&source, EntityType::Companies).await.unwrap();
    assert_eq!(
        pipeline.live_entities(source.id, EntityType::Companies).await.unwrap().len(),
        5
    );

    pipeline
        .connector
        .set_records(EntityType::Companies, all[..3].to_vec())
        .await;
    pipeline.sync(&source, EntityType::Companies).await.unwrap();

    let live = pipeline.live_entities(source.id, EntityType::Companies).await.unwrap();
    let ids: Vec<&str> = live.iter().map(|e| e.external_id.as_str()).collect();
    assert_eq!(ids, vec!["co-0000", "co-0001", "co-0002"]);

    let gone = pipeline
        .entity_by_external_id(source.id, EntityType::Companies, "co-0004")
        .await
        .unwrap();
    assert!(gone.deleted_at.is_some());
}

#[tokio::test]
async fn a_failed_run_deletes_nothing() {
    let pipeline = TestPipeline::start(2).await.unwrap();
    let source = pipeline.create_data_source().await.unwrap();
    pipeline
        .connector
        .set_records(EntityType::Companies, companies(4))
        .await;
    pipeline.sync(&source, EntityType::Companies).await.unwrap();

    // Second run only gets through its first page.
    pipeline
        .connector
        .set_records(EntityType::Companies, companies(3))
        .await;
    pipeline
        .enqueue_sync(&source, EntityType::Companies)
        .await
        .unwrap();
    pipeline.poll_once(Utc::now()).await.unwrap();
    pipeline
        .connector
        .fail_always(Some(ConnectorError::AuthenticationError {
            details: "revoked".into(),
        }))
        .await;
    pipeline.drain(Utc::now()).await.unwrap();

    assert_eq!(
        pipeline.live_entities(source.id, EntityType::Companies).await.unwrap().len(),
        4
    );
    let jobs = pipeline.jobs(source.id).await.unwrap();
    let last = jobs.last().unwrap();
    assert_eq!(last.job_status(), Some(JobStatus::Invalid));
    assert_eq!(last.attempts, 1);
    assert_eq!(
        pipeline.reload_data_source(source.id).await.unwrap().current_sync_id,
        None
    );
}

#[tokio::test]
async fn retried_batch_resumes_the_same_run() {
    let pipeline = TestPipeline::start(100).await.unwrap();
    let source = pipeline.create_data_source().await.unwrap();
    pipeline
        .connector
        .set_records(EntityType::Identities, identities(150))
        .await;
    pipeline
        .enqueue_sync(&source, EntityType::Identities)
        .await
        .unwrap();

    let stats = pipeline.poll_once(Utc::now()).await.unwrap();
    assert_eq!(stats.dispatched, 1);

    pipeline
        .connector
        .fail_next(ConnectorError::NetworkError {
            details: "connection reset".into(),
            retryable: true,
        })
        .await;
    pipeline.poll_once(Utc::now()).await.unwrap();

    let jobs = pipeline.jobs(source.id).await.unwrap();
    let second = &jobs[1];
    assert_eq!(second.job_status(), Some(JobStatus::Failed));
    assert_eq!(second.attempts, 1);
    assert!(second.next_retry_at.is_some());
    let error = second.error.clone().expect("error recorded");
    assert_eq!(error["code"], "CONNECTOR_ERROR");
    assert_eq!(error["kind"], "transient");

    let in_flight = pipeline.reload_data_source(source.id).await.unwrap();
    let first_sync = pipeline.events("fetched").await[0]
        .sync_metadata
        .clone()
        .unwrap()
        .sync_id;
    assert_eq!(in_flight.current_sync_id, Some(first_sync));

    // Not due before the backoff elapses.
    assert_eq!(pipeline.poll_once(Utc::now()).await.unwrap().claimed, 0);

    let later = Utc::now() + Duration::seconds(61);
    pipeline.drain(later).await.unwrap();

    let fetched = pipeline.events("fetched").await;
    assert_eq!(fetched.len(), 2);
    let retried = fetched[1].sync_metadata.clone().unwrap();
    assert_eq!(retried.sync_id, first_sync);
    assert_eq!(retried.batch_number, 2);
    assert!(retried.is_final_batch);

    let jobs = pipeline.jobs(source.id).await.unwrap();
    assert_eq!(jobs[1].job_status(), Some(JobStatus::Completed));
    assert_eq!(jobs[1].attempts, 1);
    assert_eq!(
        pipeline.live_entities(source.id, EntityType::Identities).await.unwrap().len(),
        150
    );
    assert_eq!(
        pipeline.reload_data_source(source.id).await.unwrap().current_sync_id,
        None
    );
}

#[tokio::test]
async fn relationships_are_created_once() {
    let pipeline = TestPipeline::start(100).await.unwrap();
    let source = pipeline.create_data_source().await.unwrap();
    pipeline
        .connector
        .set_records(
            EntityType::Firewalls,
            vec![
                json!({"id": "fw-1", "serial": "SN-1"}),
                json!({"id": "fw-2", "serial": "SN-2"}),
            ],
        )
        .await;
    pipeline
        .connector
        .set_records(
            EntityType::Licenses,
            vec![json!({"id": "lic-1", "serialNumber": "SN-1"})],
        )
        .await;

    // Both types in flight at once; the per-source lock keeps one edge.
    pipeline
        .enqueue_sync(&source, EntityType::Firewalls)
        .await
        .unwrap();
    pipeline
        .enqueue_sync(&source, EntityType::Licenses)
        .await
        .unwrap();
    pipeline.drain(Utc::now()).await.unwrap();

    pipeline.sync(&source, EntityType::Firewalls).await.unwrap();
    pipeline.sync(&source, EntityType::Licenses).await.unwrap();

    let edges = pipeline.relationships(source.id).await.unwrap();
    assert_eq!(edges.len(), 1);
    let firewall = pipeline
        .entity_by_external_id(source.id, EntityType::Firewalls, "fw-1")
        .await
        .unwrap();
    let license = pipeline
        .entity_by_external_id(source.id, EntityType::Licenses, "lic-1")
        .await
        .unwrap();
    assert_eq!(edges[0].parent_entity_id, firewall.id);
    assert_eq!(edges[0].child_entity_id, license.id);
    assert_eq!(edges[0].relationship_type, FIREWALL_LICENSE);

    let created: usize = pipeline
        .events("linked")
        .await
        .iter()
        .map(|e| e.decode_payload::<LinkedPayload>().unwrap().relationships_created)
        .sum();
    assert_eq!(created, 1);
}

#[tokio::test]
async fn unlicensed_firewalls_are_flagged_until_licensed() {
    let pipeline = TestPipeline::start(100).await.unwrap();
    let source = pipeline.create_data_source().await.unwrap();
    pipeline
        .connector
        .set_records(
            EntityType::Firewalls,
            vec![
                json!({"id": "fw-1", "serial": "SN-1"}),
                json!({"id": "fw-2", "serial": "SN-2"}),
            ],
        )
        .await;
    pipeline.sync(&source, EntityType::Firewalls).await.unwrap();

    let fw1 = pipeline
        .entity_by_external_id(source.id, EntityType::Firewalls, "fw-1")
        .await
        .unwrap();
    assert!(fw1.tag_set().contains(TAG_UNLICENSED));
    assert_eq!(fw1.state, STATE_WARN);

    pipeline
        .connector
        .set_records(
            EntityType::Licenses,
            vec![json!({"id": "lic-1", "serialNumber": "SN-1"})],
        )
        .await;
    pipeline.sync(&source, EntityType::Licenses).await.unwrap();

    let fw1 = pipeline
        .entity_by_external_id(source.id, EntityType::Firewalls, "fw-1")
        .await
        .unwrap();
    let fw2 = pipeline
        .entity_by_external_id(source.id, EntityType::Firewalls, "fw-2")
        .await
        .unwrap();
    assert!(!fw1.tag_set().contains(TAG_UNLICENSED));
    assert_eq!(fw1.state, STATE_NORMAL);
    assert!(fw2.tag_set().contains(TAG_UNLICENSED));
    assert_eq!(fw2.state, STATE_WARN);

    let reports = pipeline.alerts.reports().await;
    let last = reports
        .iter()
        .rev()
        .find(|r| r.alert_type == "firewall.unlicensed")
        .expect("firewall report");
    assert_eq!(last.findings.len(), 1);
    assert_eq!(last.findings[0].entity_id, fw2.id);
    assert_eq!(last.evaluated_entity_ids.len(), 2);
}

#[tokio::test]
async fn stale_identity_analysis_only_evaluates_changed_records() {
    let pipeline = TestPipeline::start(100).await.unwrap();
    let source = pipeline.create_data_source().await.unwrap();
    let long_ago = (Utc::now() - Duration::days(90)).to_rfc3339();
    let recent = Utc::now().to_rfc3339();
    let records = vec![
        json!({"id": "alice", "enabled": true, "lastLoginAt": recent}),
        json!({"id": "bob", "enabled": true, "lastLoginAt": long_ago}),
        json!({"id": "carol", "enabled": false, "lastLoginAt": long_ago}),
    ];
    pipeline
        .connector
        .set_records(EntityType::Identities, records.clone())
        .await;
    pipeline.sync(&source, EntityType::Identities).await.unwrap();

    let bob = pipeline
        .entity_by_external_id(source.id, EntityType::Identities, "bob")
        .await
        .unwrap();
    let carol = pipeline
        .entity_by_external_id(source.id, EntityType::Identities, "carol")
        .await
        .unwrap();
    assert!(bob.tag_set().contains(TAG_STALE));
    assert!(!carol.tag_set().contains(TAG_STALE));

    let first = pipeline.alerts.reports().await;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].evaluated_entity_ids.len(), 3);
    assert_eq!(first[0].findings.len(), 1);
    assert_eq!(first[0].findings[0].entity_id, bob.id);

    // Only alice changes; bob is already flagged and carol is disabled, so
    // neither is a candidate.
    let mut changed = records;
    changed[0]["email"] = json!("alice@example.com");
    pipeline
        .connector
        .set_records(EntityType::Identities, changed)
        .await;
    pipeline.sync(&source, EntityType::Identities).await.unwrap();

    let alice = pipeline
        .entity_by_external_id(source.id, EntityType::Identities, "alice")
        .await
        .unwrap();
    let reports = pipeline.alerts.reports().await;
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[1].evaluated_entity_ids, vec![alice.id]);
    assert!(reports[1].findings.is_empty());

    let bob = pipeline
        .entity_by_external_id(source.id, EntityType::Identities, "bob")
        .await
        .unwrap();
    assert!(bob.tag_set().contains(TAG_STALE));
}

#[tokio::test]
async fn alert_sink_outage_does_not_stop_analysis() {
    let pipeline = TestPipeline::start(100).await.unwrap();
    let source = pipeline.create_data_source().await.unwrap();
    pipeline.alerts.set_failing(true);
    pipeline
        .connector
        .set_records(EntityType::Firewalls, vec![json!({"id": "fw-1", "serial": "SN-1"})])
        .await;

    pipeline.sync(&source, EntityType::Firewalls).await.unwrap();

    let fw = pipeline
        .entity_by_external_id(source.id, EntityType::Firewalls, "fw-1")
        .await
        .unwrap();
    assert!(fw.tag_set().contains(TAG_UNLICENSED));
    assert!(pipeline.alerts.reports().await.is_empty());
    assert!(pipeline.bus.dead_letters().await.is_empty());
}

#[tokio::test]
async fn redelivered_sync_event_for_a_finished_job_is_ignored() {
    let pipeline = TestPipeline::start(100).await.unwrap();
    let source = pipeline.create_data_source().await.unwrap();
    pipeline
        .connector
        .set_records(EntityType::Companies, companies(2))
        .await;
    pipeline.sync(&source, EntityType::Companies).await.unwrap();
    let calls = pipeline.connector.fetch_calls();

    let job = pipeline.jobs(source.id).await.unwrap().remove(0);
    let replay = EventEnvelope::new(
        &source,
        EntityType::Companies.as_str(),
        Stage::Sync,
        json!(SyncRequest {
            job_id: job.id,
            action: job.action.clone(),
        }),
    );
    pipeline.bus.publish(&replay.topic(), replay).await.unwrap();
    pipeline.bus.wait_idle().await;

    assert_eq!(pipeline.connector.fetch_calls(), calls);
    assert_eq!(pipeline.events("fetched").await.len(), 1);
}

#[tokio::test]
async fn an_unprocessable_batch_is_persisted_as_a_failed_event() {
    let pipeline = TestPipeline::start(100).await.unwrap();
    let source = pipeline.create_data_source().await.unwrap();
    let sync_id = Uuid::new_v4();
    let event = EventEnvelope::new(
        &source,
        EntityType::Licenses.as_str(),
        Stage::Fetched,
        json!({"records": "not-a-list"}),
    )
    .with_sync_metadata(SyncMetadata {
        sync_id,
        batch_number: 3,
        is_final_batch: true,
        cursor: None,
        sync_started_at: Utc::now(),
        total_processed: 250,
    });

    pipeline.bus.publish(&event.topic(), event.clone()).await.unwrap();
    pipeline.bus.wait_idle().await;

    let failed = FailedEventRepository::new(pipeline.db.clone())
        .list(FailedEventFilter {
            sync_id: Some(sync_id),
            ..FailedEventFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].handler, "processor");
    assert_eq!(failed[0].stage, "fetched");
    assert_eq!(failed[0].event_id, event.event_id);
    assert_eq!(failed[0].batch_number, Some(3));
    assert_eq!(failed[0].data_source_id, source.id);
    assert!(failed[0].error.contains("invalid event payload"));
    assert!(pipeline.events("processed").await.is_empty());
}

#[tokio::test]
async fn a_firewall_whose_license_disappears_is_flagged_again() {
    let pipeline = TestPipeline::start(100).await.unwrap();
    let source = pipeline.create_data_source().await.unwrap();
    pipeline
        .connector
        .set_records(EntityType::Firewalls, vec![json!({"id": "fw-1", "serial": "SN-1"})])
        .await;
    pipeline
        .connector
        .set_records(
            EntityType::Licenses,
            vec![json!({"id": "lic-1", "serialNumber": "SN-1"})],
        )
        .await;
    pipeline.sync(&source, EntityType::Firewalls).await.unwrap();
    pipeline.sync(&source, EntityType::Licenses).await.unwrap();

    let fw = pipeline
        .entity_by_external_id(source.id, EntityType::Firewalls, "fw-1")
        .await
        .unwrap();
    assert!(!fw.tag_set().contains(TAG_UNLICENSED));
    assert_eq!(pipeline.relationships(source.id).await.unwrap().len(), 1);

    // The license vanishes upstream and is swept.
    pipeline
        .connector
        .set_records(EntityType::Licenses, Vec::new())
        .await;
    pipeline.sync(&source, EntityType::Licenses).await.unwrap();
    assert!(
        pipeline
            .live_entities(source.id, EntityType::Licenses)
            .await
            .unwrap()
            .is_empty()
    );

    pipeline.sync(&source, EntityType::Firewalls).await.unwrap();

    assert!(pipeline.relationships(source.id).await.unwrap().is_empty());
    let fw = pipeline
        .entity_by_external_id(source.id, EntityType::Firewalls, "fw-1")
        .await
        .unwrap();
    assert!(fw.tag_set().contains(TAG_UNLICENSED));
    assert_eq!(fw.state, STATE_WARN);

    let reports = pipeline.alerts.reports().await;
    let last = reports.last().unwrap();
    assert_eq!(last.findings.len(), 1);
    assert_eq!(last.findings[0].entity_id, fw.id);

    let removed: usize = pipeline
        .events("linked")
        .await
        .iter()
        .map(|e| e.decode_payload::<LinkedPayload>().unwrap().relationships_removed)
        .sum();
    assert_eq!(removed, 1);
}

#[tokio::test]
async fn a_changed_serial_moves_the_license_edge() {
    let pipeline = TestPipeline::start(100).await.unwrap();
    let source = pipeline.create_data_source().await.unwrap();
    pipeline
        .connector
        .set_records(
            EntityType::Firewalls,
            vec![
                json!({"id": "fw-1", "serial": "SN-1"}),
                json!({"id": "fw-2", "serial": "SN-2"}),
            ],
        )
        .await;
    pipeline
        .connector
        .set_records(
            EntityType::Licenses,
            vec![json!({"id": "lic-1", "serialNumber": "SN-1"})],
        )
        .await;
    pipeline.sync(&source, EntityType::Firewalls).await.unwrap();
    pipeline.sync(&source, EntityType::Licenses).await.unwrap();

    pipeline
        .connector
        .set_records(
            EntityType::Licenses,
            vec![json!({"id": "lic-1", "serialNumber": "SN-2"})],
        )
        .await;
    pipeline.sync(&source, EntityType::Licenses).await.unwrap();

    let fw2 = pipeline
        .entity_by_external_id(source.id, EntityType::Firewalls, "fw-2")
        .await
        .unwrap();
    let edges = pipeline.relationships(source.id).await.unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].parent_entity_id, fw2.id);

    let fw1 = pipeline
        .entity_by_external_id(source.id, EntityType::Firewalls, "fw-1")
        .await
        .unwrap();
    assert!(fw1.tag_set().contains(TAG_UNLICENSED));
    assert!(!fw2.tag_set().contains(TAG_UNLICENSED));
}

#[tokio::test]
async fn an_unchanged_identity_crossing_the_threshold_is_flagged_once() {
    let pipeline = TestPipeline::start(100).await.unwrap();
    let source = pipeline.create_data_source().await.unwrap();
    let threshold = pipeline.ctx.config.analyzer.stale_identity_days;
    let about_to_lapse = (Utc::now() - Duration::days(threshold) + Duration::seconds(2)).to_rfc3339();
    let recent = Utc::now().to_rfc3339();
    let mut records = vec![
        json!({"id": "dave", "enabled": true, "lastLoginAt": about_to_lapse}),
        json!({"id": "erin", "enabled": true, "lastLoginAt": recent}),
    ];
    pipeline
        .connector
        .set_records(EntityType::Identities, records.clone())
        .await;
    pipeline.sync(&source, EntityType::Identities).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_secs(3)).await;

    // Only erin changes; dave's row is untouched but his login has lapsed.
    records[1]["email"] = json!("erin@example.com");
    pipeline
        .connector
        .set_records(EntityType::Identities, records)
        .await;
    pipeline.sync(&source, EntityType::Identities).await.unwrap();

    let dave = pipeline
        .entity_by_external_id(source.id, EntityType::Identities, "dave")
        .await
        .unwrap();
    assert!(dave.tag_set().contains(TAG_STALE));

    let dave_findings = pipeline
        .alerts
        .reports()
        .await
        .iter()
        .flat_map(|r| r.findings.iter())
        .filter(|f| f.entity_id == dave.id)
        .count();
    assert_eq!(dave_findings, 1);
}
