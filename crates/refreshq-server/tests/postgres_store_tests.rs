//! PostgreSQL store integration tests using SQLx
//!
//! Each test gets a fresh database with the crate migrations applied, so
//! these need `DATABASE_URL` pointing at a server the test user can create
//! databases on.
//!
//! Coverage includes:
//! - `enqueue_refresh_batch` admission outcomes
//! - The partial unique index on active jobs
//! - Priority claim order and `SKIP LOCKED` claiming
//! - Transactional completion and failure
//! - Conditional record upserts
//! - Concurrent admission through the queue service

mod common;

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use common::{key, quote_body, test_config, ScriptedProvider};
use refreshq_common::DataType;
use refreshq_server::{
    provider::ProviderResponse,
    refresh::{
        types::{EnqueueRequest, JobCompletion, JobFailure},
        EnqueueOutcome, JobHealthRecord, JobRun, JobStatus, RefreshResult, RefreshWorker,
        StoredRecord, SUBSCRIPTION_PRIORITY, SWEEP_PRIORITY,
    },
    services::Services,
    store::{
        JobHealthStore, PgStore, QueueStore, QuotaStore, RecordSink, RefreshStateStore,
        RegistrySource, TrackingStore,
    },
};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
}

fn request(data_type: DataType, ttl_minutes: i64) -> EnqueueRequest {
    EnqueueRequest {
        data_type,
        ttl_minutes,
    }
}

fn completion(job_id: Uuid, ts: Option<DateTime<Utc>>, at: DateTime<Utc>) -> JobCompletion {
    JobCompletion {
        job_id,
        wire_bytes: 1_000,
        source_timestamp: ts,
        requires_source_timestamp: true,
        completed_at: at,
    }
}

fn failure(job_id: Uuid, retry_at: Option<DateTime<Utc>>, at: DateTime<Utc>) -> JobFailure {
    JobFailure {
        job_id,
        error: "transient_network_error".to_string(),
        retry_at,
        max_attempts: 3,
        failed_at: at,
    }
}

fn record(ts: Option<DateTime<Utc>>, price: f64) -> StoredRecord {
    StoredRecord {
        entity_key: key("AAPL"),
        payload: json!({ "symbol": "AAPL", "price": price }),
        source_timestamp: ts,
        fetched_at: now(),
    }
}

// ============================================================================
// Admission
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
async fn test_enqueue_batch_outcomes(pool: PgPool) -> RefreshResult<()> {
    let store = PgStore::new(pool);
    let aapl = key("AAPL");
    let requests = [
        request(DataType::Quote, 1),
        request(DataType::CompanyProfile, 1440),
    ];

    let first = store
        .enqueue_batch(&aapl, &requests, SUBSCRIPTION_PRIORITY, now())
        .await?;
    assert_eq!(first.len(), 2);
    assert!(first
        .iter()
        .all(|o| matches!(o.outcome, EnqueueOutcome::Admitted(_))));
    assert_eq!(first[0].data_type, DataType::Quote);
    assert_eq!(first[1].data_type, DataType::CompanyProfile);

    let second = store
        .enqueue_batch(&aapl, &requests, SUBSCRIPTION_PRIORITY, now())
        .await?;
    assert!(second
        .iter()
        .all(|o| o.outcome == EnqueueOutcome::AlreadyQueued));

    // Finish the quote job so its slot is fresh for one minute.
    let job = store.claim_next(Uuid::new_v4(), now()).await?.unwrap();
    assert_eq!(job.data_type, DataType::Quote);
    store
        .complete_job(&completion(job.id, Some(now()), now()))
        .await?;

    let third = store
        .enqueue_batch(&aapl, &requests, SWEEP_PRIORITY, now() + Duration::seconds(30))
        .await?;
    assert_eq!(third[0].outcome, EnqueueOutcome::AlreadyFresh);
    assert_eq!(third[1].outcome, EnqueueOutcome::AlreadyQueued);

    let later = store
        .enqueue_batch(&aapl, &requests[..1], SWEEP_PRIORITY, now() + Duration::minutes(2))
        .await?;
    assert!(matches!(later[0].outcome, EnqueueOutcome::Admitted(_)));

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_active_slot_index_rejects_second_pending_job(pool: PgPool) -> RefreshResult<()> {
    let store = PgStore::new(pool.clone());
    let aapl = key("AAPL");

    store
        .enqueue_batch(&aapl, &[request(DataType::Quote, 1)], 0, now())
        .await?;

    let duplicate = sqlx::query(
        "INSERT INTO refresh_jobs (id, entity_key, data_type, status) \
         VALUES ($1, 'AAPL', 'quote', 'pending')",
    )
    .bind(Uuid::new_v4())
    .execute(&pool)
    .await;
    assert!(duplicate.is_err(), "Expected the active slot to be unique");

    // Settled jobs free the slot.
    let job = store.claim_next(Uuid::new_v4(), now()).await?.unwrap();
    assert!(store.fail_job(&failure(job.id, None, now())).await?.is_none());

    let outcomes = store
        .enqueue_batch(&aapl, &[request(DataType::Quote, 1)], 0, now())
        .await?;
    assert!(matches!(outcomes[0].outcome, EnqueueOutcome::Admitted(_)));

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_empty_batch_admits_nothing(pool: PgPool) -> RefreshResult<()> {
    let store = PgStore::new(pool);
    let outcomes = store.enqueue_batch(&key("AAPL"), &[], 0, now()).await?;
    assert!(outcomes.is_empty());
    assert!(store.list_jobs(None, None).await?.is_empty());
    Ok(())
}

// ============================================================================
// Claiming
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
async fn test_claim_order_and_availability(pool: PgPool) -> RefreshResult<()> {
    let store = PgStore::new(pool);

    store
        .enqueue_batch(&key("MSFT"), &[request(DataType::Quote, 1)], SWEEP_PRIORITY, now())
        .await?;
    store
        .enqueue_batch(
            &key("AAPL"),
            &[request(DataType::Quote, 1)],
            SUBSCRIPTION_PRIORITY,
            now() + Duration::seconds(1),
        )
        .await?;

    // Nothing is available before it was enqueued.
    assert!(store
        .claim_next(Uuid::new_v4(), now() - Duration::seconds(1))
        .await?
        .is_none());

    let worker = Uuid::new_v4();
    let first = store
        .claim_next(worker, now() + Duration::seconds(1))
        .await?
        .unwrap();
    assert_eq!(first.entity_key.as_str(), "AAPL");
    assert_eq!(first.status, JobStatus::Processing);
    assert_eq!(first.worker_id, Some(worker));
    assert_eq!(first.claimed_at, Some(now() + Duration::seconds(1)));

    let second = store
        .claim_next(worker, now() + Duration::seconds(1))
        .await?
        .unwrap();
    assert_eq!(second.entity_key.as_str(), "MSFT");

    assert!(store.claim_next(worker, now()).await?.is_none());

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_claim_skips_locked_rows(pool: PgPool) -> RefreshResult<()> {
    let store = PgStore::new(pool.clone());

    store
        .enqueue_batch(&key("AAPL"), &[request(DataType::Quote, 1)], SUBSCRIPTION_PRIORITY, now())
        .await?;
    store
        .enqueue_batch(&key("MSFT"), &[request(DataType::Quote, 1)], SWEEP_PRIORITY, now())
        .await?;

    // Hold the row lock another claimer would be taking.
    let mut tx = pool.begin().await?;
    let locked: Uuid = sqlx::query_scalar(
        "SELECT id FROM refresh_jobs WHERE entity_key = 'AAPL' FOR UPDATE",
    )
    .fetch_one(&mut *tx)
    .await?;

    let claimed = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        store.claim_next(Uuid::new_v4(), now()),
    )
    .await
    .expect("claim blocked on a locked row")?
    .unwrap();
    assert_ne!(claimed.id, locked);
    assert_eq!(claimed.entity_key.as_str(), "MSFT");

    tx.rollback().await?;
    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_concurrent_claims_take_distinct_jobs(pool: PgPool) -> RefreshResult<()> {
    let store = Arc::new(PgStore::new(pool));
    for symbol in ["AAPL", "MSFT", "GOOG", "AMZN"] {
        store
            .enqueue_batch(&key(symbol), &[request(DataType::Quote, 1)], 0, now())
            .await?;
    }

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.claim_next(Uuid::new_v4(), now()).await })
        })
        .collect();

    let mut claimed = Vec::new();
    for task in tasks {
        if let Some(job) = task.await.unwrap()? {
            claimed.push(job.id);
        }
    }
    // A claimer racing a commit may come back empty; pick up what is left.
    while let Some(job) = store.claim_next(Uuid::new_v4(), now()).await? {
        claimed.push(job.id);
    }

    let total = claimed.len();
    claimed.sort();
    claimed.dedup();
    assert_eq!(claimed.len(), total, "a job was claimed twice");
    assert_eq!(total, 4);

    Ok(())
}

// ============================================================================
// Completion and failure
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
async fn test_complete_job_records_state_and_quota(pool: PgPool) -> RefreshResult<()> {
    let store = PgStore::new(pool);
    let aapl = key("AAPL");
    let ts = now() - Duration::minutes(5);

    store
        .enqueue_batch(&aapl, &[request(DataType::Quote, 1)], 0, now())
        .await?;
    let job = store.claim_next(Uuid::new_v4(), now()).await?.unwrap();

    let done = store
        .complete_job(&completion(job.id, Some(ts), now()))
        .await?;
    assert_eq!(done.status, JobStatus::Complete);
    assert_eq!(done.wire_bytes, Some(1_000));
    assert_eq!(done.completed_at, Some(now()));

    let state = store.refresh_state(&aapl, DataType::Quote).await?.unwrap();
    assert_eq!(state.last_fetched_at, now());
    assert_eq!(state.source_timestamp, Some(ts));
    assert_eq!(store.usage(now().date_naive()).await?, 1_000);

    // A settled job cannot be completed again.
    let err = store
        .complete_job(&completion(job.id, Some(ts), now()))
        .await
        .unwrap_err();
    assert_eq!(err.category(), "invalid_transition");

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_complete_job_rejects_stale_source_timestamp(pool: PgPool) -> RefreshResult<()> {
    let store = PgStore::new(pool);
    let aapl = key("AAPL");
    let ts = now() - Duration::minutes(5);

    store
        .enqueue_batch(&aapl, &[request(DataType::Quote, 1)], 0, now())
        .await?;
    let job = store.claim_next(Uuid::new_v4(), now()).await?.unwrap();
    store
        .complete_job(&completion(job.id, Some(ts), now()))
        .await?;

    let later = now() + Duration::minutes(2);
    store
        .enqueue_batch(&aapl, &[request(DataType::Quote, 1)], 0, later)
        .await?;
    let job = store.claim_next(Uuid::new_v4(), later).await?.unwrap();

    let err = store
        .complete_job(&completion(job.id, Some(ts), later))
        .await
        .unwrap_err();
    assert_eq!(err.category(), "staleness_violation");

    // The whole transaction rolled back.
    let job = store.get_job(job.id).await?.unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(store.usage(now().date_naive()).await?, 1_000);
    let state = store.refresh_state(&aapl, DataType::Quote).await?.unwrap();
    assert_eq!(state.last_fetched_at, now());

    let missing = store
        .complete_job(&completion(job.id, None, later))
        .await
        .unwrap_err();
    assert_eq!(missing.category(), "validation_error");

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_fail_job_spawns_retry_until_attempts_run_out(pool: PgPool) -> RefreshResult<()> {
    let store = PgStore::new(pool);
    let aapl = key("AAPL");

    store
        .enqueue_batch(&aapl, &[request(DataType::Quote, 1)], SUBSCRIPTION_PRIORITY, now())
        .await?;

    let mut at = now();
    let mut attempts = 0;
    while let Some(job) = store.claim_next(Uuid::new_v4(), at).await? {
        attempts += 1;
        let retry = store
            .fail_job(&failure(job.id, Some(at + Duration::seconds(10)), at))
            .await?;

        let failed = store.get_job(job.id).await?.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("transient_network_error"));

        match retry {
            Some(retry) => {
                assert_eq!(retry.retry_of, Some(job.id));
                assert_eq!(retry.attempt_count, job.attempt_count + 1);
                assert_eq!(retry.priority, SUBSCRIPTION_PRIORITY);
                assert_eq!(retry.available_at, at + Duration::seconds(10));
                // Not claimable before its backoff elapses.
                assert!(store.claim_next(Uuid::new_v4(), at).await?.is_none());
            }
            None => assert_eq!(job.attempt_count, 3),
        }
        at += Duration::seconds(10);
    }

    assert_eq!(attempts, 3);
    assert_eq!(store.list_jobs(Some(&aapl), None).await?.len(), 3);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_expired_leases_lists_old_claims_only(pool: PgPool) -> RefreshResult<()> {
    let store = PgStore::new(pool);

    store
        .enqueue_batch(&key("AAPL"), &[request(DataType::Quote, 1)], 0, now())
        .await?;
    store
        .enqueue_batch(&key("MSFT"), &[request(DataType::Quote, 1)], 0, now())
        .await?;

    let old = store.claim_next(Uuid::new_v4(), now()).await?.unwrap();
    let recent = store
        .claim_next(Uuid::new_v4(), now() + Duration::minutes(15))
        .await?
        .unwrap();

    let expired = store
        .expired_leases(now() + Duration::minutes(10))
        .await?;
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, old.id);
    assert_ne!(expired[0].id, recent.id);

    Ok(())
}

// ============================================================================
// Records, tracking, health and registry
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
async fn test_upsert_keeps_the_newest_record(pool: PgPool) -> RefreshResult<()> {
    let store = PgStore::new(pool.clone());
    let older = now() - Duration::hours(1);

    assert_eq!(store.upsert("quotes", &[record(None, 1.0)], "entity_key").await?, 1);
    // A record without a source timestamp is always replaced.
    assert_eq!(store.upsert("quotes", &[record(Some(now()), 2.0)], "entity_key").await?, 1);
    assert_eq!(store.upsert("quotes", &[record(Some(older), 3.0)], "entity_key").await?, 0);
    assert_eq!(store.upsert("quotes", &[record(Some(now()), 4.0)], "entity_key").await?, 0);

    let (payload, ts): (serde_json::Value, Option<DateTime<Utc>>) = sqlx::query_as(
        "SELECT payload, source_timestamp FROM quotes WHERE entity_key = 'AAPL'",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(payload["price"], 2.0);
    assert_eq!(ts, Some(now()));

    let newer = now() + Duration::hours(1);
    assert_eq!(store.upsert("quotes", &[record(Some(newer), 5.0)], "entity_key").await?, 1);

    let err = store
        .upsert("quotes; DROP TABLE quotes", &[record(None, 1.0)], "entity_key")
        .await
        .unwrap_err();
    assert_eq!(err.category(), "storage_error");

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_tracking_merges_data_types(pool: PgPool) -> RefreshResult<()> {
    let store = PgStore::new(pool);
    let aapl = key("AAPL");

    store
        .track(&aapl, &[DataType::Quote], now() - Duration::hours(2))
        .await?;
    store
        .track(&aapl, &[DataType::CompanyProfile, DataType::Quote], now())
        .await?;
    store
        .track(&key("MSFT"), &[DataType::Quote], now() - Duration::days(3))
        .await?;

    let active = store.active_entities(now() - Duration::days(1)).await?;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].entity_key, aapl);
    let mut expected = vec![DataType::Quote, DataType::CompanyProfile];
    expected.sort();
    assert_eq!(active[0].data_types, expected);
    assert_eq!(active[0].last_subscribed_at, now());

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_job_health_round_trip(pool: PgPool) -> RefreshResult<()> {
    let store = PgStore::new(pool);
    let record = JobHealthRecord {
        job_name: "staleness-sweep".to_string(),
        last_run: Some(now()),
        expected_interval_minutes: 2,
    };

    store.record_run(&record).await?;
    let later = JobHealthRecord {
        last_run: Some(now() + Duration::minutes(2)),
        ..record.clone()
    };
    store.record_run(&later).await?;

    let stored = store
        .job_health(&["staleness-sweep".to_string(), "unknown".to_string()])
        .await?;
    assert_eq!(stored, vec![later]);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_registry_is_seeded_by_migration(pool: PgPool) -> RefreshResult<()> {
    let store = PgStore::new(pool);
    let entries = store.load_entries().await?;

    assert_eq!(entries.len(), 6);
    let quote = entries
        .iter()
        .find(|e| e.data_type == DataType::Quote)
        .unwrap();
    assert_eq!(quote.storage_target, "quotes");
    assert_eq!(quote.source_timestamp_field.as_deref(), Some("timestamp"));
    assert_eq!(quote.ttl_minutes, 1);

    Ok(())
}

// ============================================================================
// Services over PostgreSQL
// ============================================================================

fn services(pool: PgPool) -> (Services, Arc<ScriptedProvider>) {
    let provider = ScriptedProvider::new(ProviderResponse::new(
        200,
        quote_body("AAPL", 1_700_000_000, 200),
        None,
    ));
    let services = Services::build(&test_config(), Arc::new(PgStore::new(pool)), provider.clone());
    (services, provider)
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_concurrent_enqueues_admit_one_job(pool: PgPool) -> RefreshResult<()> {
    let (services, _) = services(pool);
    let aapl = key("AAPL");

    let tasks: Vec<_> = (0..100)
        .map(|_| {
            let queue = services.queue.clone();
            let aapl = aapl.clone();
            tokio::spawn(async move {
                queue
                    .enqueue_if_stale(&aapl, DataType::Quote, SUBSCRIPTION_PRIORITY)
                    .await
            })
        })
        .collect();

    let mut admitted = 0;
    for task in tasks {
        match task.await.unwrap()? {
            EnqueueOutcome::Admitted(_) => admitted += 1,
            EnqueueOutcome::AlreadyQueued => {}
            EnqueueOutcome::AlreadyFresh => panic!("no refresh state was seeded"),
        }
    }

    assert_eq!(admitted, 1);
    let jobs = services.queue.list_jobs(Some(&aapl), None).await?;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Pending);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_worker_refreshes_through_postgres(pool: PgPool) -> RefreshResult<()> {
    let (services, provider) = services(pool.clone());
    let aapl = key("AAPL");

    services
        .queue
        .enqueue_if_stale(&aapl, DataType::Quote, SUBSCRIPTION_PRIORITY)
        .await?;

    let run = RefreshWorker::new(services.worker_deps.clone())
        .run_once()
        .await?
        .unwrap();
    let JobRun::Completed(job) = run else {
        panic!("expected completion, got {:?}", run);
    };
    assert_eq!(job.wire_bytes, Some(200));
    assert_eq!(provider.calls(), 1);

    let ts: Option<DateTime<Utc>> =
        sqlx::query_scalar("SELECT source_timestamp FROM quotes WHERE entity_key = 'AAPL'")
            .fetch_one(&pool)
            .await?;
    assert_eq!(ts, Utc.timestamp_opt(1_700_000_000, 0).single());

    let outcome = services
        .queue
        .enqueue_if_stale(&aapl, DataType::Quote, SUBSCRIPTION_PRIORITY)
        .await?;
    assert_eq!(outcome, EnqueueOutcome::AlreadyFresh);

    Ok(())
}
