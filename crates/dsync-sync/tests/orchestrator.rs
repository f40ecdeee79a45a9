mod support;

use std::sync::Arc;
use std::time::Duration;

use dsync_core::{FetchState, JobKind, JobStatus};
use dsync_providers::{PageCursor, ProviderError};
use dsync_sync::{SyncError, CANCELLED_MESSAGE};

use support::{orchestrator, payload, seed_stubs, store_with_user, wait, ScriptedProvider};

#[tokio::test]
async fn full_sync_walks_every_page_then_fetches_details() {
    let ids: Vec<i64> = (1..=237).rev().collect();
    let pages = ids.chunks(100).map(<[i64]>::to_vec).collect();
    let provider = Arc::new(ScriptedProvider::new().with_pages(pages));
    let (store, user) = store_with_user().await;
    let orch = orchestrator(&store, &provider);

    let jobs = orch.trigger(user.id, JobKind::Full).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].kind, JobKind::Full);
    assert_eq!(jobs[1].kind, JobKind::FetchDetails);

    let collect = wait(&orch, jobs[0].id).await;
    assert_eq!(collect.status, JobStatus::Completed);
    assert_eq!((collect.total, collect.processed, collect.new_matches), (237, 237, 237));
    assert_eq!(
        provider.history_calls(),
        vec![
            None,
            Some(PageCursor {
                oldest_seen: 138,
                offset: 100
            }),
            Some(PageCursor {
                oldest_seen: 38,
                offset: 200
            }),
        ]
    );

    let fetch = wait(&orch, jobs[1].id).await;
    assert_eq!(fetch.status, JobStatus::Completed);
    assert_eq!((fetch.total, fetch.processed, fetch.new_matches), (237, 237, 237));
    assert!(fetch.execution_handle.is_some());
    assert!(fetch.completed_at.is_some());

    let counts = store.match_counts(user.id).await.unwrap();
    assert_eq!(counts.complete, 237);
    assert_eq!(counts.stub, 0);
    let user = store.get_user(user.id).await.unwrap().unwrap();
    assert!(user.last_sync_at.is_some());
}

#[tokio::test]
async fn detail_phase_still_runs_after_collection_fails() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.push_history_error(ProviderError::Outage { status: 502 });
    let (store, user) = store_with_user().await;
    seed_stubs(&store, user.id, &[7, 6]).await;
    let orch = orchestrator(&store, &provider);

    let jobs = orch.trigger(user.id, JobKind::Full).await.unwrap();

    let collect = wait(&orch, jobs[0].id).await;
    assert_eq!(collect.status, JobStatus::Failed);
    assert!(collect.error.as_deref().unwrap().contains("http 502"));
    assert!(collect.completed_at.is_some());
    assert_eq!(provider.history_calls(), vec![None]);

    let fetch = wait(&orch, jobs[1].id).await;
    assert_eq!(fetch.status, JobStatus::Completed);
    assert_eq!((fetch.total, fetch.processed, fetch.new_matches), (2, 2, 2));
    assert_eq!(store.match_counts(user.id).await.unwrap().complete, 2);
}

#[tokio::test]
async fn collecting_the_same_history_twice_adds_nothing() {
    let provider = Arc::new(ScriptedProvider::new().with_pages(vec![vec![30, 20, 10]]));
    let (store, user) = store_with_user().await;
    let orch = orchestrator(&store, &provider);

    let first = orch.trigger(user.id, JobKind::CollectIds).await.unwrap();
    assert_eq!(wait(&orch, first[0].id).await.new_matches, 3);

    provider.push_page(vec![30, 20, 10]);
    let second = orch.trigger(user.id, JobKind::CollectIds).await.unwrap();
    let second = wait(&orch, second[0].id).await;
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!((second.total, second.new_matches), (3, 0));
    assert_eq!(store.match_counts(user.id).await.unwrap().stub, 3);
}

#[tokio::test]
async fn incremental_sync_stops_at_newest_complete_match() {
    let provider = Arc::new(ScriptedProvider::new());
    let (store, user) = store_with_user().await;
    let orch = orchestrator(&store, &provider);

    seed_stubs(&store, user.id, &[1000, 999]).await;
    let warmup = orch.trigger(user.id, JobKind::FetchDetails).await.unwrap();
    assert_eq!(wait(&orch, warmup[0].id).await.status, JobStatus::Completed);

    provider.push_page(vec![1005, 1004, 1003, 1000, 999]);
    let jobs = orch.trigger(user.id, JobKind::Incremental).await.unwrap();
    let collect = wait(&orch, jobs[0].id).await;
    assert_eq!(collect.new_matches, 3);
    assert_eq!(provider.history_calls().len(), 1);

    let fetch = wait(&orch, jobs[1].id).await;
    assert_eq!(fetch.new_matches, 3);
    assert_eq!(provider.detail_calls(), 5);
    assert_eq!(store.match_counts(user.id).await.unwrap().complete, 5);
}

#[tokio::test]
async fn failures_exhaust_the_budget_but_outages_never_do() {
    let provider = Arc::new(ScriptedProvider::new().with_details(|match_id, _| match match_id {
        1 => Err(ProviderError::Outage { status: 503 }),
        _ => Err(ProviderError::NotFound(format!("match {match_id}"))),
    }));
    let (store, user) = store_with_user().await;
    let orch = orchestrator(&store, &provider);
    seed_stubs(&store, user.id, &[1, 2]).await;

    for _ in 0..5 {
        let jobs = orch.trigger(user.id, JobKind::MissingOnly).await.unwrap();
        assert_eq!(wait(&orch, jobs[0].id).await.status, JobStatus::Completed);
    }

    assert_eq!(provider.calls_for(2), 3);
    let failed = store.get_match(2).await.unwrap().unwrap();
    assert_eq!(failed.state, FetchState::Failed { retries: 3 });
    assert!(failed.last_error.is_some());

    assert_eq!(provider.calls_for(1), 5);
    let deferred = store.get_match(1).await.unwrap().unwrap();
    assert_eq!(deferred.state, FetchState::Stub { retries: 0 });
    assert!(deferred.last_attempt_at.is_some());

    let counts = store.match_counts(user.id).await.unwrap();
    assert_eq!((counts.stub, counts.failed, counts.exhausted), (1, 1, 1));
}

#[tokio::test]
async fn active_job_rejects_a_second_trigger() {
    let provider = Arc::new(ScriptedProvider::new());
    let (store, user) = store_with_user().await;
    let orch = orchestrator(&store, &provider);

    store
        .create_jobs(user.id, &[JobKind::FetchDetails])
        .await
        .unwrap()
        .unwrap();

    let err = orch.trigger(user.id, JobKind::Full).await.unwrap_err();
    assert!(matches!(err, SyncError::Conflict { user_id } if user_id == user.id));
    assert_eq!(orch.jobs(user.id, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn cancelling_a_pending_job_is_immediate() {
    let provider = Arc::new(ScriptedProvider::new());
    let (store, user) = store_with_user().await;
    let orch = orchestrator(&store, &provider);
    let job = store
        .create_jobs(user.id, &[JobKind::CollectIds])
        .await
        .unwrap()
        .unwrap()
        .remove(0);

    let cancelled = orch.cancel(user.id, job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(cancelled.error.as_deref(), Some(CANCELLED_MESSAGE));
    assert!(cancelled.completed_at.is_some());

    let again = orch.cancel(user.id, job.id).await.unwrap_err();
    assert!(matches!(
        again,
        SyncError::NotCancellable {
            status: JobStatus::Cancelled,
            ..
        }
    ));
    assert!(provider.history_calls().is_empty());
}

#[tokio::test]
async fn cancelling_a_running_job_stops_it_and_keeps_committed_work() {
    let provider =
        Arc::new(ScriptedProvider::new().with_detail_delay(Duration::from_millis(20)));
    let (store, user) = store_with_user().await;
    let orch = orchestrator(&store, &provider);
    let ids: Vec<i64> = (1..=40).collect();
    seed_stubs(&store, user.id, &ids).await;

    let job = orch.trigger(user.id, JobKind::FetchDetails).await.unwrap().remove(0);
    tokio::time::timeout(Duration::from_secs(10), async {
        while provider.detail_calls() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    orch.cancel(user.id, job.id).await.unwrap();
    let finished = wait(&orch, job.id).await;
    assert_eq!(finished.status, JobStatus::Cancelled);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let settled = provider.detail_calls();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(provider.detail_calls(), settled);
    assert!(settled < 40);

    let after = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(after.status, JobStatus::Cancelled);
    assert_eq!(after.error.as_deref(), Some(CANCELLED_MESSAGE));
    let counts = store.match_counts(user.id).await.unwrap();
    assert_eq!(counts.complete + counts.stub, 40);
    assert!(counts.stub > 0);
}

#[tokio::test]
async fn crash_mid_run_keeps_every_committed_batch() {
    let provider = Arc::new(ScriptedProvider::new().with_details(|match_id, call| {
        if call > 30 {
            panic!("worker lost after {} calls", call - 1);
        }
        Ok(payload(match_id, 0, true, &[]))
    }));
    let (store, user) = store_with_user().await;
    let orch = orchestrator(&store, &provider);
    let ids: Vec<i64> = (1..=40).collect();
    seed_stubs(&store, user.id, &ids).await;

    let job = orch.trigger(user.id, JobKind::FetchDetails).await.unwrap().remove(0);
    let failed = wait(&orch, job.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error.unwrap_or_default().contains("panicked"));
    assert_eq!(failed.processed, 25);

    let counts = store.match_counts(user.id).await.unwrap();
    assert_eq!(counts.complete, 25);
    assert_eq!(counts.stub, 15);
    assert!(store.get_match(40).await.unwrap().unwrap().state == FetchState::Complete);
}

#[tokio::test]
async fn jobs_are_scoped_to_their_owner() {
    let provider = Arc::new(ScriptedProvider::new());
    let (store, user) = store_with_user().await;
    let other = store.upsert_user(76_561_198_000_000_000, "other").await.unwrap();
    let orch = orchestrator(&store, &provider);
    let job = store
        .create_jobs(user.id, &[JobKind::CollectIds])
        .await
        .unwrap()
        .unwrap()
        .remove(0);

    assert_eq!(orch.job(user.id, job.id).await.unwrap().id, job.id);
    assert!(matches!(
        orch.job(other.id, job.id).await,
        Err(SyncError::Forbidden { .. })
    ));
    assert!(matches!(
        orch.cancel(other.id, job.id).await,
        Err(SyncError::Forbidden { .. })
    ));
    assert!(matches!(
        orch.job(user.id, job.id + 100).await,
        Err(SyncError::JobNotFound(_))
    ));
    assert!(matches!(
        orch.trigger(9_999, JobKind::Full).await,
        Err(SyncError::UserNotFound(9_999))
    ));
}

#[tokio::test]
async fn job_listing_is_newest_first_and_limited() {
    let provider = Arc::new(ScriptedProvider::new());
    let (store, user) = store_with_user().await;
    let orch = orchestrator(&store, &provider);

    let mut last = 0;
    for _ in 0..12 {
        let job = store
            .create_jobs(user.id, &[JobKind::CollectIds])
            .await
            .unwrap()
            .unwrap()
            .remove(0);
        store
            .finish_job(job.id, JobStatus::Completed, None)
            .await
            .unwrap();
        last = job.id;
    }

    let recent = orch.jobs(user.id, None).await.unwrap();
    assert_eq!(recent.len(), 10);
    assert_eq!(recent[0].id, last);
    assert_eq!(orch.jobs(user.id, Some(3)).await.unwrap().len(), 3);
}

#[tokio::test]
async fn scheduled_pass_skips_users_with_active_jobs() {
    let provider = Arc::new(ScriptedProvider::new());
    let (store, busy) = store_with_user().await;
    let idle = store.upsert_user(76_561_198_000_000_001, "idle").await.unwrap();
    let orch = orchestrator(&store, &provider);
    store
        .create_jobs(busy.id, &[JobKind::FetchDetails])
        .await
        .unwrap()
        .unwrap();

    let summary = orch.sync_all_users().await.unwrap();
    assert_eq!((summary.users, summary.triggered, summary.skipped), (2, 1, 1));

    let idle_jobs = orch.jobs(idle.id, None).await.unwrap();
    assert_eq!(idle_jobs.len(), 2);
    for job in idle_jobs {
        wait(&orch, job.id).await;
    }
}
