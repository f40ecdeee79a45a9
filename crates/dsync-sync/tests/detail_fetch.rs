mod support;

use std::sync::Arc;

use dsync_core::{
    CollectMode, FetchState, JobKind, JobStatus, SyncJob, User, ANONYMOUS_ACCOUNT_ID,
};
use dsync_providers::ProviderError;
use dsync_storage::Store;
use dsync_sync::{CancelFlag, CollectSummary, DetailFetcher, IdCollector, JobContext};

use support::{payload, seed_stubs, store_with_user, ScriptedProvider};

async fn job_context(
    store: &Store,
    user: &User,
    kind: JobKind,
) -> (SyncJob, JobContext, CancelFlag) {
    let job = store
        .create_jobs(user.id, &[kind])
        .await
        .unwrap()
        .unwrap()
        .remove(0);
    let flag = CancelFlag::default();
    let ctx = JobContext::new(job.id, user.clone(), store.clone(), flag.clone());
    (job, ctx, flag)
}

#[tokio::test]
async fn teammates_are_counted_once_per_shared_game() {
    let provider = Arc::new(ScriptedProvider::new().with_details(|match_id, _| {
        Ok(match match_id {
            // radiant user, radiant win, 42 alongside, anonymous alongside
            1 => payload(
                1,
                0,
                true,
                &[(Some(42), 1), (Some(ANONYMOUS_ACCOUNT_ID), 2), (Some(77), 128)],
            ),
            // dire user, dire win, 42 alongside
            2 => payload(2, 129, false, &[(Some(42), 130), (None, 131), (Some(77), 0)]),
            // 42 on the other side
            _ => payload(match_id, 0, false, &[(Some(42), 128)]),
        })
    }));
    let (store, user) = store_with_user().await;
    seed_stubs(&store, user.id, &[1, 2, 3]).await;
    let (job, ctx, _flag) = job_context(&store, &user, JobKind::FetchDetails).await;

    let summary = DetailFetcher::new(store.clone(), provider.clone())
        .fetch(&ctx)
        .await
        .unwrap();
    assert_eq!((summary.fetched, summary.failed, summary.deferred), (3, 0, 0));

    let with_42 = store.encounter(user.id, 42).await.unwrap().unwrap();
    assert_eq!(
        (with_42.games_together, with_42.games_won, with_42.games_lost),
        (2, 2, 0)
    );
    assert_eq!(with_42.first_seen.timestamp(), 1_735_689_600 + 1);
    assert_eq!(with_42.last_seen.timestamp(), 1_735_689_600 + 2);
    assert!(store.encounter(user.id, 77).await.unwrap().is_none());
    assert!(store
        .encounter(user.id, ANONYMOUS_ACCOUNT_ID)
        .await
        .unwrap()
        .is_none());

    let participants = store.participants(2).await.unwrap();
    assert_eq!(participants.len(), 4);

    let job = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!((job.total, job.processed, job.new_matches), (3, 3, 3));
}

#[tokio::test]
async fn unnormalizable_payload_counts_as_a_failure() {
    let provider = Arc::new(ScriptedProvider::new().with_details(|match_id, _| {
        Ok(match match_id {
            5 => serde_json::json!({ "match_id": 5 }),
            // tracked account absent
            6 => serde_json::json!({
                "match_id": 6,
                "start_time": 1_735_689_600,
                "radiant_win": true,
                "players": [{ "account_id": 3, "player_slot": 0 }]
            }),
            _ => return Err(ProviderError::Rejected("http 403 for match".into())),
        })
    }));
    let (store, user) = store_with_user().await;
    seed_stubs(&store, user.id, &[5, 6, 7]).await;
    let (_job, ctx, _flag) = job_context(&store, &user, JobKind::FetchDetails).await;

    let summary = DetailFetcher::new(store.clone(), provider)
        .fetch(&ctx)
        .await
        .unwrap();
    assert_eq!((summary.fetched, summary.failed), (0, 3));
    for id in [5, 6, 7] {
        let record = store.get_match(id).await.unwrap().unwrap();
        assert_eq!(record.state, FetchState::Failed { retries: 1 });
    }
    let missing = store.get_match(6).await.unwrap().unwrap();
    assert!(missing.last_error.unwrap().contains("not found among players"));
}

#[tokio::test]
async fn payload_for_another_match_spends_the_budget_without_counting_teammates() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_details(|_, _| Ok(payload(6, 0, true, &[(Some(42), 1)]))),
    );
    let (store, user) = store_with_user().await;
    seed_stubs(&store, user.id, &[5]).await;

    for expected in 1..=3 {
        let (_job, ctx, _flag) = job_context(&store, &user, JobKind::FetchDetails).await;
        let summary = DetailFetcher::new(store.clone(), provider.clone())
            .fetch(&ctx)
            .await
            .unwrap();
        assert_eq!((summary.fetched, summary.failed), (0, 1));
        store
            .finish_job(ctx.job_id, JobStatus::Completed, None)
            .await
            .unwrap();

        let record = store.get_match(5).await.unwrap().unwrap();
        assert_eq!(record.state, FetchState::Failed { retries: expected });
        assert!(record.last_attempt_at.is_some());
        assert!(record.last_error.unwrap().contains("payload describes match 6"));
    }

    assert!(store.eligible_matches(user.id).await.unwrap().is_empty());
    assert!(store.get_match(6).await.unwrap().is_none());
    assert!(store.encounter(user.id, 42).await.unwrap().is_none());
    assert_eq!(provider.calls_for(5), 3);
}

#[tokio::test]
async fn cancellation_flushes_the_partial_batch() {
    let flag = CancelFlag::default();
    let raised = flag.clone();
    let provider = Arc::new(ScriptedProvider::new().with_details(move |match_id, call| {
        if call == 10 {
            raised.cancel();
        }
        Ok(payload(match_id, 0, true, &[(Some(42), 1)]))
    }));
    let (store, user) = store_with_user().await;
    let ids: Vec<i64> = (1..=40).collect();
    seed_stubs(&store, user.id, &ids).await;
    let job = store
        .create_jobs(user.id, &[JobKind::FetchDetails])
        .await
        .unwrap()
        .unwrap()
        .remove(0);
    let ctx = JobContext::new(job.id, user.clone(), store.clone(), flag);

    let summary = DetailFetcher::new(store.clone(), provider.clone())
        .fetch(&ctx)
        .await
        .unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.fetched, 10);
    assert_eq!(provider.detail_calls(), 10);

    let counts = store.match_counts(user.id).await.unwrap();
    assert_eq!((counts.complete, counts.stub), (10, 30));
    let with_42 = store.encounter(user.id, 42).await.unwrap().unwrap();
    assert_eq!(with_42.games_together, 10);
    let job = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!((job.total, job.processed), (40, 10));
}

#[tokio::test]
async fn full_collection_stops_when_the_cursor_stalls() {
    let page: Vec<i64> = (101..=200).rev().collect();
    let provider = Arc::new(ScriptedProvider::new().with_pages(vec![page.clone(), page]));
    let (store, user) = store_with_user().await;
    let (_job, ctx, _flag) = job_context(&store, &user, JobKind::CollectIds).await;

    let summary = IdCollector::new(store.clone(), provider.clone())
        .collect(&ctx, CollectMode::Full)
        .await
        .unwrap();
    assert_eq!(
        summary,
        CollectSummary {
            ids_seen: 200,
            stubs_created: 100,
            pages: 2,
            cancelled: false
        }
    );
    assert_eq!(store.match_counts(user.id).await.unwrap().stub, 100);
}

#[tokio::test]
async fn incremental_collection_without_history_takes_the_first_page() {
    let provider = Arc::new(ScriptedProvider::new().with_pages(vec![vec![9, 8, 7]]));
    let (store, user) = store_with_user().await;
    let (_job, ctx, _flag) = job_context(&store, &user, JobKind::Incremental).await;

    let summary = IdCollector::new(store.clone(), provider)
        .collect(&ctx, CollectMode::Incremental)
        .await
        .unwrap();
    assert_eq!((summary.ids_seen, summary.stubs_created, summary.pages), (3, 3, 1));
}
