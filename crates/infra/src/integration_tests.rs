//! Integration tests for the full batch pipeline.
//!
//! Tests: BatchClient → JobExecutor → CompletionEvaluator → CallbackDispatcher
//!
//! Verifies:
//! - Lifecycle callbacks fire at most once per batch under concurrent reports
//! - A discarded batch never fires `success`
//! - Lifecycle timestamps are write-once and ordered
//! - Properties and listing behave as documented

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    use convoy_core::{ArgValue, BatchContext, BatchError, BatchEvent, BatchId, NewBatch};

    use crate::client::BatchClient;
    use crate::config::CoordinatorConfig;
    use crate::dispatcher::{CallbackArgs, CallbackRegistry};
    use crate::jobs::{Job, JobExecutor, JobResult, NewJob, RetryPolicy};
    use crate::lock::LockMode;
    use crate::store::{
        BatchCursor, BatchQuery, BatchStore, BatchTransaction, InMemoryBatchStore, JobStore,
    };

    type Client = BatchClient<InMemoryBatchStore>;

    fn registry() -> CallbackRegistry {
        let mut registry = CallbackRegistry::new();
        for name in ["OnSuccess", "OnDiscard", "OnFinish"] {
            registry.register_fn(name, |_, _| JobResult::Success);
        }
        registry
    }

    fn setup(mode: LockMode) -> (Arc<Client>, Arc<JobExecutor<InMemoryBatchStore>>) {
        let config = CoordinatorConfig::default()
            .with_lock_mode(mode)
            .with_report_retry(RetryPolicy::fixed(20, Duration::from_millis(1)));
        let client = Arc::new(BatchClient::new(
            Arc::new(InMemoryBatchStore::new()),
            registry(),
            config,
        ));
        let mut executor = JobExecutor::new(client.clone()).with_retry_policy(RetryPolicy::no_retry());
        executor.register_fn("Work", |_| JobResult::Success);
        executor.register_fn("Fail", |_| JobResult::Failure("boom".to_string()));
        (client, Arc::new(executor))
    }

    fn lifecycle_batch() -> NewBatch {
        NewBatch::new()
            .on_success("OnSuccess")
            .on_discard("OnDiscard")
            .on_finish("OnFinish")
    }

    fn work(name: &str) -> NewJob {
        NewJob::task(name, ArgValue::Null)
    }

    /// Dispatched callback jobs of `batch_id`, counted by event.
    async fn callback_counts(client: &Client, batch_id: BatchId) -> HashMap<BatchEvent, usize> {
        let mut counts = HashMap::new();
        for job in client.store().callback_jobs(batch_id).await.unwrap() {
            let args = CallbackArgs::from_value(&job.decode_args().unwrap()).unwrap();
            *counts.entry(args.event).or_default() += 1;
        }
        counts
    }

    /// Claim every ready job without running it.
    async fn claim_all(client: &Client) -> Vec<Job> {
        let mut claimed = Vec::new();
        let lease = Duration::from_secs(60);
        while let Some(job) = client.store().claim_next(&[], lease).await.unwrap() {
            claimed.push(job);
        }
        claimed
    }

    async fn drain(executor: &JobExecutor<InMemoryBatchStore>) {
        while executor.run_next(&[]).await.unwrap().is_some() {}
    }

    #[tokio::test]
    async fn last_job_erroring_discards_and_finishes_without_success() {
        let (client, executor) = setup(LockMode::Locked);
        let batch = client
            .define_batch(
                &mut BatchContext::new(),
                lifecycle_batch(),
                vec![work("Work"), work("Work"), work("Fail")],
            )
            .await
            .unwrap();

        // Claim order follows creation order, so the failing job arrives last.
        for _ in 0..3 {
            executor.run_next(&[]).await.unwrap();
        }

        let record = client.require_batch(batch.id).await.unwrap();
        assert!(record.is_discarded());
        assert!(record.is_finished());
        assert!(!record.is_succeeded());

        let counts = callback_counts(&client, batch.id).await;
        assert_eq!(counts.get(&BatchEvent::Success), None);
        assert_eq!(counts.get(&BatchEvent::Discard), Some(&1));
        assert_eq!(counts.get(&BatchEvent::Finish), Some(&1));
    }

    #[tokio::test]
    async fn sweep_recovers_discard_when_the_worker_died_before_reporting() {
        let (client, _) = setup(LockMode::Locked);
        let batch = client
            .define_batch(
                &mut BatchContext::new(),
                lifecycle_batch(),
                vec![work("Work"), work("Fail")],
            )
            .await
            .unwrap();

        let claimed = claim_all(&client).await;
        client.store().finish_job(claimed[0].id, None).await.unwrap();
        client
            .store()
            .finish_job(claimed[1].id, Some("boom".to_string()))
            .await
            .unwrap();

        let report = client.evaluator().sweep(10).await.unwrap();
        assert_eq!(report.transitioned, 1);

        let record = client.require_batch(batch.id).await.unwrap();
        assert!(record.is_discarded() && record.is_finished());
        let counts = callback_counts(&client, batch.id).await;
        assert_eq!(counts.get(&BatchEvent::Success), None);
        assert_eq!(counts.get(&BatchEvent::Discard), Some(&1));
        assert_eq!(counts.get(&BatchEvent::Finish), Some(&1));
    }

    async fn concurrent_completions_fire_once(mode: LockMode, jobs: usize) {
        let (client, executor) = setup(mode);
        let batch = client
            .define_batch(
                &mut BatchContext::new(),
                lifecycle_batch(),
                (0..jobs).map(|_| work("Work")).collect(),
            )
            .await
            .unwrap();

        let claimed = claim_all(&client).await;
        assert_eq!(claimed.len(), jobs);

        let handles: Vec<_> = claimed
            .into_iter()
            .map(|job| {
                let executor = executor.clone();
                tokio::spawn(async move { executor.execute(job).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        // Anything a report gave up on is picked up here.
        client.evaluator().sweep(100).await.unwrap();

        let record = client.require_batch(batch.id).await.unwrap();
        assert!(record.is_finished());
        assert!(record.is_succeeded());

        let counts = callback_counts(&client, batch.id).await;
        assert_eq!(counts.get(&BatchEvent::Success), Some(&1), "{mode}");
        assert_eq!(counts.get(&BatchEvent::Finish), Some(&1), "{mode}");
        assert_eq!(counts.get(&BatchEvent::Discard), None, "{mode}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_completions_dispatch_once_when_locked() {
        for _ in 0..10 {
            concurrent_completions_fire_once(LockMode::Locked, 2).await;
        }
        concurrent_completions_fire_once(LockMode::Locked, 16).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_completions_dispatch_once_when_unlocked() {
        for _ in 0..10 {
            concurrent_completions_fire_once(LockMode::Unlocked, 2).await;
        }
        concurrent_completions_fire_once(LockMode::Unlocked, 16).await;
    }

    #[tokio::test]
    async fn unenqueued_batch_does_not_finish_until_enqueued() {
        let (client, executor) = setup(LockMode::Locked);
        let batch = client.create_batch(lifecycle_batch()).await.unwrap();

        let mut ctx = BatchContext::new();
        {
            let frame = ctx.enter_batch(batch.id);
            client.enqueue(&frame, work("Fail")).await.unwrap();
        }
        drain(&executor).await;

        let record = client.require_batch(batch.id).await.unwrap();
        assert!(record.is_discarded());
        assert!(!record.is_finished());
        assert_eq!(callback_counts(&client, batch.id).await.get(&BatchEvent::Finish), None);

        let record = client.mark_enqueued(batch.id).await.unwrap();
        assert!(record.is_finished());
        let counts = callback_counts(&client, batch.id).await;
        assert_eq!(counts.get(&BatchEvent::Discard), Some(&1));
        assert_eq!(counts.get(&BatchEvent::Finish), Some(&1));
        assert_eq!(counts.get(&BatchEvent::Success), None);
    }

    #[tokio::test]
    async fn callbacks_finish_after_callback_jobs_run() {
        let (client, executor) = setup(LockMode::Locked);
        let batch = client
            .define_batch(&mut BatchContext::new(), lifecycle_batch(), vec![work("Work")])
            .await
            .unwrap();

        executor.run_next(&[]).await.unwrap();
        let record = client.require_batch(batch.id).await.unwrap();
        assert!(record.is_finished());
        assert!(!record.are_callbacks_finished());

        drain(&executor).await;
        let record = client.require_batch(batch.id).await.unwrap();
        assert!(record.are_callbacks_finished());
        assert!(record.callbacks_finished_at >= record.finished_at);
        for job in client.store().callback_jobs(batch.id).await.unwrap() {
            assert!(job.finished_at.unwrap() <= record.callbacks_finished_at.unwrap());
        }
    }

    #[tokio::test]
    async fn finished_at_never_changes_once_set() {
        let (client, executor) = setup(LockMode::Locked);
        let batch = client
            .define_batch(&mut BatchContext::new(), lifecycle_batch(), vec![work("Work")])
            .await
            .unwrap();
        executor.run_next(&[]).await.unwrap();
        let first = client.require_batch(batch.id).await.unwrap().finished_at;
        assert!(first.is_some());

        drain(&executor).await;
        client.evaluator().evaluate(batch.id, None).await.unwrap();
        client.mark_enqueued(batch.id).await.unwrap();
        client.evaluator().sweep(10).await.unwrap();

        assert_eq!(client.require_batch(batch.id).await.unwrap().finished_at, first);
    }

    #[tokio::test]
    async fn rejected_properties_keep_prior_value() {
        let (client, _) = setup(LockMode::Locked);
        let batch = client.create_batch(NewBatch::new()).await.unwrap();

        client
            .set_properties(batch.id, ArgValue::map([("owner", "ops")]))
            .await
            .unwrap();
        let err = client
            .set_properties(batch.id, ArgValue::from("not a mapping"))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::InvalidArgument(_)));

        let props = client.properties(batch.id).await.unwrap();
        assert_eq!(props.get("owner").and_then(ArgValue::as_str), Some("ops"));
    }

    fn finish_orders() -> impl Strategy<Value = (Vec<bool>, Vec<usize>)> {
        (2usize..6)
            .prop_flat_map(|n| {
                (
                    proptest::collection::vec(any::<bool>(), n),
                    Just((0..n).collect::<Vec<_>>()).prop_shuffle(),
                )
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn any_failure_discards_regardless_of_finish_order((fails, order) in finish_orders()) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let (client, executor) = setup(LockMode::Locked);
                let jobs = fails.iter().map(|&f| work(if f { "Fail" } else { "Work" })).collect();
                let batch = client
                    .define_batch(&mut BatchContext::new(), lifecycle_batch(), jobs)
                    .await
                    .unwrap();

                let claimed = claim_all(&client).await;
                for &i in &order {
                    executor.execute(claimed[i].clone()).await.unwrap();
                }

                let record = client.require_batch(batch.id).await.unwrap();
                let counts = callback_counts(&client, batch.id).await;
                let any_failed = fails.iter().any(|&f| f);

                assert!(record.is_finished());
                assert_eq!(record.is_discarded(), any_failed);
                assert_eq!(counts.get(&BatchEvent::Finish), Some(&1));
                assert_eq!(counts.get(&BatchEvent::Discard).copied(), any_failed.then_some(1));
                assert_eq!(counts.get(&BatchEvent::Success).copied(), (!any_failed).then_some(1));
            });
        }

        #[test]
        fn cursor_listing_returns_only_strictly_older(
            offsets in proptest::collection::vec(0i64..5, 1..20),
            pick in any::<prop::sample::Index>(),
            limit in 1usize..30,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let store = InMemoryBatchStore::new();
                let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
                let mut records = Vec::new();
                let mut tx = store.begin().await.unwrap();
                for offset in &offsets {
                    let mut record = NewBatch::new().into_record("default", 0);
                    record.created_at = base + chrono::Duration::seconds(*offset);
                    tx.insert_batch(&record).await.unwrap();
                    records.push(record);
                }
                tx.commit().await.unwrap();

                let anchor = &records[pick.index(records.len())];
                let cursor = BatchCursor::after(anchor);
                let page = store
                    .list_batches(&BatchQuery::new(limit).after(cursor))
                    .await
                    .unwrap();

                for batch in &page {
                    assert!((batch.created_at, batch.id) < (anchor.created_at, anchor.id));
                }
                for pair in page.windows(2) {
                    assert!((pair[0].created_at, pair[0].id) > (pair[1].created_at, pair[1].id));
                }
                let expected = records
                    .iter()
                    .filter(|b| (b.created_at, b.id) < (anchor.created_at, anchor.id))
                    .count()
                    .min(limit);
                assert_eq!(page.len(), expected);
            });
        }
    }
}
