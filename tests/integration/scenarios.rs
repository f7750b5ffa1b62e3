//! End-to-end behaviour of admission, scheduling, retries and context fitting.

use std::sync::Arc;
use std::time::Duration;

use quillforge::budget::{ContentItem, ContextOptimizer, TokenBudget, TokenEstimator};
use quillforge::external::CostLedger;
use quillforge::sim::{InMemoryLedger, SimulatedGenerator};
use quillforge::{CancelOutcome, DenialReason, JobStatus, SubmissionOutcome, TierLimit};

use crate::support::{chapter, fast_config, Setup, StallOnce};

#[tokio::test]
async fn test_five_chapters_never_exceed_three_running() {
    let (setup, generator) =
        Setup::simulated(SimulatedGenerator::new().with_latency(Duration::from_millis(30)));
    let orchestrator = setup.start(fast_config().with_max_parallel(3));

    let requests = (0..5).map(|_| chapter("author", "pro", 3)).collect();
    let submission = orchestrator.submit_batch(requests).await;
    assert_eq!(submission.accepted().len(), 5);

    let mut peak_running = 0;
    loop {
        let progress = orchestrator
            .batch_progress(submission.batch_id)
            .expect("batch tracked");
        peak_running = peak_running.max(progress.running);
        assert!(progress.running <= 3, "{} jobs running", progress.running);
        if progress.is_finished() {
            assert_eq!(progress.completed, 5);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(peak_running >= 1);
    assert!(generator.max_concurrent() <= 3);
    assert_eq!(setup.ledger.charges("author").len(), 5);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_timed_out_attempt_resumes_from_its_checkpoint() {
    let generator = Arc::new(StallOnce::new(2, Duration::from_millis(500)));
    let setup = Setup::new(generator.clone());
    let config = fast_config()
        .with_max_parallel(1)
        .with_attempt_timeout(Duration::from_millis(100));
    let orchestrator = setup.start(config);

    let request = chapter("author", "pro", 5);
    let expected_charge = setup.ledger.estimate_cost(&request).await;
    let submission = orchestrator.submit_batch(vec![request]).await;
    let job_id = submission.accepted()[0];

    let progress = orchestrator
        .wait_for_batch(submission.batch_id)
        .await
        .expect("batch tracked");
    assert_eq!(progress.completed, 1);

    // Stages 0 and 1 ran once; the second attempt picked up at stage 2.
    assert_eq!(generator.inner.stages_for(job_id), vec![0, 1, 2, 3, 4]);
    assert_eq!(setup.ledger.charges("author"), vec![expected_charge]);

    let result = orchestrator.result(job_id).await.unwrap().expect("result stored");
    assert_eq!(result.matches("stage").count(), 5);
    assert!(setup.store.load(job_id).await.unwrap().is_none());
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_job_over_remaining_budget_is_denied_and_not_queued() {
    let (setup, generator) = Setup::simulated(SimulatedGenerator::new());
    let setup = setup.with_ledger(
        InMemoryLedger::new()
            .with_budget("author", 200)
            .with_flat_cost(500),
    );
    let orchestrator = setup.start(fast_config().with_max_parallel(1));

    let queued_before = orchestrator.queued();
    let submission = orchestrator
        .submit_batch(vec![chapter("author", "pro", 1)])
        .await;

    assert_eq!(
        submission.outcomes,
        vec![SubmissionOutcome::Denied(DenialReason::BudgetExceeded)]
    );
    assert_eq!(orchestrator.queued(), queued_before);
    assert!(orchestrator.batch_progress(submission.batch_id).is_none());
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(generator.calls(), 0);
    orchestrator.shutdown().await;
}

#[test]
fn test_context_over_ceiling_is_fitted() {
    let estimator = TokenEstimator::default();
    let item = |id: &str, tokens: u64, weight: f64| ContentItem {
        id: id.to_string(),
        text: "word ".repeat(tokens as usize),
        weight,
        tokens,
        summarizable: false,
        truncatable: false,
    };
    let items = vec![
        item("outline", 500, 3.0),
        item("characters", 400, 2.0),
        item("recap", 300, 1.0),
    ];

    let selection = ContextOptimizer::new(estimator)
        .optimize(items, TokenBudget::new(1_000))
        .expect("fits");

    assert!(selection.used <= 1_000);
    assert!(selection.contains("outline"));
    assert!(selection.contains("characters"));
    assert_eq!(selection.dropped, vec!["recap".to_string()]);
}

#[tokio::test]
async fn test_eleventh_request_within_a_second_is_rate_limited() {
    let (setup, _generator) =
        Setup::simulated(SimulatedGenerator::new().with_latency(Duration::from_millis(5)));
    let orchestrator = setup.start(fast_config().with_queue_capacity(32));

    let requests = (0..11).map(|_| chapter("reader", "free", 1)).collect();
    let submission = orchestrator.submit_batch(requests).await;

    assert_eq!(submission.accepted().len(), 10);
    assert_eq!(
        submission.outcomes[10],
        SubmissionOutcome::Denied(DenialReason::RateLimited)
    );

    let progress = orchestrator
        .wait_for_batch(submission.batch_id)
        .await
        .expect("batch tracked");
    assert_eq!(progress.total, 10);
    assert_eq!(progress.completed, 10);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_higher_priority_runs_first() {
    let (setup, generator) =
        Setup::simulated(SimulatedGenerator::new().with_latency(Duration::from_millis(100)));
    let orchestrator = setup.start(fast_config().with_max_parallel(1));

    // Occupy the single worker so the rest queue up.
    let blocker = orchestrator.submit_batch(vec![chapter("a", "pro", 1)]).await;
    while orchestrator.job_status(blocker.accepted()[0]) != Some(JobStatus::Running) {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let requests = vec![
        chapter("a", "pro", 1).with_priority(1),
        chapter("a", "pro", 1).with_priority(9),
        chapter("a", "pro", 1).with_priority(5),
    ];
    let submission = orchestrator.submit_batch(requests).await;
    let ids = submission.accepted();
    assert_eq!(orchestrator.position_of(ids[1]), Some(0));

    orchestrator.wait_for_batch(submission.batch_id).await;
    let order: Vec<_> = generator
        .stages_run()
        .into_iter()
        .map(|(id, _)| id)
        .filter(|id| ids.contains(id))
        .collect();
    assert_eq!(order, vec![ids[1], ids[2], ids[0]]);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_progress_events_reach_the_sink() {
    let (setup, _generator) = Setup::simulated(SimulatedGenerator::new());
    let orchestrator = setup.start(fast_config());
    let submission = orchestrator
        .submit_batch(vec![chapter("author", "pro", 2)])
        .await;
    let job_id = submission.accepted()[0];
    orchestrator.wait_for_batch(submission.batch_id).await;
    orchestrator.shutdown().await;

    let statuses: Vec<_> = setup
        .sink
        .events()
        .into_iter()
        .filter(|e| e.job_id == job_id)
        .map(|e| e.status)
        .collect();
    assert_eq!(statuses.first(), Some(&JobStatus::Pending));
    assert_eq!(statuses.last(), Some(&JobStatus::Completed));
    assert!(statuses.contains(&JobStatus::Running));
}

#[tokio::test]
async fn test_cancel_during_backoff_ends_cancelled() {
    let (setup, generator) =
        Setup::simulated(SimulatedGenerator::new().with_transient_failures(1));
    let config = fast_config()
        .with_max_parallel(1)
        .with_retry_backoff(Duration::from_secs(4), Duration::from_secs(4));
    let orchestrator = setup.start(config);

    let submission = orchestrator
        .submit_batch(vec![chapter("author", "pro", 2)])
        .await;
    let job_id = submission.accepted()[0];
    while generator.calls() < 1 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(
        orchestrator.cancel(job_id).await.unwrap(),
        CancelOutcome::Requested
    );
    let progress = tokio::time::timeout(
        Duration::from_secs(1),
        orchestrator.wait_for_batch(submission.batch_id),
    )
    .await
    .expect("backoff interrupted")
    .expect("batch tracked");

    assert_eq!(progress.cancelled, 1);
    assert_eq!(generator.calls(), 1);
    assert!(setup.ledger.charges("author").is_empty());
    assert!(setup.store.load_record(job_id).await.unwrap().is_none());
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_bursting_client_is_denied_as_abuse() {
    let (setup, generator) =
        Setup::simulated(SimulatedGenerator::new().with_latency(Duration::from_millis(5)));
    let config = fast_config().with_tier("pro", TierLimit::new(60, 60).with_burst_threshold(3));
    let orchestrator = setup.start(config);

    let requests = (0..5).map(|_| chapter("author", "pro", 1)).collect();
    let submission = orchestrator.submit_batch(requests).await;

    assert_eq!(submission.accepted().len(), 3);
    assert_eq!(
        submission.denied(),
        vec![DenialReason::AbuseSuspected, DenialReason::AbuseSuspected]
    );
    let progress = orchestrator
        .wait_for_batch(submission.batch_id)
        .await
        .expect("batch tracked");
    assert_eq!(progress.completed, 3);
    assert_eq!(progress.job_ids, submission.accepted());
    assert_eq!(generator.calls(), 3);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_ledger_outage_still_charges_once() {
    let (setup, generator) = Setup::simulated(SimulatedGenerator::new());
    let setup = setup.with_ledger(
        InMemoryLedger::new()
            .with_default_budget(100_000)
            .with_charge_outages(1),
    );
    let orchestrator = setup.start(fast_config());

    let request = chapter("author", "pro", 2);
    let expected_charge = setup.ledger.estimate_cost(&request).await;
    let submission = orchestrator.submit_batch(vec![request]).await;
    let progress = orchestrator
        .wait_for_batch(submission.batch_id)
        .await
        .expect("batch tracked");

    assert_eq!(progress.completed, 1);
    assert_eq!(setup.ledger.charges("author"), vec![expected_charge]);
    assert_eq!(generator.calls(), 2);
    orchestrator.shutdown().await;
}
