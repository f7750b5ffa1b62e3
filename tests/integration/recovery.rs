//! Restart recovery from a file-backed store.

use std::sync::Arc;

use tempfile::TempDir;

use quillforge::checkpoint::{CheckpointStore, FileBackend, JobRecord, KvBackend};
use quillforge::sim::SimulatedGenerator;
use quillforge::{BatchId, FeatureLevel, Job, JobStatus};

use crate::support::{chapter, fast_config, Setup};

fn file_store(dir: &TempDir) -> (Arc<CheckpointStore>, Arc<FileBackend>) {
    let backend = Arc::new(FileBackend::new(dir.path()).expect("store dir"));
    (Arc::new(CheckpointStore::new(backend.clone())), backend)
}

fn interrupted_job(stages: u32) -> Job {
    let mut job = Job::from_request(
        chapter("author", "pro", stages),
        BatchId::new(),
        40,
        FeatureLevel::Full,
    );
    job.status = JobStatus::Running;
    job.attempts = 1;
    job
}

#[tokio::test]
async fn test_interrupted_job_resumes_from_last_checkpoint() {
    let dir = TempDir::new().unwrap();
    let (store, _) = file_store(&dir);

    let job = interrupted_job(4);
    let job_id = job.id;
    let batch_id = job.batch_id;
    store.save_record(&JobRecord::new(job)).await.unwrap();
    store
        .save(job_id, 2, "opening scene\n\nsecond scene", 120)
        .await
        .unwrap();

    // A fresh process over the same directory.
    let (store, _) = file_store(&dir);
    let (setup, generator) = Setup::simulated(SimulatedGenerator::new());
    let setup = setup.with_store(store.clone());
    let orchestrator = setup.start(fast_config());

    let report = orchestrator.recover().await.unwrap();
    assert_eq!(report.resumed, vec![job_id]);
    assert_eq!(report.batches, vec![batch_id]);

    let progress = orchestrator.wait_for_batch(batch_id).await.expect("batch tracked");
    assert_eq!(progress.completed, 1);
    assert_eq!(generator.stages_for(job_id), vec![2, 3]);

    let result = orchestrator.result(job_id).await.unwrap().expect("result stored");
    assert!(result.starts_with("opening scene\n\nsecond scene"));
    assert!(result.contains("stage 4 of 4"));
    assert_eq!(setup.ledger.charges("author"), vec![40]);

    assert!(store.load_records().await.unwrap().is_empty());
    assert!(store.load_checkpoints().await.unwrap().is_empty());
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_charged_job_completes_without_second_charge() {
    let dir = TempDir::new().unwrap();
    let (store, _) = file_store(&dir);

    let job = interrupted_job(2);
    let job_id = job.id;
    let mut record = JobRecord::new(job);
    record.charge_issued = true;
    store.save_record(&record).await.unwrap();
    store.put_result(job_id, "the whole chapter").await.unwrap();

    let (setup, generator) = Setup::simulated(SimulatedGenerator::new());
    let setup = setup.with_store(store.clone());
    let orchestrator = setup.start(fast_config());

    let report = orchestrator.recover().await.unwrap();
    assert_eq!(report.completed, vec![job_id]);
    assert!(report.resumed.is_empty());
    assert_eq!(orchestrator.job_status(job_id), Some(JobStatus::Completed));
    assert_eq!(generator.calls(), 0);
    assert_eq!(setup.ledger.total_charges(), 0);
    assert_eq!(
        orchestrator.result(job_id).await.unwrap().as_deref(),
        Some("the whole chapter")
    );
    assert!(store.load_record(job_id).await.unwrap().is_none());
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_job_out_of_attempts_fails_on_recovery() {
    let dir = TempDir::new().unwrap();
    let (store, _) = file_store(&dir);

    let mut job = interrupted_job(3);
    job.attempts = 3;
    job.last_error = Some("generation timed out".to_string());
    let job_id = job.id;
    store.save_record(&JobRecord::new(job)).await.unwrap();
    store.save(job_id, 1, "partial", 10).await.unwrap();

    let (setup, generator) = Setup::simulated(SimulatedGenerator::new());
    let orchestrator = setup
        .with_store(store.clone())
        .start(fast_config().with_max_retries(3));

    let report = orchestrator.recover().await.unwrap();
    assert_eq!(report.failed, vec![job_id]);
    assert_eq!(orchestrator.job_status(job_id), Some(JobStatus::Failed));
    assert_eq!(generator.calls(), 0);
    assert!(store.load(job_id).await.unwrap().is_none());
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_corrupt_record_is_skipped() {
    let dir = TempDir::new().unwrap();
    let (store, backend) = file_store(&dir);

    let good = interrupted_job(1);
    let good_id = good.id;
    store.save_record(&JobRecord::new(good)).await.unwrap();
    backend
        .put(&format!("job/{}", quillforge::JobId::new()), b"{not json".to_vec())
        .await
        .unwrap();

    let (setup, _generator) = Setup::simulated(SimulatedGenerator::new());
    let orchestrator = setup.with_store(store.clone()).start(fast_config());

    let report = orchestrator.recover().await.unwrap();
    assert_eq!(report.resumed, vec![good_id]);
    assert!(backend.keys("job/").await.unwrap().len() <= 1);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_finished_records_are_cleared() {
    let dir = TempDir::new().unwrap();
    let (store, _) = file_store(&dir);

    let mut job = interrupted_job(1);
    job.status = JobStatus::Cancelled;
    let job_id = job.id;
    store.save_record(&JobRecord::new(job)).await.unwrap();

    let (setup, _generator) = Setup::simulated(SimulatedGenerator::new());
    let orchestrator = setup.with_store(store.clone()).start(fast_config());

    let report = orchestrator.recover().await.unwrap();
    assert!(report.resumed.is_empty() && report.completed.is_empty() && report.failed.is_empty());
    assert!(store.load_record(job_id).await.unwrap().is_none());
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_stored_output_with_unsettled_charge_is_charged_on_recovery() {
    let dir = TempDir::new().unwrap();
    let (store, _) = file_store(&dir);

    let mut job = interrupted_job(2);
    job.attempts = 3;
    let job_id = job.id;
    let batch_id = job.batch_id;
    job.result_ref = Some(store.put_result(job_id, "both scenes").await.unwrap());
    store.save_record(&JobRecord::new(job)).await.unwrap();
    store.save(job_id, 2, "both scenes", 90).await.unwrap();

    let (setup, generator) = Setup::simulated(SimulatedGenerator::new());
    let setup = setup.with_store(store.clone());
    let orchestrator = setup.start(fast_config().with_max_retries(3));

    let report = orchestrator.recover().await.unwrap();
    assert_eq!(report.resumed, vec![job_id]);
    assert!(report.failed.is_empty());

    let progress = orchestrator.wait_for_batch(batch_id).await.expect("batch tracked");
    assert_eq!(progress.completed, 1);
    assert_eq!(generator.calls(), 0);
    assert_eq!(setup.ledger.charges("author"), vec![40]);
    assert_eq!(
        orchestrator.result(job_id).await.unwrap().as_deref(),
        Some("both scenes")
    );
    assert!(store.load_record(job_id).await.unwrap().is_none());
    orchestrator.shutdown().await;
}
