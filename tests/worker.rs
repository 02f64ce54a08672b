//! Worker loop: locking, retry cap, cancellation, compute jobs.
//!
//! Run with: `cargo test --test worker`

mod common;

use std::time::Duration;

use futures::future::join_all;

use common::*;
use dataset_sync::job::{COMPUTE_PLUGIN, DDI_CDI_PLUGIN};
use dataset_sync::keys::queue_key;
use dataset_sync::{Job, JobOutcome, KeyValueStore, NodeMap, SyncError};

// =============================================================================
// Queue & lock
// =============================================================================

#[tokio::test]
async fn only_one_of_concurrent_adds_wins_the_lock() {
    let h = harness(false).await;
    let node = h.source("a.txt", b"alpha");

    let adds = (0..10).map(|_| {
        let engine = h.engine.clone();
        let node = node.clone();
        async move {
            let mut job = write_job([node]);
            engine.add_job(&mut job).await
        }
    });
    let results = join_all(adds).await;

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, SyncError::AlreadyInProgress(_))));
    assert_eq!(h.engine.queue().len("").await.unwrap(), 1);
}

#[tokio::test]
async fn job_without_nodes_is_not_queued() {
    let h = harness(false).await;
    let mut job = Job::new(PID, PLUGIN, NodeMap::new());
    h.engine.add_job(&mut job).await.unwrap();

    assert!(!h.engine.is_locked(PID).await.unwrap());
    assert!(h.engine.queue().is_empty("").await.unwrap());
}

#[tokio::test]
async fn malformed_payload_is_dropped() {
    let h = harness(false).await;
    h.store.lpush(&queue_key(""), "{not json").await.unwrap();

    assert_eq!(h.engine.process_one("").await.unwrap(), None);
    assert!(h.engine.queue().is_empty("").await.unwrap());
}

// =============================================================================
// Retry policy
// =============================================================================

#[tokio::test]
async fn retryable_error_stops_at_the_cap_with_one_mail() {
    let h = harness(false).await;
    // No content registered: every attempt fails with a missing stream.
    let mut job = write_job([copy_node("a.txt", b"alpha")]);
    h.engine.add_job(&mut job).await.unwrap();

    let mut outcomes = Vec::new();
    while let Some(outcome) = h.engine.process_one("").await.unwrap() {
        outcomes.push(outcome);
    }

    assert_eq!(outcomes.len(), 5);
    assert!(outcomes[..4].iter().all(|o| *o == JobOutcome::Requeued));
    assert_eq!(outcomes[4], JobOutcome::Failed);
    assert_eq!(h.notifier.len(), 1);
    assert!(!h.engine.is_locked(PID).await.unwrap());
    let error = h.engine.last_error(PID).await.unwrap().unwrap();
    assert!(error.contains("No stream found"), "{error}");
}

#[tokio::test]
async fn shutdown_requeues_without_counting_an_error() {
    let h = harness(false).await;
    let mut job = write_job([h.source("a.txt", b"alpha")]);
    h.engine.add_job(&mut job).await.unwrap();

    h.engine.shutdown_token().cancel();
    assert_eq!(h.engine.process_one("").await.unwrap(), Some(JobOutcome::Requeued));

    let requeued = h.engine.queue().pop_job("").await.unwrap().unwrap();
    assert_eq!(requeued.err_cnt, 0);
    assert_eq!(requeued.writable_nodes.len(), 1);
    assert!(h.engine.is_locked(PID).await.unwrap());
    assert!(h.notifier.is_empty());
}

#[tokio::test]
async fn expired_deadline_counts_as_an_error() {
    let h = harness(false).await;
    let mut job = write_job([h.source("a.txt", b"alpha")]);
    h.engine.add_job(&mut job).await.unwrap();
    let mut popped = h.engine.queue().pop_job("").await.unwrap().unwrap();
    popped.deadline = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
    h.engine.queue().requeue(&popped).await.unwrap();

    assert_eq!(h.engine.process_one("").await.unwrap(), Some(JobOutcome::Requeued));
    let requeued = h.engine.queue().pop_job("").await.unwrap().unwrap();
    assert_eq!(requeued.err_cnt, 1);
}

// =============================================================================
// Worker pool
// =============================================================================

#[tokio::test]
async fn workers_drain_the_queue_and_stop_on_shutdown() {
    let h = harness(false).await;
    let nodes: Vec<_> = (0..4)
        .map(|i| h.source(&format!("f{i}.txt"), format!("content {i}").as_bytes()))
        .collect();
    let mut job = write_job(nodes);
    h.engine.add_job(&mut job).await.unwrap();

    h.engine.spin_workers(2, dataset_sync::ALL_QUEUES);

    tokio::time::timeout(Duration::from_secs(10), async {
        while h.engine.is_locked(PID).await.unwrap() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not finish");

    h.engine.shutdown().await;
    assert_eq!(h.listing().await.len(), 4);
    assert!(h.engine.shutdown_token().is_cancelled());
}

// =============================================================================
// Compute jobs
// =============================================================================

#[cfg(unix)]
fn compute_job(plugin: &str, key: &str, files: &[&str]) -> Job {
    let mut job = write_job(files.iter().map(|f| dataset_sync::Node::file(*f)));
    job.plugin = plugin.to_string();
    job.key = key.to_string();
    job
}

#[cfg(unix)]
#[tokio::test]
async fn compute_runs_script_against_dataset_snapshot() {
    let h = harness_with(false, |c| c.compute_command = "sh".into()).await;
    h.seed("data/input.txt", b"hello from the dataset").await;
    h.seed("run.sh", b"cat data/input.txt\n").await;

    let mut job = compute_job(COMPUTE_PLUGIN, "ck1", &["run.sh"]);
    h.engine.add_job(&mut job).await.unwrap();
    assert_eq!(h.engine.process_one("").await.unwrap(), Some(JobOutcome::Finished));

    let res = h.engine.take_cached_compute_response("ck1").await.unwrap();
    assert!(res.ready);
    assert!(res.error_message.is_empty());
    assert_eq!(res.console_out.trim(), "hello from the dataset");
    assert!(!h.dir.path().join("workspace").join("ck1").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn compute_needs_exactly_one_script() {
    let h = harness_with(false, |c| c.compute_command = "sh".into()).await;
    let mut job = compute_job(COMPUTE_PLUGIN, "ck2", &["a.sh", "b.sh"]);
    h.engine.add_job(&mut job).await.unwrap();
    assert_eq!(h.engine.process_one("").await.unwrap(), Some(JobOutcome::Finished));
    assert!(!h.engine.is_locked(PID).await.unwrap());

    let res = h.engine.take_cached_compute_response("ck2").await.unwrap();
    assert_eq!(res.error_message, "computation failed");
    assert_eq!(res.console_out, "file not found");
}

#[cfg(unix)]
#[tokio::test]
async fn script_failure_is_reported_not_retried() {
    let h = harness_with(false, |c| c.compute_command = "sh".into()).await;
    h.seed("fail.sh", b"echo partial\nexit 3\n").await;
    let mut job = compute_job(COMPUTE_PLUGIN, "ck3", &["fail.sh"]);
    h.engine.add_job(&mut job).await.unwrap();

    assert_eq!(h.engine.process_one("").await.unwrap(), Some(JobOutcome::Finished));
    let res = h.engine.take_cached_compute_response("ck3").await.unwrap();
    assert!(res.console_out.contains("partial"));
    assert!(h.notifier.is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn ddi_cdi_converts_each_selected_file() {
    let script_dir = tempfile::tempdir().unwrap();
    let script = script_dir.path().join("csv_to_cdi.sh");
    std::fs::write(
        &script,
        r#"while [ $# -gt 0 ]; do
  case "$1" in
    --csv) csv="$2"; shift 2 ;;
    --output) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
echo "<cdi> $(basename "$csv") $(wc -l < "$csv")" > "$out"
"#,
    )
    .unwrap();
    let script_path = script.display().to_string();
    let h = harness_with(false, |c| {
        c.compute_command = "sh".into();
        c.ddi_cdi_script = script_path;
    })
    .await;
    h.seed("a.csv", b"x,y\n1,2\n").await;
    h.seed("b.csv", b"x\n1\n2\n").await;

    let mut job = compute_job(DDI_CDI_PLUGIN, "cdi1", &["b.csv", "a.csv"]);
    h.engine.add_job(&mut job).await.unwrap();
    assert_eq!(h.engine.process_one("").await.unwrap(), Some(JobOutcome::Finished));

    let res = h.engine.take_cached_compute_response("cdi1").await.unwrap();
    assert!(res.error_message.is_empty(), "{}", res.console_out);
    let a = res.ddi_cdi.find("<cdi> a.csv 2").expect("a.csv converted");
    let b = res.ddi_cdi.find("<cdi> b.csv 3").expect("b.csv converted");
    assert!(a < b);
}
