//! Fixed-size worker pool over a batch of instances.
//!
//! Each instance runs in its own tokio task so a panic inside one
//! orchestrator run is recorded as `crashed` instead of tearing down the
//! batch. The memory pool is the only state shared between runs.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

use super::input::InputRecord;
use super::orchestrator::Orchestrator;
use super::state::{FailureKind, InstanceOutcome};

/// Run every record with at most `workers` instances in flight.
///
/// Always returns exactly one terminal record per input record, in input
/// order. When `events` is set each record is also sent there as soon as
/// its instance finishes.
pub async fn run_batch(
    orchestrator: Arc<Orchestrator>,
    records: Vec<InputRecord>,
    workers: usize,
    events: Option<mpsc::Sender<InstanceOutcome>>,
) -> Vec<InstanceOutcome> {
    let workers = workers.max(1);
    let round_limit = orchestrator.round_limit();
    let sem = Arc::new(Semaphore::new(workers));
    tracing::info!(instances = records.len(), workers, "Starting batch");

    let mut futures = Vec::with_capacity(records.len());
    for record in records {
        let sem = sem.clone();
        let orchestrator = orchestrator.clone();
        let events = events.clone();
        futures.push(async move {
            let outcome = match record.parsed {
                Err(e) => {
                    tracing::warn!(line = record.line, error = %e, "Skipping malformed input line");
                    InstanceOutcome::invalid_line(record.line, round_limit, e.to_string())
                }
                Ok(instance) => run_one(orchestrator.clone(), sem, instance).await,
            };
            orchestrator
                .progress()
                .record_finished(outcome.success);
            if let Some(tx) = &events {
                if tx.send(outcome.clone()).await.is_err() {
                    tracing::debug!("Outcome receiver dropped");
                }
            }
            outcome
        });
    }

    let outcomes = futures::future::join_all(futures).await;
    let succeeded = outcomes.iter().filter(|o| o.success).count();
    tracing::info!(
        instances = outcomes.len(),
        succeeded,
        failed = outcomes.len() - succeeded,
        "Batch finished"
    );
    outcomes
}

async fn run_one(
    orchestrator: Arc<Orchestrator>,
    sem: Arc<Semaphore>,
    instance: crate::types::TaskInstance,
) -> InstanceOutcome {
    let round_limit = orchestrator.round_limit();
    let permit = match sem.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            return InstanceOutcome::failed_early(
                &instance.with_resolved_id(),
                round_limit,
                FailureKind::Crashed,
                "worker pool closed before the instance started",
            )
        }
    };
    orchestrator.progress().started.fetch_add(1, Ordering::Relaxed);

    let fallback = instance.clone().with_resolved_id();
    let handle = tokio::spawn(async move {
        let _permit = permit;
        orchestrator.process(instance).await
    });
    match handle.await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(
                instance_id = %fallback.instance_id,
                error = %e,
                "Instance task crashed"
            );
            let reason = if e.is_panic() {
                format!("instance task panicked: {}", e)
            } else {
                format!("instance task aborted: {}", e)
            };
            InstanceOutcome::failed_early(&fallback, round_limit, FailureKind::Crashed, reason)
        }
    }
}
