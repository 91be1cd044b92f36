//! Bounded row-level worker pools: one upstream call (or one fused lookup)
//! per eligible row, with results scattered back by row index.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::client::SingleCall;
use crate::error::LlmError;
use crate::fused::FusedDispatcher;
use crate::metrics;

/// Shared deadline for all single-shot calls of one chunk.
pub const SINGLE_CHUNK_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RowJob {
    pub row: usize,
    pub text: String,
    pub prompt: String,
}

pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// One upstream call per job; `None` marks the row invalid.
pub async fn run_single_pool(
    client: Arc<dyn SingleCall>,
    jobs: Vec<RowJob>,
    parallel: usize,
) -> Vec<(usize, Option<String>)> {
    let parallel = normalize(parallel);
    let deadline = Instant::now() + SINGLE_CHUNK_DEADLINE;

    stream::iter(jobs)
        .map(|job| {
            let client = Arc::clone(&client);
            async move {
                let started = std::time::Instant::now();
                let outcome = match timeout_at(deadline, client.run(&job.text, &job.prompt)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(LlmError::Deadline {
                        message: "chunk deadline exceeded".to_string(),
                    }),
                };
                metrics::record_upstream_request(started.elapsed());
                (job.row, keep_answer(job.row, outcome))
            }
        })
        .buffer_unordered(parallel)
        .collect()
        .await
}

/// One fused-dispatcher lookup per job; `None` marks the row invalid.
pub async fn run_fused_pool(
    dispatcher: Arc<FusedDispatcher>,
    jobs: Vec<RowJob>,
    parallel: usize,
) -> Vec<(usize, Option<String>)> {
    let parallel = normalize(parallel);

    stream::iter(jobs)
        .map(|job| {
            let dispatcher = Arc::clone(&dispatcher);
            async move {
                let outcome = dispatcher.get_result(&job.text, &job.prompt).await;
                (job.row, keep_answer(job.row, outcome))
            }
        })
        .buffer_unordered(parallel)
        .collect()
        .await
}

fn normalize(parallel: usize) -> usize {
    if parallel == 0 {
        default_parallelism()
    } else {
        parallel
    }
}

fn keep_answer(row: usize, outcome: crate::error::Result<String>) -> Option<String> {
    match outcome {
        Ok(ans) if !ans.is_empty() => Some(ans),
        Ok(_) => None,
        Err(err) => {
            debug!(row, %err, "row call failed");
            None
        }
    }
}
