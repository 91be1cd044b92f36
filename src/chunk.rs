//! Vectorized front-end: routes one chunk of (text, prompt) rows through
//! the selected dispatch strategy and writes answers or nulls per row.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use datafusion::arrow::array::{Array, StringArray};
use tracing::debug;

use crate::fingerprint::fingerprint;
use crate::models::LlmJob;
use crate::state::Dispatch;
use crate::worker::{self, RowJob};

/// Deadline for one batch-mode submission covering a whole chunk.
pub const BATCH_SUBMIT_DEADLINE: Duration = Duration::from_secs(120);

/// Answers one chunk. The output's null buffer is the validity bitmap:
/// rows with either input null, a failed call, or an empty answer are null;
/// every other row carries a non-empty answer. Each position is written
/// exactly once.
pub async fn answer_chunk(
    dispatch: &Dispatch,
    texts: &StringArray,
    prompts: &StringArray,
    parallel: usize,
) -> StringArray {
    let n = texts.len().min(prompts.len());
    let mut out: Vec<Option<String>> = vec![None; n];
    if n == 0 {
        return out.into_iter().collect();
    }

    match dispatch {
        Dispatch::Fused(dispatcher) => {
            let jobs = eligible_jobs(texts, prompts, n);
            for (row, ans) in worker::run_fused_pool(Arc::clone(dispatcher), jobs, parallel).await {
                out[row] = ans;
            }
        }
        Dispatch::Single(client) => {
            let jobs = eligible_jobs(texts, prompts, n);
            for (row, ans) in worker::run_single_pool(Arc::clone(client), jobs, parallel).await {
                out[row] = ans;
            }
        }
        Dispatch::Batch(dispatcher) => {
            // one pass: remember each row's fingerprint, submit unique pairs only
            let mut refs: Vec<(usize, String)> = Vec::with_capacity(n);
            let mut uniq: HashMap<String, LlmJob> = HashMap::with_capacity(n);
            for row in 0..n {
                if texts.is_null(row) || prompts.is_null(row) {
                    continue;
                }
                let text = texts.value(row);
                let prompt = prompts.value(row);
                let fp = fingerprint(text, prompt);
                refs.push((row, fp.clone()));
                uniq.entry(fp).or_insert_with(|| LlmJob {
                    text: text.to_string(),
                    prompt: prompt.to_string(),
                });
            }

            if refs.is_empty() {
                return out.into_iter().collect();
            }

            let jobs: Vec<LlmJob> = uniq.into_values().collect();
            match dispatcher.submit(jobs, BATCH_SUBMIT_DEADLINE).await {
                Ok(answers) => {
                    for (row, fp) in refs {
                        if let Some(ans) = answers.get(&fp) {
                            if !ans.is_empty() {
                                out[row] = Some(ans.clone());
                            }
                        }
                    }
                }
                Err(err) => {
                    // every eligible row of this chunk stays invalid
                    debug!(%err, "batch submit failed");
                }
            }
        }
    }

    out.into_iter().collect()
}

fn eligible_jobs(texts: &StringArray, prompts: &StringArray, n: usize) -> Vec<RowJob> {
    (0..n)
        .filter(|&row| !texts.is_null(row) && !prompts.is_null(row))
        .map(|row| RowJob {
            row,
            text: texts.value(row).to_string(),
            prompt: prompts.value(row).to_string(),
        })
        .collect()
}
