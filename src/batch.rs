//! Buffers jobs across concurrent callers for a short window, then submits
//! them as size-bounded server-side batches and wakes every waiter with one
//! shared result map.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::client::BatchCall;
use crate::config::BatchOptions;
use crate::error::{LlmError, Result};
use crate::fingerprint::fingerprint;
use crate::metrics;
use crate::models::{BatchItem, LlmJob};

pub type BatchAnswers = Arc<HashMap<String, String>>;

type Waiter = oneshot::Sender<(BatchAnswers, Option<LlmError>)>;

struct PendingState {
    pending: Vec<LlmJob>,
    waiters: Vec<Waiter>,
    flush_scheduled: bool,
}

pub struct LlmDispatcher {
    state: Mutex<PendingState>,
    client: Arc<dyn BatchCall>,
    opts: BatchOptions,
    me: Weak<LlmDispatcher>,
}

impl LlmDispatcher {
    pub fn new(client: Arc<dyn BatchCall>, opts: BatchOptions) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            state: Mutex::new(PendingState {
                pending: Vec::new(),
                waiters: Vec::new(),
                flush_scheduled: false,
            }),
            client,
            opts,
            me: me.clone(),
        })
    }

    /// Queues `jobs` for the next flush and blocks until it completes or
    /// `deadline` fires. The map is keyed by fingerprint; callers read only
    /// the fingerprints they submitted, and a missing fingerprint is a
    /// per-row failure.
    pub async fn submit(&self, jobs: Vec<LlmJob>, deadline: Duration) -> Result<BatchAnswers> {
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.state.lock();
            state.pending.extend(jobs);
            state.waiters.push(tx);

            if !state.flush_scheduled {
                state.flush_scheduled = true;
                if let Some(dispatcher) = self.me.upgrade() {
                    tokio::spawn(async move {
                        sleep(dispatcher.opts.flush_delay).await;
                        dispatcher.flush().await;
                    });
                }
            }
        }

        // an armed flush keeps running after this deadline; it wakes the
        // remaining waiters normally
        match timeout(deadline, rx).await {
            Err(_) => Err(LlmError::Deadline {
                message: format!("submit timed out after {deadline:?}"),
            }),
            Ok(Err(_)) => Err(LlmError::Upstream {
                location: "submit",
                message: "flush dropped its waiters".to_string(),
            }),
            Ok(Ok((answers, None))) => Ok(answers),
            Ok(Ok((_, Some(err)))) => Err(err),
        }
    }

    async fn flush(&self) {
        let (jobs, waiters) = {
            let mut state = self.state.lock();
            state.flush_scheduled = false;
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.waiters),
            )
        };
        // the lock is released for the duration of the upstream calls

        if waiters.is_empty() {
            return;
        }

        if jobs.is_empty() {
            wake_all(waiters, Arc::new(HashMap::new()), None);
            return;
        }

        debug!(jobs = jobs.len(), waiters = waiters.len(), "flushing job batch");

        let mut all_answers = HashMap::with_capacity(jobs.len());
        let mut first_err: Option<LlmError> = None;

        for chunk in jobs.chunks(self.opts.max_batch_size) {
            let items: Vec<BatchItem> = chunk
                .iter()
                .map(|job| BatchItem {
                    custom_id: fingerprint(&job.text, &job.prompt),
                    text: job.text.clone(),
                    prompt: job.prompt.clone(),
                })
                .collect();

            let budget = self.opts.poll_timeout + Duration::from_secs(10);
            let started = Instant::now();
            let outcome = match timeout(
                budget,
                self.client
                    .run_message_batch(items, self.opts.poll_every, self.opts.poll_timeout),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(LlmError::Deadline {
                    message: format!("batch chunk timed out after {budget:?}"),
                }),
            };
            metrics::record_upstream_request(started.elapsed());

            match outcome {
                Ok(answers) => all_answers.extend(answers),
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }

        wake_all(waiters, Arc::new(all_answers), first_err);
    }
}

fn wake_all(waiters: Vec<Waiter>, answers: BatchAnswers, err: Option<LlmError>) {
    for waiter in waiters {
        // a waiter that hit its own deadline is gone; that's fine
        let _ = waiter.send((Arc::clone(&answers), err.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockBatch;

    fn job(text: &str, prompt: &str) -> LlmJob {
        LlmJob {
            text: text.to_string(),
            prompt: prompt.to_string(),
        }
    }

    const DEADLINE: Duration = Duration::from_secs(120);

    #[tokio::test(start_paused = true)]
    async fn one_flush_answers_every_waiter() {
        let mock = MockBatch::echo();
        let d = LlmDispatcher::new(mock.clone(), BatchOptions::default());

        let (r1, r2) = tokio::join!(
            d.submit(vec![job("cat", "plural")], DEADLINE),
            d.submit(vec![job("dog", "plural")], DEADLINE),
        );

        // both waiters share the same merged map
        assert_eq!(mock.calls(), 1);
        let m1 = r1.unwrap();
        let m2 = r2.unwrap();
        assert_eq!(m1.len(), 2);
        assert_eq!(m1[&fingerprint("cat", "plural")], "cat/plural");
        assert_eq!(m2[&fingerprint("dog", "plural")], "dog/plural");
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_are_chunked_by_max_batch_size() {
        let mock = MockBatch::echo();
        let opts = BatchOptions {
            max_batch_size: 2,
            ..BatchOptions::default()
        };
        let d = LlmDispatcher::new(mock.clone(), opts);

        let jobs: Vec<LlmJob> = (0..5).map(|i| job(&format!("t{i}"), "p")).collect();
        let answers = d.submit(jobs, DEADLINE).await.unwrap();

        assert_eq!(mock.calls(), 3);
        assert_eq!(mock.batch_sizes(), vec![2, 2, 1]);
        assert_eq!(answers.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_submit_resolves_to_an_empty_map() {
        let mock = MockBatch::echo();
        let d = LlmDispatcher::new(mock.clone(), BatchOptions::default());

        let answers = d.submit(Vec::new(), DEADLINE).await.unwrap();
        assert!(answers.is_empty());
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn upstream_error_reaches_every_waiter() {
        let mock = MockBatch::new(|_| {
            Err(LlmError::Deadline {
                message: "batch timed out".to_string(),
            })
        });
        let d = LlmDispatcher::new(mock.clone(), BatchOptions::default());

        let (r1, r2) = tokio::join!(
            d.submit(vec![job("cat", "plural")], DEADLINE),
            d.submit(vec![job("dog", "plural")], DEADLINE),
        );
        assert!(matches!(r1.unwrap_err(), LlmError::Deadline { .. }));
        assert!(matches!(r2.unwrap_err(), LlmError::Deadline { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn caller_deadline_cuts_the_wait_short() {
        let mock = MockBatch::with_delay(Duration::from_secs(600), |_| Ok(HashMap::new()));
        let d = LlmDispatcher::new(mock.clone(), BatchOptions::default());

        let err = d
            .submit(vec![job("cat", "plural")], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Deadline { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_jobs_stay_within_one_submission() {
        // the chunk front-end dedups, but even duplicate submissions must
        // collapse into ceil(n / max_batch_size) upstream batches
        let mock = MockBatch::echo();
        let d = LlmDispatcher::new(mock.clone(), BatchOptions::default());

        let jobs = vec![job("cat", "plural"), job("cat", "plural")];
        let answers = d.submit(jobs, DEADLINE).await.unwrap();
        assert_eq!(mock.calls(), 1);
        // duplicate fingerprints collapse into one key
        assert_eq!(answers.len(), 1);
    }
}
