//! Fuses every prompt that arrives for one text within a short window into
//! a single delimited upstream request, and optionally coalesces several
//! texts into one multi-item request.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, timeout_at};
use tracing::{debug, warn};

use crate::client::SingleCall;
use crate::config::FusedOptions;
use crate::error::{LlmError, Result};
use crate::metrics;
use crate::rate_limit::RequestPacer;

// enough room for one chunk's worth of flushes
const WORK_QUEUE_CAPACITY: usize = 4096;

struct BatchInner {
    // prompt -> answer, plus insertion order for deterministic slotting
    prompts: HashMap<String, String>,
    order: Vec<String>,
    frozen: bool,
    err: Option<LlmError>,
}

struct FusedBatch {
    inner: Mutex<BatchInner>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl FusedBatch {
    fn new() -> Arc<Self> {
        let (done_tx, done_rx) = watch::channel(false);
        Arc::new(Self {
            inner: Mutex::new(BatchInner {
                prompts: HashMap::new(),
                order: Vec::new(),
                frozen: false,
                err: None,
            }),
            done_tx,
            done_rx,
        })
    }

    async fn wait_done(&self) {
        let mut rx = self.done_rx.clone();
        // the sender lives as long as the batch, so this cannot fail
        let _ = rx.wait_for(|done| *done).await;
    }

    fn signal_done(&self) {
        let _ = self.done_tx.send(true);
    }

    fn answer_for(&self, prompt: &str) -> Result<String> {
        let inner = self.inner.lock();
        if let Some(err) = &inner.err {
            return Err(err.clone());
        }
        Ok(inner.prompts.get(prompt).cloned().unwrap_or_default())
    }
}

struct FusedWorkItem {
    text: String,
    prompt_list: Vec<String>,
    fused_prompt: String,
    batch: Arc<FusedBatch>,
}

struct Tables {
    // at most one collecting and one in-flight batch per text
    batches: HashMap<String, Arc<FusedBatch>>,
    inflight: HashMap<String, Arc<FusedBatch>>,
    // text -> prompt -> answer; only non-empty answers, never evicted
    cache: HashMap<String, HashMap<String, String>>,
}

pub struct FusedDispatcher {
    tables: Mutex<Tables>,
    client: Arc<dyn SingleCall>,
    opts: FusedOptions,
    pacer: Option<RequestPacer>,
    work_tx: Option<mpsc::Sender<FusedWorkItem>>,
    me: Weak<FusedDispatcher>,
}

enum Wait {
    // an in-flight batch exists; wait on it, take its answer if included
    Inflight { batch: Arc<FusedBatch>, included: bool },
    // joined a collecting batch
    Joined(Arc<FusedBatch>),
    // the batch froze under us; wait it out and retry
    Refrozen(Arc<FusedBatch>),
}

impl FusedDispatcher {
    /// Must be called inside a tokio runtime; multi mode spawns its worker.
    pub fn new(client: Arc<dyn SingleCall>, opts: FusedOptions) -> Arc<Self> {
        let pacer = opts.rps.map(RequestPacer::new);
        let (work_tx, work_rx) = if opts.multi {
            let (tx, rx) = mpsc::channel(WORK_QUEUE_CAPACITY);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let dispatcher = Arc::new_cyclic(|me| Self {
            tables: Mutex::new(Tables {
                batches: HashMap::new(),
                inflight: HashMap::new(),
                cache: HashMap::new(),
            }),
            client,
            opts,
            pacer,
            work_tx,
            me: me.clone(),
        });

        if let Some(rx) = work_rx {
            tokio::spawn(Arc::clone(&dispatcher).multi_worker(rx));
        }

        dispatcher
    }

    /// Returns the answer for (text, prompt), blocking until one is
    /// available: cache first, then an in-flight batch, then a collecting
    /// batch (created on demand).
    pub async fn get_result(&self, text: &str, prompt: &str) -> Result<String> {
        loop {
            let wait = {
                let mut tables = self.tables.lock();

                if let Some(answers) = tables.cache.get(text) {
                    if let Some(ans) = answers.get(prompt) {
                        if !ans.is_empty() {
                            return Ok(ans.clone());
                        }
                    }
                }

                if let Some(inflight) = tables.inflight.get(text) {
                    let batch = Arc::clone(inflight);
                    let included = batch.inner.lock().prompts.contains_key(prompt);
                    Wait::Inflight { batch, included }
                } else {
                    let batch = match tables.batches.get(text) {
                        Some(batch) => Arc::clone(batch),
                        None => {
                            let batch = FusedBatch::new();
                            tables.batches.insert(text.to_string(), Arc::clone(&batch));
                            self.arm_flush_timer(text.to_string());
                            batch
                        }
                    };

                    let mut inner = batch.inner.lock();
                    if inner.frozen {
                        drop(inner);
                        Wait::Refrozen(batch)
                    } else {
                        if !inner.prompts.contains_key(prompt) {
                            inner.prompts.insert(prompt.to_string(), String::new());
                            inner.order.push(prompt.to_string());
                        }
                        drop(inner);
                        Wait::Joined(batch)
                    }
                }
            };
            // the table lock is released before any wait

            match wait {
                Wait::Joined(batch) => {
                    batch.wait_done().await;
                    return batch.answer_for(prompt);
                }
                Wait::Inflight { batch, included } => {
                    batch.wait_done().await;
                    if included {
                        return batch.answer_for(prompt);
                    }
                    // not part of that batch; attach to the next collecting one
                }
                Wait::Refrozen(batch) => {
                    batch.wait_done().await;
                }
            }
        }
    }

    fn arm_flush_timer(&self, text: String) {
        let window = self.opts.fuse_delay + self.opts.fuse_grace;
        let Some(dispatcher) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            sleep(window).await;
            dispatcher.flush_text(&text).await;
        });
    }

    async fn flush_text(&self, text: &str) {
        let batch = {
            let mut tables = self.tables.lock();
            match tables.batches.remove(text) {
                Some(batch) => {
                    tables.inflight.insert(text.to_string(), Arc::clone(&batch));
                    batch
                }
                None => return,
            }
        };

        let prompt_list = {
            let mut inner = batch.inner.lock();
            inner.frozen = true;
            inner.order.clone()
        };

        if prompt_list.is_empty() {
            self.remove_inflight(text);
            batch.signal_done();
            return;
        }

        let fused_prompt = prompt_list.join(&self.opts.separator);

        if let Some(tx) = &self.work_tx {
            let item = FusedWorkItem {
                text: text.to_string(),
                prompt_list,
                fused_prompt,
                batch,
            };
            if let Err(send_err) = tx.send(item).await {
                // fail the batch rather than strand its waiters
                let item = send_err.0;
                self.fail_batch(
                    &item.text,
                    &item.batch,
                    LlmError::Config {
                        message: "multi worker is not running".to_string(),
                    },
                );
            }
            return;
        }

        debug!(text, prompts = prompt_list.len(), "flushing fused batch");
        let outcome = self.run_single_fused(text, &fused_prompt).await;
        self.finish_single(text, &batch, &prompt_list, outcome);
    }

    fn finish_single(
        &self,
        text: &str,
        batch: &Arc<FusedBatch>,
        prompt_list: &[String],
        outcome: Result<String>,
    ) {
        let raw = match outcome {
            Ok(raw) => raw,
            Err(err) => {
                self.fail_batch(text, batch, err);
                return;
            }
        };

        let parts = split_fused(&raw, &self.opts.separator);
        if parts.len() != prompt_list.len() {
            self.fail_batch_with_diag(
                text,
                batch,
                LlmError::Parse {
                    got: parts.len(),
                    want: prompt_list.len(),
                    unit: "parts",
                },
                format!(
                    "PARSE_MISMATCH want={} got={} raw={}",
                    prompt_list.len(),
                    parts.len(),
                    raw
                ),
            );
            return;
        }

        self.complete_batch(text, batch, prompt_list, &parts);
    }

    // fill answers, cache the non-empty ones, retire the batch, signal
    fn complete_batch(
        &self,
        text: &str,
        batch: &Arc<FusedBatch>,
        prompt_list: &[String],
        parts: &[String],
    ) {
        {
            let mut inner = batch.inner.lock();
            for (prompt, answer) in prompt_list.iter().zip(parts.iter()) {
                inner.prompts.insert(prompt.clone(), answer.clone());
            }
            inner.err = None;
        }

        {
            let mut tables = self.tables.lock();
            let cached = tables.cache.entry(text.to_string()).or_default();
            let inner = batch.inner.lock();
            for (prompt, answer) in inner.prompts.iter() {
                if !answer.is_empty() {
                    cached.insert(prompt.clone(), answer.clone());
                }
            }
            drop(inner);
            tables.inflight.remove(text);
        }

        batch.signal_done();
    }

    fn fail_batch(&self, text: &str, batch: &Arc<FusedBatch>, err: LlmError) {
        let diag = format!("ERR:{err}");
        self.fail_batch_with_diag(text, batch, err, diag);
    }

    fn fail_batch_with_diag(
        &self,
        text: &str,
        batch: &Arc<FusedBatch>,
        err: LlmError,
        diag: String,
    ) {
        warn!(text, %err, "fused batch failed");
        {
            let mut inner = batch.inner.lock();
            if self.opts.debug {
                for answer in inner.prompts.values_mut() {
                    *answer = diag.clone();
                }
                inner.err = None;
            } else {
                inner.err = Some(err);
            }
        }
        self.remove_inflight(text);
        batch.signal_done();
    }

    fn remove_inflight(&self, text: &str) {
        self.tables.lock().inflight.remove(text);
    }

    async fn run_single_fused(&self, text: &str, fused_prompt: &str) -> Result<String> {
        if let Some(pacer) = &self.pacer {
            pacer.acquire(self.opts.max_wait).await?;
        }

        // keep this short to hold down token overhead
        let payload = format!(
            "Return machine-parseable output.\n\
             TEXT:{text}\n\
             INSTRUCTIONS:{fused_prompt}\n\
             Return answers ONLY, in order, separated by \"{sep}\". No newlines.",
            sep = self.opts.separator
        );

        self.timed_call(&payload).await
    }

    async fn timed_call(&self, payload: &str) -> Result<String> {
        let started = Instant::now();
        let res = match timeout(self.opts.max_wait, self.client.run("", payload)).await {
            Ok(res) => res,
            Err(_) => Err(LlmError::Deadline {
                message: format!("fused request timed out after {:?}", self.opts.max_wait),
            }),
        };
        metrics::record_upstream_request(started.elapsed());
        res
    }

    async fn multi_worker(self: Arc<Self>, mut rx: mpsc::Receiver<FusedWorkItem>) {
        while let Some(first) = rx.recv().await {
            let mut items = vec![first];
            let deadline = tokio::time::Instant::now() + self.opts.multi_batch_wait;
            while items.len() < self.opts.multi_max_texts {
                match timeout_at(deadline, rx.recv()).await {
                    Ok(Some(item)) => items.push(item),
                    Ok(None) | Err(_) => break,
                }
            }
            self.run_multi_batch(items).await;
        }
    }

    async fn run_multi_batch(&self, items: Vec<FusedWorkItem>) {
        if items.is_empty() {
            return;
        }

        let want_n = items[0].prompt_list.len();
        if items.iter().any(|item| item.prompt_list.len() != want_n) {
            // mixed shapes cannot share one response grid
            for item in &items {
                let outcome = self.run_single_fused(&item.text, &item.fused_prompt).await;
                self.finish_single(&item.text, &item.batch, &item.prompt_list, outcome);
            }
            return;
        }

        debug!(items = items.len(), prompts = want_n, "running multi-text batch");

        let mut payload = String::with_capacity(256 * items.len());
        payload.push_str("Return machine-parseable output.\n");
        payload.push_str("For each item below, output EXACTLY ONE line.\n");
        payload.push_str(&format!(
            "Each line must contain exactly {want_n} answers separated by '{}'. \
             No extra text. No blank lines.\n\n",
            self.opts.separator
        ));
        for (i, item) in items.iter().enumerate() {
            payload.push_str(&format!(
                "ITEM {i}\nTEXT:{}\nINSTRUCTIONS:{}\n\n",
                item.text, item.fused_prompt
            ));
        }

        let outcome = self.timed_call(&payload).await;

        let raw = match outcome {
            Ok(raw) if !raw.trim().is_empty() => raw,
            Ok(_) => {
                let err = LlmError::Upstream {
                    location: "multi_batch",
                    message: "empty response".to_string(),
                };
                for item in &items {
                    self.fail_batch(&item.text, &item.batch, err.clone());
                }
                return;
            }
            Err(err) => {
                for item in &items {
                    self.fail_batch(&item.text, &item.batch, err.clone());
                }
                return;
            }
        };

        let lines = split_lines(&raw);
        if lines.len() != items.len() {
            let err = LlmError::Parse {
                got: lines.len(),
                want: items.len(),
                unit: "lines",
            };
            for item in &items {
                self.fail_batch_with_diag(
                    &item.text,
                    &item.batch,
                    err.clone(),
                    format!("lines={} raw={}", lines.len(), raw),
                );
            }
            return;
        }

        for (item, line) in items.iter().zip(lines.iter()) {
            let parts = split_fused(line, &self.opts.separator);
            if parts.len() != item.prompt_list.len() {
                self.fail_batch_with_diag(
                    &item.text,
                    &item.batch,
                    LlmError::Parse {
                        got: parts.len(),
                        want: item.prompt_list.len(),
                        unit: "parts",
                    },
                    format!("got={} raw={}", parts.len(), line),
                );
                continue;
            }
            self.complete_batch(&item.text, &item.batch, &item.prompt_list, &parts);
        }
    }
}

// split one response line into trimmed, non-empty parts
fn split_fused(raw: &str, sep: &str) -> Vec<String> {
    raw.trim()
        .split(sep)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

// trimmed, non-empty lines
fn split_lines(raw: &str) -> Vec<String> {
    raw.replace('\r', "")
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
