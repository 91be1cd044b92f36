//! Mock upstream adapters for dispatcher tests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::time::sleep;

use crate::client::{BatchCall, SingleCall};
use crate::error::Result;
use crate::models::BatchItem;

type SingleRespond = dyn Fn(String, String) -> BoxFuture<'static, Result<String>> + Send + Sync;

pub struct MockSingle {
    calls: AtomicUsize,
    seen: Mutex<Vec<(String, String)>>,
    respond: Box<SingleRespond>,
}

impl MockSingle {
    pub fn new(
        respond: impl Fn(&str, &str) -> Result<String> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::build(Box::new(move |text, prompt| {
            let out = respond(&text, &prompt);
            Box::pin(async move { out })
        }))
    }

    pub fn with_delay(
        delay: Duration,
        respond: impl Fn(&str, &str) -> Result<String> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::build(Box::new(move |text, prompt| {
            let out = respond(&text, &prompt);
            Box::pin(async move {
                sleep(delay).await;
                out
            })
        }))
    }

    pub fn new_async<F, Fut>(respond: F) -> Arc<Self>
    where
        F: Fn(String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        Self::build(Box::new(move |text, prompt| Box::pin(respond(text, prompt))))
    }

    fn build(respond: Box<SingleRespond>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            respond,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<(String, String)> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl SingleCall for MockSingle {
    async fn run(&self, text: &str, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .push((text.to_string(), prompt.to_string()));
        (self.respond)(text.to_string(), prompt.to_string()).await
    }
}

type BatchRespond = dyn Fn(&[BatchItem]) -> Result<HashMap<String, String>> + Send + Sync;

pub struct MockBatch {
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<BatchItem>>>,
    delay: Duration,
    respond: Box<BatchRespond>,
}

impl MockBatch {
    pub fn new(
        respond: impl Fn(&[BatchItem]) -> Result<HashMap<String, String>> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::with_delay(Duration::ZERO, respond)
    }

    pub fn with_delay(
        delay: Duration,
        respond: impl Fn(&[BatchItem]) -> Result<HashMap<String, String>> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            delay,
            respond: Box::new(respond),
        })
    }

    /// Answers every item with "text/prompt".
    pub fn echo() -> Arc<Self> {
        Self::new(|items| {
            Ok(items
                .iter()
                .map(|item| {
                    (
                        item.custom_id.clone(),
                        format!("{}/{}", item.text, item.prompt),
                    )
                })
                .collect())
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<Vec<BatchItem>> {
        self.seen.lock().clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.seen.lock().iter().map(|batch| batch.len()).collect()
    }
}

#[async_trait]
impl BatchCall for MockBatch {
    async fn run_message_batch(
        &self,
        items: Vec<BatchItem>,
        _poll_every: Duration,
        _poll_timeout: Duration,
    ) -> Result<HashMap<String, String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(items.clone());
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        (self.respond)(&items)
    }
}
