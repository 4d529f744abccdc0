//! Sticky-proxy worker pool
//!
//! Items are spread over `concurrency` worker slots by index, so a slot keeps
//! reusing the same sticky proxy for the whole batch. A transient network
//! failure reports the proxy dead and retries the item once on a freshly
//! selected proxy. Every item ends with its own outcome; one failure never
//! aborts the batch.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{EgressError, Result};
use crate::proxy::descriptor::ProxyDescriptor;
use crate::proxy::selector::{ProxySelector, SelectOptions};
use crate::runner::classify::is_transient_message;
use crate::runner::limiter::ConcurrencyLimiter;

/// Cooperative cancellation shared between a caller and a running batch
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a handler gets for one attempt at one item
#[derive(Debug)]
pub struct WorkerContext<T> {
    pub worker_id: usize,
    /// 1 for the first try, 2 for the retry
    pub attempt: u32,
    pub proxy: Arc<ProxyDescriptor>,
    pub item: T,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub service: String,
    pub min: Option<usize>,
    pub max: Option<usize>,
    pub ttl: Option<Duration>,
    pub prefer_paid: bool,
    pub abort: Option<AbortFlag>,
}

impl RunOptions {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            min: None,
            max: None,
            ttl: None,
            prefer_paid: false,
            abort: None,
        }
    }

    fn is_aborted(&self) -> bool {
        self.abort.as_ref().map(AbortFlag::is_aborted).unwrap_or(false)
    }
}

/// Terminal result for one item
#[derive(Debug)]
pub struct ItemOutcome<R> {
    pub index: usize,
    pub worker_id: usize,
    /// Handler invocations made for this item
    pub attempts: u32,
    pub result: Result<R>,
}

impl<R> ItemOutcome<R> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct WorkerPool {
    selector: Arc<ProxySelector>,
    config: WorkerConfig,
    launches: ConcurrencyLimiter,
}

impl WorkerPool {
    pub fn new(selector: Arc<ProxySelector>, config: WorkerConfig) -> Self {
        let cap = config.autoconcurrency_cap.max(1);
        let launches = match config.queue_timeout {
            Some(timeout) => ConcurrencyLimiter::with_queue_timeout(cap, timeout),
            None => ConcurrencyLimiter::new(cap),
        };
        Self {
            selector,
            config,
            launches,
        }
    }

    /// Run `task` under the process-wide launch gate (for example a browser
    /// launch inside a handler). Waiting longer than the queue timeout fails
    /// with `QueueTimeout`.
    pub async fn launch<F: Future>(&self, task: F) -> Result<F::Output> {
        self.launches.run(task).await
    }

    pub fn concurrency_for(&self, options: &RunOptions) -> usize {
        self.config.derive_concurrency(options.min, options.max)
    }

    /// Run `handler` over every item with bounded concurrency.
    ///
    /// Outcomes come back in item order once every item has finished.
    pub async fn run_across_workers<T, R, E, F, Fut>(
        &self,
        items: Vec<T>,
        handler: F,
        options: RunOptions,
    ) -> Vec<ItemOutcome<R>>
    where
        T: Clone,
        F: Fn(WorkerContext<T>) -> Fut,
        Fut: Future<Output = std::result::Result<R, E>>,
        E: Display,
    {
        let concurrency = self.concurrency_for(&options);
        // Batch items wait on each other only, so their queue is unbounded in
        // time; a slot always frees once the item ahead of it finishes.
        let limiter = ConcurrencyLimiter::new(concurrency);

        let batch = Uuid::new_v4();
        let span = info_span!("batch", %batch, service = %options.service, items = items.len(), concurrency);

        async {
            info!("Starting batch");
            let runs = items.into_iter().enumerate().map(|(index, item)| {
                let worker_id = index % concurrency;
                let limiter = &limiter;
                let handler = &handler;
                let options = &options;
                async move {
                    let run = self.run_item(index, worker_id, item, handler, options);
                    match limiter.run(run).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            warn!(index, worker_id, "Item never started: {}", e);
                            ItemOutcome {
                                index,
                                worker_id,
                                attempts: 0,
                                result: Err(e),
                            }
                        }
                    }
                }
            });

            let outcomes = futures::future::join_all(runs).await;
            let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
            info!(succeeded = outcomes.len() - failed, failed, "Batch finished");
            outcomes
        }
        .instrument(span)
        .await
    }

    async fn run_item<T, R, E, F, Fut>(
        &self,
        index: usize,
        worker_id: usize,
        item: T,
        handler: &F,
        options: &RunOptions,
    ) -> ItemOutcome<R>
    where
        T: Clone,
        F: Fn(WorkerContext<T>) -> Fut,
        Fut: Future<Output = std::result::Result<R, E>>,
        E: Display,
    {
        let key = format!("{}:worker-{}", options.service, worker_id);
        let outcome = |attempts: u32, result: Result<R>| ItemOutcome {
            index,
            worker_id,
            attempts,
            result,
        };

        if options.is_aborted() {
            return outcome(0, Err(EgressError::Aborted));
        }

        let proxy = match self.select(&key, options).await {
            Ok(proxy) => proxy,
            Err(e) => return outcome(0, Err(e)),
        };

        let first = handler(WorkerContext {
            worker_id,
            attempt: 1,
            proxy: proxy.clone(),
            item: item.clone(),
        })
        .await;

        let message = match first {
            Ok(value) => return outcome(1, Ok(value)),
            Err(e) => e.to_string(),
        };

        if !is_transient_message(&message) {
            warn!(index, worker_id, "Item failed: {}", message);
            return outcome(1, Err(EgressError::Handler(message)));
        }

        warn!(
            index,
            worker_id,
            proxy = %proxy.kind(),
            "Transient failure, retrying on a fresh proxy: {}",
            message
        );
        self.selector.report_dead(&proxy, Some(&key));
        drop(proxy);

        if options.is_aborted() {
            return outcome(1, Err(EgressError::Aborted));
        }

        let proxy = match self.select(&key, options).await {
            Ok(proxy) => proxy,
            Err(e) => return outcome(1, Err(e)),
        };

        match handler(WorkerContext {
            worker_id,
            attempt: 2,
            proxy,
            item,
        })
        .await
        {
            Ok(value) => {
                debug!(index, worker_id, "Retry succeeded");
                outcome(2, Ok(value))
            }
            Err(e) => {
                let message = e.to_string();
                warn!(index, worker_id, "Retry failed: {}", message);
                outcome(2, Err(EgressError::Handler(message)))
            }
        }
    }

    async fn select(&self, key: &str, options: &RunOptions) -> Result<Arc<ProxyDescriptor>> {
        let select = SelectOptions {
            prefer_paid: options.prefer_paid,
            sticky: true,
            key: Some(key.to_string()),
            sticky_ttl: options.ttl,
            ..Default::default()
        };
        self.selector
            .select(&options.service, &select)
            .await
            .map(Arc::new)
    }
}
