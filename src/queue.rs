//! Serialized, rate-limited access to the description provider.
//!
//! One worker task drains a FIFO channel. It keeps at most one provider call
//! in flight, pauses while the token window is over its cooldown threshold,
//! and backs off on rate-limit errors. Every enqueued descriptor resolves to
//! exactly one string, whatever happens to the provider.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, info, warn};

use crate::config::{NarratorConfig, RateLimitConfig};
use crate::formatter::{CommentaryFormatter, CommentaryHistory, fallback_description};
use crate::provider::{DescriptionProvider, OpenAiRateLimitPolicy, RateLimitPolicy};
use crate::rate_limit::{RateLimiter, estimate_tokens};
use crate::scene::SceneDescriptor;

pub const RATE_LIMITED_MESSAGE: &str = "Commentary is temporarily rate limited, please try again shortly.";

/// Description for a descriptor that never needs the provider: an analysis
/// failure message, or the templated fallback.
pub fn local_description(descriptor: &SceneDescriptor) -> String {
    match &descriptor.error {
        Some(error) => format!("Scene analysis unavailable: {}", error),
        None => fallback_description(descriptor),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    pub enqueued: u64,
    /// Enqueues turned away after `close()`
    pub refused: u64,
    /// Provider calls, retries included
    pub dispatched: u64,
    pub succeeded: u64,
    /// Tasks resolved with a local description
    pub degraded: u64,
    /// Tasks that ran out of retries
    pub rate_limited: u64,
    pub backoff_waits: u64,
    pub cooldowns: u64,
    pub tokens_used: u32,
    pub current_backoff: Duration,
}

struct QueueTask {
    descriptor: SceneDescriptor,
    respond: oneshot::Sender<String>,
    retry_count: u32,
    enqueued_at: Instant,
}

enum Command {
    Describe(QueueTask),
    Shutdown,
}

struct SharedState {
    limiter: RateLimiter,
    history: CommentaryHistory,
    stats: QueueStats,
}

/// Cloneable handle to the description worker.
#[derive(Clone)]
pub struct DescriptionQueue {
    sender: mpsc::UnboundedSender<Command>,
    closed: Arc<AtomicBool>,
    shared: Arc<Mutex<SharedState>>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl DescriptionQueue {
    /// Spawns the worker on the current tokio runtime. A `None` provider
    /// resolves every task with the local fallback without any network use.
    pub fn from_config(config: &NarratorConfig, provider: Option<Arc<dyn DescriptionProvider>>) -> Self {
        Self::spawn(
            &config.rate_limit,
            CommentaryFormatter::from_config(&config.commentary),
            config.commentary.history_size,
            provider,
            Arc::new(OpenAiRateLimitPolicy),
        )
    }

    pub fn spawn(
        rate_limit: &RateLimitConfig,
        formatter: CommentaryFormatter,
        history_size: usize,
        provider: Option<Arc<dyn DescriptionProvider>>,
        policy: Arc<dyn RateLimitPolicy>,
    ) -> Self {
        let limiter = RateLimiter::new(rate_limit, Instant::now());
        let shared = Arc::new(Mutex::new(SharedState {
            stats: QueueStats {
                current_backoff: limiter.backoff(),
                ..Default::default()
            },
            limiter,
            history: CommentaryHistory::new(history_size),
        }));

        match &provider {
            Some(provider) => info!("📝 Description queue using provider: {}", provider.name()),
            None => info!("📝 No description provider configured, using local descriptions only"),
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = Worker {
            receiver,
            provider,
            policy,
            formatter,
            shared: Arc::clone(&shared),
            max_retries: rate_limit.max_retries,
            min_spacing: Duration::from_millis(rate_limit.min_spacing_ms),
            last_dispatch: None,
        };
        let handle = tokio::spawn(worker.run());

        Self {
            sender,
            closed: Arc::new(AtomicBool::new(false)),
            shared,
            worker: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Queues a descriptor and returns a future for its description.
    ///
    /// The task joins the queue when this is called, not when the future is
    /// first polled, so call order is dispatch order. The future never fails:
    /// if the queue is closed or the worker is gone it yields the local
    /// description instead.
    pub fn enqueue(&self, descriptor: SceneDescriptor) -> impl Future<Output = String> + Send + 'static {
        let fallback = local_description(&descriptor);

        let receiver = if self.closed.load(Ordering::SeqCst) {
            debug!("Description queue is closed, answering locally");
            self.shared.lock().stats.refused += 1;
            None
        } else {
            let (respond, receiver) = oneshot::channel();
            let task = QueueTask {
                descriptor,
                respond,
                retry_count: 0,
                enqueued_at: Instant::now(),
            };
            self.shared.lock().stats.enqueued += 1;
            self.sender.send(Command::Describe(task)).ok().map(|_| receiver)
        };

        async move {
            match receiver {
                Some(receiver) => receiver.await.unwrap_or(fallback),
                None => fallback,
            }
        }
    }

    /// Stops accepting new work. Tasks already queued still drain.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("🛑 Closing description queue");
            let _ = self.sender.send(Command::Shutdown);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Waits for the worker to exit. Only returns after `close()`, or once
    /// every handle has been dropped.
    pub async fn join(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Description queue worker ended abnormally: {}", e);
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        let shared = self.shared.lock();
        QueueStats {
            tokens_used: shared.limiter.tokens_used(),
            current_backoff: shared.limiter.backoff(),
            ..shared.stats.clone()
        }
    }

    /// Model descriptions recorded so far, oldest first.
    pub fn history(&self) -> Vec<String> {
        self.shared.lock().history.entries().cloned().collect()
    }
}

struct Worker {
    receiver: mpsc::UnboundedReceiver<Command>,
    provider: Option<Arc<dyn DescriptionProvider>>,
    policy: Arc<dyn RateLimitPolicy>,
    formatter: CommentaryFormatter,
    shared: Arc<Mutex<SharedState>>,
    max_retries: u32,
    min_spacing: Duration,
    last_dispatch: Option<Instant>,
}

impl Worker {
    async fn run(mut self) {
        while let Some(command) = self.receiver.recv().await {
            match command {
                Command::Describe(mut task) => {
                    let description = self.resolve(&mut task).await;
                    debug!(
                        waited_ms = task.enqueued_at.elapsed().as_millis() as u64,
                        "Description task resolved"
                    );
                    // The caller may have stopped listening.
                    let _ = task.respond.send(description);
                }
                Command::Shutdown => break,
            }
        }
        debug!("Description queue worker stopped");
    }

    async fn resolve(&mut self, task: &mut QueueTask) -> String {
        if let Some(error) = &task.descriptor.error {
            warn!("Scene analysis failed upstream: {}", error);
            self.shared.lock().stats.degraded += 1;
            return local_description(&task.descriptor);
        }

        let Some(provider) = self.provider.clone() else {
            self.shared.lock().stats.degraded += 1;
            return fallback_description(&task.descriptor);
        };

        let request = {
            let shared = self.shared.lock();
            self.formatter.build_request(&task.descriptor, &shared.history)
        };
        let prompt_tokens = request.estimated_tokens();

        loop {
            self.wait_for_budget().await;
            self.wait_for_spacing().await;

            {
                let mut shared = self.shared.lock();
                shared.limiter.record_usage(prompt_tokens);
                shared.stats.dispatched += 1;
            }
            self.last_dispatch = Some(Instant::now());
            debug!(retry = task.retry_count, prompt_tokens, "📤 Dispatching description request");

            match provider.describe(&request).await {
                Ok(completion) => {
                    let used = completion
                        .completion_tokens
                        .unwrap_or_else(|| estimate_tokens(&completion.text));
                    let mut shared = self.shared.lock();
                    shared.limiter.record_usage(used);
                    shared.limiter.relax_backoff();
                    shared.history.push(completion.text.clone());
                    shared.stats.succeeded += 1;
                    debug!(tokens_used = shared.limiter.tokens_used(), "✅ Description received");
                    return completion.text;
                }
                Err(e) if self.policy.is_rate_limit_error(&e) => {
                    if task.retry_count >= self.max_retries {
                        warn!(retry = task.retry_count, "Rate limited after all retries, giving up: {}", e);
                        self.shared.lock().stats.rate_limited += 1;
                        return RATE_LIMITED_MESSAGE.to_string();
                    }

                    let delay = {
                        let mut shared = self.shared.lock();
                        shared.stats.backoff_waits += 1;
                        shared.limiter.escalate_backoff()
                    };
                    task.retry_count += 1;
                    info!(
                        retry = task.retry_count,
                        backoff_ms = delay.as_millis() as u64,
                        "⏳ Provider rate limited, backing off"
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    warn!("Description request failed, using local description: {}", e);
                    self.shared.lock().stats.degraded += 1;
                    return fallback_description(&task.descriptor);
                }
            }
        }
    }

    /// Sleeps through rate windows until usage is back under the threshold.
    async fn wait_for_budget(&mut self) {
        loop {
            let reset_at = {
                let mut shared = self.shared.lock();
                shared.limiter.roll_window(Instant::now());
                if !shared.limiter.is_cooling_down() {
                    return;
                }
                shared.stats.cooldowns += 1;
                info!(
                    tokens_used = shared.limiter.tokens_used(),
                    budget = shared.limiter.budget(),
                    "❄️ Token budget nearly spent, cooling down until the window resets"
                );
                shared.limiter.next_reset()
            };
            sleep_until(reset_at).await;
        }
    }

    async fn wait_for_spacing(&self) {
        if let Some(last) = self.last_dispatch {
            let ready_at = last + self.min_spacing;
            if ready_at > Instant::now() {
                sleep_until(ready_at).await;
            }
        }
    }
}
