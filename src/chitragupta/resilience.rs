//! Resilience wrappers for provider streams.
//!
//! Four composable pieces — [`RetryPolicy`], [`CircuitBreaker`],
//! [`RateLimiter`], and [`RequestQueue`] — plus [`resilient_stream`], which
//! stacks them in front of a [`Provider`]: rate-limit admission, then the
//! circuit gate, then the retry wrapper, then the provider stream itself.
//! Terminal stream failures feed back into the circuit; a successful `Done`
//! closes it.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chitragupta::chitragupta::clock::system_clock;
//! use chitragupta::chitragupta::provider::{CancellationToken, ChatRequest, Provider};
//! use chitragupta::chitragupta::resilience::{resilient_stream, CircuitBreaker, RetryPolicy};
//!
//! # async fn demo(provider: Arc<dyn Provider>) -> Result<(), Box<dyn std::error::Error>> {
//! let breaker = Arc::new(CircuitBreaker::new(5, 30_000, system_clock()));
//! let stream = resilient_stream(
//!     provider,
//!     &ChatRequest::default(),
//!     CancellationToken::new(),
//!     &RetryPolicy::default(),
//!     breaker,
//!     None,
//! )
//! .await?;
//! # let _ = stream;
//! # Ok(())
//! # }
//! ```

use crate::chitragupta::clock::Clock;
use crate::chitragupta::provider::{
    CancellationToken, ChatRequest, EventStream, Provider, ProviderError, ProviderErrorKind,
    StreamEvent,
};
use futures_util::stream::{self, StreamExt};
use std::collections::BinaryHeap;
use std::cmp::Ordering as CmpOrdering;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Exponential backoff with jitter and an explicit `retry-after` override.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Base delay before the first retry.
    pub base_delay_ms: u64,
    /// Cap applied to the exponential delay.
    pub max_delay_ms: u64,
    /// Fraction of the delay added as random jitter (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_base_delay_ms(mut self, ms: u64) -> Self {
        self.base_delay_ms = ms;
        self
    }

    pub fn with_max_delay_ms(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }

    pub fn with_jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (0-based).
    ///
    /// An explicit `retry_after_ms` from the provider wins over the
    /// computed backoff, clamped to the configured cap.
    pub fn delay_for(&self, attempt: u32, retry_after_ms: Option<u64>) -> Duration {
        if let Some(ra) = retry_after_ms {
            return Duration::from_millis(ra.min(self.max_delay_ms));
        }
        let exponential = (self.base_delay_ms as f64) * 2f64.powi(attempt as i32);
        let capped = exponential.min(self.max_delay_ms as f64);
        let jitter = rand::random::<f64>() * capped * self.jitter_factor;
        Duration::from_millis((capped + jitter) as u64)
    }
}

/// Circuit breaker state as observed by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at_ms: u64,
    trial_in_flight: bool,
}

/// Consecutive-failure circuit breaker with a single half-open trial.
///
/// Closed → Open after `failure_threshold` consecutive failures; Open →
/// HalfOpen after `open_timeout_ms`; the one trial call in HalfOpen closes
/// the circuit on success and reopens it on failure.
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_timeout_ms: u64,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_timeout_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            open_timeout_ms,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at_ms: 0,
                trial_in_flight: false,
            }),
        }
    }

    /// Ask to pass the gate. Returns `false` while the circuit is open and
    /// the timeout has not elapsed, or while a half-open trial is already
    /// in flight.
    pub fn try_acquire(&self) -> bool {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if now.saturating_sub(inner.opened_at_ms) >= self.open_timeout_ms {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;
    }

    pub fn record_failure(&self) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at_ms = now;
                inner.trial_in_flight = false;
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at_ms = now;
                    log::warn!(
                        "circuit opened after {} consecutive failures",
                        inner.consecutive_failures
                    );
                }
            }
            CircuitState::Open => {
                inner.opened_at_ms = now;
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }
}

/// Error surfaced by [`RateLimiter::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// The wait queue is at capacity; the caller should not retry internally.
    QueueFull,
    /// More tokens were requested than the bucket can ever hold.
    RequestTooLarge,
    /// The cancellation token fired while waiting.
    Cancelled,
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::QueueFull => write!(f, "rate limiter wait queue is full"),
            RateLimitError::RequestTooLarge => {
                write!(f, "requested more tokens than bucket capacity")
            }
            RateLimitError::Cancelled => write!(f, "rate limiter wait was cancelled"),
        }
    }
}

impl Error for RateLimitError {}

struct Waiter {
    priority: u8,
    seq: u64,
    tokens: f64,
    tx: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Waiter {}
impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then FIFO by sequence.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct BucketInner {
    tokens: f64,
    last_refill_ms: u64,
    waiters: BinaryHeap<Waiter>,
}

/// Token-bucket rate limiter with a priority-ordered wait queue.
///
/// `acquire(n, priority)` suspends until `n` tokens are available; waiters
/// are granted highest-priority first, FIFO within a priority level.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    max_queue: usize,
    clock: Arc<dyn Clock>,
    seq: AtomicU64,
    inner: Mutex<BucketInner>,
}

impl RateLimiter {
    pub fn new(capacity: f64, refill_per_sec: f64, max_queue: usize, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_ms();
        Self {
            capacity: capacity.max(0.0),
            refill_per_sec: refill_per_sec.max(0.0),
            max_queue,
            clock,
            seq: AtomicU64::new(0),
            inner: Mutex::new(BucketInner {
                tokens: capacity.max(0.0),
                last_refill_ms: now,
                waiters: BinaryHeap::new(),
            }),
        }
    }

    fn refill(&self, inner: &mut BucketInner) {
        let now = self.clock.now_ms();
        let elapsed_ms = now.saturating_sub(inner.last_refill_ms);
        if elapsed_ms > 0 {
            inner.tokens =
                (inner.tokens + self.refill_per_sec * (elapsed_ms as f64) / 1000.0).min(self.capacity);
            inner.last_refill_ms = now;
        }
    }

    /// Wake every waiter that can be satisfied, highest priority first.
    fn pump(&self, inner: &mut BucketInner) {
        while let Some(top) = inner.waiters.peek() {
            if inner.tokens < top.tokens {
                break;
            }
            let waiter = inner.waiters.pop().unwrap();
            inner.tokens -= waiter.tokens;
            // A dropped receiver means the waiter gave up; return its tokens.
            if waiter.tx.send(()).is_err() {
                inner.tokens += waiter.tokens;
            }
        }
    }

    /// Take `n` tokens immediately if available and no waiter is queued.
    pub fn try_acquire(&self, n: f64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        self.refill(&mut inner);
        if inner.waiters.is_empty() && inner.tokens >= n {
            inner.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Suspend until `n` tokens are available.
    pub async fn acquire(
        &self,
        n: f64,
        priority: u8,
        cancel: &CancellationToken,
    ) -> Result<(), RateLimitError> {
        if n > self.capacity {
            return Err(RateLimitError::RequestTooLarge);
        }
        let rx = {
            let mut inner = self.inner.lock().unwrap();
            self.refill(&mut inner);
            if inner.waiters.is_empty() && inner.tokens >= n {
                inner.tokens -= n;
                return Ok(());
            }
            if inner.waiters.len() >= self.max_queue {
                return Err(RateLimitError::QueueFull);
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push(Waiter {
                priority,
                seq: self.seq.fetch_add(1, Ordering::SeqCst),
                tokens: n,
                tx,
            });
            rx
        };

        // Poll-and-pump loop: the bucket has no background task, so waiters
        // drive refills while they sleep.
        let mut rx = rx;
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                self.refill(&mut inner);
                self.pump(&mut inner);
            }
            tokio::select! {
                granted = &mut rx => {
                    return granted.map_err(|_| RateLimitError::Cancelled);
                }
                _ = cancel.cancelled() => {
                    return Err(RateLimitError::Cancelled);
                }
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
        }
    }

    /// Tokens currently in the bucket (after refill accounting).
    pub fn available(&self) -> f64 {
        let mut inner = self.inner.lock().unwrap();
        self.refill(&mut inner);
        inner.tokens
    }
}

struct QueueInner {
    running: usize,
    waiters: BinaryHeap<SlotWaiter>,
}

struct SlotWaiter {
    priority: u8,
    seq: u64,
    tx: oneshot::Sender<()>,
}

impl PartialEq for SlotWaiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for SlotWaiter {}
impl PartialOrd for SlotWaiter {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for SlotWaiter {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Ordered processing with bounded concurrency and priorities.
///
/// Used for dispatching resilient streams: `acquire` suspends until one of
/// the `max_concurrent` slots frees up, granting higher-priority requests
/// first.
pub struct RequestQueue {
    max_concurrent: usize,
    seq: AtomicU64,
    inner: Arc<Mutex<QueueInner>>,
}

/// RAII permit returned by [`RequestQueue::acquire`]; releases its slot on
/// drop.
pub struct QueuePermit {
    inner: Arc<Mutex<QueueInner>>,
}

impl Drop for QueuePermit {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        inner.running = inner.running.saturating_sub(1);
        // Hand the freed slot to the next live waiter.
        while let Some(waiter) = inner.waiters.pop() {
            if waiter.tx.send(()).is_ok() {
                inner.running += 1;
                break;
            }
        }
    }
}

impl RequestQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            seq: AtomicU64::new(0),
            inner: Arc::new(Mutex::new(QueueInner {
                running: 0,
                waiters: BinaryHeap::new(),
            })),
        }
    }

    /// Wait for a free slot. The returned permit frees the slot on drop.
    pub async fn acquire(&self, priority: u8) -> QueuePermit {
        let rx = {
            let mut inner = self.inner.lock().unwrap();
            if inner.running < self.max_concurrent {
                inner.running += 1;
                return QueuePermit {
                    inner: Arc::clone(&self.inner),
                };
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push(SlotWaiter {
                priority,
                seq: self.seq.fetch_add(1, Ordering::SeqCst),
                tx,
            });
            rx
        };
        // A dropped sender can only happen if the queue itself is dropped.
        let _ = rx.await;
        QueuePermit {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn running(&self) -> usize {
        self.inner.lock().unwrap().running
    }

    pub fn queued(&self) -> usize {
        self.inner.lock().unwrap().waiters.len()
    }
}

/// Open a provider stream behind the full resilience stack.
///
/// Composition order: rate-limit admission → circuit gate → retry wrapper →
/// `provider.stream()`. The returned stream reports its terminal event back
/// into the breaker: `Done` closes it, `Error` counts a failure.
///
/// Retryable failures (timeouts, 429s, 5xx, connection resets) observed
/// either when opening the stream or as the *first* event are retried with
/// backoff, honoring an explicit `retry-after` when the provider sent one.
/// Once any payload event has been delivered the stream is committed and
/// failures surface to the consumer instead.
pub async fn resilient_stream(
    provider: Arc<dyn Provider>,
    request: &ChatRequest,
    cancel: CancellationToken,
    retry: &RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    limiter: Option<Arc<RateLimiter>>,
) -> Result<EventStream, ProviderError> {
    if let Some(limiter) = &limiter {
        limiter.acquire(1.0, 0, &cancel).await.map_err(|e| match e {
            RateLimitError::Cancelled => {
                ProviderError::new(ProviderErrorKind::Aborted, "cancelled while rate limited")
            }
            other => ProviderError::new(ProviderErrorKind::Other, other.to_string()),
        })?;
    }

    if !breaker.try_acquire() {
        return Err(ProviderError::new(
            ProviderErrorKind::Other,
            "circuit breaker is open",
        ));
    }

    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(ProviderError::new(
                ProviderErrorKind::Aborted,
                "stream cancelled before start",
            ));
        }

        let outcome = match provider.stream(request, cancel.clone()).await {
            Ok(mut stream) => match stream.next().await {
                Some(StreamEvent::Error { error }) => Err(error),
                Some(first) => Ok((first, stream)),
                None => Err(ProviderError::new(
                    ProviderErrorKind::Connection,
                    "stream closed before any event",
                )),
            },
            Err(error) => Err(error),
        };

        match outcome {
            Ok((first, rest)) => {
                let breaker_hook = Arc::clone(&breaker);
                let wrapped = stream::once(async move { first })
                    .chain(rest)
                    .map(move |event| {
                        match &event {
                            StreamEvent::Done { .. } => breaker_hook.record_success(),
                            StreamEvent::Error { .. } => breaker_hook.record_failure(),
                            _ => {}
                        }
                        event
                    });
                return Ok(Box::pin(wrapped));
            }
            Err(error) => {
                breaker.record_failure();
                if error.is_retryable() && attempt < retry.max_retries {
                    let delay = retry.delay_for(attempt, error.retry_after_ms);
                    log::debug!(
                        "retrying provider stream after {:?} (attempt {}): {}",
                        delay,
                        attempt + 1,
                        error
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return Err(ProviderError::new(
                                ProviderErrorKind::Aborted,
                                "cancelled during retry backoff",
                            ));
                        }
                    }
                    if !breaker.try_acquire() {
                        return Err(ProviderError::new(
                            ProviderErrorKind::Other,
                            "circuit breaker is open",
                        ));
                    }
                    continue;
                }
                return Err(error);
            }
        }
    }
}

/// A [`Provider`] wrapper that applies the full resilience stack to every
/// stream. Register it in the provider registry in place of the raw
/// provider and the agent loop gets retries, circuit breaking, and rate
/// limiting for free.
pub struct ResilientProvider {
    inner: Arc<dyn Provider>,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    limiter: Option<Arc<RateLimiter>>,
}

impl ResilientProvider {
    pub fn new(inner: Arc<dyn Provider>, retry: RetryPolicy, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            inner,
            retry,
            breaker,
            limiter: None,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }
}

#[async_trait::async_trait]
impl Provider for ResilientProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn stream(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream, ProviderError> {
        resilient_stream(
            Arc::clone(&self.inner),
            request,
            cancel,
            &self.retry,
            Arc::clone(&self.breaker),
            self.limiter.clone(),
        )
        .await
    }
}
