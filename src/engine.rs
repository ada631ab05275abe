//! Background task engine: four priority bands, auto-scaling workers,
//! delayed and retryable tasks.
//!
//! The engine owns one [`MsQueue`] per [`Priority`] band and a pool of
//! dedicated OS worker threads. Workers drain bands highest-first; when
//! every band is empty they park on a condition variable with a bounded
//! timeout (100 ms) and are woken by the next submission. Delayed tasks are
//! plain re-enqueues — a task observed before its `scheduled_at` goes back
//! to its own band, there is deliberately no timer wheel here.
//!
//! Retries keep the task id and re-enter the band with an exponential
//! backoff delay; the retry, success, and failure continuations fire on the
//! worker that executed the attempt. Auto-scaling compares average queue
//! pressure against the configured thresholds and spawns or retires one
//! worker per decision, never more often than the cooldown allows.
//!
//! # Examples
//!
//! ```rust,no_run
//! use catzilla::engine::{EngineConfig, TaskEngine, TaskSpec};
//! use catzilla::queue::Priority;
//! use bytes::Bytes;
//!
//! let engine = TaskEngine::start(EngineConfig::default());
//! let id = engine.submit(
//!     TaskSpec::new(|payload: &Bytes| Ok(Bytes::from(payload.len().to_string())))
//!         .priority(Priority::High)
//!         .max_retries(2),
//! );
//! assert!(id.is_some());
//! engine.stop(true);
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::platform::{counter_add, now_ms, now_ns};
use crate::queue::{MsQueue, Priority, QueueStats};

/// Non-zero task identifier; retries keep it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Submitted, not yet runnable (delay pending) or waiting in a band.
    Pending = 0,
    /// `scheduled_at` reached; eligible for the next dequeue.
    Runnable = 1,
    /// Executing on a worker.
    Running = 2,
    /// Terminal: work function succeeded.
    Completed = 3,
    /// Terminal: retries exhausted.
    Failed = 4,
    /// Terminal: cancelled while pending.
    Cancelled = 5,
}

impl TaskState {
    fn from_u8(v: u8) -> TaskState {
        match v {
            0 => TaskState::Pending,
            1 => TaskState::Runnable,
            2 => TaskState::Running,
            3 => TaskState::Completed,
            4 => TaskState::Failed,
            _ => TaskState::Cancelled,
        }
    }
}

/// Failure reported by a task work function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// Host-defined error code handed to the failure continuation.
    pub code: i32,
    /// Short description.
    pub message: String,
}

impl TaskFailure {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Execution timing and retry accounting for one task.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecStats {
    /// Monotonic ns when the last attempt started.
    pub started_ns: u64,
    /// Monotonic ns when the task reached a terminal state.
    pub ended_ns: u64,
    /// Retries actually taken.
    pub retries_taken: u32,
}

type WorkFn = dyn Fn(&Bytes) -> Result<Bytes, TaskFailure> + Send + Sync;
type SuccessFn = dyn Fn(&Bytes, &Bytes) + Send + Sync;
type FailureFn = dyn Fn(&TaskFailure, &Bytes) + Send + Sync;
type RetryFn = dyn Fn(u32, &Bytes) + Send + Sync;

/// Everything needed to submit a task. Built fluently, consumed by
/// [`TaskEngine::submit`].
pub struct TaskSpec {
    work: Arc<WorkFn>,
    payload: Bytes,
    priority: Priority,
    delay: Duration,
    timeout: Duration,
    max_retries: u32,
    backoff_base: Duration,
    backoff_factor: f64,
    on_success: Option<Arc<SuccessFn>>,
    on_failure: Option<Arc<FailureFn>>,
    on_retry: Option<Arc<RetryFn>>,
}

impl TaskSpec {
    /// Wraps a work function. The function receives the payload and may be
    /// invoked once per attempt.
    pub fn new<F>(work: F) -> Self
    where
        F: Fn(&Bytes) -> Result<Bytes, TaskFailure> + Send + Sync + 'static,
    {
        Self {
            work: Arc::new(work),
            payload: Bytes::new(),
            priority: Priority::Normal,
            delay: Duration::ZERO,
            timeout: Duration::from_secs(300),
            max_retries: 0,
            backoff_base: Duration::from_millis(100),
            backoff_factor: 2.0,
            on_success: None,
            on_failure: None,
            on_retry: None,
        }
    }

    /// Opaque bytes handed to the work function and every continuation.
    pub fn payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    /// Target band. Defaults to [`Priority::Normal`].
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Initial scheduling delay.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Wall-clock budget for one attempt; overrun counts as a failure.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Retry budget. Zero means fail on the first error.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Backoff schedule: attempt `n` retries after `base * factor^n`.
    pub fn backoff(mut self, base: Duration, factor: f64) -> Self {
        self.backoff_base = base;
        self.backoff_factor = factor.max(1.0);
        self
    }

    /// Fired once with `(result_bytes, payload)` on completion.
    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&Bytes, &Bytes) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    /// Fired once with `(failure, payload)` when retries are exhausted.
    pub fn on_failure<F>(mut self, f: F) -> Self
    where
        F: Fn(&TaskFailure, &Bytes) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(f));
        self
    }

    /// Fired with `(attempt_number, payload)` before each retry re-enqueue.
    pub fn on_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, &Bytes) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(f));
        self
    }
}

/// Shared per-task record living in the engine registry until terminal.
struct TaskShared {
    state: AtomicU8,
    cancelled: AtomicBool,
    started_ns: AtomicU64,
    ended_ns: AtomicU64,
    retries_taken: AtomicU64,
}

impl TaskShared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(TaskState::Pending as u8),
            cancelled: AtomicBool::new(false),
            started_ns: AtomicU64::new(0),
            ended_ns: AtomicU64::new(0),
            retries_taken: AtomicU64::new(0),
        }
    }

    fn set_state(&self, s: TaskState) {
        self.state.store(s as u8, Ordering::Release);
    }
}

struct Task {
    id: TaskId,
    spec: TaskSpec,
    scheduled_at_ns: u64,
    retries_taken: u32,
    shared: Arc<TaskShared>,
}

/// Live view of a non-terminal task.
#[derive(Debug, Clone, Copy)]
pub struct TaskSnapshot {
    pub state: TaskState,
    pub stats: ExecStats,
}

/// Worker pool and scheduling parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub initial_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Soft capacity per priority band.
    pub queue_size: u64,
    pub enable_auto_scaling: bool,
    /// Average pressure above which one worker is added.
    pub scale_up_threshold: f64,
    /// Average pressure below which one worker is retired.
    pub scale_down_threshold: f64,
    /// Minimum spacing between scaling decisions.
    pub scale_cooldown: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_workers: 4,
            min_workers: 1,
            max_workers: 16,
            queue_size: 10_000,
            enable_auto_scaling: true,
            scale_up_threshold: 0.80,
            scale_down_threshold: 0.20,
            scale_cooldown: Duration::from_secs(30),
        }
    }
}

/// Engine-level counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub active_workers: usize,
    pub bands: [QueueStats; 4],
}

const PARK_TIMEOUT: Duration = Duration::from_millis(100);
/// Short park when the only resident tasks are scheduled in the future.
const DEFER_PARK: Duration = Duration::from_millis(5);

struct EngineInner {
    bands: [MsQueue<Task>; 4],
    registry: DashMap<u64, Arc<TaskShared>>,
    cfg: EngineConfig,
    shutdown: AtomicBool,
    park_lock: Mutex<()>,
    park_cond: Condvar,
    id_counter: AtomicU64,
    active_workers: AtomicUsize,
    stop_requests: AtomicUsize,
    last_scale_ms: AtomicU64,
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
}

impl EngineInner {
    fn next_id(&self) -> TaskId {
        let counter = self.id_counter.fetch_add(1, Ordering::Relaxed) & 0xFFFF;
        let id = (now_ns() << 16) ^ counter;
        TaskId(if id == 0 { 1 } else { id })
    }

    /// Average occupancy over capacity across the four bands.
    fn pressure(&self) -> f64 {
        if self.cfg.queue_size == 0 {
            return 0.0;
        }
        let total: u64 = self.bands.iter().map(|q| q.len()).sum();
        total as f64 / (self.cfg.queue_size * 4) as f64
    }

    fn wake_one(&self) {
        let _guard = self.park_lock.lock();
        self.park_cond.notify_one();
    }

    fn wake_all(&self) {
        let _guard = self.park_lock.lock();
        self.park_cond.notify_all();
    }
}

/// Handle to the running engine. Cloning shares the pool.
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<EngineInner>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TaskEngine {
    /// Spawns the initial worker set and returns the engine handle.
    pub fn start(cfg: EngineConfig) -> Self {
        let initial = cfg
            .initial_workers
            .min(cfg.max_workers)
            .max(cfg.min_workers);
        let inner = Arc::new(EngineInner {
            bands: [
                MsQueue::with_capacity(cfg.queue_size),
                MsQueue::with_capacity(cfg.queue_size),
                MsQueue::with_capacity(cfg.queue_size),
                MsQueue::with_capacity(cfg.queue_size),
            ],
            registry: DashMap::new(),
            cfg,
            shutdown: AtomicBool::new(false),
            park_lock: Mutex::new(()),
            park_cond: Condvar::new(),
            id_counter: AtomicU64::new(1),
            active_workers: AtomicUsize::new(0),
            stop_requests: AtomicUsize::new(0),
            last_scale_ms: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        });
        let engine = Self {
            inner,
            workers: Arc::new(Mutex::new(Vec::new())),
        };
        for _ in 0..initial {
            engine.spawn_worker();
        }
        engine
    }

    /// Submits a task; `None` when the target band is saturated or the
    /// engine is shutting down.
    pub fn submit(&self, spec: TaskSpec) -> Option<TaskId> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            counter_add(&self.inner.rejected, 1);
            return None;
        }
        let id = self.inner.next_id();
        let shared = Arc::new(TaskShared::new());
        let scheduled_at_ns = now_ns() + spec.delay.as_nanos() as u64;
        let priority = spec.priority;
        let task = Task {
            id,
            spec,
            scheduled_at_ns,
            retries_taken: 0,
            shared: shared.clone(),
        };
        // Registered before the push: a fast worker may finish the task
        // (and clear the entry) before this call returns.
        self.inner.registry.insert(id.0, shared);
        match self.inner.bands[priority.index()].push(task) {
            Ok(()) => {
                counter_add(&self.inner.submitted, 1);
                self.inner.wake_one();
                self.maybe_scale();
                Some(id)
            }
            Err(_rejected) => {
                self.inner.registry.remove(&id.0);
                counter_add(&self.inner.rejected, 1);
                None
            }
        }
    }

    /// Cooperative cancel. Succeeds only while the task is still pending;
    /// the dropped task is discarded at its next dequeue.
    pub fn cancel(&self, id: TaskId) -> bool {
        if let Some(shared) = self.inner.registry.get(&id.0) {
            let state = TaskState::from_u8(shared.state.load(Ordering::Acquire));
            if matches!(state, TaskState::Pending | TaskState::Runnable) {
                shared.cancelled.store(true, Ordering::Release);
                return true;
            }
        }
        false
    }

    /// Live state of a task still in the registry. Terminal tasks are
    /// removed once their continuation has fired.
    pub fn snapshot(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.inner.registry.get(&id.0).map(|shared| TaskSnapshot {
            state: TaskState::from_u8(shared.state.load(Ordering::Acquire)),
            stats: ExecStats {
                started_ns: shared.started_ns.load(Ordering::Relaxed),
                ended_ns: shared.ended_ns.load(Ordering::Relaxed),
                retries_taken: shared.retries_taken.load(Ordering::Relaxed) as u32,
            },
        })
    }

    /// Counter snapshot including per-band queue stats.
    pub fn stats(&self) -> EngineStats {
        let i = &self.inner;
        EngineStats {
            submitted: i.submitted.load(Ordering::Relaxed),
            rejected: i.rejected.load(Ordering::Relaxed),
            completed: i.completed.load(Ordering::Relaxed),
            failed: i.failed.load(Ordering::Relaxed),
            retried: i.retried.load(Ordering::Relaxed),
            cancelled: i.cancelled.load(Ordering::Relaxed),
            timed_out: i.timed_out.load(Ordering::Relaxed),
            active_workers: i.active_workers.load(Ordering::Relaxed),
            bands: [
                i.bands[0].stats(),
                i.bands[1].stats(),
                i.bands[2].stats(),
                i.bands[3].stats(),
            ],
        }
    }

    /// Current worker count.
    pub fn worker_count(&self) -> usize {
        self.inner.active_workers.load(Ordering::Relaxed)
    }

    /// Initiates shutdown. With `wait` the call blocks until every band
    /// drained and every worker exited; otherwise workers finish
    /// outstanding items on their own time.
    pub fn stop(&self, wait: bool) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.wake_all();
        if !wait {
            return;
        }
        while self.inner.bands.iter().any(|q| !q.is_empty()) {
            self.inner.wake_all();
            std::thread::sleep(Duration::from_millis(1));
        }
        let handles = std::mem::take(&mut *self.workers.lock());
        for h in handles {
            let _ = h.join();
        }
    }

    fn spawn_worker(&self) {
        let inner = self.inner.clone();
        let n = inner.active_workers.fetch_add(1, Ordering::Relaxed);
        let handle = std::thread::Builder::new()
            .name(format!("catzilla-worker-{n}"))
            .spawn(move || worker_loop(inner))
            .expect("worker thread spawn");
        self.workers.lock().push(handle);
    }

    /// One scaling decision per cooldown window.
    fn maybe_scale(&self) {
        let inner = &self.inner;
        if !inner.cfg.enable_auto_scaling || inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        let now = now_ms();
        let last = inner.last_scale_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < inner.cfg.scale_cooldown.as_millis() as u64 {
            return;
        }
        let pressure = inner.pressure();
        let workers = inner.active_workers.load(Ordering::Relaxed);
        if pressure > inner.cfg.scale_up_threshold && workers < inner.cfg.max_workers {
            if inner
                .last_scale_ms
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                tracing::debug!(pressure, workers, "scaling worker pool up");
                self.spawn_worker();
            }
        } else if pressure < inner.cfg.scale_down_threshold && workers > inner.cfg.min_workers {
            if inner
                .last_scale_ms
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                tracing::debug!(pressure, workers, "scaling worker pool down");
                inner.stop_requests.fetch_add(1, Ordering::Release);
                inner.wake_one();
            }
        }
    }
}

fn worker_loop(inner: Arc<EngineInner>) {
    loop {
        let mut ran = false;
        let mut deferred = false;

        for band in Priority::ALL {
            match inner.bands[band.index()].pop() {
                Some(task) => {
                    match process(&inner, band, task) {
                        Progress::Ran => ran = true,
                        Progress::Deferred => deferred = true,
                    }
                    break;
                }
                None => continue,
            }
        }

        if ran {
            if consume_stop_request(&inner) {
                return;
            }
            continue;
        }

        if inner.shutdown.load(Ordering::Acquire)
            && inner.bands.iter().all(|q| q.is_empty())
        {
            inner.active_workers.fetch_sub(1, Ordering::Relaxed);
            return;
        }

        if consume_stop_request(&inner) {
            return;
        }

        // Nothing runnable: bounded park, woken by the next submit.
        let timeout = if deferred { DEFER_PARK } else { PARK_TIMEOUT };
        let mut guard = inner.park_lock.lock();
        inner.park_cond.wait_for(&mut guard, timeout);
    }
}

/// Consumes one pending scale-down request if the pool can shrink.
fn consume_stop_request(inner: &EngineInner) -> bool {
    let mut current = inner.stop_requests.load(Ordering::Acquire);
    while current > 0 {
        match inner.stop_requests.compare_exchange_weak(
            current,
            current - 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                inner.active_workers.fetch_sub(1, Ordering::Relaxed);
                return true;
            }
            Err(actual) => current = actual,
        }
    }
    false
}

enum Progress {
    Ran,
    Deferred,
}

fn process(inner: &EngineInner, band: Priority, mut task: Task) -> Progress {
    if task.shared.cancelled.load(Ordering::Acquire) {
        task.shared.set_state(TaskState::Cancelled);
        task.shared.ended_ns.store(now_ns(), Ordering::Relaxed);
        counter_add(&inner.cancelled, 1);
        inner.registry.remove(&task.id.0);
        return Progress::Ran;
    }

    let now = now_ns();
    if task.scheduled_at_ns > now {
        // Simple delay: back into its own band until due.
        if let Err(bounced) = inner.bands[band.index()].push(task) {
            // Band filled up underneath the deferral; treat as overflow
            // rather than busy-looping the worker.
            counter_add(&inner.rejected, 1);
            inner.registry.remove(&bounced.id.0);
        }
        return Progress::Deferred;
    }

    task.shared.set_state(TaskState::Runnable);
    task.shared.set_state(TaskState::Running);
    task.shared.started_ns.store(now, Ordering::Relaxed);

    let result = (task.spec.work)(&task.spec.payload);
    let elapsed = Duration::from_nanos(now_ns().saturating_sub(now));

    let outcome = match result {
        Ok(bytes) if elapsed <= task.spec.timeout => Ok(bytes),
        Ok(_) => {
            counter_add(&inner.timed_out, 1);
            Err(TaskFailure::new(
                -2,
                format!("attempt exceeded {:?} budget", task.spec.timeout),
            ))
        }
        Err(failure) => Err(failure),
    };

    match outcome {
        Ok(result_bytes) => {
            task.shared.set_state(TaskState::Completed);
            task.shared.ended_ns.store(now_ns(), Ordering::Relaxed);
            counter_add(&inner.completed, 1);
            if let Some(cb) = &task.spec.on_success {
                cb(&result_bytes, &task.spec.payload);
            }
            inner.registry.remove(&task.id.0);
        }
        Err(failure) => {
            if task.retries_taken < task.spec.max_retries {
                let backoff = task
                    .spec
                    .backoff_base
                    .mul_f64(task.spec.backoff_factor.powi(task.retries_taken as i32));
                task.retries_taken += 1;
                task.shared
                    .retries_taken
                    .store(task.retries_taken as u64, Ordering::Relaxed);
                task.shared.set_state(TaskState::Pending);
                task.scheduled_at_ns = now_ns() + backoff.as_nanos() as u64;
                counter_add(&inner.retried, 1);
                if let Some(cb) = &task.spec.on_retry {
                    cb(task.retries_taken, &task.spec.payload);
                }
                let id = task.id;
                if let Err(bounced) = inner.bands[band.index()].push(task) {
                    // Band saturated underneath the retry: terminal failure.
                    bounced.shared.set_state(TaskState::Failed);
                    bounced.shared.ended_ns.store(now_ns(), Ordering::Relaxed);
                    counter_add(&inner.failed, 1);
                    if let Some(cb) = &bounced.spec.on_failure {
                        cb(&failure, &bounced.spec.payload);
                    }
                    inner.registry.remove(&id.0);
                }
            } else {
                task.shared.set_state(TaskState::Failed);
                task.shared.ended_ns.store(now_ns(), Ordering::Relaxed);
                counter_add(&inner.failed, 1);
                if let Some(cb) = &task.spec.on_failure {
                    cb(&failure, &task.spec.payload);
                }
                inner.registry.remove(&task.id.0);
            }
        }
    }
    Progress::Ran
}
