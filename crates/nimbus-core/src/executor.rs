//! Elastic worker pool for asynchronous units of work.
//!
//! Node-event dispatch, deferred completions, range-download retries and
//! periodic reclaim sweeps all run here instead of on the caller's thread.
//!
//! # Design
//!
//! - Ready tasks reach the workers through one unbounded channel, in
//!   submission order.
//! - Tasks scheduled for later wait on a timer thread, which forwards them to
//!   the workers at their deadline, ties broken by submission order.
//! - Workers are spawned on demand: a ready task spawns a worker when none is
//!   idle and the pool is below [`TaskExecutorFlags::max_workers`].
//! - A worker idle for [`TaskExecutorFlags::idle_time`] exits as long as more
//!   than [`TaskExecutorFlags::min_workers`] remain.
//! - Every task function runs exactly once. A task cancelled before it ran
//!   (explicitly or by [`TaskExecutor::shutdown`]) still runs, and can see
//!   that through [`Task::cancelled`].

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{Span, debug, error, info, info_span, trace};

/// Default minimum number of workers kept alive while idle.
pub const DEFAULT_MIN_WORKERS: usize = 0;

/// Default maximum number of workers.
pub const DEFAULT_MAX_WORKERS: usize = 16;

/// Default time an idle worker waits before exiting.
pub const DEFAULT_IDLE_TIME: Duration = Duration::from_secs(300);

/// Sizing of a [`TaskExecutor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskExecutorFlags {
    /// Workers kept alive even when idle.
    pub min_workers: usize,
    /// Upper bound on concurrently running workers.
    pub max_workers: usize,
    /// How long an idle worker waits for work before exiting.
    #[serde(with = "humantime_serde")]
    pub idle_time: Duration,
}

impl Default for TaskExecutorFlags {
    fn default() -> Self {
        Self {
            min_workers: DEFAULT_MIN_WORKERS,
            max_workers: DEFAULT_MAX_WORKERS,
            idle_time: DEFAULT_IDLE_TIME,
        }
    }
}

impl TaskExecutorFlags {
    /// Sets the minimum number of workers.
    #[must_use]
    pub fn with_min_workers(mut self, min_workers: usize) -> Self {
        self.min_workers = min_workers;
        self
    }

    /// Sets the maximum number of workers.
    #[must_use]
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Sets the idle timeout.
    #[must_use]
    pub fn with_idle_time(mut self, idle_time: Duration) -> Self {
        self.idle_time = idle_time;
        self
    }
}

#[derive(Debug, Default)]
struct TaskState {
    cancelled: AtomicBool,
    completed: Mutex<bool>,
    completed_cv: Condvar,
}

/// Handle to a submitted unit of work.
#[derive(Debug, Clone, Default)]
pub struct Task {
    state: Arc<TaskState>,
}

impl Task {
    fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Returns `true` if the task had not yet completed.
    pub fn cancel(&self) -> bool {
        self.state.cancelled.store(true, Ordering::Release);
        !self.completed()
    }

    /// Whether cancellation was requested.
    pub fn cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Whether the task's function has returned.
    pub fn completed(&self) -> bool {
        *self.state.completed.lock()
    }

    /// Blocks until the task completes or `timeout` passes.
    ///
    /// Returns whether the task completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut completed = self.state.completed.lock();
        while !*completed {
            if self
                .state
                .completed_cv
                .wait_until(&mut completed, deadline)
                .timed_out()
            {
                return *completed;
            }
        }
        true
    }

    fn mark_completed(&self) {
        *self.state.completed.lock() = true;
        self.state.completed_cv.notify_all();
    }
}

type TaskFn = Box<dyn FnOnce(&Task) + Send + 'static>;

struct Job {
    when: Instant,
    sequence: u64,
    task: Task,
    function: TaskFn,
}

impl Job {
    fn run(self, stats: &ExecutorStats) {
        let Job { task, function, .. } = self;
        if task.cancelled() {
            stats.record_cancelled();
        }
        if catch_unwind(AssertUnwindSafe(|| function(&task))).is_err() {
            error!("Task panicked");
        }
        task.mark_completed();
        stats.record_completed();
    }

    fn cancel_and_run(self, stats: &ExecutorStats) {
        self.task.cancel();
        self.run(stats);
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.sequence == other.sequence
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    // BinaryHeap is a max-heap; the earliest job must compare greatest.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// What the workers receive.
enum WorkerMessage {
    Run(Job),
    Stop,
}

/// What the timer thread receives.
enum TimerMessage {
    Schedule(Job),
    /// Forward every waiting job to the workers and exit.
    Flush,
}

/// Statistics for the executor.
#[derive(Debug, Default)]
pub struct ExecutorStats {
    /// Tasks submitted.
    pub tasks_submitted: AtomicU64,
    /// Tasks whose function has returned.
    pub tasks_completed: AtomicU64,
    /// Tasks that ran after being cancelled.
    pub tasks_cancelled: AtomicU64,
    /// Workers started.
    pub workers_spawned: AtomicU64,
    /// Workers that exited.
    pub workers_retired: AtomicU64,
}

impl ExecutorStats {
    fn record_submitted(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_cancelled(&self) {
        self.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    fn record_spawned(&self) {
        self.workers_spawned.fetch_add(1, Ordering::Relaxed);
    }

    fn record_retired(&self) {
        self.workers_retired.fetch_add(1, Ordering::Relaxed);
    }
}

struct PoolState {
    flags: TaskExecutorFlags,
    workers: usize,
    available: usize,
    next_sequence: u64,
    next_worker: u64,
    terminating: bool,
}

struct Shared {
    name: String,
    state: Mutex<PoolState>,
    ready_tx: Sender<WorkerMessage>,
    ready_rx: Receiver<WorkerMessage>,
    timer_tx: Sender<TimerMessage>,
    /// Jobs waiting on the timer thread.
    delayed: AtomicUsize,
    handles: Mutex<HashMap<u64, JoinHandle<()>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    stats: ExecutorStats,
    span: Span,
}

/// An elastic pool of worker threads.
pub struct TaskExecutor {
    shared: Arc<Shared>,
}

impl TaskExecutor {
    /// Creates an executor. Threads are named `<name>-<n>`; the timer thread
    /// is `<name>-timer`.
    pub fn new(name: impl Into<String>, flags: TaskExecutorFlags) -> Self {
        let name = name.into();
        let span = info_span!("task_executor", name = %name);
        let (ready_tx, ready_rx) = unbounded();
        let (timer_tx, timer_rx) = unbounded();
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                flags: flags.clone(),
                workers: 0,
                available: 0,
                next_sequence: 0,
                next_worker: 0,
                terminating: false,
            }),
            ready_tx,
            ready_rx,
            timer_tx,
            delayed: AtomicUsize::new(0),
            handles: Mutex::new(HashMap::new()),
            timer: Mutex::new(None),
            stats: ExecutorStats::default(),
            span,
            name,
        });

        let timer = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("{}-timer", shared.name))
                .spawn(move || timer_loop(&shared, &timer_rx))
                .expect("failed to spawn executor timer thread")
        };
        *shared.timer.lock() = Some(timer);

        {
            let mut state = shared.state.lock();
            for _ in 0..flags.min_workers.min(flags.max_workers) {
                spawn_worker(&shared, &mut state);
            }
        }

        shared.span.in_scope(|| {
            info!(
                min_workers = flags.min_workers,
                max_workers = flags.max_workers,
                idle_ms = flags.idle_time.as_millis(),
                "Task executor started"
            );
        });

        Self { shared }
    }

    /// Runs `function` as soon as a worker is available.
    pub fn execute<F>(&self, function: F) -> Task
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        self.execute_at(function, Instant::now())
    }

    /// Runs `function` once `delay` has passed.
    pub fn execute_after<F>(&self, function: F, delay: Duration) -> Task
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        self.execute_at(function, Instant::now() + delay)
    }

    /// Runs `function` no earlier than `when`.
    pub fn execute_at<F>(&self, function: F, when: Instant) -> Task
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        let task = Task::new();
        let mut state = self.shared.state.lock();
        self.shared.stats.record_submitted();

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let job = Job {
            when,
            sequence,
            task: task.clone(),
            function: Box::new(function),
        };

        if state.terminating {
            drop(state);
            trace!("Executor terminating, running cancelled task inline");
            job.cancel_and_run(&self.shared.stats);
            return task;
        }

        if when <= Instant::now() {
            dispatch(&self.shared, &mut state, job);
        } else {
            self.shared.delayed.fetch_add(1, Ordering::AcqRel);
            if let Err(e) = self.shared.timer_tx.send(TimerMessage::Schedule(job)) {
                // The timer only exits during shutdown, which holds no jobs back.
                self.shared.delayed.fetch_sub(1, Ordering::AcqRel);
                if let TimerMessage::Schedule(job) = e.into_inner() {
                    dispatch(&self.shared, &mut state, job);
                }
            }
        }
        task
    }

    /// Replaces the pool's sizing. Excess workers exit once idle.
    pub fn set_flags(&self, flags: TaskExecutorFlags) {
        let mut state = self.shared.state.lock();
        state.flags = flags;
        while state.workers < state.flags.min_workers.min(state.flags.max_workers) {
            spawn_worker(&self.shared, &mut state);
        }
    }

    /// Current sizing.
    pub fn flags(&self) -> TaskExecutorFlags {
        self.shared.state.lock().flags.clone()
    }

    /// Number of live workers.
    pub fn workers(&self) -> usize {
        self.shared.state.lock().workers
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.shared.ready_rx.len() + self.shared.delayed.load(Ordering::Acquire)
    }

    /// Executor statistics.
    pub fn stats(&self) -> &ExecutorStats {
        &self.shared.stats
    }

    /// Cancels and runs every queued task, then joins all workers.
    ///
    /// Safe to call more than once and from a worker thread.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.terminating {
                drop(state);
                self.join_workers();
                return;
            }
            state.terminating = true;
        }

        let _entered = self.shared.span.enter();

        // The timer forwards what it holds, earliest first, then exits.
        let _ = self.shared.timer_tx.send(TimerMessage::Flush);
        if let Some(timer) = self.shared.timer.lock().take()
            && timer.thread().id() != thread::current().id()
        {
            let _ = timer.join();
        }

        let mut cancelled = 0;
        for message in self.shared.ready_rx.try_iter() {
            if let WorkerMessage::Run(job) = message {
                job.cancel_and_run(&self.shared.stats);
                cancelled += 1;
            }
        }
        info!(cancelled, "Shutting down task executor");

        // No worker is spawned once terminating.
        let workers = self.shared.state.lock().workers;
        for _ in 0..workers {
            let _ = self.shared.ready_tx.send(WorkerMessage::Stop);
        }
        self.join_workers();
        debug!("Task executor stopped");
    }

    fn join_workers(&self) {
        let current = thread::current().id();
        let handles: Vec<JoinHandle<()>> =
            self.shared.handles.lock().drain().map(|(_, handle)| handle).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

/// Hands a ready job to the workers, growing the pool if none is idle.
fn dispatch(shared: &Arc<Shared>, state: &mut PoolState, job: Job) {
    if shared.ready_tx.send(WorkerMessage::Run(job)).is_err() {
        // Unreachable while `shared` owns the receiver.
        return;
    }
    if !state.terminating && state.available == 0 && state.workers < state.flags.max_workers {
        spawn_worker(shared, state);
    }
}

fn spawn_worker(shared: &Arc<Shared>, state: &mut PoolState) {
    let worker_id = state.next_worker;
    state.next_worker += 1;
    state.workers += 1;
    state.available += 1;

    let thread_shared = Arc::clone(shared);
    let handle = thread::Builder::new()
        .name(format!("{}-{worker_id}", shared.name))
        .spawn(move || worker_loop(worker_id, &thread_shared))
        .expect("failed to spawn executor worker thread");

    shared.handles.lock().insert(worker_id, handle);
    shared.stats.record_spawned();
}

/// Holds delayed jobs until their deadline.
fn timer_loop(shared: &Arc<Shared>, rx: &Receiver<TimerMessage>) {
    let _entered = shared.span.enter();
    let mut waiting: BinaryHeap<Job> = BinaryHeap::new();

    loop {
        let now = Instant::now();
        while waiting.peek().is_some_and(|job| job.when <= now) {
            if let Some(job) = waiting.pop() {
                shared.delayed.fetch_sub(1, Ordering::AcqRel);
                dispatch(shared, &mut shared.state.lock(), job);
            }
        }

        let received = match waiting.peek() {
            Some(job) => rx.recv_deadline(job.when),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(TimerMessage::Schedule(job)) => waiting.push(job),
            Err(RecvTimeoutError::Timeout) => {}
            Ok(TimerMessage::Flush) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Schedules are sent under the pool lock, so none can follow the flush.
    while let Some(job) = waiting.pop() {
        shared.delayed.fetch_sub(1, Ordering::AcqRel);
        let _ = shared.ready_tx.send(WorkerMessage::Run(job));
    }
    trace!("Executor timer stopped");
}

/// Worker thread main loop.
fn worker_loop(worker_id: u64, shared: &Arc<Shared>) {
    let _entered = shared.span.enter();
    debug!(worker_id, "Executor worker started");

    let mut retire = false;
    loop {
        let idle_time = shared.state.lock().flags.idle_time;
        match shared.ready_rx.recv_timeout(idle_time) {
            Ok(WorkerMessage::Run(job)) => {
                let terminating = {
                    let mut state = shared.state.lock();
                    state.available -= 1;
                    // Work queued behind this job must not wait for it.
                    if state.available == 0
                        && !state.terminating
                        && state.workers < state.flags.max_workers
                        && !shared.ready_rx.is_empty()
                    {
                        spawn_worker(shared, &mut state);
                    }
                    state.terminating
                };
                if terminating {
                    job.cancel_and_run(&shared.stats);
                } else {
                    job.run(&shared.stats);
                }

                let mut state = shared.state.lock();
                state.available += 1;
                // Release excess workers.
                if state.workers > state.flags.max_workers {
                    retire = true;
                    break;
                }
            }
            Ok(WorkerMessage::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                let state = shared.state.lock();
                // An empty channel under the lock means no submission is
                // counting on this worker.
                if !state.terminating
                    && state.workers > state.flags.min_workers
                    && shared.ready_rx.is_empty()
                {
                    retire = true;
                    break;
                }
            }
        }
    }

    {
        let mut state = shared.state.lock();
        state.workers -= 1;
        state.available -= 1;
    }

    if retire {
        // Dropping our own handle detaches the thread.
        shared.handles.lock().remove(&worker_id);
        shared.stats.record_retired();
    }

    debug!(worker_id, retire, "Executor worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_flags_defaults_and_builder() {
        let flags = TaskExecutorFlags::default();
        assert_eq!(flags.min_workers, DEFAULT_MIN_WORKERS);
        assert_eq!(flags.max_workers, DEFAULT_MAX_WORKERS);
        assert_eq!(flags.idle_time, DEFAULT_IDLE_TIME);

        let flags = flags
            .with_min_workers(2)
            .with_max_workers(0)
            .with_idle_time(Duration::from_secs(1));
        assert_eq!(flags.min_workers, 2);
        assert_eq!(flags.max_workers, 1);
    }

    #[test]
    fn test_flags_from_json() {
        let flags: TaskExecutorFlags =
            serde_json::from_str(r#"{"max_workers": 4, "idle_time": "250ms"}"#).unwrap();
        assert_eq!(flags.max_workers, 4);
        assert_eq!(flags.idle_time, Duration::from_millis(250));
        assert_eq!(flags.min_workers, DEFAULT_MIN_WORKERS);
    }

    #[test]
    fn test_execute_runs_task() {
        let executor = TaskExecutor::new("test-exec", TaskExecutorFlags::default());
        let (tx, rx) = unbounded();
        let task = executor.execute(move |task| {
            tx.send(task.cancelled()).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), false);
        assert!(task.wait_timeout(Duration::from_secs(5)));
        assert!(task.completed());
    }

    #[test]
    fn test_delayed_tasks_run_in_deadline_order() {
        let executor = TaskExecutor::new(
            "test-order",
            TaskExecutorFlags::default().with_max_workers(1),
        );
        let (tx, rx) = unbounded();
        let now = Instant::now();
        for (label, delay) in [("c", 60), ("a", 20), ("b", 40)] {
            let tx = tx.clone();
            executor.execute_at(
                move |_| tx.send(label).unwrap(),
                now + Duration::from_millis(delay),
            );
        }
        let order: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(now.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_ready_tasks_queue_in_submission_order() {
        let executor = TaskExecutor::new(
            "test-fifo",
            TaskExecutorFlags::default().with_max_workers(1),
        );
        let (started_tx, started_rx) = unbounded();
        let (release_tx, release_rx) = unbounded::<()>();
        executor.execute(move |_| {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        });
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (tx, rx) = unbounded();
        for label in ["first", "second"] {
            let tx = tx.clone();
            executor.execute(move |_| tx.send(label).unwrap());
        }
        executor.execute_after(|_| {}, Duration::from_secs(3600));
        assert_eq!(executor.pending(), 3);

        release_tx.send(()).unwrap();
        let order: Vec<_> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, vec!["first", "second"]);
        assert_eq!(executor.pending(), 1);
    }

    #[test]
    fn test_worker_count_is_bounded() {
        let executor = TaskExecutor::new(
            "test-bound",
            TaskExecutorFlags::default().with_max_workers(2),
        );
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<Task> = (0..8)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                executor.execute(move |_| {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for task in &tasks {
            assert!(task.wait_timeout(Duration::from_secs(5)));
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(executor.workers() <= 2);
    }

    #[test]
    fn test_idle_workers_retire() {
        let executor = TaskExecutor::new(
            "test-idle",
            TaskExecutorFlags::default().with_idle_time(Duration::from_millis(20)),
        );
        let task = executor.execute(|_| {});
        assert!(task.wait_timeout(Duration::from_secs(5)));
        let deadline = Instant::now() + Duration::from_secs(5);
        while executor.workers() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(executor.workers(), 0);
        assert!(executor.stats().workers_retired.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn test_shutdown_runs_pending_tasks_cancelled() {
        let executor = TaskExecutor::new("test-shutdown", TaskExecutorFlags::default());
        let (tx, rx) = unbounded();
        let task = executor.execute_after(
            move |task| tx.send(task.cancelled()).unwrap(),
            Duration::from_secs(3600),
        );
        executor.shutdown();
        assert!(task.completed());
        assert_eq!(rx.try_recv().unwrap(), true);

        // Submissions after shutdown run inline, cancelled.
        let (tx, rx) = unbounded();
        let late = executor.execute(move |task| tx.send(task.cancelled()).unwrap());
        assert!(late.completed());
        assert_eq!(rx.try_recv().unwrap(), true);
    }
}
