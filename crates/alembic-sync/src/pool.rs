//! Two-queue executor pair running the chemical machine.
//!
//! A pool owns exactly one scheduler thread and a bounded group of worker
//! threads. All match-search decisions of the sites bound to a pool run on
//! its scheduler thread, which serializes them; reaction bodies run on the
//! workers and may execute in parallel.
//!
//! Blocking-elastic pools grow their worker target by one whenever a body
//! announces a voluntary blocking call and shrink it back afterwards, so a
//! body waiting on another molecule of the same site never starves the
//! reaction that would unblock it. Fixed pools ignore the announcements;
//! provisioning capacity is the caller's job there.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// How long `shutdown_now` waits for in-flight bodies before detaching
/// their threads.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// The parallelism policy of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Worker parallelism is constant.
    Fixed,
    /// Worker parallelism grows by one around each announced blocking call.
    BlockingElastic,
}

/// A unit of work for the worker group, tagged with the reaction it runs.
struct ReactionTask {
    reaction: String,
    run: Box<dyn FnOnce() + Send>,
}

/// A scheduling decision for the single scheduler thread.
type SchedulerTask = Box<dyn FnOnce() + Send>;

/// A blocking FIFO shared by one executor group.
struct TaskQueue<T> {
    tasks: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> TaskQueue<T> {
    fn new() -> Self {
        TaskQueue {
            tasks: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    fn push(&self, task: T) {
        self.tasks.lock().push_back(task);
        self.available.notify_one();
    }

    fn clear(&self) -> usize {
        let mut tasks = self.tasks.lock();
        let dropped = tasks.len();
        tasks.clear();
        dropped
    }
}

/// State of the worker executor group.
struct WorkerGroup {
    queue: TaskQueue<ReactionTask>,
    /// Parallelism the group returns to when no blocking calls are active.
    base_parallelism: usize,
    /// Current parallelism target; elastic pools move this up and down.
    target_parallelism: AtomicUsize,
    /// Threads currently alive (including ones executing a task).
    live_workers: AtomicUsize,
    /// Threads parked on the queue condvar.
    idle_workers: AtomicUsize,
    next_worker_id: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Count of worker threads that have fully exited, for the shutdown
    /// grace wait.
    exited: Mutex<usize>,
    exited_signal: Condvar,
}

struct PoolCore {
    name: String,
    kind: PoolKind,
    shutdown: AtomicBool,
    scheduler_queue: TaskQueue<SchedulerTask>,
    scheduler_handle: Mutex<Option<JoinHandle<()>>>,
    workers: WorkerGroup,
}

/// A scheduler/worker thread-pool pair.
///
/// Cloning a `Pool` clones a handle; all clones drive the same executors.
#[derive(Clone)]
pub struct Pool {
    core: Arc<PoolCore>,
}

thread_local! {
    /// Set on every worker thread so blocking emitters can announce their
    /// waits on the pool that is running them.
    static CURRENT_POOL: RefCell<Option<Pool>> = const { RefCell::new(None) };
}

impl Pool {
    /// Creates a fixed-parallelism pool.
    pub fn fixed(name: &str, parallelism: usize) -> Pool {
        Pool::with_kind(name, PoolKind::Fixed, parallelism.max(1))
    }

    /// Creates a fixed pool sized to the machine.
    pub fn fixed_cpu(name: &str) -> Pool {
        Pool::fixed(name, num_cpus::get())
    }

    /// Creates a blocking-elastic pool with the given base parallelism.
    pub fn blocking_elastic(name: &str, base_parallelism: usize) -> Pool {
        Pool::with_kind(name, PoolKind::BlockingElastic, base_parallelism.max(1))
    }

    fn with_kind(name: &str, kind: PoolKind, parallelism: usize) -> Pool {
        let core = Arc::new(PoolCore {
            name: name.to_string(),
            kind,
            shutdown: AtomicBool::new(false),
            scheduler_queue: TaskQueue::new(),
            scheduler_handle: Mutex::new(None),
            workers: WorkerGroup {
                queue: TaskQueue::new(),
                base_parallelism: parallelism,
                target_parallelism: AtomicUsize::new(parallelism),
                live_workers: AtomicUsize::new(0),
                idle_workers: AtomicUsize::new(0),
                next_worker_id: AtomicUsize::new(0),
                handles: Mutex::new(Vec::new()),
                exited: Mutex::new(0),
                exited_signal: Condvar::new(),
            },
        });

        let sched_core = Arc::clone(&core);
        let handle = thread::Builder::new()
            .name(format!("{name}-scheduler"))
            .spawn(move || sched_core.scheduler_loop())
            .expect("failed to spawn pool scheduler thread");
        *core.scheduler_handle.lock() = Some(handle);

        log::debug!("pool '{}' created ({kind:?}, parallelism {parallelism})", name);
        Pool { core }
    }

    /// The pool running the current thread, if it is one of a pool's
    /// worker threads.
    pub fn current() -> Option<Pool> {
        CURRENT_POOL.with(|slot| slot.borrow().clone())
    }

    /// Schedules a reaction body on the worker group.
    pub fn run_reaction(&self, reaction: &str, run: impl FnOnce() + Send + 'static) {
        if self.core.shutdown.load(Ordering::Acquire) {
            log::warn!(
                "pool '{}': dropping reaction '{}' scheduled after shutdown",
                self.core.name,
                reaction
            );
            return;
        }
        self.core.workers.queue.push(ReactionTask {
            reaction: reaction.to_string(),
            run: Box::new(run),
        });
        self.core.ensure_worker_capacity();
    }

    /// Schedules a task on the single scheduler thread.
    pub fn run_scheduler(&self, task: impl FnOnce() + Send + 'static) {
        if self.core.shutdown.load(Ordering::Acquire) {
            return;
        }
        self.core.scheduler_queue.push(Box::new(task));
    }

    /// Announces that the current task is about to block voluntarily.
    /// Elastic pools grow their worker target so other reactions can run
    /// meanwhile; fixed pools ignore the announcement.
    pub fn started_blocking_call(&self, self_blocking: bool) {
        if self.core.kind != PoolKind::BlockingElastic {
            return;
        }
        let target = self.core.workers.target_parallelism.fetch_add(1, Ordering::AcqRel) + 1;
        log::debug!(
            "pool '{}': blocking call started (self_blocking={self_blocking}), target now {target}",
            self.core.name
        );
        self.core.ensure_worker_capacity();
    }

    /// Reverts the effect of [`started_blocking_call`](Pool::started_blocking_call).
    pub fn finished_blocking_call(&self, self_blocking: bool) {
        if self.core.kind != PoolKind::BlockingElastic {
            return;
        }
        let workers = &self.core.workers;
        // Never shrink below the base; a mismatched announcement pair would
        // otherwise wedge the pool.
        let _ = workers.target_parallelism.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |t| (t > workers.base_parallelism).then(|| t - 1),
        );
        log::debug!(
            "pool '{}': blocking call finished (self_blocking={self_blocking}), target now {}",
            self.core.name,
            workers.target_parallelism.load(Ordering::Acquire)
        );
        // Wake parked workers so a surplus one can retire.
        workers.queue.available.notify_all();
    }

    /// Clears both queues, signals every thread, and joins them within a
    /// small grace period. Threads still inside a reaction body after the
    /// grace are detached.
    pub fn shutdown_now(&self) {
        if self.core.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped_sched = self.core.scheduler_queue.clear();
        let dropped_work = self.core.workers.queue.clear();
        log::info!(
            "pool '{}': shutting down ({dropped_sched} scheduler tasks, {dropped_work} reactions dropped)",
            self.core.name
        );
        self.core.scheduler_queue.available.notify_all();
        self.core.workers.queue.available.notify_all();

        if let Some(handle) = self.core.scheduler_handle.lock().take() {
            let _ = handle.join();
        }

        let spawned = self.core.workers.next_worker_id.load(Ordering::Acquire);
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        let mut exited = self.core.workers.exited.lock();
        while *exited < spawned {
            if self
                .core
                .workers
                .exited_signal
                .wait_until(&mut exited, deadline)
                .timed_out()
            {
                break;
            }
        }
        let all_exited = *exited == spawned;
        drop(exited);

        let handles = std::mem::take(&mut *self.core.workers.handles.lock());
        if all_exited {
            for handle in handles {
                let _ = handle.join();
            }
        } else {
            log::warn!(
                "pool '{}': {} worker(s) still inside a reaction body after {:?}, detaching",
                self.core.name,
                self.core.workers.live_workers.load(Ordering::Acquire),
                SHUTDOWN_GRACE
            );
        }
    }

    /// Whether `shutdown_now` has run.
    pub fn is_shutdown(&self) -> bool {
        self.core.shutdown.load(Ordering::Acquire)
    }

    /// The pool's name, used in logs and reporter events.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// The pool's parallelism policy.
    pub fn kind(&self) -> PoolKind {
        self.core.kind
    }

    /// Whether `other` drives the same executors as `self`.
    pub fn same_pool(&self, other: &Pool) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.core.name)
            .field("kind", &self.core.kind)
            .field(
                "target_parallelism",
                &self.core.workers.target_parallelism.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl PoolCore {
    /// Spawns a worker if tasks are queued, nobody is idle to take them,
    /// and the target allows another thread.
    fn ensure_worker_capacity(self: &Arc<Self>) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        let workers = &self.workers;
        if workers.queue.tasks.lock().is_empty() {
            return;
        }
        if workers.idle_workers.load(Ordering::Acquire) > 0 {
            workers.queue.available.notify_one();
            return;
        }
        loop {
            let live = workers.live_workers.load(Ordering::Acquire);
            if live >= workers.target_parallelism.load(Ordering::Acquire) {
                return;
            }
            if workers
                .live_workers
                .compare_exchange(live, live + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.spawn_worker();
                return;
            }
        }
    }

    /// Spawns one worker thread. `live_workers` must already be
    /// incremented by the caller.
    fn spawn_worker(self: &Arc<Self>) {
        let id = self.workers.next_worker_id.fetch_add(1, Ordering::AcqRel);
        let pool = Pool { core: Arc::clone(self) };
        let thread_name = format!("{}-worker-{id}", self.name);
        let spawned = thread::Builder::new().name(thread_name).spawn(move || {
            CURRENT_POOL.with(|slot| *slot.borrow_mut() = Some(pool.clone()));
            pool.core.worker_loop(id);
            CURRENT_POOL.with(|slot| *slot.borrow_mut() = None);
            let core = &pool.core;
            core.workers.live_workers.fetch_sub(1, Ordering::AcqRel);
            *core.workers.exited.lock() += 1;
            core.workers.exited_signal.notify_all();
        });
        match spawned {
            Ok(handle) => self.workers.handles.lock().push(handle),
            Err(error) => {
                self.workers.live_workers.fetch_sub(1, Ordering::AcqRel);
                log::error!("pool '{}': failed to spawn worker: {error}", self.name);
            }
        }
    }

    fn worker_loop(&self, id: usize) {
        log::debug!("pool '{}': worker {id} entering run loop", self.name);
        loop {
            let task = {
                let mut tasks = self.workers.queue.tasks.lock();
                loop {
                    if self.shutdown.load(Ordering::Acquire) {
                        log::debug!("pool '{}': worker {id} exiting on shutdown", self.name);
                        return;
                    }
                    if self.workers.live_workers.load(Ordering::Acquire)
                        > self.workers.target_parallelism.load(Ordering::Acquire)
                    {
                        log::debug!("pool '{}': worker {id} retiring (surplus)", self.name);
                        return;
                    }
                    if let Some(task) = tasks.pop_front() {
                        break task;
                    }
                    self.workers.idle_workers.fetch_add(1, Ordering::AcqRel);
                    self.workers.queue.available.wait(&mut tasks);
                    self.workers.idle_workers.fetch_sub(1, Ordering::AcqRel);
                }
            };
            log::trace!(
                "pool '{}': worker {id} running reaction '{}'",
                self.name,
                task.reaction
            );
            // The site wraps bodies in its own panic guard; this one only
            // keeps a worker alive if that guard itself has a bug.
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task.run));
            if outcome.is_err() {
                log::error!(
                    "pool '{}': reaction '{}' panicked past the site guard",
                    self.name,
                    task.reaction
                );
            }
        }
    }

    fn scheduler_loop(&self) {
        log::debug!("pool '{}': scheduler thread started", self.name);
        loop {
            let task = {
                let mut tasks = self.scheduler_queue.tasks.lock();
                loop {
                    if self.shutdown.load(Ordering::Acquire) {
                        log::debug!("pool '{}': scheduler exiting on shutdown", self.name);
                        return;
                    }
                    if let Some(task) = tasks.pop_front() {
                        break task;
                    }
                    self.scheduler_queue.available.wait(&mut tasks);
                }
            };
            task();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn runs_reactions_and_scheduler_tasks() {
        init_logging();
        let pool = Pool::fixed("t-basic", 2);
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        pool.run_scheduler(move || tx2.send("sched").unwrap());
        pool.run_reaction("r", move || tx.send("work").unwrap());
        let mut seen: Vec<_> = vec![rx.recv().unwrap(), rx.recv().unwrap()];
        seen.sort();
        assert_eq!(seen, vec!["sched", "work"]);
        pool.shutdown_now();
    }

    #[test]
    fn fixed_pool_bounds_parallelism() {
        init_logging();
        let pool = Pool::fixed("t-bound", 1);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for _ in 0..4 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let tx = tx.clone();
            pool.run_reaction("busy", move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                running.fetch_sub(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            });
        }
        for _ in 0..4 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        pool.shutdown_now();
    }

    #[test]
    fn elastic_pool_grows_around_blocking_calls() {
        init_logging();
        let pool = Pool::blocking_elastic("t-elastic", 1);
        let (inner_tx, inner_rx) = mpsc::channel();
        let (outer_tx, outer_rx) = mpsc::channel();
        let inner_pool = pool.clone();
        pool.run_reaction("outer", move || {
            inner_pool.started_blocking_call(true);
            // With parallelism still at 1 this would deadlock: the inner
            // task could never get a worker.
            let (done_tx, done_rx) = mpsc::channel();
            inner_pool.run_reaction("inner", move || done_tx.send(()).unwrap());
            let got = done_rx.recv_timeout(Duration::from_secs(5));
            inner_pool.finished_blocking_call(true);
            inner_tx.send(got.is_ok()).unwrap();
            outer_tx.send(()).unwrap();
        });
        assert!(inner_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        outer_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.shutdown_now();
    }

    #[test]
    fn shutdown_drops_queued_tasks() {
        init_logging();
        let pool = Pool::fixed("t-shutdown", 1);
        pool.shutdown_now();
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = Arc::clone(&flag);
        pool.run_reaction("late", move || flag2.store(true, Ordering::SeqCst));
        thread::sleep(Duration::from_millis(30));
        assert!(!flag.load(Ordering::SeqCst));
        assert!(pool.is_shutdown());
    }
}
