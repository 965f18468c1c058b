//! Background job dispatcher.
//!
//! Blocking work (DNS lookups, password hashing, disk writes) runs on
//! a small pool of native threads so it never stalls the async
//! reactor. The pool grows on demand up to a cap and sheds idle
//! threads; completion flows back to the reactor through a wake pipe:
//! each finished job writes one byte to a socketpair whose read end
//! the main task watches, then calls [`JobDispatcher::poll_completions`]
//! to run completion callbacks on the reactor side.
//!
//! Cancellation is cooperative. Jobs still queued are cancelled in
//! place and never run; running jobs keep going until they observe
//! their [`CancelToken`], and their results are discarded either way.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Idle threads above this count exit instead of waiting for work.
const MAX_IDLE_THREADS: usize = 3;
/// Hard cap on pool size; excess jobs queue.
const MAX_TOTAL_THREADS: usize = 20;

/// Lifecycle of one submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Queued, not yet picked up by a worker.
    Ready,
    /// Executing on a worker thread.
    Running,
    /// Ran to completion; its callback runs on the next poll.
    Done,
    /// Cancelled; its callback never runs.
    Cancelled,
}

impl JobState {
    fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Cancelled)
    }
}

/// A unit of blocking work.
///
/// `run` executes on a worker thread and should check the token at
/// natural pause points. `finished` runs later on the reactor side,
/// only if the job was not cancelled.
pub trait Job: Send + 'static {
    /// Execute the blocking work.
    fn run(&mut self, cancel: &CancelToken);
    /// Completion callback, invoked from [`JobDispatcher::poll_completions`].
    fn finished(self: Box<Self>);
}

/// Shared cancellation flag a running job polls.
#[derive(Debug, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Whether cancellation was requested for this job.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct JobShared {
    id: u64,
    state: Mutex<JobState>,
    cancel: Arc<AtomicBool>,
}

/// Handle to a submitted job, used to observe state and cancel.
#[derive(Debug, Clone)]
pub struct JobHandle {
    shared: Arc<JobShared>,
}

impl JobHandle {
    /// Dispatcher-assigned job id.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> JobState {
        *self.shared.state.lock()
    }
}

struct QueuedJob {
    shared: Arc<JobShared>,
    job: Box<dyn Job>,
}

struct PoolState {
    queue: VecDeque<QueuedJob>,
    finished: VecDeque<Box<dyn Job>>,
    num_threads: usize,
    num_idle: usize,
    shutting_down: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    /// Signalled when work is queued or the pool shuts down.
    work_ready: Condvar,
    /// Signalled whenever a job reaches a terminal state.
    job_done: Condvar,
    /// Nonblocking write end of the wake pipe.
    wake_tx: Mutex<UnixStream>,
}

/// Thread pool for blocking jobs with reactor-side completion.
pub struct JobDispatcher {
    inner: Arc<PoolInner>,
    next_id: AtomicU64,
}

impl JobDispatcher {
    /// Create the dispatcher and the read end of its wake pipe. The
    /// read end is nonblocking, ready to hand to the async runtime;
    /// drain it and call [`poll_completions`](Self::poll_completions)
    /// whenever it becomes readable.
    pub fn new() -> io::Result<(Self, UnixStream)> {
        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;
        let dispatcher = Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    finished: VecDeque::new(),
                    num_threads: 0,
                    num_idle: 0,
                    shutting_down: false,
                }),
                work_ready: Condvar::new(),
                job_done: Condvar::new(),
                wake_tx: Mutex::new(wake_tx),
            }),
            next_id: AtomicU64::new(1),
        };
        Ok((dispatcher, wake_rx))
    }

    /// Queue a job, spawning a worker if none is idle and the pool is
    /// under its cap.
    pub fn submit<J: Job>(&self, job: J) -> JobHandle {
        let shared = Arc::new(JobShared {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(JobState::Ready),
            cancel: Arc::new(AtomicBool::new(false)),
        });
        let handle = JobHandle {
            shared: shared.clone(),
        };
        let mut state = self.inner.state.lock();
        state.queue.push_back(QueuedJob {
            shared,
            job: Box::new(job),
        });
        if state.num_idle == 0 && state.num_threads < MAX_TOTAL_THREADS {
            let inner = Arc::clone(&self.inner);
            let spawned = std::thread::Builder::new()
                .name("tetherd-job".to_string())
                .spawn(move || worker(inner));
            match spawned {
                // The queued job waits for an existing worker if the
                // spawn failed.
                Ok(_) => state.num_threads += 1,
                Err(err) => warn!(%err, "failed to spawn job worker"),
            }
        }
        drop(state);
        self.inner.work_ready.notify_one();
        handle
    }

    /// Cancel one job; see [`cancel_all`](Self::cancel_all). Safe on
    /// jobs that already finished.
    pub fn cancel(&self, handle: &JobHandle) {
        self.cancel_all(std::slice::from_ref(handle));
    }

    /// Cancel the given jobs and block until every one of them has
    /// reached a terminal state. Ready jobs are removed from the queue
    /// without running; running jobs finish on their own after
    /// observing the token, and their results are discarded.
    pub fn cancel_all(&self, handles: &[JobHandle]) {
        let mut state = self.inner.state.lock();
        for handle in handles {
            let mut job_state = handle.shared.state.lock();
            match *job_state {
                JobState::Ready => {
                    state.queue.retain(|q| q.shared.id != handle.shared.id);
                    *job_state = JobState::Cancelled;
                }
                JobState::Running => {
                    handle.shared.cancel.store(true, Ordering::Release);
                }
                JobState::Done | JobState::Cancelled => {}
            }
        }
        while handles.iter().any(|h| !h.state().is_terminal()) {
            self.inner.job_done.wait(&mut state);
        }
    }

    /// Run completion callbacks for jobs that finished since the last
    /// poll. Returns the number of callbacks invoked. Call after the
    /// wake pipe signals readability; callbacks run on the caller's
    /// thread, outside the pool lock.
    pub fn poll_completions(&self) -> usize {
        let finished = {
            let mut state = self.inner.state.lock();
            std::mem::take(&mut state.finished)
        };
        let count = finished.len();
        for job in finished {
            job.finished();
        }
        count
    }

    /// Pool size snapshot for diagnostics: (total, idle).
    pub fn thread_counts(&self) -> (usize, usize) {
        let state = self.inner.state.lock();
        (state.num_threads, state.num_idle)
    }
}

impl Drop for JobDispatcher {
    fn drop(&mut self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.work_ready.notify_all();
    }
}

fn worker(inner: Arc<PoolInner>) {
    let mut state = inner.state.lock();
    loop {
        while state.queue.is_empty() {
            if state.shutting_down || state.num_idle >= MAX_IDLE_THREADS {
                state.num_threads -= 1;
                return;
            }
            state.num_idle += 1;
            inner.work_ready.wait(&mut state);
            state.num_idle -= 1;
        }
        let queued = match state.queue.pop_front() {
            Some(queued) => queued,
            None => continue,
        };
        *queued.shared.state.lock() = JobState::Running;
        drop(state);

        let QueuedJob { shared, mut job } = queued;
        let token = CancelToken(Arc::clone(&shared.cancel));
        // A panicking job must not take the worker down; it is treated
        // as completed and its callback still runs.
        if catch_unwind(AssertUnwindSafe(|| job.run(&token))).is_err() {
            debug!(job = shared.id, "job panicked");
        }

        state = inner.state.lock();
        if shared.cancel.load(Ordering::Acquire) {
            *shared.state.lock() = JobState::Cancelled;
        } else {
            *shared.state.lock() = JobState::Done;
            state.finished.push_back(job);
            // One byte per completion; a full pipe already means a
            // wakeup is pending.
            let _ = inner.wake_tx.lock().write(&[0]);
        }
        inner.job_done.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    struct CountingJob {
        ran: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
    }

    impl Job for CountingJob {
        fn run(&mut self, _cancel: &CancelToken) {
            self.ran.fetch_add(1, Ordering::SeqCst);
        }
        fn finished(self: Box<Self>) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_terminal(handle: &JobHandle) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.state().is_terminal() {
            assert!(Instant::now() < deadline, "job did not finish in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn job_runs_and_callback_fires_on_poll() {
        let (dispatcher, mut wake_rx) = JobDispatcher::new().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let handle = dispatcher.submit(CountingJob {
            ran: ran.clone(),
            finished: finished.clone(),
        });
        wait_terminal(&handle);
        assert_eq!(handle.state(), JobState::Done);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        assert_eq!(dispatcher.poll_completions(), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        // exactly one wake byte was written
        let mut buf = [0u8; 8];
        assert_eq!(wake_rx.read(&mut buf).unwrap(), 1);
    }

    #[test]
    fn panicking_job_still_completes_once() {
        struct PanicJob {
            finished: Arc<AtomicUsize>,
        }
        impl Job for PanicJob {
            fn run(&mut self, _cancel: &CancelToken) {
                panic!("boom");
            }
            fn finished(self: Box<Self>) {
                self.finished.fetch_add(1, Ordering::SeqCst);
            }
        }
        let (dispatcher, _wake_rx) = JobDispatcher::new().unwrap();
        let finished = Arc::new(AtomicUsize::new(0));
        let handle = dispatcher.submit(PanicJob {
            finished: finished.clone(),
        });
        wait_terminal(&handle);
        assert_eq!(handle.state(), JobState::Done);
        assert_eq!(dispatcher.poll_completions(), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        // the worker survived the panic
        let follow_up = dispatcher.submit(CountingJob {
            ran: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(AtomicUsize::new(0)),
        });
        wait_terminal(&follow_up);
        assert_eq!(follow_up.state(), JobState::Done);
    }

    #[test]
    fn running_job_is_cancelled_cooperatively() {
        struct GatedJob {
            started: mpsc::Sender<()>,
            finished: Arc<AtomicUsize>,
        }
        impl Job for GatedJob {
            fn run(&mut self, cancel: &CancelToken) {
                let _ = self.started.send(());
                while !cancel.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            fn finished(self: Box<Self>) {
                self.finished.fetch_add(1, Ordering::SeqCst);
            }
        }
        let (dispatcher, _wake_rx) = JobDispatcher::new().unwrap();
        let (started_tx, started_rx) = mpsc::channel();
        let finished = Arc::new(AtomicUsize::new(0));
        let handle = dispatcher.submit(GatedJob {
            started: started_tx,
            finished: finished.clone(),
        });
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        dispatcher.cancel_all(std::slice::from_ref(&handle));
        assert_eq!(handle.state(), JobState::Cancelled);
        // the cancelled job's callback never runs
        assert_eq!(dispatcher.poll_completions(), 0);
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_after_done_returns_promptly() {
        let (dispatcher, _wake_rx) = JobDispatcher::new().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let handle = dispatcher.submit(CountingJob {
            ran,
            finished: finished.clone(),
        });
        wait_terminal(&handle);
        dispatcher.cancel(&handle);
        assert_eq!(handle.state(), JobState::Done);
        // the completion delivered before the cancel still runs
        assert_eq!(dispatcher.poll_completions(), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn idle_pool_sheds_threads() {
        let (dispatcher, _wake_rx) = JobDispatcher::new().unwrap();
        let mut handles = Vec::new();
        for _ in 0..8 {
            handles.push(dispatcher.submit(CountingJob {
                ran: Arc::new(AtomicUsize::new(0)),
                finished: Arc::new(AtomicUsize::new(0)),
            }));
        }
        for handle in &handles {
            wait_terminal(handle);
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let (total, idle) = dispatcher.thread_counts();
            if total <= MAX_IDLE_THREADS && idle <= MAX_IDLE_THREADS {
                break;
            }
            assert!(Instant::now() < deadline, "pool kept {total} threads");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
