//! Deadline timers for throttled policies.
//!
//! A TBF instance owns exactly one timer. Arming it replaces the previous deadline; when the
//! deadline passes the callback runs once on the timer's own thread. Callbacks must not touch
//! the queues, they only clear a throttle flag and wake workers.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{NrsError, Result};

/// Callback run when a timer expires.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// A re-armable one-shot deadline timer.
pub trait PolicyTimer: Send + Sync {
    /// Fire at `deadline_ns` (same time base as the policy clock), replacing any earlier arming.
    fn arm(&self, deadline_ns: u64);
    /// Disarm without firing.
    fn cancel(&self);
}

/// Creates timers for policy instances.
pub trait TimerFactory: Send + Sync {
    fn create(&self, name: &str, callback: TimerCallback) -> Result<Box<dyn PolicyTimer>>;
}

enum TimerCommand {
    Arm(Instant),
    Cancel,
    Shutdown,
}

/// Builds [`ThreadTimer`]s: one sleeping thread per timer driven by a command channel.
pub struct ThreadTimerFactory {
    clock: Arc<dyn Clock>,
}

impl ThreadTimerFactory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl TimerFactory for ThreadTimerFactory {
    fn create(&self, name: &str, callback: TimerCallback) -> Result<Box<dyn PolicyTimer>> {
        let (tx, rx) = unbounded::<TimerCommand>();
        let thread_name = format!("nrs-timer-{name}");
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let mut armed: Option<Instant> = None;
                loop {
                    let command = match armed {
                        Some(at) => match rx.recv_deadline(at) {
                            Ok(command) => command,
                            Err(RecvTimeoutError::Timeout) => {
                                armed = None;
                                callback();
                                continue;
                            }
                            Err(RecvTimeoutError::Disconnected) => break,
                        },
                        None => match rx.recv() {
                            Ok(command) => command,
                            Err(_) => break,
                        },
                    };
                    match command {
                        TimerCommand::Arm(at) => armed = Some(at),
                        TimerCommand::Cancel => armed = None,
                        TimerCommand::Shutdown => break,
                    }
                }
            })
            .map_err(|e| NrsError::OutOfMemory(format!("spawn {thread_name}: {e}")))?;

        debug!(timer = %thread_name, "timer thread started");
        Ok(Box::new(ThreadTimer {
            clock: Arc::clone(&self.clock),
            tx,
            handle: Mutex::new(Some(handle)),
        }))
    }
}

/// Timer backed by a dedicated thread.
pub struct ThreadTimer {
    clock: Arc<dyn Clock>,
    tx: Sender<TimerCommand>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PolicyTimer for ThreadTimer {
    fn arm(&self, deadline_ns: u64) {
        let wait = deadline_ns.saturating_sub(self.clock.now_ns());
        let at = Instant::now() + Duration::from_nanos(wait);
        // The receiver only disappears after shutdown.
        let _ = self.tx.send(TimerCommand::Arm(at));
    }

    fn cancel(&self) {
        let _ = self.tx.send(TimerCommand::Cancel);
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        let _ = self.tx.send(TimerCommand::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("timer thread panicked");
            }
        }
    }
}

struct ManualTimerState {
    name: String,
    deadline: Mutex<Option<u64>>,
    callback: TimerCallback,
}

/// Test timer factory: records armed deadlines and fires them when asked.
#[derive(Clone, Default)]
pub struct ManualTimerFactory {
    timers: Arc<Mutex<Vec<Arc<ManualTimerState>>>>,
}

impl ManualTimerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently armed deadlines as `(timer name, deadline)`.
    pub fn armed(&self) -> Vec<(String, u64)> {
        self.timers
            .lock()
            .iter()
            .filter_map(|t| t.deadline.lock().map(|d| (t.name.clone(), d)))
            .collect()
    }

    /// Fire every timer whose deadline is at or before `now_ns`. Returns how many fired.
    pub fn fire_due(&self, now_ns: u64) -> usize {
        let due: Vec<Arc<ManualTimerState>> = self
            .timers
            .lock()
            .iter()
            .filter(|t| {
                let mut deadline = t.deadline.lock();
                match *deadline {
                    Some(d) if d <= now_ns => {
                        *deadline = None;
                        true
                    }
                    _ => false,
                }
            })
            .cloned()
            .collect();
        for timer in &due {
            (timer.callback)();
        }
        due.len()
    }
}

impl TimerFactory for ManualTimerFactory {
    fn create(&self, name: &str, callback: TimerCallback) -> Result<Box<dyn PolicyTimer>> {
        let state = Arc::new(ManualTimerState {
            name: name.to_owned(),
            deadline: Mutex::new(None),
            callback,
        });
        self.timers.lock().push(Arc::clone(&state));
        Ok(Box::new(ManualTimer { state }))
    }
}

struct ManualTimer {
    state: Arc<ManualTimerState>,
}

impl PolicyTimer for ManualTimer {
    fn arm(&self, deadline_ns: u64) {
        *self.state.deadline.lock() = Some(deadline_ns);
    }

    fn cancel(&self) {
        *self.state.deadline.lock() = None;
    }
}
