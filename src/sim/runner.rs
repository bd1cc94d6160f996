//! Background runner: drives the engine along wall-clock time.

use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::debug;

use crate::sim::engine::Engine;
use crate::sim::time_machine::TimeMachine;
use crate::sim::types::NO_UPDATE_SCHEDULED;

struct RunnerState {
    running: bool,
    /// Query-barrier flag: true while a client waits for the worker to
    /// integrate up to the current virtual time.
    updating: bool,
    shutdown: bool,
    /// Scheduled pause, cached from the time machine.
    stop_time: i32,
    clock: TimeMachine,
}

struct Shared {
    lock: Mutex<RunnerState>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RunnerState> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, RunnerState>) -> MutexGuard<'a, RunnerState> {
        self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns the worker thread that repeatedly maps wall time to virtual time and
/// steps the engine, honoring scheduled pauses.
///
/// Client queries synchronize with the worker through [`Runner::update`]: the
/// call returns once the worker has stepped the engine up to "now" and
/// re-armed its sleep, so a query issued right after observes fresh state.
pub struct Runner {
    engine: Arc<Engine>,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Runner {
    /// Spawns the worker. With `start == false` the runner comes up paused at
    /// virtual second zero; otherwise time starts flowing immediately at the
    /// configured speed-up.
    pub fn spawn(engine: Arc<Engine>, start: bool) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            lock: Mutex::new(RunnerState {
                running: false,
                updating: false,
                shutdown: false,
                stop_time: NO_UPDATE_SCHEDULED,
                clock: TimeMachine::new(engine.speedup()),
            }),
            cond: Condvar::new(),
        });

        {
            let mut st = shared.lock();
            if !start {
                st.stop_time = st.clock.set_stop(0);
            }
            if st.stop_time != 0 {
                st.clock.start(engine.uptime());
            }
        }

        let thread = thread::Builder::new().name("meter-runner".into()).spawn({
            let engine = Arc::clone(&engine);
            let shared = Arc::clone(&shared);
            move || worker(engine, shared)
        })?;

        Ok(Self {
            engine,
            shared,
            thread: Some(thread),
        })
    }

    /// Query barrier: blocks until the worker has completed a step up to the
    /// current virtual time. Returns immediately while the runner is paused.
    pub fn update(&self) {
        let mut st = self.shared.lock();
        if st.running {
            st.updating = true;
            self.shared.cond.notify_all();
            while st.updating {
                st = self.shared.wait(st);
            }
        }
    }

    pub fn resume(&self) {
        let mut st = self.shared.lock();
        st.running = true;
        if st.stop_time <= self.engine.uptime() {
            st.stop_time = NO_UPDATE_SCHEDULED;
        }
        st.clock.start(self.engine.uptime());
        self.shared.cond.notify_all();
    }

    /// Schedules a pause at virtual time `when`; a time already reached pauses
    /// as soon as the worker observes it.
    pub fn pause(&self, when: i32) {
        let mut st = self.shared.lock();
        st.stop_time = st.clock.set_stop(when);
        self.shared.cond.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    pub fn set_speedup(&self, speedup: u16) {
        self.shared.lock().clock.set_speedup(speedup);
    }

    pub fn time(&self) -> i32 {
        let _st = self.shared.lock();
        self.engine.uptime()
    }

    /// Drives the worker out of whichever wait it sits in and joins it.
    pub fn finish(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        {
            let mut st = self.shared.lock();
            st.shutdown = true;
            st.updating = true;
            st.running = true;
        }
        self.shared.cond.notify_all();
        let _ = thread.join();

        let mut st = self.shared.lock();
        st.updating = false;
        st.running = false;
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        self.finish();
    }
}

fn worker(engine: Arc<Engine>, shared: Arc<Shared>) {
    let mut st = shared.lock();
    st.running = true;
    debug!("starting runner");

    loop {
        let now = st.clock.now();
        // The engine can sit ahead of the clock if a client stepped it while
        // the runner was paused; it never steps backwards.
        engine.step_forward((now - engine.uptime()).max(0));

        if st.shutdown {
            break;
        } else if now == st.stop_time {
            debug_assert!(st.clock.is_stopped());
            debug!("pausing");
            st.running = false;
            st.updating = false;
            shared.cond.notify_all();
            while !st.running && !st.shutdown {
                st = shared.wait(st);
            }
            debug!("resuming");
            if st.shutdown {
                break;
            }
        } else {
            debug_assert!(st.stop_time == NO_UPDATE_SCHEDULED || now < st.stop_time);

            let wakeup = engine.next_update_time().min(st.stop_time);
            st.updating = false;
            shared.cond.notify_all();

            if wakeup == NO_UPDATE_SCHEDULED {
                st = shared.wait(st);
            } else {
                let deadline = st.clock.wait_until(wakeup);
                let timeout = deadline.saturating_duration_since(Instant::now());
                let (guard, _) = shared
                    .cond
                    .wait_timeout(st, timeout)
                    .unwrap_or_else(PoisonError::into_inner);
                st = guard;
            }
        }
    }

    st.running = false;
    debug!("finishing runner");
}
