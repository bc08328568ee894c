//! Scheduled executor backing the message-processor autoflush and any
//! other periodic callback (book cleanup, active-quote-table sweeps).
//!
//! Tasks live in a map keyed by absolute scheduled time (nanoseconds since
//! epoch); collisions are resolved by incrementing the key until unused,
//! so ordering within a tie is still deterministic. Worker threads sleep
//! on a condvar bounded by the next due time.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::error;

pub type Action = Arc<dyn Fn() + Send + Sync>;
pub type ExceptionHandler = Arc<dyn Fn(&str) + Send + Sync>;

pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_nanos() as i64
}

struct Task {
    id: i64,
    name: String,
    action: Action,
    on_exception: Option<ExceptionHandler>,
    /// 0 means one-time.
    interval_ns: i64,
}

struct TimerState {
    by_time: BTreeMap<i64, Task>,
    id_to_time: HashMap<i64, i64>,
    name_to_id: HashMap<String, i64>,
}

pub struct Timer {
    state: Mutex<TimerState>,
    cv: Condvar,
    next_id: AtomicI64,
    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Timer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TimerState {
                by_time: BTreeMap::new(),
                id_to_time: HashMap::new(),
                name_to_id: HashMap::new(),
            }),
            cv: Condvar::new(),
            next_id: AtomicI64::new(1),
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn start(self: &Arc<Self>, name: &str, n_threads: usize) {
        let mut workers = self.workers.lock().unwrap();
        for i in 0..n_threads {
            let timer = self.clone();
            let thread_name = format!("{name}_{i:02}");
            let handle = thread::Builder::new()
                .name(thread_name)
                .spawn(move || timer.worker_loop())
                .expect("failed to spawn timer worker");
            workers.push(handle);
        }
    }

    pub fn stop(&self, detach: bool) {
        self.shutdown.store(true, Ordering::Release);
        self.cv.notify_all();
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            if detach {
                drop(handle);
            } else {
                let _ = handle.join();
            }
        }
    }

    fn unused_key(state: &TimerState, mut time: i64) -> i64 {
        while state.by_time.contains_key(&time) {
            time += 1;
        }
        time
    }

    pub fn schedule(
        &self,
        name: &str,
        action: Action,
        first_delay_ns: i64,
        repeat_interval_ns: i64,
        on_exception: Option<ExceptionHandler>,
    ) -> i64 {
        self.schedule_at(name, action, now_ns() + first_delay_ns, repeat_interval_ns, on_exception)
    }

    pub fn schedule_at(
        &self,
        name: &str,
        action: Action,
        absolute_time_ns: i64,
        repeat_interval_ns: i64,
        on_exception: Option<ExceptionHandler>,
    ) -> i64 {
        let mut state = self.state.lock().unwrap();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let key = Self::unused_key(&state, absolute_time_ns);
        state.by_time.insert(
            key,
            Task {
                id,
                name: name.to_string(),
                action,
                on_exception,
                interval_ns: repeat_interval_ns,
            },
        );
        state.id_to_time.insert(id, key);
        state.name_to_id.insert(name.to_string(), id);
        drop(state);
        self.cv.notify_all();
        id
    }

    pub fn cancel(&self, task_id: i64) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(time) = state.id_to_time.remove(&task_id) {
            if let Some(task) = state.by_time.remove(&time) {
                state.name_to_id.remove(&task.name);
            }
            true
        } else {
            false
        }
    }

    pub fn cancel_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.by_time.clear();
        state.id_to_time.clear();
        state.name_to_id.clear();
    }

    pub fn reschedule(
        &self,
        task_id: i64,
        new_time_ns: i64,
        new_action: Option<Action>,
        new_on_exception: Option<ExceptionHandler>,
    ) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(old_time) = state.id_to_time.remove(&task_id) else {
            return false;
        };
        let Some(mut task) = state.by_time.remove(&old_time) else {
            return false;
        };
        if let Some(action) = new_action {
            task.action = action;
        }
        if new_on_exception.is_some() {
            task.on_exception = new_on_exception;
        }
        let key = Self::unused_key(&state, new_time_ns);
        state.id_to_time.insert(task_id, key);
        state.by_time.insert(key, task);
        drop(state);
        self.cv.notify_all();
        true
    }

    /// Debounce: if a task registered under `unique_name` is still
    /// pending, its time is reset to `now + delay`; otherwise a new task
    /// is created. Repeated calls within the window collapse to one
    /// execution.
    pub fn execute_delayed(&self, unique_name: &str, action: Action, delay_ns: i64) -> i64 {
        let existing_id = self.state.lock().unwrap().name_to_id.get(unique_name).copied();
        match existing_id {
            Some(id) => {
                self.reschedule(id, now_ns() + delay_ns, Some(action), None);
                id
            }
            None => self.schedule(unique_name, action, delay_ns, 0, None),
        }
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            let mut state = self.state.lock().unwrap();
            loop {
                if self.shutdown.load(Ordering::Acquire) {
                    return;
                }
                match state.by_time.keys().next().copied() {
                    None => {
                        let (guard, _) = self
                            .cv
                            .wait_timeout(state, Duration::from_secs(1))
                            .unwrap();
                        state = guard;
                        continue;
                    }
                    Some(next_due) => {
                        let now = now_ns();
                        if next_due > now {
                            let wait_for = Duration::from_nanos((next_due - now).max(0) as u64);
                            let (guard, _) = self.cv.wait_timeout(state, wait_for).unwrap();
                            state = guard;
                            continue;
                        }
                        let task = state.by_time.remove(&next_due).unwrap();
                        state.id_to_time.remove(&task.id);
                        if task.interval_ns == 0 {
                            state.name_to_id.remove(&task.name);
                        }
                        drop(state);

                        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| (task.action)())) {
                            let msg = panic
                                .downcast_ref::<&str>()
                                .map(|s| s.to_string())
                                .or_else(|| panic.downcast_ref::<String>().cloned())
                                .unwrap_or_else(|| "timer task panicked".to_string());
                            error!("timer task '{}' panicked: {msg}", task.name);
                            if let Some(handler) = &task.on_exception {
                                handler(&msg);
                            }
                        }

                        if task.interval_ns > 0 && !self.shutdown.load(Ordering::Acquire) {
                            self.schedule_at(
                                &task.name,
                                task.action.clone(),
                                now_ns() + task.interval_ns,
                                task.interval_ns,
                                task.on_exception.clone(),
                            );
                        }
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;

    #[test]
    fn execute_delayed_collapses_repeated_calls() {
        let timer = Timer::new();
        timer.start("test", 1);
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let count = count.clone();
            timer.execute_delayed("debounce", Arc::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }), 50_000_000);
        }

        thread::sleep(StdDuration::from_millis(200));
        timer.stop(false);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
