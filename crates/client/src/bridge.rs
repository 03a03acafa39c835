//! Deferred callbacks from the receiver thread to the thread that owns the UI.
//!
//! The receiver thread never touches UI state. It enqueues closures on a
//! [`CallbackScheduler`]; whoever owns rendering drains them. [`CallbackQueue`]
//! is the stock mpsc-backed scheduler, drained with
//! [`CallbackQueue::run_pending`].

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Injected scheduling primitive (an idle handler, an event-loop proxy, ...).
pub trait CallbackScheduler: Send + Sync {
    fn enqueue(&self, callback: Callback);
}

/// Notifications delivered on the scheduler's thread.
pub trait DebuggerHooks: Send + Sync {
    /// Active states changed; redraw.
    fn on_states_updated(&self) {}
    /// Result string of an evaluation.
    fn on_evaluation_result(&self, _result: &str) {}
    fn on_status_changed(&self, _status: &str) {}
    fn on_error(&self, _message: &str) {}
    /// Session or net state changed; refresh the enabled commands.
    fn on_toolbar_refresh(&self) {}
}

/// Hooks that ignore everything.
pub struct NoHooks;

impl DebuggerHooks for NoHooks {}

/// mpsc-backed scheduler.
pub struct CallbackQueue {
    tx: mpsc::Sender<Callback>,
    rx: Mutex<mpsc::Receiver<Callback>>,
}

impl CallbackQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { tx, rx: Mutex::new(rx) }
    }

    /// Run every queued callback. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let pending: Vec<Callback> = {
            let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
            rx.try_iter().collect()
        };
        let count = pending.len();
        for callback in pending {
            callback();
        }
        count
    }

    /// Wait up to `timeout` for a callback, then run everything queued.
    pub fn wait_and_run(&self, timeout: Duration) -> usize {
        let first = {
            let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
            match rx.recv_timeout(timeout) {
                Ok(cb) => Some(cb),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
            }
        };
        match first {
            Some(callback) => {
                callback();
                1 + self.run_pending()
            }
            None => 0,
        }
    }
}

impl Default for CallbackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackScheduler for CallbackQueue {
    fn enqueue(&self, callback: Callback) {
        // The receiver lives as long as the queue
        let _ = self.tx.send(callback);
    }
}

/// Receiver-side helper that wraps each hook call into a scheduled callback.
#[derive(Clone)]
pub(crate) struct Notifier {
    scheduler: Arc<dyn CallbackScheduler>,
    hooks: Arc<dyn DebuggerHooks>,
}

impl Notifier {
    pub(crate) fn new(scheduler: Arc<dyn CallbackScheduler>, hooks: Arc<dyn DebuggerHooks>) -> Self {
        Self { scheduler, hooks }
    }

    fn schedule(&self, f: impl FnOnce(&dyn DebuggerHooks) + Send + 'static) {
        let hooks = Arc::clone(&self.hooks);
        self.scheduler.enqueue(Box::new(move || f(hooks.as_ref())));
    }

    pub(crate) fn status(&self, text: &str) {
        log::info!("{}", text);
        let text = text.to_string();
        self.schedule(move |h| h.on_status_changed(&text));
    }

    pub(crate) fn error(&self, message: &str) {
        log::warn!("Debugger error: {}", message);
        let message = message.to_string();
        self.schedule(move |h| h.on_error(&message));
    }

    pub(crate) fn states_updated(&self) {
        self.schedule(|h| h.on_states_updated());
    }

    pub(crate) fn evaluation(&self, result: String) {
        self.schedule(move |h| h.on_evaluation_result(&result));
    }

    pub(crate) fn toolbar(&self) {
        self.schedule(|h| h.on_toolbar_refresh());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl DebuggerHooks for Recorder {
        fn on_status_changed(&self, status: &str) {
            self.0.lock().unwrap().push(format!("status:{}", status));
        }
        fn on_error(&self, message: &str) {
            self.0.lock().unwrap().push(format!("error:{}", message));
        }
        fn on_toolbar_refresh(&self) {
            self.0.lock().unwrap().push("toolbar".to_string());
        }
    }

    #[test]
    fn test_callbacks_run_on_draining_thread_in_order() {
        let queue = Arc::new(CallbackQueue::new());
        let recorder = Arc::new(Recorder::default());
        let notifier = Notifier::new(queue.clone(), recorder.clone());

        let worker = thread::spawn(move || {
            notifier.status("Paused.");
            notifier.error("boom");
            notifier.toolbar();
        });
        worker.join().unwrap();

        assert!(recorder.0.lock().unwrap().is_empty());
        assert_eq!(queue.run_pending(), 3);
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec!["status:Paused.", "error:boom", "toolbar"]
        );
        assert_eq!(queue.run_pending(), 0);
    }

    #[test]
    fn test_wait_and_run_times_out() {
        let queue = CallbackQueue::new();
        assert_eq!(queue.wait_and_run(Duration::from_millis(10)), 0);
    }
}
