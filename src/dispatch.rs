//! Where completion notifications run.
//!
//! Workers never call user code directly.  They hand a [Notification] to a [Dispatcher], which runs notifications
//! one at a time on a context of its own.  Two are provided:
//!
//! - [notification_queue] returns a [QueueDispatcher] and a [NotificationPump].  Notifications run on whichever
//!   thread pumps, which is how an application with its own main loop gets them delivered there.
//! - [ThreadDispatcher] owns a dedicated thread and runs everything on it.
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{error, warn};

pub type Notification = Box<dyn FnOnce() + Send + 'static>;

pub trait Dispatcher: Send + Sync + 'static {
    /// Queue a notification.  Implementations must run notifications one at a time, in the order they arrive.
    fn dispatch(&self, notification: Notification);
}

fn send(sender: &Mutex<Sender<Notification>>, notification: Notification) {
    let sent = sender
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .send(notification);
    if sent.is_err() {
        warn!("notification receiver is gone; dropping notification");
    }
}

/// Build a caller-pumped notification channel.
pub fn notification_queue() -> (QueueDispatcher, NotificationPump) {
    let (tx, rx) = mpsc::channel();
    (
        QueueDispatcher {
            sender: Mutex::new(tx),
        },
        NotificationPump { receiver: rx },
    )
}

pub struct QueueDispatcher {
    sender: Mutex<Sender<Notification>>,
}

impl Dispatcher for QueueDispatcher {
    fn dispatch(&self, notification: Notification) {
        send(&self.sender, notification);
    }
}

/// The receiving end of a [notification_queue].  Notifications only run when one of these methods is called, on
/// the calling thread.
pub struct NotificationPump {
    receiver: Receiver<Notification>,
}

impl NotificationPump {
    /// Run everything already queued without blocking.  Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(n) = self.receiver.try_recv() {
            n();
            ran += 1;
        }
        ran
    }

    /// Wait up to `timeout` for one notification and run it.
    pub fn run_next(&self, timeout: Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Ok(n) => {
                n();
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Run notifications until `count` have run or `timeout` has passed.  Returns how many ran.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut ran = 0;
        while ran < count {
            let now = Instant::now();
            if now >= deadline || !self.run_next(deadline - now) {
                break;
            }
            ran += 1;
        }
        ran
    }
}

/// Runs notifications on a dedicated thread.
///
/// The thread exits once the dispatcher is dropped and the queue is empty.  A panicking notification is logged and
/// does not take the thread down with it.
pub struct ThreadDispatcher {
    sender: Mutex<Sender<Notification>>,
}

impl ThreadDispatcher {
    pub fn spawn(name: &str) -> std::io::Result<ThreadDispatcher> {
        let (tx, rx) = mpsc::channel::<Notification>();
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for n in rx {
                    if catch_unwind(AssertUnwindSafe(n)).is_err() {
                        error!("notification panicked");
                    }
                }
            })?;
        Ok(ThreadDispatcher {
            sender: Mutex::new(tx),
        })
    }
}

impl Dispatcher for ThreadDispatcher {
    fn dispatch(&self, notification: Notification) {
        send(&self.sender, notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_queue_runs_on_pumping_thread_in_order() {
        let (dispatcher, pump) = notification_queue();
        let seen = Arc::new(Mutex::new(vec![]));
        let pump_thread = std::thread::current().id();

        let producer = {
            let seen = seen.clone();
            std::thread::spawn(move || {
                for i in 0..5 {
                    let seen = seen.clone();
                    dispatcher.dispatch(Box::new(move || {
                        assert_eq!(std::thread::current().id(), pump_thread);
                        seen.lock().unwrap().push(i);
                    }));
                }
            })
        };
        producer.join().unwrap();

        // Nothing runs until we pump.
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(pump.run_pending(), 5);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(pump.run_pending(), 0);
    }

    #[test]
    fn test_wait_for_times_out() {
        let (dispatcher, pump) = notification_queue();
        dispatcher.dispatch(Box::new(|| {}));
        assert_eq!(pump.wait_for(3, Duration::from_millis(50)), 1);
        assert!(!pump.run_next(Duration::from_millis(1)));
    }

    #[test]
    fn test_dispatch_after_pump_dropped_is_harmless() {
        let (dispatcher, pump) = notification_queue();
        drop(pump);
        dispatcher.dispatch(Box::new(|| panic!("Should never run")));
    }

    #[test]
    fn test_thread_dispatcher_is_serial() {
        let dispatcher = ThreadDispatcher::spawn("test-notify").unwrap();
        let active = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        for _ in 0..20 {
            let active = active.clone();
            let overlapped = overlapped.clone();
            let done = done.clone();
            let tx = tx.clone();
            dispatcher.dispatch(Box::new(move || {
                if active.swap(true, Ordering::SeqCst) {
                    overlapped.store(true, Ordering::SeqCst);
                }
                std::thread::sleep(Duration::from_millis(1));
                active.store(false, Ordering::SeqCst);
                if done.fetch_add(1, Ordering::SeqCst) + 1 == 20 {
                    tx.send(()).unwrap();
                }
            }));
        }

        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_thread_dispatcher_survives_panics() {
        let dispatcher = ThreadDispatcher::spawn("test-notify").unwrap();
        let (tx, rx) = mpsc::channel();
        dispatcher.dispatch(Box::new(|| panic!("boom")));
        dispatcher.dispatch(Box::new(move || tx.send(()).unwrap()));
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
    }
}
