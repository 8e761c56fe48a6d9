//! The per-thread loop driver.
//!
//! A thread calls [`Looper::prepare`] once to bind a queue to itself,
//! creates its handlers, then calls [`Looper::run`] to process messages
//! until the queue quits.
//!
//! ```no_run
//! use std::sync::Arc;
//! use runloop::{Handler, Looper};
//!
//! let looper = Looper::prepare();
//! let handler = Handler::builder().name("worker").build();
//! handler.post(Arc::new(|| println!("first message")));
//! looper.run();
//! ```

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use crate::message::MessageBody;
use crate::pool;
use crate::queue::MessageQueue;
use crate::sync::Mutex;
use crate::time::{uptime_millis, wall_millis};
use crate::trace::Printer;

thread_local! {
    static CURRENT: RefCell<Option<Arc<Looper>>> = const { RefCell::new(None) };
}

static MAIN: OnceLock<Arc<Looper>> = OnceLock::new();

/// Drives the message queue bound to one thread.
pub struct Looper {
    queue: Arc<MessageQueue>,
    thread: ThreadId,
    thread_name: String,
    logging: Mutex<Option<Printer>>,
    slow_dispatch_ms: AtomicU64,
    slow_delivery_ms: AtomicU64,
}

impl Looper {
    /// Binds a new queue to the calling thread and returns its looper.
    ///
    /// # Panics
    ///
    /// Panics if the thread already has a looper, or if the OS refuses the
    /// resources for the wait primitive.
    pub fn prepare() -> Arc<Looper> {
        Self::prepare_inner(true)
    }

    /// Like [`prepare`](Self::prepare), but marks this looper as the
    /// process main looper. The main queue is not allowed to quit.
    ///
    /// # Panics
    ///
    /// Panics if a main looper was already prepared anywhere in the
    /// process.
    pub fn prepare_main() -> Arc<Looper> {
        let looper = Self::prepare_inner(false);
        if MAIN.set(looper.clone()).is_err() {
            panic!("the main looper has already been prepared");
        }
        looper
    }

    fn prepare_inner(quit_allowed: bool) -> Arc<Looper> {
        CURRENT.with(|current| {
            let mut slot = current.borrow_mut();
            if slot.is_some() {
                panic!("only one looper may be created per thread");
            }
            let queue = MessageQueue::new(quit_allowed)
                .unwrap_or_else(|err| panic!("failed to set up the thread waiter: {err}"));
            let handle = thread::current();
            let looper = Arc::new(Looper {
                queue: Arc::new(queue),
                thread: handle.id(),
                thread_name: handle.name().unwrap_or("<unnamed>").to_owned(),
                logging: Mutex::new(None),
                slow_dispatch_ms: AtomicU64::new(0),
                slow_delivery_ms: AtomicU64::new(0),
            });
            *slot = Some(looper.clone());
            looper
        })
    }

    /// The calling thread's looper, if it prepared one.
    pub fn my_looper() -> Option<Arc<Looper>> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// The calling thread's queue, if it prepared a looper.
    pub fn my_queue() -> Option<Arc<MessageQueue>> {
        Self::my_looper().map(|looper| looper.queue.clone())
    }

    /// The process main looper, if one was prepared.
    pub fn main_looper() -> Option<Arc<Looper>> {
        MAIN.get().cloned()
    }

    /// The queue this looper drives.
    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    /// Whether the calling thread is the one that prepared this looper.
    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Runs the loop until the queue quits and drains.
    ///
    /// Each delivered message is dispatched to its target handler and then
    /// recycled. A panicking handler unwinds out of this call untouched.
    ///
    /// # Panics
    ///
    /// Panics when called from a thread other than the one that prepared
    /// this looper.
    pub fn run(&self) {
        assert!(
            self.is_current_thread(),
            "Looper::run must be called on the thread that prepared it"
        );
        let mut slow_delivery_detected = false;
        loop {
            let Some(msg) = self.queue.next() else {
                // The queue is quitting and drained.
                return;
            };
            let target = msg
                .target()
                .cloned()
                .expect("next() only returns targeted messages");

            // Keep the printer in a local; a handler may swap it mid-dispatch.
            let logging = self.logging.lock().clone();
            if let Some(printer) = &logging {
                printer(&dispatch_line(">>>>> Dispatching to", target.label(), &msg.body));
            }

            let slow_dispatch_ms = self.slow_dispatch_ms.load(Ordering::Relaxed);
            let slow_delivery_ms = self.slow_delivery_ms.load(Ordering::Relaxed);
            // Front-of-queue messages carry when == 0; their delivery lag is
            // meaningless.
            let log_slow_delivery = slow_delivery_ms > 0 && msg.when() > 0;
            let log_slow_dispatch = slow_dispatch_ms > 0;

            let dispatch_start = if log_slow_delivery || log_slow_dispatch {
                uptime_millis()
            } else {
                0
            };
            target.dispatch(&msg);
            let dispatch_end = if log_slow_dispatch { uptime_millis() } else { 0 };

            if log_slow_delivery {
                if slow_delivery_detected {
                    if dispatch_start.saturating_sub(msg.when()) <= 10 {
                        tracing::warn!(thread = %self.thread_name, "drained");
                        slow_delivery_detected = false;
                    }
                } else if show_slow_log(
                    slow_delivery_ms,
                    msg.when(),
                    dispatch_start,
                    "delivery",
                    &self.thread_name,
                    msg.what(),
                ) {
                    // One report per backlog; stay quiet until it drains.
                    slow_delivery_detected = true;
                }
            }
            if log_slow_dispatch {
                show_slow_log(
                    slow_dispatch_ms,
                    dispatch_start,
                    dispatch_end,
                    "dispatch",
                    &self.thread_name,
                    msg.what(),
                );
            }

            if let Some(printer) = &logging {
                printer(&dispatch_line("<<<<< Finished to", target.label(), &msg.body));
            }

            pool::recycle(msg);
        }
    }

    /// Stops the loop immediately, discarding all pending messages.
    ///
    /// Prefer [`quit_safely`](Self::quit_safely) so already-due work still
    /// runs. Panics on the main looper, which is not allowed to quit.
    pub fn quit(&self) {
        self.queue.quit(false);
    }

    /// Stops the loop once every message already due has been delivered.
    ///
    /// Pending delayed messages are discarded. Panics on the main looper,
    /// which is not allowed to quit.
    pub fn quit_safely(&self) {
        self.queue.quit(true);
    }

    /// Installs a printer that receives a line at the start and end of
    /// every dispatch, or removes it with `None`.
    pub fn set_message_logging(&self, printer: Option<Printer>) {
        *self.logging.lock() = printer;
    }

    /// Sets the surveillance thresholds, in milliseconds; zero disables the
    /// respective warning. Dispatch measures time spent inside the handler,
    /// delivery measures lag between a message's due time and its dispatch
    /// start.
    pub fn set_slow_log_thresholds(&self, dispatch_ms: u64, delivery_ms: u64) {
        self.slow_dispatch_ms.store(dispatch_ms, Ordering::Relaxed);
        self.slow_delivery_ms.store(delivery_ms, Ordering::Relaxed);
    }

    /// Writes this looper's state and its queue contents for debugging.
    pub fn dump(&self, out: &mut dyn fmt::Write, prefix: &str) -> fmt::Result {
        writeln!(
            out,
            "{prefix}Looper ({}) dumped at unix {}ms",
            self.thread_name,
            wall_millis()
        )?;
        self.queue.dump(out, &format!("{prefix}  "), None)
    }
}

impl fmt::Debug for Looper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Looper")
            .field("thread", &self.thread_name)
            .finish_non_exhaustive()
    }
}

fn dispatch_line(verb: &str, label: &str, body: &MessageBody) -> String {
    match body {
        MessageBody::Callback(_) => format!("{verb} {label} (callback)"),
        MessageBody::Code(what) => format!("{verb} {label}: {what}"),
    }
}

fn show_slow_log(
    threshold_ms: u64,
    start: u64,
    end: u64,
    what: &str,
    thread: &str,
    code: i32,
) -> bool {
    let actual = end.saturating_sub(start);
    if actual < threshold_ms {
        return false;
    }
    tracing::warn!(took_ms = actual, thread, code, "slow {what}");
    true
}
