//! Thread-affine message endpoints.
//!
//! A handler binds to one looper at construction. Any thread may post work
//! through it; the work always executes on the looper's thread, one message
//! at a time, in queue order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::looper::Looper;
use crate::message::{Message, MessageBody, Payload, Runnable};
use crate::queue::MessageQueue;
use crate::sync::{Condvar, Mutex};
use crate::time::uptime_millis;

/// Receives messages routed by code. The handler's "subclass method".
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, msg: &Message);
}

/// Intercepts messages before they reach the [`MessageHandler`]. Returning
/// `true` marks the message handled and stops routing.
pub trait HandlerHook: Send + Sync {
    fn handle_message(&self, msg: &Message) -> bool;
}

/// Builder for [`Handler`]; see [`Handler::builder`].
#[derive(Default)]
pub struct HandlerBuilder {
    looper: Option<Arc<Looper>>,
    hook: Option<Arc<dyn HandlerHook>>,
    behavior: Option<Arc<dyn MessageHandler>>,
    asynchronous: bool,
    name: Option<String>,
}

impl HandlerBuilder {
    /// Binds to an explicit looper instead of the calling thread's.
    pub fn looper(mut self, looper: Arc<Looper>) -> Self {
        self.looper = Some(looper);
        self
    }

    /// Installs an intercept hook consulted before the behavior.
    pub fn hook(mut self, hook: Arc<dyn HandlerHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Installs the message behavior invoked for code-routed messages.
    pub fn behavior(mut self, behavior: Arc<dyn MessageHandler>) -> Self {
        self.behavior = Some(behavior);
        self
    }

    /// Stamps every outgoing message asynchronous so it bypasses sync
    /// barriers.
    pub fn asynchronous(mut self, asynchronous: bool) -> Self {
        self.asynchronous = asynchronous;
        self
    }

    /// Label used in dumps and dispatch logging.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// # Panics
    ///
    /// Panics when no looper was given and the calling thread has not
    /// prepared one.
    pub fn build(self) -> Arc<Handler> {
        let looper = self
            .looper
            .or_else(Looper::my_looper)
            .unwrap_or_else(|| {
                panic!("cannot create a handler on a thread that has not prepared a looper")
            });
        Arc::new(Handler {
            queue: looper.queue().clone(),
            looper,
            hook: self.hook,
            behavior: self.behavior,
            asynchronous: self.asynchronous,
            name: self.name,
        })
    }
}

/// Posts and receives messages on one looper's queue.
pub struct Handler {
    looper: Arc<Looper>,
    queue: Arc<MessageQueue>,
    hook: Option<Arc<dyn HandlerHook>>,
    behavior: Option<Arc<dyn MessageHandler>>,
    asynchronous: bool,
    name: Option<String>,
}

impl Handler {
    /// A plain handler bound to the calling thread's looper.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread has not prepared a looper.
    pub fn new() -> Arc<Handler> {
        Self::builder().build()
    }

    /// A plain handler bound to the given looper.
    pub fn for_looper(looper: &Arc<Looper>) -> Arc<Handler> {
        Self::builder().looper(looper.clone()).build()
    }

    pub fn builder() -> HandlerBuilder {
        HandlerBuilder::default()
    }

    /// The looper this handler posts into.
    pub fn looper(&self) -> &Arc<Looper> {
        &self.looper
    }

    pub(crate) fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("<handler>")
    }

    // ---- obtain conveniences ------------------------------------------

    /// An empty message from the pool with this handler as target.
    pub fn obtain_message(self: &Arc<Self>, what: i32) -> Box<Message> {
        let mut msg = Message::obtain();
        msg.body = MessageBody::Code(what);
        msg.set_target(self.clone());
        msg
    }

    /// Like [`obtain_message`](Self::obtain_message) with the integer slots
    /// filled in.
    pub fn obtain_message_args(self: &Arc<Self>, what: i32, arg1: i32, arg2: i32) -> Box<Message> {
        let mut msg = self.obtain_message(what);
        msg.arg1 = arg1;
        msg.arg2 = arg2;
        msg
    }

    /// Like [`obtain_message`](Self::obtain_message) with a payload.
    pub fn obtain_message_obj(self: &Arc<Self>, what: i32, obj: Payload) -> Box<Message> {
        let mut msg = self.obtain_message(what);
        msg.obj = Some(obj);
        msg
    }

    // ---- posting ------------------------------------------------------

    /// Enqueues `task` to run on the looper thread as soon as the queue
    /// reaches it. Returns `false` if the looper is quitting.
    pub fn post(self: &Arc<Self>, task: Runnable) -> bool {
        self.post_delayed(task, 0)
    }

    /// Enqueues `task` to run after at least `delay_ms` milliseconds.
    pub fn post_delayed(self: &Arc<Self>, task: Runnable, delay_ms: u64) -> bool {
        self.send_message_delayed(self.wrap_callback(task), delay_ms)
    }

    /// Enqueues `task` for the absolute [`uptime_millis`] time `at_ms`.
    pub fn post_at_time(self: &Arc<Self>, task: Runnable, at_ms: u64) -> bool {
        self.send_message_at_time(self.wrap_callback(task), at_ms)
    }

    /// Enqueues `task` ahead of every time-stamped message.
    ///
    /// This deliberately breaks FIFO ordering; reserve it for interrupts
    /// that must preempt queued work, or starvation follows.
    pub fn post_at_front(self: &Arc<Self>, task: Runnable) -> bool {
        self.enqueue(self.wrap_callback(task), 0)
    }

    /// Stamps this handler as target and enqueues for immediate delivery.
    pub fn send_message(self: &Arc<Self>, msg: Box<Message>) -> bool {
        self.send_message_delayed(msg, 0)
    }

    /// Stamps this handler as target and enqueues after `delay_ms`.
    pub fn send_message_delayed(self: &Arc<Self>, msg: Box<Message>, delay_ms: u64) -> bool {
        self.send_message_at_time(msg, uptime_millis().saturating_add(delay_ms))
    }

    /// Stamps this handler as target and enqueues for the absolute
    /// [`uptime_millis`] time `at_ms`.
    pub fn send_message_at_time(self: &Arc<Self>, msg: Box<Message>, at_ms: u64) -> bool {
        self.enqueue(msg, at_ms)
    }

    /// Stamps this handler as target and enqueues ahead of every
    /// time-stamped message. See [`post_at_front`](Self::post_at_front).
    pub fn send_message_at_front(self: &Arc<Self>, msg: Box<Message>) -> bool {
        self.enqueue(msg, 0)
    }

    /// Sends a message carrying only a code.
    pub fn send_empty_message(self: &Arc<Self>, what: i32) -> bool {
        self.send_empty_message_delayed(what, 0)
    }

    /// Sends a message carrying only a code, delayed by `delay_ms`.
    pub fn send_empty_message_delayed(self: &Arc<Self>, what: i32, delay_ms: u64) -> bool {
        self.send_message_delayed(self.obtain_message(what), delay_ms)
    }

    fn wrap_callback(self: &Arc<Self>, task: Runnable) -> Box<Message> {
        let mut msg = Message::obtain();
        msg.body = MessageBody::Callback(task);
        msg.set_target(self.clone());
        msg
    }

    fn enqueue(self: &Arc<Self>, mut msg: Box<Message>, when: u64) -> bool {
        msg.set_target(self.clone());
        if self.asynchronous {
            msg.set_asynchronous(true);
        }
        self.queue.enqueue_message(msg, when)
    }

    // ---- removal and query --------------------------------------------

    /// Removes every pending code-routed message with this code. A `None`
    /// payload matches any.
    pub fn remove_messages(self: &Arc<Self>, what: i32, obj: Option<&Payload>) {
        self.queue.remove_messages(self, what, obj);
    }

    /// Removes every pending post of exactly this callback.
    pub fn remove_callbacks(self: &Arc<Self>, task: &Runnable, obj: Option<&Payload>) {
        self.queue.remove_callbacks(self, task, obj);
    }

    /// Removes every pending message and callback for this handler whose
    /// payload matches; a `None` payload matches any.
    pub fn remove_callbacks_and_messages(self: &Arc<Self>, obj: Option<&Payload>) {
        self.queue.remove_callbacks_and_messages(self, obj);
    }

    pub fn has_messages(self: &Arc<Self>, what: i32) -> bool {
        self.queue.has_messages(self, what, None)
    }

    pub fn has_messages_with_obj(self: &Arc<Self>, what: i32, obj: &Payload) -> bool {
        self.queue.has_messages(self, what, Some(obj))
    }

    pub fn has_callbacks(self: &Arc<Self>, task: &Runnable) -> bool {
        self.queue.has_callbacks(self, task, None)
    }

    /// Whether any message for this handler is pending at all.
    pub fn has_pending_work(self: &Arc<Self>) -> bool {
        self.queue.has_messages_for(self)
    }

    // ---- dispatch -----------------------------------------------------

    /// Routes one delivered message. Called by the looper.
    ///
    /// Callback messages run their callback; otherwise the intercept hook
    /// gets a chance to claim the message before it reaches the behavior.
    pub fn dispatch(&self, msg: &Message) {
        if let MessageBody::Callback(task) = &msg.body {
            task();
            return;
        }
        if let Some(hook) = &self.hook {
            if hook.handle_message(msg) {
                return;
            }
        }
        if let Some(behavior) = &self.behavior {
            behavior.handle_message(msg);
        }
    }

    // ---- synchronous execution ----------------------------------------

    /// Runs `task` on the looper thread and blocks the caller until it
    /// completes or the timeout expires.
    ///
    /// Runs inline when already on the looper thread. On timeout the task
    /// stays queued and may still run later; `false` is returned.
    ///
    /// This primitive deadlocks by construction if the looper thread is
    /// itself waiting on the caller, and a timed-out caller cannot tell
    /// whether the task ran. It exists for bootstrap handshakes; prefer
    /// posting a message that replies through [`Message::reply_to`].
    pub fn run_synchronously(
        self: &Arc<Self>,
        task: impl FnOnce() + Send + 'static,
        timeout: Option<Duration>,
    ) -> bool {
        if self.looper.is_current_thread() {
            task();
            return true;
        }
        let runner = Arc::new(BlockingRunner::new(task));
        let post = {
            let runner = runner.clone();
            Arc::new(move || runner.run()) as Runnable
        };
        if !self.post(post) {
            return false;
        }
        runner.wait(timeout)
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("asynchronous", &self.asynchronous)
            .finish_non_exhaustive()
    }
}

struct RunnerState {
    task: Option<Box<dyn FnOnce() + Send>>,
    done: bool,
}

/// One-shot rendezvous between the posting thread and the looper thread.
struct BlockingRunner {
    state: Mutex<RunnerState>,
    done_cv: Condvar,
}

impl BlockingRunner {
    fn new(task: impl FnOnce() + Send + 'static) -> Self {
        Self {
            state: Mutex::new(RunnerState {
                task: Some(Box::new(task)),
                done: false,
            }),
            done_cv: Condvar::new(),
        }
    }

    fn run(&self) {
        let task = self.state.lock().task.take();
        if let Some(task) = task {
            task();
        }
        self.state.lock().done = true;
        self.done_cv.notify_all();
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock();
        while !state.done {
            match deadline {
                None => state = self.done_cv.wait(state),
                Some(deadline) => {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero()) else {
                        return false;
                    };
                    let (guard, _timed_out) = self.done_cv.wait_timeout(state, remaining);
                    state = guard;
                }
            }
        }
        true
    }
}
