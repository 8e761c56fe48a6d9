//! The time-ordered message queue.
//!
//! Messages are kept on a singly linked list in non-decreasing `when`
//! order; equal timestamps keep insertion order. Producers enqueue from any
//! thread; exactly one consumer, the thread that prepared the owning
//! [`Looper`](crate::Looper), pops and dispatches.
//!
//! Besides ordinary messages the list can hold *sync barriers*: sentinel
//! entries without a target. While a barrier sits at the head, synchronous
//! messages behind it are withheld and only messages flagged asynchronous
//! are delivered. The queue also runs idle handlers when it drains and
//! dispatches readiness callbacks for watched file descriptors, all from
//! the owning thread.
//!
//! One mutex guards the list, the idle-handler list, the fd table and the
//! quit flags. User callbacks always run with that mutex released so they
//! may re-enter the queue.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;

use crate::handler::Handler;
use crate::message::{Message, MessageBody, Payload, Runnable};
use crate::pool;
use crate::sync::Mutex;
use crate::time::uptime_millis;
use crate::waiter::Waiter;

/// Bitmask of file-descriptor readiness conditions.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FdEvents(pub u32);

impl FdEvents {
    pub const NONE: Self = Self(0);
    /// The descriptor is ready for reading, or has a pending incoming
    /// connection.
    pub const INPUT: Self = Self(1 << 0);
    /// The descriptor is ready for writing.
    pub const OUTPUT: Self = Self(1 << 1);
    /// The descriptor hit a fatal condition, commonly a peer hangup.
    /// Reported even when not requested.
    pub const ERROR: Self = Self(1 << 2);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn from_epoll(bits: u32) -> Self {
        let mut events = Self::NONE;
        if bits & libc::EPOLLIN as u32 != 0 {
            events |= Self::INPUT;
        }
        if bits & libc::EPOLLOUT as u32 != 0 {
            events |= Self::OUTPUT;
        }
        if bits & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
            events |= Self::ERROR;
        }
        events
    }

    pub(crate) fn to_epoll(self) -> u32 {
        let mut bits = 0;
        if self.contains(Self::INPUT) {
            bits |= libc::EPOLLIN as u32;
        }
        if self.contains(Self::OUTPUT) {
            bits |= libc::EPOLLOUT as u32;
        }
        // Error conditions are always reported by the kernel.
        bits
    }
}

impl BitOr for FdEvents {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for FdEvents {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for FdEvents {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Display for FdEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (bit, name) in [(Self::INPUT, "input"), (Self::OUTPUT, "output"), (Self::ERROR, "error")]
        {
            if self.contains(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// Invoked when the queue runs out of currently-deliverable messages.
///
/// Runs on the owning thread, at most once per drain. Returning `false`
/// removes the handler.
pub trait IdleHandler: Send + Sync {
    fn queue_idle(&self) -> bool;
}

impl<F> IdleHandler for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn queue_idle(&self) -> bool {
        self()
    }
}

/// Invoked on the owning thread when a watched descriptor reports
/// readiness.
pub trait FdEventListener: Send + Sync {
    /// Handles the reported events and returns the new watch mask. An empty
    /// mask unregisters the listener.
    fn on_fd_events(&self, fd: RawFd, events: FdEvents) -> FdEvents;
}

impl<F> FdEventListener for F
where
    F: Fn(RawFd, FdEvents) -> FdEvents + Send + Sync,
{
    fn on_fd_events(&self, fd: RawFd, events: FdEvents) -> FdEvents {
        self(fd, events)
    }
}

/// Errors surfaced by the fd-listener registry.
#[derive(Debug, Error)]
pub enum FdWatchError {
    #[error("queue is quitting")]
    Quitting,
    #[error(transparent)]
    Io(#[from] io::Error),
}

struct FdRecord {
    events: FdEvents,
    listener: Arc<dyn FdEventListener>,
    /// Bumped whenever the listener or mask is replaced in place, so a
    /// stale out-of-lock dispatch cannot clobber a newer registration.
    seq: u32,
}

/// Point-in-time view of one queued message, for debugging dumps.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSnapshot {
    pub when: u64,
    pub barrier: bool,
    /// Target handler label; `None` for barriers.
    pub target: Option<String>,
    /// `None` when the message carries an inline callback instead.
    pub what: Option<i32>,
    pub arg1: i32,
    pub arg2: i32,
    pub has_obj: bool,
    pub asynchronous: bool,
}

struct QueueState {
    messages: Option<Box<Message>>,
    idle_handlers: Vec<Arc<dyn IdleHandler>>,
    fd_records: HashMap<RawFd, FdRecord>,
    next_barrier_token: i32,
    quitting: bool,
    /// Whether `next` is parked in the waiter with a non-zero timeout.
    blocked: bool,
}

/// The queue behind a [`Looper`](crate::Looper).
///
/// Obtained from [`Looper::queue`](crate::Looper::queue) or
/// [`Looper::my_queue`](crate::Looper::my_queue).
pub struct MessageQueue {
    state: Mutex<QueueState>,
    waiter: Waiter,
    quit_allowed: bool,
}

impl MessageQueue {
    pub(crate) fn new(quit_allowed: bool) -> io::Result<MessageQueue> {
        Ok(MessageQueue {
            state: Mutex::new(QueueState {
                messages: None,
                idle_handlers: Vec::new(),
                fd_records: HashMap::new(),
                next_barrier_token: 0,
                quitting: false,
                blocked: false,
            }),
            waiter: Waiter::new()?,
            quit_allowed,
        })
    }

    /// True when the queue has no message due now: it is empty or its head
    /// is scheduled in the future.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        let now = uptime_millis();
        state.messages.as_deref().map_or(true, |head| now < head.when)
    }

    /// Whether the owning thread is currently parked waiting for work. A
    /// liveness hint: `false` while a dispatch is running, so a stuck
    /// callback shows up as "never polling".
    pub fn is_polling(&self) -> bool {
        let state = self.state.lock();
        self.is_polling_locked(&state)
    }

    fn is_polling_locked(&self, state: &QueueState) -> bool {
        !state.quitting && self.waiter.is_polling()
    }

    /// Registers an idle handler. Safe from any thread.
    pub fn add_idle_handler(&self, handler: Arc<dyn IdleHandler>) {
        let mut state = self.state.lock();
        state.idle_handlers.push(handler);
    }

    /// Removes a previously added idle handler by identity. Unknown
    /// handlers are ignored.
    pub fn remove_idle_handler(&self, handler: &Arc<dyn IdleHandler>) {
        let mut state = self.state.lock();
        state.idle_handlers.retain(|other| !Arc::ptr_eq(other, handler));
    }

    /// Posts a sync barrier stamped with the current time and returns its
    /// token.
    ///
    /// Until [`remove_sync_barrier`](Self::remove_sync_barrier) is called
    /// with that token, synchronous messages ordered at or after the
    /// barrier are withheld from dispatch; asynchronous messages keep
    /// flowing. Every barrier must eventually be removed or the queue
    /// stalls.
    pub fn post_sync_barrier(&self) -> i32 {
        self.post_sync_barrier_at(uptime_millis())
    }

    fn post_sync_barrier_at(&self, when: u64) -> i32 {
        // No wake: the whole point of the barrier is to stall the queue.
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let token = state.next_barrier_token;
        state.next_barrier_token += 1;

        let mut msg = pool::obtain();
        msg.mark_in_use();
        msg.when = when;
        msg.arg1 = token;
        // The target stays unset; that is what marks a barrier.

        let mut link = &mut state.messages;
        while link.as_deref().is_some_and(|queued| queued.when <= when) {
            link = &mut link.as_mut().unwrap().next;
        }
        msg.next = link.take();
        *link = Some(msg);
        token
    }

    /// Removes the barrier identified by `token`.
    ///
    /// # Panics
    ///
    /// Panics if no such barrier is queued; an unknown token means the
    /// caller's pairing of post and remove is broken.
    pub fn remove_sync_barrier(&self, token: i32) {
        let need_wake;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut at_head = true;
            let mut link = &mut state.messages;
            while link
                .as_deref()
                .is_some_and(|queued| !(queued.is_barrier() && queued.arg1 == token))
            {
                link = &mut link.as_mut().unwrap().next;
                at_head = false;
            }
            let Some(mut barrier) = link.take() else {
                panic!(
                    "sync barrier token {token} has not been posted or was already removed"
                );
            };
            *link = barrier.next.take();
            pool::recycle(barrier);

            // Wake only when removing the head barrier actually exposed
            // deliverable work; a quitting queue is already awake.
            need_wake = at_head
                && !state.quitting
                && state.messages.as_deref().map_or(true, |head| !head.is_barrier());
        }
        if need_wake {
            self.waiter.wake();
        }
    }

    /// Watches `fd` and delivers readiness to `listener` on the owning
    /// thread. Replaces any previous registration for the descriptor; an
    /// empty mask unregisters. [`FdEvents::ERROR`] is always watched
    /// implicitly.
    pub fn set_fd_listener(
        &self,
        fd: RawFd,
        events: FdEvents,
        listener: Arc<dyn FdEventListener>,
    ) -> Result<(), FdWatchError> {
        let mut state = self.state.lock();
        if state.quitting {
            return Err(FdWatchError::Quitting);
        }
        if events.is_empty() {
            return self.remove_fd_listener_locked(&mut state, fd);
        }
        let events = events | FdEvents::ERROR;
        match state.fd_records.get_mut(&fd) {
            Some(record) => {
                if record.events == events && Arc::ptr_eq(&record.listener, &listener) {
                    return Ok(());
                }
                let reprogram = record.events != events;
                record.events = events;
                record.listener = listener;
                record.seq = record.seq.wrapping_add(1);
                if reprogram {
                    self.waiter.watch(fd, events)?;
                }
            }
            None => {
                self.waiter.watch(fd, events)?;
                state.fd_records.insert(
                    fd,
                    FdRecord {
                        events,
                        listener,
                        seq: 0,
                    },
                );
            }
        }
        Ok(())
    }

    /// Stops watching `fd`. Unknown descriptors are ignored.
    pub fn remove_fd_listener(&self, fd: RawFd) -> Result<(), FdWatchError> {
        let mut state = self.state.lock();
        self.remove_fd_listener_locked(&mut state, fd)
    }

    fn remove_fd_listener_locked(
        &self,
        state: &mut QueueState,
        fd: RawFd,
    ) -> Result<(), FdWatchError> {
        if state.fd_records.remove(&fd).is_some() {
            self.waiter.watch(fd, FdEvents::NONE)?;
        }
        Ok(())
    }

    /// Runs one fd readiness callback with the lock released, then applies
    /// the returned mask only if the registration was not concurrently
    /// replaced (checked through the record's sequence counter).
    fn dispatch_fd_events(&self, fd: RawFd, reported: FdEvents) {
        let (listener, events, old_mask, seq) = {
            let state = self.state.lock();
            let Some(record) = state.fd_records.get(&fd) else {
                // Spurious: unregistered between the poll and now.
                return;
            };
            let events = reported & record.events;
            if events.is_empty() {
                // The watch set changed since the kernel reported.
                return;
            }
            (record.listener.clone(), events, record.events, record.seq)
        };

        let new_mask = match panic::catch_unwind(AssertUnwindSafe(|| {
            listener.on_fd_events(fd, events)
        })) {
            Ok(mask) => {
                if mask.is_empty() {
                    FdEvents::NONE
                } else {
                    mask | FdEvents::ERROR
                }
            }
            Err(_) => {
                tracing::error!(fd, "fd listener panicked; keeping its previous watch mask");
                old_mask
            }
        };

        if new_mask == old_mask {
            return;
        }
        let mut state = self.state.lock();
        let unchanged = state
            .fd_records
            .get(&fd)
            .is_some_and(|record| record.seq == seq);
        if !unchanged {
            return;
        }
        if new_mask.is_empty() {
            state.fd_records.remove(&fd);
        } else {
            state.fd_records.get_mut(&fd).expect("record checked above").events = new_mask;
        }
        if let Err(err) = self.waiter.watch(fd, new_mask) {
            tracing::warn!(fd, %err, "failed to reprogram fd watch");
        }
    }

    /// Links `msg` into the queue for delivery at `when`.
    ///
    /// Returns `false` and recycles the message when the queue is already
    /// quitting. Insertion is stable: equal timestamps keep posting order,
    /// including the `when == 0` front-of-queue class.
    ///
    /// # Panics
    ///
    /// Panics if the message has no target or is already in use.
    pub(crate) fn enqueue_message(&self, mut msg: Box<Message>, when: u64) -> bool {
        assert!(msg.target().is_some(), "message must have a target");
        assert!(!msg.is_in_use(), "message is already in use");

        let need_wake;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.quitting {
                tracing::warn!(when, "discarding message sent to a quitting queue");
                pool::recycle(msg);
                return false;
            }
            msg.mark_in_use();
            msg.when = when;

            let head_insert = state
                .messages
                .as_deref()
                .map_or(true, |head| when < head.when);
            if head_insert {
                msg.next = state.messages.take();
                state.messages = Some(msg);
                need_wake = state.blocked;
            } else {
                // Inserted behind the head. The sleeper only needs a wake
                // when it is stalled on a barrier and this message becomes
                // the earliest deliverable asynchronous one behind it.
                let mut wake = state.blocked
                    && state.messages.as_deref().is_some_and(Message::is_barrier)
                    && msg.is_asynchronous();
                let mut link = &mut state.messages;
                loop {
                    let advance = {
                        let node = link.as_deref().expect("non-empty on this path");
                        match node.next.as_deref() {
                            None => false,
                            Some(next) if when < next.when => false,
                            Some(next) => {
                                if wake && next.is_asynchronous() {
                                    // An asynchronous message already sits
                                    // ahead of this one behind the barrier.
                                    wake = false;
                                }
                                true
                            }
                        }
                    };
                    if !advance {
                        let node = link.as_mut().expect("non-empty on this path");
                        msg.next = node.next.take();
                        node.next = Some(msg);
                        break;
                    }
                    link = &mut link.as_mut().unwrap().next;
                }
                need_wake = wake;
            }
        }
        if need_wake {
            self.waiter.wake();
        }
        true
    }

    /// Blocks until a deliverable message is available and unlinks it, or
    /// returns `None` once the queue is quitting and drained.
    ///
    /// Runs idle handlers, at most once per drain, and fd readiness
    /// callbacks while waiting. Must only be called by the owning looper.
    pub(crate) fn next(&self) -> Option<Box<Message>> {
        // -1 until the first pass that finds the queue idle.
        let mut pending_idle: i32 = -1;
        let mut timeout_ms: i32 = 0;
        let mut ready: Vec<(RawFd, FdEvents)> = Vec::new();
        loop {
            ready.clear();
            if let Err(err) = self.waiter.wait(timeout_ms, &mut ready) {
                panic!("queue waiter failed: {err}");
            }
            for (fd, events) in ready.drain(..) {
                self.dispatch_fd_events(fd, events);
            }

            let idle_snapshot: Vec<Arc<dyn IdleHandler>>;
            {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                let now = uptime_millis();

                let mut link = &mut state.messages;
                if link.as_deref().is_some_and(Message::is_barrier) {
                    // Stalled by a barrier; only asynchronous messages are
                    // eligible.
                    while link.as_deref().is_some_and(|queued| {
                        queued.is_barrier() || !queued.is_asynchronous()
                    }) {
                        link = &mut link.as_mut().unwrap().next;
                    }
                }
                match link.as_deref() {
                    Some(selected) if now < selected.when => {
                        // Head not yet due; sleep until it is.
                        timeout_ms = (selected.when - now).min(i32::MAX as u64) as i32;
                    }
                    Some(_) => {
                        let mut msg = link.take().expect("selected message present");
                        *link = msg.next.take();
                        state.blocked = false;
                        debug_assert!(msg.is_in_use());
                        return Some(msg);
                    }
                    None => timeout_ms = -1,
                }

                if state.quitting {
                    // Every deliverable message has been handed out.
                    return None;
                }

                // First pass with nothing deliverable: snapshot the idle
                // handlers. Later passes skip idle dispatch until the queue
                // is found idle afresh on a future call.
                if pending_idle < 0
                    && state
                        .messages
                        .as_deref()
                        .map_or(true, |head| now < head.when)
                {
                    pending_idle = state.idle_handlers.len() as i32;
                }
                if pending_idle <= 0 {
                    state.blocked = true;
                    continue;
                }
                idle_snapshot = state.idle_handlers.clone();
            }

            for idler in &idle_snapshot {
                let keep = panic::catch_unwind(AssertUnwindSafe(|| idler.queue_idle()))
                    .unwrap_or_else(|_| {
                        tracing::error!("idle handler panicked; dropping it");
                        false
                    });
                if !keep {
                    let mut state = self.state.lock();
                    state.idle_handlers.retain(|other| !Arc::ptr_eq(other, idler));
                }
            }
            pending_idle = 0;

            // Idle handlers may have posted work; look again without
            // sleeping.
            timeout_ms = 0;
        }
    }

    /// Stops the queue.
    ///
    /// Safe quit drops only messages scheduled strictly in the future and
    /// lets the past-due prefix drain; immediate quit drops everything.
    /// Either way all further sends fail.
    ///
    /// # Panics
    ///
    /// Panics on the main-thread queue, which is not allowed to quit.
    pub(crate) fn quit(&self, safe: bool) {
        assert!(self.quit_allowed, "this queue is not allowed to quit");
        {
            let mut state = self.state.lock();
            if state.quitting {
                return;
            }
            state.quitting = true;
            if safe {
                let now = uptime_millis();
                remove_matching(&mut state.messages, &|msg| msg.when > now);
            } else {
                remove_matching(&mut state.messages, &|_| true);
            }
        }
        self.waiter.wake();
    }

    pub(crate) fn remove_messages(&self, target: &Arc<Handler>, what: i32, obj: Option<&Payload>) {
        let mut state = self.state.lock();
        remove_matching(&mut state.messages, &|msg| {
            targets(msg, target)
                && matches!(msg.body, MessageBody::Code(code) if code == what)
                && obj_matches(msg, obj)
        });
    }

    pub(crate) fn remove_callbacks(
        &self,
        target: &Arc<Handler>,
        callback: &Runnable,
        obj: Option<&Payload>,
    ) {
        let mut state = self.state.lock();
        remove_matching(&mut state.messages, &|msg| {
            targets(msg, target) && callback_matches(msg, callback) && obj_matches(msg, obj)
        });
    }

    pub(crate) fn remove_callbacks_and_messages(
        &self,
        target: &Arc<Handler>,
        obj: Option<&Payload>,
    ) {
        let mut state = self.state.lock();
        remove_matching(&mut state.messages, &|msg| {
            targets(msg, target) && obj_matches(msg, obj)
        });
    }

    pub(crate) fn has_messages(&self, target: &Arc<Handler>, what: i32, obj: Option<&Payload>) -> bool {
        self.scan(|msg| {
            targets(msg, target)
                && matches!(msg.body, MessageBody::Code(code) if code == what)
                && obj_matches(msg, obj)
        })
    }

    pub(crate) fn has_callbacks(
        &self,
        target: &Arc<Handler>,
        callback: &Runnable,
        obj: Option<&Payload>,
    ) -> bool {
        self.scan(|msg| targets(msg, target) && callback_matches(msg, callback) && obj_matches(msg, obj))
    }

    pub(crate) fn has_messages_for(&self, target: &Arc<Handler>) -> bool {
        self.scan(|msg| targets(msg, target))
    }

    fn scan(&self, pred: impl Fn(&Message) -> bool) -> bool {
        let state = self.state.lock();
        let mut cursor = state.messages.as_deref();
        while let Some(msg) = cursor {
            if pred(msg) {
                return true;
            }
            cursor = msg.next.as_deref();
        }
        false
    }

    /// Point-in-time copies of every queued message, head first.
    pub fn snapshot(&self) -> Vec<MessageSnapshot> {
        let state = self.state.lock();
        let mut out = Vec::new();
        let mut cursor = state.messages.as_deref();
        while let Some(msg) = cursor {
            out.push(MessageSnapshot {
                when: msg.when(),
                barrier: msg.is_barrier(),
                target: msg.target().map(|handler| handler.label().to_owned()),
                what: match &msg.body {
                    MessageBody::Code(code) => Some(*code),
                    MessageBody::Callback(_) => None,
                },
                arg1: msg.arg1,
                arg2: msg.arg2,
                has_obj: msg.obj.is_some(),
                asynchronous: msg.is_asynchronous(),
            });
            cursor = msg.next.as_deref();
        }
        out
    }

    /// Writes a human-readable dump of the queue, one line per message,
    /// optionally filtered to one handler.
    pub fn dump(
        &self,
        out: &mut dyn fmt::Write,
        prefix: &str,
        only: Option<&Arc<Handler>>,
    ) -> fmt::Result {
        let state = self.state.lock();
        let now = uptime_millis();
        let mut total = 0usize;
        let mut cursor = state.messages.as_deref();
        while let Some(msg) = cursor {
            if only.map_or(true, |handler| targets(msg, handler)) {
                writeln!(out, "{prefix}Message {total}: {}", msg.render(now))?;
            }
            total += 1;
            cursor = msg.next.as_deref();
        }
        writeln!(
            out,
            "{prefix}(Total messages: {total}, polling={}, quitting={})",
            self.is_polling_locked(&state),
            state.quitting
        )
    }
}

fn targets(msg: &Message, handler: &Arc<Handler>) -> bool {
    msg.target().is_some_and(|target| Arc::ptr_eq(target, handler))
}

fn obj_matches(msg: &Message, obj: Option<&Payload>) -> bool {
    match obj {
        None => true,
        Some(obj) => msg.obj.as_ref().is_some_and(|queued| Arc::ptr_eq(queued, obj)),
    }
}

fn callback_matches(msg: &Message, callback: &Runnable) -> bool {
    msg.body
        .callback()
        .is_some_and(|queued| Arc::ptr_eq(queued, callback))
}

/// Unlinks and recycles every queued message matching `pred`.
fn remove_matching(head: &mut Option<Box<Message>>, pred: &dyn Fn(&Message) -> bool) {
    let mut link = head;
    loop {
        match link.as_deref() {
            None => break,
            Some(msg) if pred(msg) => {
                let mut removed = link.take().expect("matched message present");
                *link = removed.next.take();
                pool::recycle(removed);
            }
            Some(_) => link = &mut link.as_mut().unwrap().next,
        }
    }
}
