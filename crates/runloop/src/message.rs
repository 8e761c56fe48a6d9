//! Message records.
//!
//! A message is a small value record stamped with a target [`Handler`] and
//! a delivery time, then threaded into the target's queue through its own
//! `next` link. Records are obtained from a process-global pool and
//! recycled back into it after dispatch, so steady-state traffic allocates
//! nothing.
//!
//! A record is always in exactly one of four states: parked in the pool,
//! owned by the caller that obtained it, linked into a queue, or in
//! dispatch. `Box` ownership makes the transitions explicit and the
//! `IN_USE` flag enforces the discipline at runtime.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::handler::Handler;
use crate::pool;

/// Inline work carried by a message instead of a numeric code.
///
/// Compared by identity in removal scans, so keep the `Arc` around if the
/// posted work may need to be cancelled.
pub type Runnable = Arc<dyn Fn() + Send + Sync>;

/// Opaque payload slot. Matched by identity (`Arc::ptr_eq`) in remove and
/// has scans.
pub type Payload = Arc<dyn Any + Send + Sync>;

pub(crate) const FLAG_IN_USE: u8 = 1 << 0;
pub(crate) const FLAG_ASYNCHRONOUS: u8 = 1 << 1;

/// What a message asks its target to do.
#[derive(Clone)]
pub enum MessageBody {
    /// Route a user-defined code to the handler's message method.
    Code(i32),
    /// Run an inline callback instead of the handler's message method.
    Callback(Runnable),
}

impl MessageBody {
    /// The user code, or 0 for callback messages.
    pub fn what(&self) -> i32 {
        match self {
            Self::Code(what) => *what,
            Self::Callback(_) => 0,
        }
    }

    pub fn callback(&self) -> Option<&Runnable> {
        match self {
            Self::Callback(task) => Some(task),
            Self::Code(_) => None,
        }
    }
}

impl Default for MessageBody {
    fn default() -> Self {
        Self::Code(0)
    }
}

impl fmt::Debug for MessageBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(what) => f.debug_tuple("Code").field(what).finish(),
            Self::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// A unit of work delivered through a [`MessageQueue`](crate::MessageQueue).
pub struct Message {
    /// Routing variant: user code or inline callback.
    pub body: MessageBody,
    /// First integer slot. Barriers carry their token here.
    pub arg1: i32,
    /// Second integer slot.
    pub arg2: i32,
    /// Opaque payload, matched by identity in removal scans.
    pub obj: Option<Payload>,
    /// Optional reply target for request/response conversations.
    pub reply_to: Option<Arc<Handler>>,
    pub(crate) when: u64,
    pub(crate) flags: u8,
    /// `None` marks a sync barrier.
    pub(crate) target: Option<Arc<Handler>>,
    /// Intrusive link used by both the queue and the pool free list.
    pub(crate) next: Option<Box<Message>>,
}

impl Message {
    pub(crate) fn new() -> Self {
        Self {
            body: MessageBody::default(),
            arg1: 0,
            arg2: 0,
            obj: None,
            reply_to: None,
            when: 0,
            flags: 0,
            target: None,
            next: None,
        }
    }

    /// Returns a cleared message from the global pool, allocating only when
    /// the pool is empty.
    pub fn obtain() -> Box<Message> {
        pool::obtain()
    }

    /// Like [`obtain`](Self::obtain), but copies the user-visible fields of
    /// `orig` (body, args, payload, reply target and target handler). The
    /// in-use mark, delivery time and link are not copied.
    pub fn obtain_copy(orig: &Message) -> Box<Message> {
        let mut msg = pool::obtain();
        msg.copy_from(orig);
        msg
    }

    /// Copies the user-visible fields of `other` into `self`, clearing the
    /// in-use mark.
    pub fn copy_from(&mut self, other: &Message) {
        self.body = other.body.clone();
        self.arg1 = other.arg1;
        self.arg2 = other.arg2;
        self.obj = other.obj.clone();
        self.reply_to = other.reply_to.clone();
        self.target = other.target.clone();
        self.flags = other.flags & !FLAG_IN_USE;
    }

    /// The user code, or 0 for callback messages.
    pub fn what(&self) -> i32 {
        self.body.what()
    }

    /// Delivery time in [`uptime_millis`](crate::uptime_millis) terms.
    /// Meaningful once the message is enqueued.
    pub fn when(&self) -> u64 {
        self.when
    }

    /// The handler this message is routed to, if stamped.
    pub fn target(&self) -> Option<&Arc<Handler>> {
        self.target.as_ref()
    }

    pub(crate) fn set_target(&mut self, target: Arc<Handler>) {
        self.target = Some(target);
    }

    /// Whether this message bypasses sync barriers.
    pub fn is_asynchronous(&self) -> bool {
        self.flags & FLAG_ASYNCHRONOUS != 0
    }

    /// Marks this message as exempt from sync barriers.
    ///
    /// Certain operations, such as view invalidation, may introduce barriers
    /// to suspend ordinary work until some condition is met. Asynchronous
    /// messages represent interrupts that do not require global ordering
    /// with respect to synchronous ones, so they keep flowing.
    pub fn set_asynchronous(&mut self, asynchronous: bool) {
        if asynchronous {
            self.flags |= FLAG_ASYNCHRONOUS;
        } else {
            self.flags &= !FLAG_ASYNCHRONOUS;
        }
    }

    pub(crate) fn is_in_use(&self) -> bool {
        self.flags & FLAG_IN_USE != 0
    }

    pub(crate) fn mark_in_use(&mut self) {
        self.flags |= FLAG_IN_USE;
    }

    pub(crate) fn is_barrier(&self) -> bool {
        self.target.is_none()
    }

    /// Returns this message to the global pool.
    ///
    /// # Panics
    ///
    /// Panics if the message is still in use, that is enqueued or being
    /// dispatched. The runtime recycles such messages itself through the
    /// internal post-dispatch path.
    pub fn recycle(self: Box<Message>) {
        assert!(
            !self.is_in_use(),
            "message cannot be recycled while it is still in use"
        );
        pool::recycle(self);
    }

    /// Resets every field to its obtained state. The in-use mark stays set
    /// while the record sits in the pool so stray references trip the
    /// checks; `obtain` clears it.
    pub(crate) fn clear(&mut self) {
        debug_assert!(self.next.is_none(), "clearing a message that is still linked");
        self.body = MessageBody::default();
        self.arg1 = 0;
        self.arg2 = 0;
        self.obj = None;
        self.reply_to = None;
        self.when = 0;
        self.target = None;
        self.flags = FLAG_IN_USE;
    }

    pub(crate) fn render(&self, now: u64) -> String {
        use fmt::Write as _;

        let mut out = String::from("{ when=");
        let delta = self.when as i64 - now as i64;
        let _ = write!(out, "{delta:+}ms");
        if self.is_barrier() {
            let _ = write!(out, " barrier token={}", self.arg1);
        } else {
            if let Some(target) = &self.target {
                let _ = write!(out, " target={}", target.label());
            }
            match &self.body {
                MessageBody::Callback(_) => out.push_str(" callback"),
                body => {
                    let _ = write!(out, " what={}", body.what());
                }
            }
            let _ = write!(out, " arg1={} arg2={}", self.arg1, self.arg2);
            if self.obj.is_some() {
                out.push_str(" obj");
            }
        }
        out.push_str(" }");
        out
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(crate::time::uptime_millis()))
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("body", &self.body)
            .field("arg1", &self.arg1)
            .field("arg2", &self.arg2)
            .field("when", &self.when)
            .field("flags", &self.flags)
            .field("barrier", &self.is_barrier())
            .finish_non_exhaustive()
    }
}
