#![doc = r#"# runloop

A per-thread cooperative message loop. A thread prepares a [`Looper`],
[`Handler`]s bound to that looper post timestamped messages into its queue
from any thread, and the owning thread drains the queue in time order while
multiplexing file-descriptor readiness and thread-goes-idle callbacks in the
same wait.

## Module overview
- [`message`] – poolable message records and their routing variants.
- [`queue`]   – the time-ordered queue: sync barriers, idle handlers, fd watchers.
- [`looper`]  – the per-thread driver: prepare, run, quit.
- [`handler`] – the thread-affine endpoint for posting and receiving work.

Linux only: the queue sleeps in `epoll` and is woken through an `eventfd`.
"#]

mod pool;
mod sync;
mod time;
mod waiter;

pub mod handler;
pub mod looper;
pub mod message;
pub mod queue;
pub mod trace;

pub use handler::{Handler, HandlerBuilder, HandlerHook, MessageHandler};
pub use looper::Looper;
pub use message::{Message, MessageBody, Payload, Runnable};
pub use pool::{pool_stats, PoolStats};
pub use queue::{
    FdEventListener, FdEvents, FdWatchError, IdleHandler, MessageQueue, MessageSnapshot,
};
pub use time::uptime_millis;
pub use trace::Printer;

#[cfg(test)]
mod tests;
