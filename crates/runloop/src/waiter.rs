//! The OS wait primitive: epoll plus an eventfd wake channel.
//!
//! The owning thread sleeps in [`Waiter::wait`] whenever its queue has
//! nothing deliverable. Producers on any thread call [`Waiter::wake`] after
//! an enqueue that becomes the next deliverable message, and watched
//! descriptors wake the sleeper through the same epoll set.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::queue::FdEvents;

const MAX_EVENTS: usize = 16;

pub(crate) struct Waiter {
    epoll_fd: RawFd,
    wake_fd: RawFd,
    polling: AtomicBool,
}

impl Waiter {
    pub(crate) fn new() -> io::Result<Self> {
        let epoll_fd = check(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        let wake_fd = match check(unsafe {
            libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC)
        }) {
            Ok(fd) => fd,
            Err(err) => {
                unsafe { libc::close(epoll_fd) };
                return Err(err);
            }
        };
        let waiter = Self {
            epoll_fd,
            wake_fd,
            polling: AtomicBool::new(false),
        };
        waiter.ctl(libc::EPOLL_CTL_ADD, wake_fd, libc::EPOLLIN as u32)?;
        Ok(waiter)
    }

    /// Sleeps until the timeout elapses, [`wake`](Self::wake) is called, or
    /// a watched descriptor becomes ready. Zero polls without blocking,
    /// negative sleeps indefinitely. Readiness is appended to `ready`; a
    /// plain wake or an interrupted sleep yields an empty return.
    pub(crate) fn wait(
        &self,
        timeout_ms: i32,
        ready: &mut Vec<(RawFd, FdEvents)>,
    ) -> io::Result<()> {
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        self.polling.store(true, Ordering::Release);
        let n = unsafe {
            libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
        };
        self.polling.store(false, Ordering::Release);
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(err);
        }
        for event in &events[..n as usize] {
            let fd = event.u64 as RawFd;
            let bits = event.events;
            if fd == self.wake_fd {
                self.drain_wake();
                continue;
            }
            ready.push((fd, FdEvents::from_epoll(bits)));
        }
        Ok(())
    }

    /// Interrupts the current or next `wait`. Idempotent and safe from any
    /// thread.
    pub(crate) fn wake(&self) {
        let one: u64 = 1;
        // EAGAIN means the counter is already non-zero and the sleeper will
        // see it; nothing to do.
        unsafe { libc::write(self.wake_fd, &one as *const u64 as *const libc::c_void, 8) };
    }

    fn drain_wake(&self) {
        let mut counter: u64 = 0;
        unsafe { libc::read(self.wake_fd, &mut counter as *mut u64 as *mut libc::c_void, 8) };
    }

    /// Reprograms the kernel watch set for `fd`. An empty mask removes it.
    pub(crate) fn watch(&self, fd: RawFd, events: FdEvents) -> io::Result<()> {
        if events.is_empty() {
            return self.ctl(libc::EPOLL_CTL_DEL, fd, 0);
        }
        let mask = events.to_epoll();
        match self.ctl(libc::EPOLL_CTL_MOD, fd, mask) {
            Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {
                self.ctl(libc::EPOLL_CTL_ADD, fd, mask)
            }
            other => other,
        }
    }

    /// Whether the owning thread is currently inside `epoll_wait`. Racy by
    /// nature; callers treat it as a liveness hint.
    pub(crate) fn is_polling(&self) -> bool {
        self.polling.load(Ordering::Acquire)
    }

    fn ctl(&self, op: i32, fd: RawFd, mask: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: mask,
            u64: fd as u64,
        };
        check(unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) })?;
        Ok(())
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
    }
}

fn check(result: i32) -> io::Result<i32> {
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}
