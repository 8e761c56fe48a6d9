//! End-to-end scenarios driving a looper thread through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use runloop::{uptime_millis, FdEvents, Handler, IdleHandler, Looper, Message, MessageHandler};

#[derive(Clone, Default)]
struct Recorder {
    records: Arc<Mutex<Vec<(i32, u64)>>>,
}

impl Recorder {
    fn whats(&self) -> Vec<i32> {
        self.records.lock().unwrap().iter().map(|(what, _)| *what).collect()
    }
}

impl MessageHandler for Recorder {
    fn handle_message(&self, msg: &Message) {
        self.records.lock().unwrap().push((msg.what(), uptime_millis()));
    }
}

/// Spawns a looper thread that waits for `go` before running, so tests can
/// finish their setup deterministically.
fn spawn_looper() -> (Arc<Looper>, mpsc::Sender<()>, JoinHandle<()>) {
    let (looper_tx, looper_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let join = thread::spawn(move || {
        let looper = Looper::prepare();
        looper_tx.send(looper.clone()).unwrap();
        go_rx.recv().unwrap();
        looper.run();
    });
    let looper = looper_rx.recv().expect("looper prepared");
    (looper, go_tx, join)
}

#[test]
fn delayed_messages_arrive_in_time_order() {
    let (looper, go, join) = spawn_looper();
    let recorder = Recorder::default();
    let records = recorder.records.clone();
    let handler = Handler::builder()
        .looper(looper.clone())
        .behavior(Arc::new(recorder))
        .build();

    let posted_at = uptime_millis();
    handler.send_empty_message_delayed(1, 50);
    handler.send_empty_message_delayed(2, 10);
    {
        let looper = looper.clone();
        handler.post_delayed(Arc::new(move || looper.quit_safely()), 120);
    }
    go.send(()).unwrap();
    join.join().expect("looper thread");

    let records = records.lock().unwrap();
    assert_eq!(records.len(), 2);
    let (first, t_first) = records[0];
    let (second, t_second) = records[1];
    assert_eq!((first, second), (2, 1));
    assert!(t_first >= posted_at + 9, "what=2 was due at +10ms");
    assert!(t_second >= posted_at + 49, "what=1 was due at +50ms");
}

#[test]
fn barriers_withhold_sync_work_until_removed() {
    let (looper, go, join) = spawn_looper();
    let recorder = Recorder::default();
    let handler = Handler::builder()
        .looper(looper.clone())
        .behavior(Arc::new(recorder.clone()))
        .build();
    let async_handler = Handler::builder()
        .looper(looper.clone())
        .behavior(Arc::new(recorder.clone()))
        .asynchronous(true)
        .build();
    let queue = looper.queue().clone();

    handler.send_empty_message(1);
    let token = queue.post_sync_barrier();
    async_handler.send_empty_message_delayed(2, 1);
    go.send(()).unwrap();

    thread::sleep(Duration::from_millis(60));
    assert_eq!(recorder.whats(), vec![1, 2], "async message crossed the barrier");

    // Synchronous work stays parked while the barrier is up.
    handler.send_empty_message(5);
    thread::sleep(Duration::from_millis(40));
    assert_eq!(recorder.whats(), vec![1, 2]);

    queue.remove_sync_barrier(token);
    handler.send_empty_message(3);
    thread::sleep(Duration::from_millis(60));
    assert_eq!(recorder.whats(), vec![1, 2, 5, 3]);

    looper.quit_safely();
    join.join().expect("looper thread");
}

#[test]
fn idle_handlers_fire_on_each_drain() {
    let (looper, go, join) = spawn_looper();
    let recorder = Recorder::default();
    let handler = Handler::builder()
        .looper(looper.clone())
        .behavior(Arc::new(recorder.clone()))
        .build();

    let idle_runs = Arc::new(AtomicUsize::new(0));
    let idle: Arc<dyn IdleHandler> = {
        let idle_runs = idle_runs.clone();
        Arc::new(move || {
            idle_runs.fetch_add(1, Ordering::SeqCst);
            true
        })
    };
    looper.queue().add_idle_handler(idle);

    handler.send_empty_message_delayed(9, 100);
    {
        let looper = looper.clone();
        handler.post_delayed(Arc::new(move || looper.quit_safely()), 200);
    }
    go.send(()).unwrap();
    join.join().expect("looper thread");

    assert_eq!(recorder.whats(), vec![9]);
    assert_eq!(
        idle_runs.load(Ordering::SeqCst),
        2,
        "one idle pass while waiting for what=9, one while waiting for the quit"
    );
}

#[test]
fn pipe_readiness_reaches_the_listener() {
    let (looper, go, join) = spawn_looper();
    let queue = looper.queue().clone();

    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (read_fd, write_fd) = (fds[0], fds[1]);

    let hits = Arc::new(AtomicUsize::new(0));
    let listener = {
        let hits = hits.clone();
        Arc::new(move |fd: i32, events: FdEvents| {
            assert!(events.contains(FdEvents::INPUT));
            let mut byte = [0u8; 1];
            unsafe { libc::read(fd, byte.as_mut_ptr().cast(), 1) };
            hits.fetch_add(1, Ordering::SeqCst);
            FdEvents::INPUT
        })
    };
    queue
        .set_fd_listener(read_fd, FdEvents::INPUT, listener)
        .expect("registration succeeds");
    go.send(()).unwrap();

    let one = [1u8];
    assert_eq!(unsafe { libc::write(write_fd, one.as_ptr().cast(), 1) }, 1);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    assert_eq!(unsafe { libc::write(write_fd, one.as_ptr().cast(), 1) }, 1);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(hits.load(Ordering::SeqCst), 2, "a second write re-triggers");

    queue.remove_fd_listener(read_fd).expect("deregistration succeeds");
    looper.quit_safely();
    join.join().expect("looper thread");
    unsafe {
        libc::close(write_fd);
        libc::close(read_fd);
    }
}

#[test]
fn safe_quit_delivers_due_work_and_drops_the_future() {
    let (looper, go, join) = spawn_looper();
    let recorder = Recorder::default();
    let handler = Handler::builder()
        .looper(looper.clone())
        .behavior(Arc::new(recorder.clone()))
        .build();

    handler.send_message_at_time(
        handler.obtain_message(1),
        uptime_millis().saturating_sub(5),
    );
    handler.send_empty_message_delayed(2, 500);
    looper.quit_safely();

    let started = uptime_millis();
    go.send(()).unwrap();
    join.join().expect("looper thread");

    assert_eq!(recorder.whats(), vec![1]);
    assert!(
        uptime_millis() - started < 400,
        "the loop must not wait for the discarded delayed message"
    );
    assert!(!handler.send_empty_message(3), "sends fail after quit");
}
