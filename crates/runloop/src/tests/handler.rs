use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::handler::{Handler, HandlerHook, MessageHandler};
use crate::looper::Looper;
use crate::message::Message;
use crate::pool;

#[derive(Clone, Default)]
struct Collector {
    records: Arc<Mutex<Vec<i32>>>,
}

impl MessageHandler for Collector {
    fn handle_message(&self, msg: &Message) {
        self.records.lock().unwrap().push(msg.what());
    }
}

struct ClaimOdd;

impl HandlerHook for ClaimOdd {
    fn handle_message(&self, msg: &Message) -> bool {
        msg.what() % 2 == 1
    }
}

#[test]
fn dispatch_routes_callback_then_hook_then_behavior() {
    let _looper = Looper::prepare();
    let collector = Collector::default();
    let records = collector.records.clone();
    let handler = Handler::builder()
        .hook(Arc::new(ClaimOdd))
        .behavior(Arc::new(collector))
        .build();

    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let mut callback = Message::obtain();
    callback.body = crate::MessageBody::Callback(Arc::new(move || {
        flag.store(true, Ordering::SeqCst);
    }));
    callback.set_target(handler.clone());
    handler.dispatch(&callback);
    assert!(ran.load(Ordering::SeqCst), "callback messages run their callback");
    pool::recycle(callback);

    let odd = handler.obtain_message(1);
    handler.dispatch(&odd);
    let even = handler.obtain_message(2);
    handler.dispatch(&even);
    assert_eq!(
        *records.lock().unwrap(),
        vec![2],
        "the hook claimed the odd message before the behavior saw it"
    );
    pool::recycle(odd);
    pool::recycle(even);
}

#[test]
fn posted_work_runs_in_order_on_the_looper_thread() {
    let looper = Looper::prepare();
    let handler = Handler::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    for n in 1..=3 {
        let order = order.clone();
        handler.post(Arc::new(move || order.lock().unwrap().push(n)));
    }
    {
        let looper = looper.clone();
        handler.post(Arc::new(move || looper.quit_safely()));
    }
    looper.run();
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[test]
fn asynchronous_handlers_stamp_their_messages() {
    let looper = Looper::prepare();
    let handler = Handler::builder().asynchronous(true).build();
    handler.send_empty_message_delayed(1, 1000);
    let snapshot = looper.queue().snapshot();
    assert!(snapshot[0].asynchronous);

    let plain = Handler::new();
    plain.send_empty_message_delayed(2, 1000);
    let snapshot = looper.queue().snapshot();
    assert!(!snapshot[1].asynchronous);
}

#[test]
fn run_synchronously_is_inline_on_the_looper_thread() {
    let _looper = Looper::prepare();
    let handler = Handler::new();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    assert!(handler.run_synchronously(move || flag.store(true, Ordering::SeqCst), None));
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn run_synchronously_blocks_until_the_looper_executes() {
    let (tx, rx) = mpsc::channel();
    let worker = thread::spawn(move || {
        let looper = Looper::prepare();
        tx.send(Handler::for_looper(&looper)).unwrap();
        looper.run();
    });
    let handler = rx.recv().expect("worker prepared");

    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    assert!(handler.run_synchronously(
        move || flag.store(true, Ordering::SeqCst),
        Some(Duration::from_secs(5)),
    ));
    assert!(ran.load(Ordering::SeqCst));

    handler.looper().quit_safely();
    worker.join().expect("worker thread");
}

#[test]
fn run_synchronously_times_out_when_the_looper_never_runs() {
    let (tx, rx) = mpsc::channel();
    // Prepare a looper but never drive it, so the posted task starves.
    let idle_thread = thread::spawn(move || {
        let looper = Looper::prepare();
        tx.send(Handler::for_looper(&looper)).unwrap();
        thread::sleep(Duration::from_millis(400));
    });
    let handler = rx.recv().expect("looper prepared");

    let counter = Arc::new(AtomicUsize::new(0));
    let bump = counter.clone();
    let started = std::time::Instant::now();
    assert!(!handler.run_synchronously(
        move || {
            bump.fetch_add(1, Ordering::SeqCst);
        },
        Some(Duration::from_millis(50)),
    ));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(counter.load(Ordering::SeqCst), 0, "task never ran");
    // The timed-out task stays queued.
    assert!(handler.has_pending_work());
    idle_thread.join().expect("idle thread");
}

#[test]
#[should_panic(expected = "has not prepared a looper")]
fn handler_without_a_looper_panics() {
    let _ = Handler::new();
}
