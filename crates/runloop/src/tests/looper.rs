use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use crate::handler::Handler;
use crate::looper::Looper;
use crate::trace::Printer;

#[test]
fn prepare_binds_the_calling_thread() {
    let looper = Looper::prepare();
    assert!(looper.is_current_thread());
    let mine = Looper::my_looper().expect("just prepared");
    assert!(Arc::ptr_eq(&looper, &mine));
    assert!(Looper::my_queue().is_some());
}

#[test]
#[should_panic(expected = "one looper may be created per thread")]
fn double_prepare_panics() {
    let _first = Looper::prepare();
    let _second = Looper::prepare();
}

#[test]
#[should_panic(expected = "not allowed to quit")]
fn the_main_queue_refuses_to_quit() {
    let looper = Looper::prepare_main();
    assert!(Looper::main_looper().is_some());
    looper.quit();
}

#[test]
#[should_panic(expected = "must be called on the thread that prepared it")]
fn run_on_a_foreign_thread_panics() {
    let (tx, rx) = mpsc::channel();
    let worker = thread::spawn(move || {
        tx.send(Looper::prepare()).unwrap();
    });
    let looper = rx.recv().expect("worker prepared");
    worker.join().expect("worker thread");
    looper.run();
}

#[test]
fn message_logging_brackets_each_dispatch() {
    let looper = Looper::prepare();
    let handler = Handler::builder().name("logged").build();

    let lines = Arc::new(Mutex::new(Vec::<String>::new()));
    let printer: Printer = {
        let lines = lines.clone();
        Arc::new(move |line: &str| lines.lock().unwrap().push(line.to_owned()))
    };
    looper.set_message_logging(Some(printer));

    handler.send_empty_message(7);
    {
        let looper = looper.clone();
        handler.post(Arc::new(move || looper.quit_safely()));
    }
    looper.run();

    let lines = lines.lock().unwrap();
    assert!(lines[0].starts_with(">>>>> Dispatching to logged: 7"));
    assert!(lines[1].starts_with("<<<<< Finished to logged"));
    assert!(lines.iter().any(|line| line.contains("(callback)")));
}

#[test]
fn slow_log_thresholds_do_not_disturb_dispatch() {
    let looper = Looper::prepare();
    let handler = Handler::new();
    looper.set_slow_log_thresholds(1, 1);

    let ran = Arc::new(Mutex::new(0));
    {
        let ran = ran.clone();
        handler.post(Arc::new(move || {
            thread::sleep(std::time::Duration::from_millis(5));
            *ran.lock().unwrap() += 1;
        }));
    }
    {
        let looper = looper.clone();
        handler.post(Arc::new(move || looper.quit_safely()));
    }
    looper.run();
    assert_eq!(*ran.lock().unwrap(), 1);
}

#[test]
fn dump_reports_pending_messages() {
    let looper = Looper::prepare();
    let handler = Handler::builder().name("dumped").build();
    handler.send_empty_message_delayed(3, 5000);

    let mut out = String::new();
    looper.dump(&mut out, "").expect("dump writes");
    assert!(out.contains("Looper ("));
    assert!(out.contains("Message 0"));
    assert!(out.contains("target=dumped"));
    assert!(out.contains("Total messages: 1"));
}
