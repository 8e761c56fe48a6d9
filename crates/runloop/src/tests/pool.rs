use serial_test::serial;

use crate::message::{Message, MessageBody};
use crate::pool;

#[test]
#[serial]
fn obtained_message_is_zero_initialized() {
    let mut msg = Message::obtain();
    msg.body = MessageBody::Code(42);
    msg.arg1 = 7;
    msg.arg2 = -7;
    msg.obj = Some(std::sync::Arc::new("payload"));
    msg.recycle();

    // Whatever record the pool hands out next, recycled or fresh, it must
    // look untouched.
    let msg = Message::obtain();
    assert_eq!(msg.what(), 0);
    assert_eq!(msg.arg1, 0);
    assert_eq!(msg.arg2, 0);
    assert!(msg.obj.is_none());
    assert!(msg.reply_to.is_none());
    assert!(msg.target().is_none());
    assert_eq!(msg.when(), 0);
    assert!(!msg.is_in_use());
    assert!(!msg.is_asynchronous());
}

#[test]
#[serial]
fn recycle_feeds_the_free_list() {
    let before = pool::pool_stats();
    Message::obtain().recycle();
    let after = pool::pool_stats();
    assert!(
        after.recycled > before.recycled || after.dropped > before.dropped,
        "recycling must either pool or drop the record"
    );
    assert!(after.pooled <= 50);
}

#[test]
#[should_panic(expected = "still in use")]
fn recycling_an_in_use_message_panics() {
    let mut msg = Message::obtain();
    msg.mark_in_use();
    msg.recycle();
}
