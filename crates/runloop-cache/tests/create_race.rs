//! A racing `put` must win over a slow `create`, with the created value
//! discarded through the removal callback.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use runloop_cache::{CacheDelegate, LruCache};

struct SlowCreate {
    discarded: Mutex<Vec<(u32, &'static str, Option<&'static str>)>>,
}

impl CacheDelegate<u32, &'static str> for SlowCreate {
    fn create(&self, _key: &u32) -> Option<&'static str> {
        thread::sleep(Duration::from_millis(100));
        Some("created")
    }

    fn entry_removed(
        &self,
        evicted: bool,
        key: &u32,
        old_value: &'static str,
        new_value: Option<&&'static str>,
    ) {
        assert!(!evicted, "nothing is evicted in this test");
        self.discarded
            .lock()
            .unwrap()
            .push((*key, old_value, new_value.copied()));
    }
}

#[test]
fn racing_put_wins_over_create() {
    let delegate = Arc::new(SlowCreate {
        discarded: Mutex::new(Vec::new()),
    });
    let cache = Arc::new(LruCache::with_delegate(4, delegate.clone()));

    let getter = {
        let cache = cache.clone();
        thread::spawn(move || cache.get(&1))
    };
    // Land a put while create() is still sleeping.
    thread::sleep(Duration::from_millis(30));
    cache.put(1, "raced");

    assert_eq!(getter.join().expect("getter thread"), Some("raced"));
    assert_eq!(cache.get(&1), Some("raced"), "the raced-in value is kept");
    assert_eq!(
        *delegate.discarded.lock().unwrap(),
        vec![(1, "created", Some("raced"))],
        "the created value was discarded through entry_removed"
    );
    assert_eq!(cache.size(), 1);
}
