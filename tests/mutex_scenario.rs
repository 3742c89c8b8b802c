//! The serialization guarantees of the mutex adapter under concurrency.

use std::sync::Arc;
use std::time::Duration;

use mountfs::Errno;
use mountfs::MemFs;
use mountfs::Mutexed;
use std::sync::Mutex;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_lockers_serialize_and_unlock_in_call_order() {
    let fs = Arc::new(Mutexed::new(MemFs::new()));
    let x = Arc::new(Mutex::new(1u32));
    let unlock_order = Arc::new(Mutex::new(Vec::new()));

    let mut tasks = Vec::new();
    for id in 0..3u32 {
        let fs = fs.clone();
        let x = x.clone();
        let unlock_order = unlock_order.clone();
        tasks.push(tokio::spawn(async move {
            // Stagger the lock calls so the acquisition order is known.
            tokio::time::sleep(Duration::from_millis(10 * u64::from(id))).await;
            let lock = fs.lock("/r", "t").await.unwrap();
            let read = *x.lock().unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            *x.lock().unwrap() = read + 1;
            unlock_order.lock().unwrap().push(id);
            lock.unlock();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // Without the lock the three increments would race on the same
    // starting value; serialized they accumulate.
    assert_eq!(*x.lock().unwrap(), 4);
    assert_eq!(*unlock_order.lock().unwrap(), [0, 1, 2]);
}

#[tokio::test]
async fn sync_surface_reports_ebusy_while_async_holds_the_lock() {
    let fs = Mutexed::new(MemFs::new());
    let held = fs.lock("/r", "probe").await.unwrap();
    assert!(fs.is_locked());

    let err = fs.lock_sync("/r", "probe").unwrap_err();
    assert_eq!(err.errno, Errno::EBUSY);

    held.unlock();
    let lock = fs.lock_sync("/r", "probe").unwrap();
    lock.unlock();
    assert!(!fs.is_locked());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queued_locks_resolve_in_request_order() {
    let fs = Arc::new(Mutexed::new(MemFs::new()));
    let order = Arc::new(Mutex::new(Vec::new()));

    let first = fs.lock("/q", "t").await.unwrap();
    let mut waiters = Vec::new();
    for id in 0..5u32 {
        // Enqueue strictly in sequence from this task.
        let lock_fut = {
            let fs = fs.clone();
            let order = order.clone();
            tokio::time::sleep(Duration::from_millis(5)).await;
            tokio::spawn(async move {
                let lock = fs.lock("/q", "t").await.unwrap();
                order.lock().unwrap().push(id);
                lock.unlock();
            })
        };
        // Give the spawned task a moment to reach the queue.
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiters.push(lock_fut);
    }

    first.unlock();
    for waiter in waiters {
        waiter.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), [0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn deadline_is_diagnostic_not_fatal() {
    let fs = Mutexed::with_deadline(MemFs::new(), Duration::from_millis(10));
    let held = fs.lock("/d", "t").await.unwrap();

    let err = fs.lock("/d", "t").await.unwrap_err();
    assert_eq!(err.errno, Errno::EDEADLK);

    held.unlock();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let recovered = fs.lock("/d", "t").await.unwrap();
    recovered.unlock();
}
