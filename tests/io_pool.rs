//! Completion port workers under load and at rest.

use std::{
    sync::{mpsc, Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use hostrt::{
    io::{CompletionCallback, IoCompletionManager, ResourceId},
    IoConfig,
};

/// Reports each completion, then blocks until the test lets it go.
struct Gate {
    entered: Mutex<mpsc::Sender<u64>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl CompletionCallback for Gate {
    fn on_complete(&self, _error_code: u32, _bytes_transferred: usize, context: u64) {
        self.entered.lock().unwrap().send(context).unwrap();
        self.release.lock().unwrap().recv().unwrap();
    }
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(u32, usize, u64)>>,
}

impl CompletionCallback for Recorder {
    fn on_complete(&self, error_code: u32, bytes_transferred: usize, context: u64) {
        self.seen
            .lock()
            .unwrap()
            .push((error_code, bytes_transferred, context));
        if context == 0xbad {
            panic!("callback failure");
        }
    }
}

fn config() -> IoConfig {
    IoConfig::default()
        .with_min_threads(0)
        .with_max_threads(4)
        .with_poll_interval(Duration::from_millis(20))
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn idle_pool_keeps_last_worker() {
    let io = IoCompletionManager::new(config());
    let (entered_tx, entered) = mpsc::channel();
    let (release, release_rx) = mpsc::channel();
    io.set_completion_callback(Arc::new(Gate {
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    }));

    let first = io.bind(None, ResourceId(1)).unwrap();
    assert_eq!(io.thread_count(), 1);

    // Occupy the only worker, so the next bind sees a saturated pool.
    first.post(0, 16, 0x1).unwrap();
    assert_eq!(entered.recv_timeout(Duration::from_secs(5)).unwrap(), 0x1);
    let second = io.bind(None, ResourceId(2)).unwrap();
    assert_eq!(io.thread_count(), 2);
    assert_eq!(second.port(), first.port());
    release.send(()).unwrap();

    assert!(wait_for(|| io.thread_count() == 1));
    // Many poll intervals later the port still has its worker.
    thread::sleep(Duration::from_millis(200));
    assert_eq!(io.thread_count(), 1);
    assert_eq!(io.port_worker_count(first.port()), Some(1));

    second.post(0, 8, 0x2).unwrap();
    assert_eq!(entered.recv_timeout(Duration::from_secs(5)).unwrap(), 0x2);
    release.send(()).unwrap();

    assert!(io.shutdown(Duration::from_secs(5)));
    assert_eq!(io.thread_count(), 0);
    assert_eq!(io.port_count(), 0);
}

#[test]
fn completions_survive_a_panicking_callback() {
    let io = IoCompletionManager::new(config());
    let recorder = Arc::new(Recorder::default());
    io.set_completion_callback(recorder.clone());

    let sink = io.bind(None, ResourceId(7)).unwrap();
    sink.post(0, 512, 0x10).unwrap();
    sink.post(5, 0, 0xbad).unwrap();
    sink.post(0, 64, 0x20).unwrap();

    assert!(wait_for(|| recorder.seen.lock().unwrap().len() == 3));
    assert_eq!(
        *recorder.seen.lock().unwrap(),
        vec![(0, 512, 0x10), (5, 0, 0xbad), (0, 64, 0x20)]
    );
    assert!(io.thread_count() >= 1);
    assert!(io.shutdown(Duration::from_secs(5)));
}

#[test]
fn closed_port_rejects_posts() {
    let io = IoCompletionManager::new(config());
    let port = io.create_port().unwrap();
    let sink = io.bind(Some(port), ResourceId(1)).unwrap();

    io.close_port(port).unwrap();
    assert!(sink.post(0, 1, 0x1).is_err());
    assert!(io.bind(Some(port), ResourceId(2)).is_err());
    assert!(wait_for(|| io.thread_count() == 0));
}
