use super::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::supervisor::worker::EventSender;

/// Records what the supervisor asks of its workers and lets tests play the workers' part.
struct Fake {
    log: Mutex<Vec<String>>,
    senders: Mutex<HashMap<WorkerId, EventSender>>,
    listen: AtomicBool,
    exit_on_disconnect: AtomicBool,
}

impl Fake {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(Vec::new()),
            senders: Mutex::new(HashMap::new()),
            listen: AtomicBool::new(true),
            exit_on_disconnect: AtomicBool::new(true),
        })
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn spawned(&self) -> usize {
        self.log().iter().filter(|l| l.starts_with("spawn")).count()
    }

    fn send(&self, event: WorkerEvent) {
        let id = match &event {
            WorkerEvent::Listening(id) => *id,
            WorkerEvent::Exited { id, .. } => *id,
        };
        if let Some(tx) = self.senders.lock().get(&id) {
            let _ = tx.send(event);
        }
    }

    fn crash(&self, id: WorkerId) {
        self.send(WorkerEvent::Exited { id, code: Some(1) });
    }
}

struct FakeSpawner(Arc<Fake>);

impl WorkerSpawner for FakeSpawner {
    fn spawn(
        &self,
        id: WorkerId,
        _config: Arc<GatewayConfig>,
        events: EventSender,
    ) -> Result<Box<dyn WorkerHandle>, GatewayError> {
        self.0.log.lock().push(format!("spawn {}", id));
        self.0.senders.lock().insert(id, events.clone());
        if self.0.listen.load(Ordering::SeqCst) {
            let _ = events.send(WorkerEvent::Listening(id));
        }
        Ok(Box::new(FakeHandle {
            id,
            fake: Arc::clone(&self.0),
        }))
    }
}

struct FakeHandle {
    id: WorkerId,
    fake: Arc<Fake>,
}

impl WorkerHandle for FakeHandle {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn pid(&self) -> u32 {
        10_000 + self.id as u32
    }

    fn disconnect(&self) {
        self.fake.log.lock().push(format!("disconnect {}", self.id));
        if self.fake.exit_on_disconnect.load(Ordering::SeqCst) {
            self.fake.send(WorkerEvent::Exited { id: self.id, code: Some(0) });
        }
    }

    fn kill(&self) {
        self.fake.log.lock().push(format!("kill {}", self.id));
        self.fake.send(WorkerEvent::Exited { id: self.id, code: None });
    }
}

fn config(workers: usize) -> GatewayConfig {
    GatewayConfig {
        workers: Some(workers),
        ..Default::default()
    }
}

fn options() -> SupervisorOptions {
    SupervisorOptions {
        workers: None,
        drain_timeout: Duration::from_secs(5),
        backoff: RespawnBackoff::new(10, 50),
    }
}

fn start(
    config: GatewayConfig,
    path: Option<PathBuf>,
    fake: &Arc<Fake>,
    options: SupervisorOptions,
) -> (SupervisorHandle, tokio::task::JoinHandle<Result<(), GatewayError>>) {
    let (supervisor, handle) = Supervisor::new(config, path, Arc::new(FakeSpawner(Arc::clone(fake))), options);
    (handle, tokio::spawn(supervisor.run()))
}

async fn wait_for(handle: &SupervisorHandle, condition: impl Fn(&PoolSnapshot) -> bool) -> Arc<PoolSnapshot> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = handle.snapshot();
            if condition(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("pool never reached the expected state")
}

async fn finish(task: tokio::task::JoinHandle<Result<(), GatewayError>>) {
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("supervisor did not exit")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn starts_target_workers_and_stops() {
    let fake = Fake::new();
    let (handle, task) = start(config(3), None, &fake, options());

    let snapshot = wait_for(&handle, |s| s.listening == 3).await;
    assert_eq!(snapshot.state, MasterState::Running);
    assert_eq!(snapshot.target, 3);
    assert!(snapshot.workers.iter().all(|w| w.generation == 1 && w.pid > 10_000));

    assert!(handle.stop());
    finish(task).await;

    assert_eq!(
        fake.log(),
        vec!["spawn 1", "spawn 2", "spawn 3", "disconnect 1", "disconnect 2", "disconnect 3"]
    );
    assert!(!handle.reload());
}

#[tokio::test]
async fn crashed_worker_is_respawned() {
    let fake = Fake::new();
    let (handle, task) = start(config(2), None, &fake, options());
    wait_for(&handle, |s| s.listening == 2).await;

    fake.crash(1);
    let snapshot = wait_for(&handle, |s| s.restarts == 1 && s.listening == 2).await;
    let ids: Vec<WorkerId> = snapshot.workers.iter().map(|w| w.id).collect();
    assert_eq!(ids, vec![2, 3]);

    handle.stop();
    finish(task).await;
}

#[tokio::test]
async fn worker_dying_before_listening_is_respawned_after_backoff() {
    let fake = Fake::new();
    fake.listen.store(false, Ordering::SeqCst);
    let (handle, task) = start(config(1), None, &fake, options());
    wait_for(&handle, |s| s.workers.len() == 1).await;

    fake.listen.store(true, Ordering::SeqCst);
    fake.crash(1);
    let snapshot = wait_for(&handle, |s| s.listening == 1).await;
    assert_eq!(snapshot.restarts, 1);
    assert_eq!(snapshot.workers[0].id, 2);

    handle.stop();
    finish(task).await;
    assert_eq!(fake.log(), vec!["spawn 1", "spawn 2", "disconnect 2"]);
}

#[tokio::test]
async fn rolling_reload_replaces_one_worker_at_a_time() {
    let fake = Fake::new();
    let (handle, task) = start(config(2), None, &fake, options());
    wait_for(&handle, |s| s.listening == 2).await;

    assert!(handle.reload());
    let snapshot = wait_for(&handle, |s| {
        s.state == MasterState::Running && s.generation == 2 && s.workers.len() == 2
    })
    .await;
    assert_eq!(snapshot.reloads, 1);
    assert_eq!(snapshot.restarts, 0);
    assert!(snapshot.workers.iter().all(|w| w.generation == 2));

    // Every old worker is disconnected only after its successor has been started.
    assert_eq!(
        fake.log(),
        vec!["spawn 1", "spawn 2", "spawn 3", "disconnect 1", "spawn 4", "disconnect 2"]
    );

    handle.stop();
    finish(task).await;
}

#[tokio::test]
async fn applied_config_resizes_the_pool() {
    let fake = Fake::new();
    let (handle, task) = start(config(1), None, &fake, options());
    wait_for(&handle, |s| s.listening == 1).await;

    assert!(handle.apply(config(3)));
    let snapshot = wait_for(&handle, |s| s.state == MasterState::Running && s.listening == 3).await;
    assert_eq!(snapshot.target, 3);
    assert!(snapshot.workers.iter().all(|w| w.generation == 2));

    handle.stop();
    finish(task).await;
}

#[tokio::test]
async fn unreadable_config_keeps_the_current_pool() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{{ not json").unwrap();

    let fake = Fake::new();
    let (handle, task) = start(config(1), Some(file.path().to_path_buf()), &fake, options());
    wait_for(&handle, |s| s.listening == 1).await;

    assert!(handle.reload());
    assert!(handle.stop());
    finish(task).await;

    assert_eq!(fake.log(), vec!["spawn 1", "disconnect 1"]);
}

#[tokio::test]
async fn stuck_workers_are_killed_after_drain_timeout() {
    let fake = Fake::new();
    fake.exit_on_disconnect.store(false, Ordering::SeqCst);
    let options = SupervisorOptions {
        drain_timeout: Duration::from_millis(50),
        ..options()
    };
    let (handle, task) = start(config(2), None, &fake, options);
    wait_for(&handle, |s| s.listening == 2).await;

    handle.stop();
    wait_for(&handle, |s| s.state == MasterState::Closing).await;
    finish(task).await;

    let log = fake.log();
    assert!(log.contains(&"kill 1".to_string()));
    assert!(log.contains(&"kill 2".to_string()));
    assert_eq!(fake.spawned(), 2);
}
