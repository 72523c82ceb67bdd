//! End-to-end coordinator runs against in-process helpers.
//!
//! The supervisor and registrar loops run as tasks over real local pipes.
//! Each registrar gets its own in-memory registry, standing in for the
//! per-process override state of a real worker.

use async_trait::async_trait;
use comreg_core::channel::MessageChannel;
use comreg_core::native::NativeRegistrar;
use comreg_core::pipe::connect;
use comreg_core::registrar::RegistrarWorker;
use comreg_core::registry::memory::MemoryRegistry;
use comreg_core::registry::{KeyPath, PredefinedRoot, Registry};
use comreg_core::settings::TimeoutSettings;
use comreg_core::supervisor::{self, WorkerSpawner};
use comreg_core::{Architecture, FileRecord, Message, PipeName, RegistrationResult};
use comreg_engine::{
    Coordinator, CoordinatorError, HelperHost, HelperProcess, ManifestClassifier,
    RegistrationItem, RegistrationStream,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CONNECT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, PartialEq, Eq)]
enum Launcher {
    /// Already elevated: serves directly.
    Serve,
    /// Relaunches an elevated copy and exits 0.
    Relaunch,
    /// User declines the prompt.
    Decline,
    /// Elevated, but cannot start registrars.
    BrokenSpawner,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Worker {
    Serve,
    /// Answers the first request with `Terminate`.
    WrongReply,
    /// Stays alive without connecting until killed.
    NeverConnects,
    /// Exits with code 4 before connecting.
    ExitsEarly,
}

struct Shared {
    launcher: Launcher,
    worker: Worker,
    output_root: PathBuf,
    native_delay: Duration,
    /// Registrars drop their channel after this many requests.
    crash_after: Option<usize>,
    native_calls: AtomicUsize,
    launches: AtomicUsize,
    next_pid: AtomicU32,
    workers: Mutex<HashMap<u32, TaskProcess>>,
    registries: Mutex<Vec<Arc<MemoryRegistry>>>,
}

struct TestHost(Arc<Shared>);

impl TestHost {
    fn new(launcher: Launcher, output_root: &Path) -> Self {
        Self(Arc::new(Shared {
            launcher,
            worker: Worker::Serve,
            output_root: output_root.to_path_buf(),
            native_delay: Duration::ZERO,
            crash_after: None,
            native_calls: AtomicUsize::new(0),
            launches: AtomicUsize::new(0),
            next_pid: AtomicU32::new(5000),
            workers: Mutex::new(HashMap::new()),
            registries: Mutex::new(Vec::new()),
        }))
    }

    fn with(mut self, f: impl FnOnce(&mut Shared)) -> Self {
        f(Arc::get_mut(&mut self.0).unwrap());
        self
    }

    fn native_calls(&self) -> usize {
        self.0.native_calls.load(Ordering::SeqCst)
    }

    fn launches(&self) -> usize {
        self.0.launches.load(Ordering::SeqCst)
    }

    fn registries(&self) -> Vec<Arc<MemoryRegistry>> {
        self.0.registries.lock().clone()
    }
}

/// Helper "process" backed by a task; killing it cancels the task's loop.
struct TaskProcess {
    pid: u32,
    task: Option<JoinHandle<i32>>,
    exit: Option<i32>,
    cancel: CancellationToken,
}

impl TaskProcess {
    fn spawn<F>(pid: u32, cancel: CancellationToken, fut: F) -> Self
    where
        F: std::future::Future<Output = i32> + Send + 'static,
    {
        Self {
            pid,
            task: Some(tokio::spawn(fut)),
            exit: None,
            cancel,
        }
    }
}

#[async_trait]
impl HelperProcess for TaskProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        if let Some(task) = self.task.as_mut() {
            let code = task.await.unwrap_or(-1);
            self.task = None;
            self.exit = Some(code);
        }
        Ok(self.exit)
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

struct FakeDll {
    registry: Arc<MemoryRegistry>,
    shared: Arc<Shared>,
}

impl NativeRegistrar for FakeDll {
    fn register(&self, path: &Path) -> anyhow::Result<()> {
        self.shared.native_calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.shared.native_delay);
        let class = KeyPath::new(
            PredefinedRoot::ClassesRoot,
            r"CLSID\{C0FFEE00-0000-0000-0000-000000000001}",
        );
        self.registry
            .set_default_value(&class, &path.display().to_string());
        Ok(())
    }
}

struct TestSpawner(Arc<Shared>);

#[async_trait]
impl WorkerSpawner for TestSpawner {
    async fn spawn_registrar(&self, pipe: &PipeName) -> io::Result<u32> {
        let shared = &self.0;
        if shared.launcher == Launcher::BrokenSpawner {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "registrar binary missing"));
        }
        let pid = shared.next_pid.fetch_add(1, Ordering::SeqCst);
        let registry = Arc::new(MemoryRegistry::new());
        shared.registries.lock().push(registry.clone());
        let native = Arc::new(FakeDll {
            registry: registry.clone(),
            shared: shared.clone(),
        });
        let worker = RegistrarWorker::new(registry, native, shared.output_root.clone());
        let crash_after = shared.crash_after;
        let mode = shared.worker;
        let cancel = CancellationToken::new();
        let pipe = pipe.clone();
        let process = TaskProcess::spawn(pid, cancel.clone(), async move {
            match mode {
                Worker::ExitsEarly => return 4,
                Worker::NeverConnects => {
                    cancel.cancelled().await;
                    return 9;
                }
                Worker::Serve | Worker::WrongReply => {}
            }
            let Ok(stream) = connect(&pipe, CONNECT).await else {
                return 2;
            };
            let mut channel = MessageChannel::new(stream);
            if mode == Worker::WrongReply {
                let Ok(Message::RegistrationRequest { .. }) = channel.read().await else {
                    return 1;
                };
                let _ = channel.write(&Message::Terminate).await;
                let _ = channel.read().await;
                return 0;
            }
            if let Some(limit) = crash_after {
                for _ in 0..limit {
                    match channel.read().await {
                        Ok(Message::RegistrationRequest { file, path, sha256 }) => {
                            let result = worker.register_one(&file, &path, &sha256);
                            let _ = channel.write(&Message::RegistrationResult(result)).await;
                        }
                        _ => return 0,
                    }
                }
                // Dies with the channel open mid-conversation.
                let _ = channel.read().await;
                return 3;
            }
            match worker.serve(&mut channel, cancel).await {
                Ok(()) => 0,
                Err(_) => 1,
            }
        });
        shared.workers.lock().insert(pid, process);
        Ok(pid)
    }
}

async fn run_supervisor(shared: Arc<Shared>, pipe: PipeName, cancel: CancellationToken) -> i32 {
    let Ok(stream) = connect(&pipe, CONNECT).await else {
        return 2;
    };
    let mut channel = MessageChannel::new(stream);
    match supervisor::serve(&mut channel, &TestSpawner(shared), cancel).await {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

#[async_trait]
impl HelperHost for TestHost {
    async fn launch_supervisor(&self, pipe: &PipeName) -> io::Result<Box<dyn HelperProcess>> {
        self.0.launches.fetch_add(1, Ordering::SeqCst);
        let shared = self.0.clone();
        let pipe = pipe.clone();
        let cancel = CancellationToken::new();
        let process = match self.0.launcher {
            Launcher::Serve | Launcher::BrokenSpawner => {
                TaskProcess::spawn(1, cancel.clone(), run_supervisor(shared, pipe, cancel))
            }
            Launcher::Relaunch => TaskProcess::spawn(1, cancel, async move {
                tokio::spawn(run_supervisor(shared, pipe, CancellationToken::new()));
                0
            }),
            Launcher::Decline => TaskProcess::spawn(1, cancel, async { 1223 }),
        };
        Ok(Box::new(process))
    }

    fn attach_worker(&self, pid: u32) -> Option<Box<dyn HelperProcess>> {
        self.0
            .workers
            .lock()
            .remove(&pid)
            .map(|p| Box::new(p) as Box<dyn HelperProcess>)
    }
}

fn timeouts() -> TimeoutSettings {
    TimeoutSettings {
        connect_secs: 5,
        terminate_grace_ms: 200,
        kill_wait_ms: 2000,
    }
}

fn com_library(path: &str, hash_seed: u8) -> FileRecord {
    FileRecord {
        sha256: format!("{hash_seed:02x}").repeat(32),
        is_portable_executable: true,
        architecture: Architecture::I386,
        is_library: true,
        is_com: true,
        exports: vec!["DllRegisterServer".into()],
        ..FileRecord::unclassified(path)
    }
}

fn managed_assembly(path: &str) -> FileRecord {
    FileRecord {
        is_managed_assembly: true,
        ..com_library(path, 0xee)
    }
}

fn x64_library(path: &str) -> FileRecord {
    FileRecord {
        architecture: Architecture::Amd64,
        ..com_library(path, 0xdd)
    }
}

fn coordinator(host: &Arc<TestHost>, records: Vec<FileRecord>) -> Coordinator {
    coordinator_with(host, records, timeouts())
}

fn coordinator_with(host: &Arc<TestHost>, records: Vec<FileRecord>, timeouts: TimeoutSettings) -> Coordinator {
    Coordinator::new(
        host.clone(),
        Arc::new(ManifestClassifier::from_records(records)),
        timeouts,
    )
}

async fn drain(stream: &mut RegistrationStream) -> Vec<RegistrationItem> {
    let mut items = Vec::new();
    while let Some(item) = tokio::time::timeout(Duration::from_secs(30), stream.next())
        .await
        .expect("stream stalled")
    {
        items.push(item);
    }
    items
}

fn live_overrides(host: &TestHost) -> usize {
    host.registries()
        .iter()
        .map(|r| r.overridden_roots().len())
        .sum()
}

fn assert_no_live_overrides(host: &TestHost) {
    for registry in host.registries() {
        assert!(registry.overridden_roots().is_empty());
        assert!(!registry.scope_slot().load(Ordering::SeqCst));
    }
}

#[tokio::test]
async fn single_com_library_is_captured() {
    let out = tempfile::tempdir().unwrap();
    let host = Arc::new(TestHost::new(Launcher::Serve, out.path()));
    let coordinator = coordinator(&host, vec![com_library("/libs/a.dll", 0xa1)]);

    let mut stream = coordinator.register(vec![PathBuf::from("/libs/a.dll")], &CancellationToken::new());
    let items = drain(&mut stream).await;
    stream.close().await;

    assert_eq!(items.len(), 1);
    match items.into_iter().next().unwrap().unwrap() {
        RegistrationResult::Success {
            output_path, name, ..
        } => {
            assert_eq!(name, "a.dll");
            assert_eq!(output_path, out.path().join("a1".repeat(32)));
            assert!(output_path.join("registration.hive").is_file());
            assert!(output_path.join("fileinfo.json").is_file());
        }
        other => panic!("expected success, got {other:?}"),
    }
    assert_eq!(host.native_calls(), 1);
    assert_no_live_overrides(&host);
}

#[tokio::test]
async fn managed_assembly_fails_without_native_call() {
    let out = tempfile::tempdir().unwrap();
    let host = Arc::new(TestHost::new(Launcher::Serve, out.path()));
    let coordinator = coordinator(&host, vec![managed_assembly("/libs/b.dll")]);

    let mut stream = coordinator.register(vec![PathBuf::from("/libs/b.dll")], &CancellationToken::new());
    let first = stream.next().await.unwrap().unwrap();
    match first {
        RegistrationResult::Failure { name, error, .. } => {
            assert_eq!(name, "b.dll");
            assert!(error.contains("managed assembly"), "{error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(stream.next().await.is_none());
    assert_eq!(host.native_calls(), 0);
    assert_eq!(host.launches(), 0);
}

#[tokio::test]
async fn declined_elevation_is_distinguished() {
    let out = tempfile::tempdir().unwrap();
    let host = Arc::new(TestHost::new(Launcher::Decline, out.path()));
    let coordinator = coordinator(&host, vec![com_library("/libs/a.dll", 0xa1)]);

    let mut stream = coordinator.register(vec![PathBuf::from("/libs/a.dll")], &CancellationToken::new());
    let items = drain(&mut stream).await;
    assert_eq!(items.len(), 1);
    let err = items.into_iter().next().unwrap().unwrap_err();
    assert!(err.is_elevation_cancelled(), "{err}");
    assert_eq!(host.native_calls(), 0);
}

#[tokio::test]
async fn relaunched_supervisor_is_awaited() {
    let out = tempfile::tempdir().unwrap();
    let host = Arc::new(TestHost::new(Launcher::Relaunch, out.path()));
    let coordinator = coordinator(
        &host,
        vec![com_library("/libs/a.dll", 0xa1), com_library("/libs/c.dll", 0xc1)],
    );

    let mut stream = coordinator.register(
        vec![PathBuf::from("/libs/a.dll"), PathBuf::from("/libs/c.dll")],
        &CancellationToken::new(),
    );
    let items = drain(&mut stream).await;
    stream.close().await;
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|i| matches!(i, Ok(r) if r.is_success())));
}

#[tokio::test]
async fn one_result_per_distinct_path() {
    let out = tempfile::tempdir().unwrap();
    let host = Arc::new(TestHost::new(Launcher::Serve, out.path()));
    let mut records: Vec<FileRecord> = (1..=5u8)
        .map(|i| com_library(&format!("/libs/lib{i}.dll"), i))
        .collect();
    records.push(managed_assembly("/libs/managed.dll"));
    records.push(x64_library("/libs/wide.dll"));
    let coordinator = coordinator(&host, records);

    let mut paths: Vec<PathBuf> = (1..=5).map(|i| PathBuf::from(format!("/libs/lib{i}.dll"))).collect();
    paths.push(PathBuf::from("/libs/managed.dll"));
    paths.push(PathBuf::from("/libs/wide.dll"));
    paths.push(PathBuf::from("/libs/unknown.txt"));
    paths.push(PathBuf::from("/libs/lib2.dll"));
    paths.push(PathBuf::from("/libs/managed.dll"));

    let mut stream = coordinator.register(paths, &CancellationToken::new());
    let items = drain(&mut stream).await;
    stream.close().await;

    assert_eq!(items.len(), 8);
    let results: Vec<RegistrationResult> = items.into_iter().map(Result::unwrap).collect();
    // Ineligible files come first, in input order.
    let leading: Vec<&str> = results[..3].iter().map(|r| r.name()).collect();
    assert_eq!(leading, vec!["managed.dll", "wide.dll", "unknown.txt"]);
    assert!(results[..3].iter().all(|r| !r.is_success()));
    assert!(results[3..].iter().all(RegistrationResult::is_success));

    let mut registered: Vec<&str> = results[3..].iter().map(|r| r.name()).collect();
    registered.sort();
    assert_eq!(registered, vec!["lib1.dll", "lib2.dll", "lib3.dll", "lib4.dll", "lib5.dll"]);
    assert_eq!(host.native_calls(), 5);
    // Two chunks, two registrars.
    assert_eq!(host.registries().len(), 2);
    assert_no_live_overrides(&host);
}

#[tokio::test]
async fn chunk_order_is_kept_per_worker() {
    let out = tempfile::tempdir().unwrap();
    let host = Arc::new(TestHost::new(Launcher::Serve, out.path()));
    let records: Vec<FileRecord> = (1..=6u8)
        .map(|i| com_library(&format!("/libs/lib{i}.dll"), i))
        .collect();
    let coordinator = coordinator(&host, records);
    let paths = (1..=6).map(|i| PathBuf::from(format!("/libs/lib{i}.dll")));

    let mut stream = coordinator.register(paths, &CancellationToken::new());
    let names: Vec<String> = drain(&mut stream)
        .await
        .into_iter()
        .map(|i| i.unwrap().name().to_string())
        .collect();
    stream.close().await;

    let position = |n: &str| names.iter().position(|x| x == n).unwrap();
    assert!(position("lib1.dll") < position("lib2.dll"));
    assert!(position("lib2.dll") < position("lib3.dll"));
    assert!(position("lib4.dll") < position("lib5.dll"));
    assert!(position("lib5.dll") < position("lib6.dll"));
}

#[tokio::test]
async fn failed_worker_spawn_ends_the_batch() {
    let out = tempfile::tempdir().unwrap();
    let host = Arc::new(TestHost::new(Launcher::BrokenSpawner, out.path()));
    let coordinator = coordinator(&host, vec![com_library("/libs/a.dll", 0xa1)]);

    let mut stream = coordinator.register(vec![PathBuf::from("/libs/a.dll")], &CancellationToken::new());
    let items = drain(&mut stream).await;
    stream.close().await;
    assert_eq!(items.len(), 1);
    match items.into_iter().next().unwrap() {
        Err(CoordinatorError::WorkerSpawn(msg)) => assert!(msg.contains("registrar binary missing")),
        other => panic!("expected spawn error, got {other:?}"),
    }
}

#[tokio::test]
async fn wrong_reply_fails_the_file() {
    let out = tempfile::tempdir().unwrap();
    let host = Arc::new(TestHost::new(Launcher::Serve, out.path()).with(|s| s.worker = Worker::WrongReply));
    let coordinator = coordinator(&host, vec![com_library("/libs/a.dll", 0xa1)]);

    let mut stream = coordinator.register(vec![PathBuf::from("/libs/a.dll")], &CancellationToken::new());
    let items = drain(&mut stream).await;
    stream.close().await;

    assert_eq!(items.len(), 1);
    match items.into_iter().next().unwrap() {
        Ok(RegistrationResult::Failure { name, error, .. }) => {
            assert_eq!(name, "a.dll");
            assert!(error.contains("unexpected Terminate message"), "{error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(host.native_calls(), 0);
    assert_no_live_overrides(&host);
}

#[tokio::test]
async fn silent_registrar_times_out() {
    let out = tempfile::tempdir().unwrap();
    let host = Arc::new(TestHost::new(Launcher::Serve, out.path()).with(|s| s.worker = Worker::NeverConnects));
    let coordinator = coordinator_with(
        &host,
        vec![com_library("/libs/a.dll", 0xa1)],
        TimeoutSettings {
            connect_secs: 1,
            ..timeouts()
        },
    );

    let mut stream = coordinator.register(vec![PathBuf::from("/libs/a.dll")], &CancellationToken::new());
    let items = drain(&mut stream).await;
    tokio::time::timeout(Duration::from_secs(10), stream.close())
        .await
        .expect("teardown stalled");

    assert_eq!(items.len(), 1);
    match items.into_iter().next().unwrap() {
        Err(CoordinatorError::ConnectTimeout(who, _)) => assert_eq!(who, "registrar"),
        other => panic!("expected registrar timeout, got {other:?}"),
    }
    assert_eq!(host.native_calls(), 0);
    assert_no_live_overrides(&host);
}

#[tokio::test]
async fn registrar_exit_before_connecting_fails_fast() {
    let out = tempfile::tempdir().unwrap();
    let host = Arc::new(TestHost::new(Launcher::Serve, out.path()).with(|s| s.worker = Worker::ExitsEarly));
    let coordinator = coordinator_with(
        &host,
        vec![com_library("/libs/a.dll", 0xa1)],
        TimeoutSettings {
            connect_secs: 60,
            ..timeouts()
        },
    );

    let started = std::time::Instant::now();
    let mut stream = coordinator.register(vec![PathBuf::from("/libs/a.dll")], &CancellationToken::new());
    let items = drain(&mut stream).await;
    stream.close().await;

    assert!(started.elapsed() < Duration::from_secs(10), "waited {:?}", started.elapsed());
    assert_eq!(items.len(), 1);
    match items.into_iter().next().unwrap() {
        Err(CoordinatorError::WorkerExited(code)) => assert_eq!(code, Some(4)),
        other => panic!("expected early exit, got {other:?}"),
    }
    assert_no_live_overrides(&host);
}

#[tokio::test]
async fn lost_worker_fails_its_remaining_files() {
    let out = tempfile::tempdir().unwrap();
    let host = Arc::new(TestHost::new(Launcher::Serve, out.path()).with(|s| s.crash_after = Some(1)));
    let records: Vec<FileRecord> = (1..=6u8)
        .map(|i| com_library(&format!("/libs/lib{i}.dll"), i))
        .collect();
    let coordinator = coordinator(&host, records);
    let paths = (1..=6).map(|i| PathBuf::from(format!("/libs/lib{i}.dll")));

    let mut stream = coordinator.register(paths, &CancellationToken::new());
    let results: Vec<RegistrationResult> = drain(&mut stream)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    stream.close().await;

    assert_eq!(results.len(), 6);
    assert_eq!(results.iter().filter(|r| r.is_success()).count(), 2);
    for failure in results.iter().filter(|r| !r.is_success()) {
        let RegistrationResult::Failure { error, .. } = failure else {
            unreachable!()
        };
        assert!(error.contains("registrar worker failed"), "{error}");
    }
}

#[tokio::test]
async fn cancellation_stops_results_and_reverts_overrides() {
    let out = tempfile::tempdir().unwrap();
    let host = Arc::new(
        TestHost::new(Launcher::Serve, out.path()).with(|s| s.native_delay = Duration::from_millis(150)),
    );
    let records: Vec<FileRecord> = (1..=8u8)
        .map(|i| com_library(&format!("/libs/lib{i}.dll"), i))
        .collect();
    let coordinator = coordinator(&host, records);
    let paths = (1..=8).map(|i| PathBuf::from(format!("/libs/lib{i}.dll")));

    let cancel = CancellationToken::new();
    let mut stream = coordinator.register(paths, &cancel);
    let first = stream.next().await.unwrap().unwrap();
    assert!(first.is_success());

    cancel.cancel();
    assert!(stream.next().await.is_none());
    tokio::time::timeout(Duration::from_secs(10), stream.close())
        .await
        .expect("teardown stalled");
    stream.close().await;

    assert!(host.native_calls() < 8);
    assert_no_live_overrides(&host);
}

#[tokio::test]
async fn dropping_the_stream_tears_down() {
    let out = tempfile::tempdir().unwrap();
    let host = Arc::new(TestHost::new(Launcher::Serve, out.path()));
    let coordinator = coordinator(&host, vec![com_library("/libs/a.dll", 0xa1)]);
    let stream = coordinator.register(vec![PathBuf::from("/libs/a.dll")], &CancellationToken::new());
    drop(stream);

    // Teardown continues in the background.
    for _ in 0..50 {
        if host.0.workers.lock().is_empty() && live_overrides(&host) == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_no_live_overrides(&host);
}
