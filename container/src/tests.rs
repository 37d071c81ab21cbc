use crate::{
    CreateOptions, LifecycleController, LifecycleError, RuntimeConfig, Status, monitor_alive,
};
use jailrun_jail::{InMemoryJails, JailBinding, JailParams, ParamValue, jail_name};
use jailrun_mount::{MountCall, RecordingMounter};
use jailrun_store::{ContainerState, FileStateStore};
use nix::unistd::{getegid, geteuid};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    jails: Arc<InMemoryJails>,
    mounter: Arc<RecordingMounter>,
    controller: Arc<LifecycleController>,
}

impl Harness {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let jails = Arc::new(InMemoryJails::new());
        let mounter = Arc::new(RecordingMounter::new());
        let controller = Arc::new(controller_for(dir.path(), jails.clone(), mounter.clone()).await);
        Self {
            dir,
            jails,
            mounter,
            controller,
        }
    }

    fn bundle(&self, name: &str, config: &Value) -> PathBuf {
        let bundle = self.dir.path().join("bundles").join(name);
        std::fs::create_dir_all(bundle.join("rootfs")).unwrap();
        std::fs::write(
            bundle.join("config.json"),
            serde_json::to_string_pretty(config).unwrap(),
        )
        .unwrap();
        bundle
    }

    async fn create(&self, id: &str, script: &str) -> ContainerState {
        let bundle = self.bundle(id, &config(script));
        self.controller
            .create(id, &bundle, CreateOptions::default())
            .await
            .unwrap()
    }
}

async fn controller_for(
    dir: &Path,
    jails: Arc<InMemoryJails>,
    mounter: Arc<RecordingMounter>,
) -> LifecycleController {
    let config = RuntimeConfig {
        root: dir.join("state"),
        strict: false,
        stop_grace: Duration::from_secs(2),
        kill_timeout: Duration::from_secs(2),
        start_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(10),
        devfs_ruleset_vnet: 5,
        devfs_ruleset_vmm: 25,
    };
    let store = Arc::new(FileStateStore::new(&config.root).await.unwrap());
    LifecycleController::new(config, store, jails, mounter)
}

fn config(script: &str) -> Value {
    json!({
        "ociVersion": "1.0.2",
        "root": { "path": "rootfs" },
        "hostname": "box",
        "process": {
            "user": { "uid": geteuid().as_raw(), "gid": getegid().as_raw() },
            "args": ["/bin/sh", "-c", script],
            "env": ["PATH=/bin:/usr/bin"],
            "cwd": "/"
        }
    })
}

fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("/bin/sh")
        .args(["-c", "true"])
        .spawn()
        .unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

#[tokio::test]
async fn test_full_lifecycle() {
    let h = Harness::new().await;

    let created = h.create("c1", "exec sleep 30").await;
    assert_eq!(created.status, Status::Created);
    assert_eq!(created.jail_name.as_deref(), Some("c1"));
    assert!(created.jail_id.is_some());
    assert_eq!(h.jails.jail_count(), 1);

    let running = h.controller.start("c1").await.unwrap();
    assert_eq!(running.status, Status::Running);
    let pid = running.pid.unwrap();
    assert!(pid > 0);
    assert_eq!(running.monitor_pid, Some(std::process::id()));

    h.controller.kill("c1", "TERM", false).await.unwrap();
    let stopped = h
        .controller
        .wait("c1", Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(stopped.status, Status::Stopped);
    assert_eq!(stopped.exit_code, Some(128 + libc::SIGTERM));
    assert!(stopped.exited_at.is_some());

    h.controller.delete("c1", false).await.unwrap();
    assert_eq!(h.jails.jail_count(), 0);

    let err = h.controller.state("c1").await.unwrap_err();
    assert_eq!(err.kind(), "NotFound");
}

#[tokio::test]
async fn test_exit_code_recorded() {
    let h = Harness::new().await;
    h.create("c1", "exit 42").await;
    h.controller.start("c1").await.unwrap();

    let stopped = h
        .controller
        .wait("c1", Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(stopped.exit_code, Some(42));
    assert!(stopped.error.is_none());
}

#[tokio::test]
async fn test_create_without_root_leaves_nothing() {
    let h = Harness::new().await;
    let mut config = config("true");
    config.as_object_mut().unwrap().remove("root");
    let bundle = h.bundle("c1", &config);

    let err = h
        .controller
        .create("c1", &bundle, CreateOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "SpecError");
    assert_eq!(h.jails.create_calls(), 0);
    assert!(h.controller.store().try_get("c1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_create_with_missing_bundle() {
    let h = Harness::new().await;
    let err = h
        .controller
        .create("c1", Path::new("/nonexistent/bundle"), CreateOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "SpecError");
}

#[tokio::test]
async fn test_jail_failure_rolls_back() {
    let h = Harness::new().await;
    h.jails.fail_next_create(libc::EPERM);
    let bundle = h.bundle("c1", &config("true"));

    let err = h
        .controller
        .create("c1", &bundle, CreateOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "JailCreateError");
    assert_eq!(h.jails.jail_count(), 0);
    assert!(h.controller.store().try_get("c1").await.unwrap().is_none());

    // the id is free again
    h.create("c1", "true").await;
}

#[tokio::test]
async fn test_mount_failure_rolls_back() {
    let h = Harness::new().await;
    let mut config = config("true");
    config["mounts"] = json!([
        { "destination": "/a", "type": "nullfs", "source": "/tmp" },
        { "destination": "/b", "type": "nullfs", "source": "/tmp" }
    ]);
    let bundle = h.bundle("c1", &config);
    let rootfs = bundle.canonicalize().unwrap().join("rootfs");
    h.mounter.fail_on(rootfs.join("b"));

    let err = h
        .controller
        .create("c1", &bundle, CreateOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "MountError");

    assert!(h.mounter.mounted().is_empty());
    assert!(h.mounter.calls().contains(&MountCall::Unmount {
        target: rootfs.join("a"),
        force: true,
    }));
    assert_eq!(h.jails.jail_count(), 0);
    assert!(h.controller.store().try_get("c1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_mounts_recorded_and_released() {
    let h = Harness::new().await;
    let mut config = config("true");
    config["root"]["readonly"] = json!(true);
    config["mounts"] = json!([
        { "destination": "/dev", "type": "devfs", "source": "devfs" },
        { "destination": "/data", "type": "bind", "source": "/tmp", "options": ["rbind", "ro"] }
    ]);
    let bundle = h.bundle("c1", &config);
    let rootfs = bundle.canonicalize().unwrap().join("rootfs");

    let state = h
        .controller
        .create("c1", &bundle, CreateOptions::default())
        .await
        .unwrap();
    assert_eq!(
        state.mount_targets,
        vec![rootfs.clone(), rootfs.join("dev"), rootfs.join("data")]
    );
    match &h.mounter.calls()[0] {
        MountCall::Mount(spec) => {
            assert_eq!(spec.target, rootfs);
            assert!(spec.read_only());
        }
        other => panic!("unexpected call: {:?}", other),
    }

    h.controller.delete("c1", false).await.unwrap();
    assert!(h.mounter.mounted().is_empty());
    // unmounted in reverse order
    let unmounts: Vec<_> = h
        .mounter
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            MountCall::Unmount { target, .. } => Some(target),
            _ => None,
        })
        .collect();
    assert_eq!(
        unmounts,
        vec![rootfs.join("data"), rootfs.join("dev"), rootfs]
    );
}

#[tokio::test]
async fn test_duplicate_create_and_start() {
    let h = Harness::new().await;
    h.create("c1", "exec sleep 30").await;

    let bundle = h.bundle("c1-again", &config("true"));
    let err = h
        .controller
        .create("c1", &bundle, CreateOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "AlreadyExists");

    h.controller.start("c1").await.unwrap();
    let err = h.controller.start("c1").await.unwrap_err();
    assert_eq!(err.kind(), "InvalidState");

    h.controller.delete("c1", true).await.unwrap();
}

#[tokio::test]
async fn test_delete_running_requires_force() {
    let h = Harness::new().await;
    h.create("c1", "exec sleep 30").await;
    let pid = h.controller.start("c1").await.unwrap().pid.unwrap();

    let err = h.controller.delete("c1", false).await.unwrap_err();
    assert_eq!(err.kind(), "InvalidState");
    assert_eq!(
        h.controller.state("c1").await.unwrap().status,
        Status::Running
    );

    h.controller.delete("c1", true).await.unwrap();
    assert!(!jailrun_supervisor::is_alive(pid));
    assert_eq!(h.jails.jail_count(), 0);
    assert!(h.controller.store().try_get("c1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_force_delete_escalates_to_sigkill() {
    let h = Harness::new().await;
    h.create("c1", "trap '' TERM; exec sleep 30").await;
    let pid = h.controller.start("c1").await.unwrap().pid.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    h.controller.delete("c1", true).await.unwrap();
    assert!(!jailrun_supervisor::group_alive(pid));
}

#[tokio::test]
async fn test_concurrent_create() {
    let h = Harness::new().await;
    let bundle = h.bundle("c1", &config("true"));
    let other = Arc::new(controller_for(h.dir.path(), h.jails.clone(), h.mounter.clone()).await);

    let first = {
        let controller = h.controller.clone();
        let bundle = bundle.clone();
        tokio::spawn(async move {
            controller
                .create("c1", &bundle, CreateOptions::default())
                .await
        })
    };
    let second = {
        let bundle = bundle.clone();
        tokio::spawn(async move { other.create("c1", &bundle, CreateOptions::default()).await })
    };

    let results = [first.await.unwrap(), second.await.unwrap()];
    let ok = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok, 1);
    let err = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert_eq!(err.kind(), "AlreadyExists");
    assert_eq!(h.jails.create_calls(), 1);
}

#[tokio::test]
async fn test_launch_failure() {
    let h = Harness::new().await;
    let mut config = config("true");
    config["process"]["args"] = json!(["/nonexistent/init"]);
    let bundle = h.bundle("c1", &config);
    h.controller
        .create("c1", &bundle, CreateOptions::default())
        .await
        .unwrap();

    let err = h.controller.start("c1").await.unwrap_err();
    assert_eq!(err.kind(), "LaunchError");

    let state = h.controller.state("c1").await.unwrap();
    assert_eq!(state.status, Status::Stopped);
    assert!(state.error.is_some());
    assert!(state.pid.is_none());

    let err = h.controller.await_started("c1").await.unwrap_err();
    assert_eq!(err.kind(), "LaunchError");

    let err = h.controller.start("c1").await.unwrap_err();
    assert_eq!(err.kind(), "InvalidState");

    h.controller.delete("c1", false).await.unwrap();
}

#[tokio::test]
async fn test_vanished_jail_marks_corrupted() {
    let h = Harness::new().await;
    let created = h.create("c1", "true").await;
    assert!(h.jails.forget(created.jail_id.unwrap()));

    let err = h.controller.start("c1").await.unwrap_err();
    assert_eq!(err.kind(), "Corrupted");
    assert!(h.controller.state("c1").await.unwrap().is_corrupted());

    let err = h.controller.delete("c1", false).await.unwrap_err();
    assert_eq!(err.kind(), "Corrupted");

    h.controller.delete("c1", true).await.unwrap();
    assert!(h.controller.store().try_get("c1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_interrupted_create_is_discarded() {
    let h = Harness::new().await;
    let store = h.controller.store();
    {
        let lock = store.lock("c1").await.unwrap();
        let mut state = ContainerState::new("c1", PathBuf::from("/bundles/c1"));
        state.jail_name = Some(jail_name("c1"));
        store.insert(&lock, &state).await.unwrap();
    }

    assert!(h.controller.reconcile_id("c1").await.unwrap().is_none());
    assert!(store.try_get("c1").await.unwrap().is_none());

    h.create("c1", "true").await;
}

#[tokio::test]
async fn test_interrupted_create_is_completed() {
    let h = Harness::new().await;
    let store = h.controller.store();

    let mut params = JailParams::new();
    params
        .set("name", ParamValue::Str(jail_name("c1")))
        .set("path", ParamValue::Str("/".to_string()))
        .set("persist", ParamValue::Bool(true));
    let handle = h.jails.create(&params).await.unwrap();
    {
        let lock = store.lock("c1").await.unwrap();
        let mut state = ContainerState::new("c1", PathBuf::from("/bundles/c1"));
        state.jail_name = Some(jail_name("c1"));
        store.insert(&lock, &state).await.unwrap();
    }

    let state = h.controller.reconcile_id("c1").await.unwrap().unwrap();
    assert_eq!(state.status, Status::Created);
    assert_eq!(state.jail_id, Some(handle.jid));
}

#[tokio::test]
async fn test_foreign_jail_survives_discarded_create() {
    let h = Harness::new().await;
    let store = h.controller.store();

    let mut params = JailParams::new();
    params
        .set("name", ParamValue::Str(jail_name("c1")))
        .set("path", ParamValue::Str("/".to_string()))
        .set("persist", ParamValue::Bool(true));
    let foreign = h.jails.create(&params).await.unwrap();
    {
        let lock = store.lock("c1").await.unwrap();
        let mut state = ContainerState::new("c1", PathBuf::from("/bundles/c1"));
        state.jail_name = Some(jail_name("c1"));
        state.jail_id = Some(foreign.jid + 100);
        store.insert(&lock, &state).await.unwrap();
    }

    assert!(h.controller.reconcile_id("c1").await.unwrap().is_none());
    assert_eq!(h.jails.jail_count(), 1);
}

#[tokio::test]
async fn test_lost_init_is_stopped() {
    let h = Harness::new().await;
    h.create("c1", "true").await;
    let store = h.controller.store();
    let pid = dead_pid();
    {
        let lock = store.lock("c1").await.unwrap();
        store
            .transition(&lock, &[Status::Created], Status::Running, |s| {
                s.pid = Some(pid);
                s.monitor_pid = Some(pid);
            })
            .await
            .unwrap();
    }

    let state = h
        .controller
        .wait("c1", Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(state.status, Status::Stopped);
    assert_eq!(state.error.as_deref(), Some("init process lost"));

    h.controller.delete("c1", false).await.unwrap();
}

#[tokio::test]
async fn test_interrupted_delete_is_finished() {
    let h = Harness::new().await;
    h.create("c1", "true").await;
    let store = h.controller.store();
    {
        let lock = store.lock("c1").await.unwrap();
        store
            .transition(&lock, &[Status::Created], Status::Deleted, |_| {})
            .await
            .unwrap();
    }

    assert!(h.controller.reconcile_id("c1").await.unwrap().is_none());
    assert_eq!(h.jails.jail_count(), 0);
    assert!(store.try_get("c1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_busy_jail_blocks_delete() {
    let h = Harness::new().await;
    let mut config = config("true");
    config["mounts"] = json!([
        { "destination": "/dev", "type": "devfs", "source": "devfs" }
    ]);
    let bundle = h.bundle("c1", &config);
    let created = h
        .controller
        .create("c1", &bundle, CreateOptions::default())
        .await
        .unwrap();
    let jid = created.jail_id.unwrap();
    let holder = std::process::id();
    h.jails.hold(jid, holder).unwrap();

    let err = h.controller.delete("c1", false).await.unwrap_err();
    assert_eq!(err.kind(), "JailRemoveError");

    // nothing was torn down
    let state = h.controller.state("c1").await.unwrap();
    assert_eq!(state.status, Status::Created);
    assert_eq!(state.mount_targets, created.mount_targets);
    assert_eq!(h.mounter.mounted(), created.mount_targets);
    assert_eq!(h.jails.jail_count(), 1);
    assert!(
        !h.mounter
            .calls()
            .iter()
            .any(|c| matches!(c, MountCall::Unmount { .. }))
    );

    h.jails.release(jid, holder).unwrap();
    h.controller.delete("c1", false).await.unwrap();
    assert!(h.mounter.mounted().is_empty());
}

#[tokio::test]
async fn test_failed_unmount_is_finished_later() {
    let h = Harness::new().await;
    let mut config = config("true");
    config["mounts"] = json!([
        { "destination": "/dev", "type": "devfs", "source": "devfs" }
    ]);
    let bundle = h.bundle("c1", &config);
    let created = h
        .controller
        .create("c1", &bundle, CreateOptions::default())
        .await
        .unwrap();
    h.mounter.fail_unmount(created.mount_targets[0].clone());

    let err = h.controller.delete("c1", false).await.unwrap_err();
    assert_eq!(err.kind(), "MountError");
    assert_eq!(h.jails.jail_count(), 0);
    let state = h.controller.state("c1").await.unwrap();
    assert_eq!(state.status, Status::Deleted);
    assert_eq!(state.mount_targets, created.mount_targets);

    assert!(h.controller.reconcile_id("c1").await.unwrap().is_none());
    assert!(h.controller.store().try_get("c1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_force_delete_kills_jail_processes() {
    let h = Harness::new().await;
    let jid = h.create("c1", "true").await.jail_id.unwrap();

    let mut stray = tokio::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .unwrap();
    h.jails.hold(jid, stray.id().unwrap()).unwrap();
    let reaper = tokio::spawn(async move { stray.wait().await.unwrap() });

    let err = h.controller.delete("c1", false).await.unwrap_err();
    assert_eq!(err.kind(), "JailRemoveError");

    h.controller.delete("c1", true).await.unwrap();
    let status = reaper.await.unwrap();
    assert_eq!(
        std::os::unix::process::ExitStatusExt::signal(&status),
        Some(libc::SIGKILL)
    );
    assert_eq!(h.jails.jail_count(), 0);
}

#[tokio::test]
async fn test_kill_all_reaches_every_jail_process() {
    let h = Harness::new().await;
    let jid = h.create("c1", "exec sleep 30").await.jail_id.unwrap();
    h.controller.start("c1").await.unwrap();

    let mut stray = tokio::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .unwrap();
    h.jails.hold(jid, stray.id().unwrap()).unwrap();

    // without --all only the init process group is signalled
    h.controller.kill("c1", "CONT", false).await.unwrap();
    h.controller.kill("c1", "KILL", true).await.unwrap();

    let status = tokio::time::timeout(Duration::from_secs(10), stray.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        std::os::unix::process::ExitStatusExt::signal(&status),
        Some(libc::SIGKILL)
    );
    let stopped = h
        .controller
        .wait("c1", Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(stopped.exit_code, Some(128 + libc::SIGKILL));

    h.controller.delete("c1", false).await.unwrap();
}

#[tokio::test]
async fn test_invalid_ids_and_signals() {
    let h = Harness::new().await;
    let bundle = h.bundle("x", &config("true"));

    for id in ["", "..", "a/b"] {
        let err = h
            .controller
            .create(id, &bundle, CreateOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidId", "{:?}", id);
    }

    h.create("c1", "true").await;
    let err = h.controller.kill("c1", "NOPE", false).await.unwrap_err();
    assert_eq!(err.kind(), "InvalidArgument");
    let err = h.controller.kill("c1", "TERM", false).await.unwrap_err();
    assert_eq!(err.kind(), "InvalidState");
    let err = h.controller.kill("missing", "TERM", false).await.unwrap_err();
    assert!(matches!(err, LifecycleError::NotFound(_)));
}

#[tokio::test]
async fn test_pid_file_written_on_start() {
    let h = Harness::new().await;
    let bundle = h.bundle("c1", &config("exec sleep 30"));
    let pid_file = h.dir.path().join("run/c1.pid");
    std::fs::create_dir_all(pid_file.parent().unwrap()).unwrap();

    h.controller
        .create(
            "c1",
            &bundle,
            CreateOptions {
                pid_file: Some(pid_file.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!pid_file.exists());

    let pid = h.controller.start("c1").await.unwrap().pid.unwrap();
    assert_eq!(
        std::fs::read_to_string(&pid_file).unwrap().trim(),
        pid.to_string()
    );

    h.controller.delete("c1", true).await.unwrap();
}

#[tokio::test]
async fn test_pid_file_failure_stops_container() {
    let h = Harness::new().await;
    let bundle = h.bundle("c1", &config("exec sleep 30"));
    h.controller
        .create(
            "c1",
            &bundle,
            CreateOptions {
                pid_file: Some(PathBuf::from("/dev/null/sub/c1.pid")),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = h.controller.start("c1").await.unwrap_err();
    assert_eq!(err.kind(), "LaunchError");

    let state = h.controller.state("c1").await.unwrap();
    assert_eq!(state.status, Status::Stopped);
    assert!(state.pid.is_none());
    assert!(state.error.is_some());
    let err = h.controller.await_started("c1").await.unwrap_err();
    assert_eq!(err.kind(), "LaunchError");

    h.controller.delete("c1", false).await.unwrap();
}

#[tokio::test]
async fn test_monitor_waits_for_start_request() {
    let h = Harness::new().await;
    h.create("c1", "exit 3").await;

    let monitor = {
        let controller = h.controller.clone();
        tokio::spawn(async move { controller.run_monitor("c1").await })
    };
    let gone = dead_pid();
    let recorded = h.controller.record_monitor("c1", gone).await.unwrap();
    assert_eq!(recorded.monitor_pid, Some(gone));
    assert!(!monitor_alive(&recorded));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        h.controller.state("c1").await.unwrap().status,
        Status::Created
    );
    assert!(!monitor.is_finished());

    let requested = h.controller.request_start("c1").await.unwrap();
    assert!(requested.start_requested);
    let started = h.controller.await_started("c1").await.unwrap();
    assert!(monitor_alive(&started));

    let last = tokio::time::timeout(Duration::from_secs(10), monitor)
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(last.status, Status::Stopped);
    assert_eq!(last.exit_code, Some(3));

    let err = h.controller.request_start("c1").await.unwrap_err();
    assert_eq!(err.kind(), "InvalidState");
}

#[tokio::test]
async fn test_monitor_exits_when_deleted_before_start() {
    let h = Harness::new().await;
    h.create("c1", "true").await;

    let monitor = {
        let controller = h.controller.clone();
        tokio::spawn(async move { controller.run_monitor("c1").await })
    };
    h.controller.delete("c1", false).await.unwrap();

    let last = tokio::time::timeout(Duration::from_secs(10), monitor)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(last.is_none());
}

#[tokio::test]
async fn test_ids_sharing_a_lookalike_name() {
    let h = Harness::new().await;
    let a = h.create("my.app", "true").await;
    let b = h.create("my_app", "true").await;
    assert_ne!(a.jail_name, b.jail_name);
    assert_ne!(a.jail_id, b.jail_id);

    h.create("1234", "true").await;
    h.create("c1234", "true").await;
    assert_eq!(h.jails.jail_count(), 4);

    h.controller.delete("my_app", false).await.unwrap();
    let a = h.controller.reconcile_id("my.app").await.unwrap().unwrap();
    assert!(!a.is_corrupted());
}

fn vnet_config(annotations: Value) -> Value {
    let mut config = config("true");
    config["annotations"] = annotations;
    config["mounts"] = json!([
        { "destination": "/dev", "type": "devfs", "source": "devfs", "options": ["ruleset=4"] }
    ]);
    config
}

fn devfs_options(mounter: &RecordingMounter) -> Vec<String> {
    mounter
        .calls()
        .into_iter()
        .find_map(|c| match c {
            MountCall::Mount(spec) if spec.is_devfs() => Some(spec.options),
            _ => None,
        })
        .unwrap()
}

#[tokio::test]
async fn test_devfs_ruleset_follows_jail_kind() {
    let h = Harness::new().await;

    let bundle = h.bundle("plain", &vnet_config(json!({})));
    h.controller
        .create("plain", &bundle, CreateOptions::default())
        .await
        .unwrap();
    assert_eq!(devfs_options(&h.mounter), vec!["ruleset=4".to_string()]);

    let h = Harness::new().await;
    let bundle = h.bundle("vnet", &vnet_config(json!({ "org.freebsd.jail.vnet": "new" })));
    h.controller
        .create("vnet", &bundle, CreateOptions::default())
        .await
        .unwrap();
    assert_eq!(devfs_options(&h.mounter), vec!["ruleset=5".to_string()]);

    let h = Harness::new().await;
    let bundle = h.bundle(
        "vmm",
        &vnet_config(json!({
            "org.freebsd.jail.vnet": "new",
            "org.freebsd.jail.allow.vmm": "1"
        })),
    );
    h.controller
        .create("vmm", &bundle, CreateOptions::default())
        .await
        .unwrap();
    assert_eq!(devfs_options(&h.mounter), vec!["ruleset=25".to_string()]);
}

#[tokio::test]
async fn test_missing_devfs_ruleset_is_rejected() {
    let h = Harness::new().await;
    h.mounter.set_devfs_rulesets([1, 2, 3, 4, 5]);

    let bundle = h.bundle(
        "vmm",
        &vnet_config(json!({ "org.freebsd.jail.allow.vmm": "true" })),
    );
    let err = h
        .controller
        .create("vmm", &bundle, CreateOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "MountError");
    assert!(err.to_string().contains("requested devfs ruleset not available: ruleset=25"));
    assert_eq!(h.jails.create_calls(), 0);
    assert!(h.controller.store().try_get("vmm").await.unwrap().is_none());

    let bundle = h.bundle("vnet", &vnet_config(json!({ "org.freebsd.jail.vnet": "new" })));
    h.controller
        .create("vnet", &bundle, CreateOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_list_and_cleanup() {
    let h = Harness::new().await;
    h.create("a", "true").await;
    h.create("b", "true").await;

    let ids: Vec<_> = h
        .controller
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(ids, vec!["a", "b"]);

    h.controller.cleanup("a").await.unwrap();
    assert!(h.controller.store().try_get("a").await.unwrap().is_none());

    let mut params = JailParams::new();
    params
        .set("name", ParamValue::Str("stray".to_string()))
        .set("path", ParamValue::Str("/".to_string()))
        .set("persist", ParamValue::Bool(true));
    let stray = h.jails.create(&params).await.unwrap();
    h.controller.cleanup(&stray.jid.to_string()).await.unwrap();
    assert_eq!(h.jails.jail_count(), 1);

    let err = h.controller.cleanup("nope").await.unwrap_err();
    assert_eq!(err.kind(), "NotFound");
}
