use std::error::Error;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use inkmon::config::{scan_config_dir, DaemonConfig};
use inkmon::engine::Engine;
use inkmon::ipc::{IpcRequest, TriggerReply, TriggerTarget};
use inkmon::oracle::ProcessingOracle;
use inkmon::registry::WatchRegistry;
use inkmon::state::State;
use inkmon::DaemonPaths;
use tokio::sync::{mpsc, oneshot};

type TestResult = Result<(), Box<dyn Error>>;

/// A mountpoint-shaped tempdir: a config dir with one watch whose action
/// appends a line to a log file, so tests can observe launches.
struct Fixture {
    _dir: tempfile::TempDir,
    paths: DaemonPaths,
    target: PathBuf,
    hits: PathBuf,
}

fn fixture(skip_db_checks: bool) -> Result<Fixture, Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let root = dir.path();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir)?;

    let target = root.join("reader.png");
    fs::write(&target, b"icon")?;

    let hits = root.join("hits.log");
    let action = root.join("action.sh");
    fs::write(
        &action,
        format!("#!/bin/sh\necho \"hit $INKMON_WATCH_BASENAME\" >> {}\n", hits.display()),
    )?;
    fs::set_permissions(&action, fs::Permissions::from_mode(0o755))?;

    fs::write(
        config_dir.join("reader.toml"),
        format!(
            "filename = {:?}\naction = {:?}\nskip_db_checks = {:?}\n",
            target, action, skip_db_checks
        ),
    )?;

    let paths = DaemonPaths {
        mountpoint: root.to_path_buf(),
        config_dir,
        db_path: root.join("library.sqlite"),
        images_root: root.join("images"),
        marker: root.join("last-change"),
        kill_switch: root.join("disabled"),
        socket: root.join("ipc.ctl"),
    };

    Ok(Fixture {
        _dir: dir,
        paths,
        target,
        hits,
    })
}

fn start_engine(
    fixture: &Fixture,
) -> Result<(Arc<State>, mpsc::Sender<IpcRequest>), Box<dyn Error>> {
    let scan = scan_config_dir(&fixture.paths.config_dir)?;
    let daemon_cfg = DaemonConfig::default();

    let registry = WatchRegistry::load(scan.watches);
    assert_eq!(registry.active_count(), 1);

    let state = Arc::new(State::new(registry));
    let oracle = Arc::new(ProcessingOracle::new(
        fixture.paths.db_path.clone(),
        fixture.paths.images_root.clone(),
        &daemon_cfg,
    ));

    let (ipc_tx, ipc_rx) = mpsc::channel(16);
    let engine = Engine::new(
        Arc::clone(&state),
        oracle,
        daemon_cfg,
        fixture.paths.clone(),
        ipc_rx,
    );
    tokio::spawn(engine.run());
    Ok((state, ipc_tx))
}

async fn wait_for_hits(hits: &Path, expected: usize) -> Result<usize, Box<dyn Error>> {
    for _ in 0..200 {
        let count = fs::read_to_string(hits)
            .map(|s| s.lines().count())
            .unwrap_or(0);
        if count >= expected {
            return Ok(count);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Err(format!("never saw {expected} launches in {hits:?}").into())
}

async fn trigger(
    ipc_tx: &mpsc::Sender<IpcRequest>,
    target: TriggerTarget,
    force: bool,
) -> Result<TriggerReply, Box<dyn Error>> {
    let (tx, rx) = oneshot::channel();
    ipc_tx
        .send(IpcRequest::Trigger {
            target,
            force,
            reply: tx,
        })
        .await?;
    Ok(rx.await?)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn opening_and_closing_a_watched_file_launches_its_action() -> TestResult {
    let fixture = fixture(true)?;
    let (_state, _ipc_tx) = start_engine(&fixture)?;

    // Give the engine time to subscribe before generating events.
    tokio::time::sleep(Duration::from_millis(500)).await;

    {
        let _f = fs::File::open(&fixture.target)?;
        // Dropping closes, completing the open/close bracket.
    }

    let count = wait_for_hits(&fixture.hits, 1).await?;
    assert_eq!(count, 1);

    let line = fs::read_to_string(&fixture.hits)?;
    assert_eq!(line.trim(), "hit reader.png");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unprocessed_target_never_fires() -> TestResult {
    // No database exists in the fixture, so the strict check always says
    // "not processed".
    let fixture = fixture(false)?;
    let (_state, _ipc_tx) = start_engine(&fixture)?;

    tokio::time::sleep(Duration::from_millis(500)).await;

    {
        let _f = fs::File::open(&fixture.target)?;
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!fixture.hits.exists(), "action must not have run");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_trigger_launches_and_validates_its_target() -> TestResult {
    let fixture = fixture(true)?;
    let (_state, ipc_tx) = start_engine(&fixture)?;

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(
        trigger(&ipc_tx, TriggerTarget::Index(42), false).await?,
        TriggerReply::InvalidId
    );
    assert_eq!(
        trigger(&ipc_tx, TriggerTarget::Basename("nope.png".into()), false).await?,
        TriggerReply::InvalidName
    );

    assert_eq!(
        trigger(&ipc_tx, TriggerTarget::Index(0), false).await?,
        TriggerReply::Ok
    );
    wait_for_hits(&fixture.hits, 1).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_switch_inhibits_manual_triggers() -> TestResult {
    let fixture = fixture(true)?;
    let (_state, ipc_tx) = start_engine(&fixture)?;

    tokio::time::sleep(Duration::from_millis(500)).await;

    fs::write(&fixture.paths.kill_switch, b"")?;
    assert_eq!(
        trigger(&ipc_tx, TriggerTarget::Index(0), false).await?,
        TriggerReply::Inhibited
    );
    assert!(!fixture.hits.exists());

    fs::remove_file(&fixture.paths.kill_switch)?;
    assert_eq!(
        trigger(&ipc_tx, TriggerTarget::Index(0), false).await?,
        TriggerReply::Ok
    );
    wait_for_hits(&fixture.hits, 1).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn control_socket_is_serviced_while_waiting_for_the_mountpoint() -> TestResult {
    let fixture = fixture(true)?;

    // Point the engine at a mountpoint that is not there, so it sits in the
    // mount-wait loop instead of ever reaching an epoch.
    let mut paths = fixture.paths.clone();
    paths.mountpoint = PathBuf::from("/inkmon-test-no-such-mount");
    paths.config_dir = paths.mountpoint.join("config");

    let scan = scan_config_dir(&fixture.paths.config_dir)?;
    let state = Arc::new(State::new(WatchRegistry::load(scan.watches)));
    let oracle = Arc::new(ProcessingOracle::new(
        paths.db_path.clone(),
        paths.images_root.clone(),
        &DaemonConfig::default(),
    ));
    let (ipc_tx, ipc_rx) = mpsc::channel(16);
    let engine = Engine::new(
        Arc::clone(&state),
        oracle,
        DaemonConfig::default(),
        paths,
        ipc_rx,
    );
    tokio::spawn(engine.run());

    tokio::time::sleep(Duration::from_millis(200)).await;

    // A list request must be answered promptly, not stall until the
    // mountpoint returns.
    let (tx, rx) = oneshot::channel();
    ipc_tx.send(IpcRequest::List { reply: tx }).await?;
    let rows = tokio::time::timeout(Duration::from_secs(3), rx).await??;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].basename, "reader.png");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removing_a_config_source_releases_its_watch_and_bumps_the_marker() -> TestResult {
    let fixture = fixture(true)?;
    let (state, ipc_tx) = start_engine(&fixture)?;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(state.lock().registry.active_count(), 1);

    fs::remove_file(fixture.paths.config_dir.join("reader.toml"))?;

    // The periodic rescan runs every couple of seconds.
    for _ in 0..100 {
        if state.lock().registry.active_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(state.lock().registry.active_count(), 0);
    assert!(fixture.paths.marker.exists(), "marker bumped on change");

    assert_eq!(
        trigger(&ipc_tx, TriggerTarget::Index(0), false).await?,
        TriggerReply::InvalidId
    );
    Ok(())
}
