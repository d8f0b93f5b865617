// src/engine/runtime.rs

use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::StreamExt;
use inotify::{Event, Inotify, WatchMask, Watches};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{bump_modification_marker, scan_config_dir, DaemonConfig, WatchConfig};
use crate::engine::decision::{self, CloseAction};
use crate::engine::events::{classify, FsEventKind};
use crate::ipc::{IpcRequest, ListRow, TriggerReply, TriggerTarget};
use crate::oracle::ProcessingOracle;
use crate::spawn::{spawn_watch_action, LaunchOutcome};
use crate::state::State;
use crate::DaemonPaths;

/// How often the inner loop re-checks the configuration directory.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(2);

/// Pause between mountpoint probes while the target filesystem is away.
const MOUNT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Pause before retrying when no watch is currently active.
const IDLE_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// The event-driven watch/spawn engine.
///
/// One epoch is one inotify-session lifetime: subscribe every active watch,
/// multiplex filesystem events, IPC requests and the periodic reconcile
/// check, and tear it all down again when a destroy/overflow/unmount signal
/// or a configuration change invalidates the session.
pub struct Engine {
    state: Arc<State>,
    oracle: Arc<ProcessingOracle>,
    cfg: DaemonConfig,
    paths: DaemonPaths,
    ipc_rx: mpsc::Receiver<IpcRequest>,
}

/// Epoch-scoped flags accumulated while handling events.
#[derive(Debug, Default)]
struct EpochFlags {
    over: bool,
    unmounted: bool,
}

impl Engine {
    pub fn new(
        state: Arc<State>,
        oracle: Arc<ProcessingOracle>,
        cfg: DaemonConfig,
        paths: DaemonPaths,
        ipc_rx: mpsc::Receiver<IpcRequest>,
    ) -> Self {
        Self {
            state,
            oracle,
            cfg,
            paths,
            ipc_rx,
        }
    }

    /// The outer loop. Only conditions that leave the engine with no coherent
    /// path forward return an error; everything else degrades to "this one
    /// event is abandoned" and keeps looping.
    pub async fn run(mut self) -> Result<()> {
        info!("engine started");
        loop {
            self.wait_for_mount().await?;

            if self.reconcile() {
                info!("configuration changed between epochs");
            }
            if self.state.lock().registry.active_count() == 0 {
                warn!("no active watches, idling until configuration returns");
                self.idle_wait().await?;
                continue;
            }

            self.run_epoch().await?;
        }
    }

    /// Sit out one retry interval without going deaf on the control socket.
    async fn idle_wait(&mut self) -> Result<()> {
        let deadline = tokio::time::sleep(IDLE_RETRY_INTERVAL);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return Ok(()),
                maybe_req = self.ipc_rx.recv() => match maybe_req {
                    Some(req) => self.handle_ipc(req).await,
                    None => anyhow::bail!("control socket channel closed"),
                },
            }
        }
    }

    /// Block until the target mountpoint is back, still answering the
    /// control socket between probes.
    async fn wait_for_mount(&mut self) -> Result<()> {
        while !is_target_mounted(&self.paths) {
            info!(mountpoint = ?self.paths.mountpoint, "waiting for target mountpoint");
            let probe = tokio::time::sleep(MOUNT_POLL_INTERVAL);
            tokio::pin!(probe);
            loop {
                tokio::select! {
                    _ = &mut probe => break,
                    maybe_req = self.ipc_rx.recv() => match maybe_req {
                        Some(req) => self.handle_ipc(req).await,
                        None => anyhow::bail!("control socket channel closed"),
                    },
                }
            }
        }
        Ok(())
    }

    /// One inotify-session lifetime.
    async fn run_epoch(&mut self) -> Result<()> {
        // Losing the event-subscription mechanism itself is fatal.
        let inotify = Inotify::init().context("initializing inotify")?;
        let mut watches = inotify.watches();

        self.subscribe_all(&mut watches);

        let mut stream = inotify
            .into_event_stream(vec![0u8; 4096])
            .context("setting up inotify event stream")?;

        let mut reconcile_tick = tokio::time::interval_at(
            tokio::time::Instant::now() + RECONCILE_INTERVAL,
            RECONCILE_INTERVAL,
        );

        let mut flags = EpochFlags::default();
        debug!("epoch started");

        while !flags.over {
            tokio::select! {
                maybe_event = stream.next() => match maybe_event {
                    Some(Ok(event)) => {
                        self.handle_fs_event(&event, &mut watches, &mut flags).await;
                    }
                    Some(Err(err)) => {
                        return Err(err).context("reading inotify events");
                    }
                    None => {
                        warn!("inotify event stream ended unexpectedly");
                        flags.over = true;
                    }
                },
                maybe_req = self.ipc_rx.recv() => match maybe_req {
                    Some(req) => self.handle_ipc(req).await,
                    None => anyhow::bail!("control socket channel closed"),
                },
                _ = reconcile_tick.tick() => {
                    if self.reconcile() {
                        info!("configuration changed, restarting epoch");
                        flags.over = true;
                    }
                }
            }
        }

        self.teardown(&mut watches, &flags);
        debug!("epoch ended");
        Ok(())
    }

    /// Subscribe every active watch. A missing target file degrades that
    /// watch to manual-trigger-only for this epoch instead of failing the
    /// daemon.
    fn subscribe_all(&self, watches: &mut Watches) {
        let mut inner = self.state.lock();
        for (idx, entry) in inner.registry.iter_active_mut() {
            entry.reset_epoch_state();
            match watches.add(&entry.cfg.filename, WatchMask::OPEN | WatchMask::CLOSE) {
                Ok(wd) => {
                    debug!(index = idx, filename = ?entry.cfg.filename, "subscribed");
                    entry.wd = Some(wd);
                }
                Err(err) => {
                    warn!(
                        index = idx,
                        filename = ?entry.cfg.filename,
                        error = %err,
                        "cannot subscribe, watch is manual-only this epoch"
                    );
                }
            }
        }
    }

    /// Best-effort teardown of every subscription still standing. Skipped
    /// wholesale after an unmount, where the kernel already dropped them all.
    fn teardown(&self, watches: &mut Watches, flags: &EpochFlags) {
        let mut inner = self.state.lock();
        for (idx, entry) in inner.registry.iter_active_mut() {
            let Some(wd) = entry.wd.take() else { continue };
            if entry.wd_destroyed || flags.unmounted {
                continue;
            }
            if let Err(err) = watches.remove(wd) {
                debug!(index = idx, error = %err, "removing subscription failed");
            }
        }
    }

    async fn handle_fs_event(
        &self,
        event: &Event<std::ffi::OsString>,
        watches: &mut Watches,
        flags: &mut EpochFlags,
    ) {
        let Some(kind) = classify(event.mask) else {
            debug!(mask = ?event.mask, "ignoring uninteresting event mask");
            return;
        };

        let idx = self.state.lock().registry.find_by_wd(&event.wd);

        match kind {
            FsEventKind::Overflow => {
                // Events were dropped; this epoch's view is no longer
                // trustworthy.
                warn!("inotify queue overflowed, restarting epoch");
                if let Some(idx) = idx {
                    self.forget_subscription(idx, watches);
                }
                flags.over = true;
            }
            FsEventKind::Unmounted => {
                warn!("target filesystem unmounted, restarting epoch");
                flags.unmounted = true;
                flags.over = true;
            }
            FsEventKind::SubscriptionGone => {
                let Some(idx) = idx else {
                    debug!("IN_IGNORED for an unknown subscription");
                    return;
                };
                info!(index = idx, "subscription destroyed, restarting epoch");
                if let Some(entry) = self.state.lock().registry.get_mut(idx) {
                    entry.wd_destroyed = true;
                    entry.wd = None;
                }
                flags.over = true;
            }
            FsEventKind::Opened => {
                if let Some(idx) = idx {
                    self.handle_open(idx).await;
                } else {
                    warn!(mask = ?event.mask, "open for an unresolvable subscription");
                }
            }
            FsEventKind::Closed => {
                if let Some(idx) = idx {
                    self.handle_close(idx).await;
                } else {
                    warn!(mask = ?event.mask, "close for an unresolvable subscription");
                }
            }
        }
    }

    fn forget_subscription(&self, idx: usize, watches: &mut Watches) {
        if let Some(entry) = self.state.lock().registry.get_mut(idx) {
            if let Some(wd) = entry.wd.take() {
                entry.wd_destroyed = true;
                if let Err(err) = watches.remove(wd) {
                    debug!(index = idx, error = %err, "removing subscription failed");
                }
            }
        }
    }

    async fn handle_open(&self, idx: usize) {
        let Some(cfg) = self.guarded_watch_cfg(idx, "open") else {
            return;
        };
        let processed = self.oracle_check(&cfg, false).await;
        if let Some(entry) = self.state.lock().registry.get_mut(idx) {
            decision::note_open(entry, processed);
            if entry.pending_processing {
                debug!(index = idx, "open on a not-yet-processed target");
            }
        }
    }

    async fn handle_close(&self, idx: usize) {
        let Some(cfg) = self.guarded_watch_cfg(idx, "close") else {
            return;
        };
        let processed = self.oracle_check(&cfg, true).await;

        let action = {
            let mut inner = self.state.lock();
            let Some(entry) = inner.registry.get_mut(idx) else {
                return;
            };
            decision::note_close(
                entry,
                processed,
                Instant::now(),
                Duration::from_secs(self.cfg.debounce_window),
            )
        };

        match action {
            CloseAction::Suppress(reason) => {
                info!(index = idx, reason, "close suppressed");
            }
            CloseAction::Fire => {
                if self.spawns_inhibited() {
                    self.notice(format!(
                        "launch of {} inhibited by the kill switch",
                        cfg.basename()
                    ));
                    return;
                }
                self.fire(idx, &cfg);
            }
        }
    }

    /// Clone a watch's config if the running/blocker guards allow handling an
    /// event for it at all.
    fn guarded_watch_cfg(&self, idx: usize, what: &str) -> Option<WatchConfig> {
        let inner = self.state.lock();
        let entry = inner.registry.get(idx)?;
        if inner.table.is_running(idx) {
            info!(index = idx, "ignoring {what}: spawn still running for this watch");
            return None;
        }
        if inner.blocker_running() {
            info!(index = idx, "ignoring {what}: a blocker action is running");
            return None;
        }
        Some(entry.cfg.clone())
    }

    /// Run the processing check off the async thread; `skip_db_checks`
    /// bypasses it entirely.
    async fn oracle_check(&self, cfg: &WatchConfig, strict: bool) -> bool {
        if cfg.skip_db_checks {
            return true;
        }
        let oracle = Arc::clone(&self.oracle);
        let cfg = cfg.clone();
        match tokio::task::spawn_blocking(move || oracle.is_processed(&cfg, strict)).await {
            Ok(processed) => processed,
            Err(err) => {
                error!(error = %err, "processing check task failed");
                false
            }
        }
    }

    fn fire(&self, idx: usize, cfg: &WatchConfig) {
        match spawn_watch_action(&self.state, idx) {
            LaunchOutcome::Launched { pid } => {
                self.notice(format!("launched {} (pid {pid})", cfg.basename()));
            }
            LaunchOutcome::AlreadyRunning => {
                info!(index = idx, "not firing, spawn already running");
            }
            LaunchOutcome::LaunchFailed(err) => {
                self.notice(format!("failed to launch {}: {err}", cfg.basename()));
            }
        }
    }

    async fn handle_ipc(&self, req: IpcRequest) {
        match req {
            IpcRequest::List { reply } => {
                let _ = reply.send(self.list_rows());
            }
            IpcRequest::Trigger {
                target,
                force,
                reply,
            } => {
                let _ = reply.send(self.manual_trigger(target, force));
            }
        }
    }

    fn list_rows(&self) -> Vec<ListRow> {
        self.state
            .lock()
            .registry
            .iter_active()
            .map(|(index, entry)| ListRow {
                index,
                basename: entry.cfg.basename(),
                label: entry.cfg.label.clone(),
                hidden: entry.cfg.hidden,
            })
            .collect()
    }

    /// Manual trigger path: bypasses the filesystem events and the processing
    /// checks entirely, but shares the process-table guards with the normal
    /// path.
    fn manual_trigger(&self, target: TriggerTarget, force: bool) -> TriggerReply {
        let (idx, cfg) = {
            let inner = self.state.lock();
            let idx = match &target {
                TriggerTarget::Index(idx) => {
                    if inner.registry.get(*idx).is_none() {
                        return TriggerReply::InvalidId;
                    }
                    *idx
                }
                TriggerTarget::Basename(name) => match inner.registry.find_by_basename(name) {
                    Some(idx) => idx,
                    None => return TriggerReply::InvalidName,
                },
            };
            let cfg = match inner.registry.get(idx) {
                Some(entry) => entry.cfg.clone(),
                None => return TriggerReply::InvalidId,
            };
            (idx, cfg)
        };

        // A forced start cannot itself be used to force a blocker through;
        // the flag is dropped instead.
        let force = if force && cfg.block_spawns {
            warn!(index = idx, "dropping force flag: target is itself a blocker");
            false
        } else {
            force
        };

        {
            let inner = self.state.lock();
            if inner.table.is_running(idx) {
                return TriggerReply::AlreadyRunning;
            }
            if !force && inner.blocker_running() {
                return TriggerReply::Blocked;
            }
        }

        if self.spawns_inhibited() {
            return TriggerReply::Inhibited;
        }

        info!(index = idx, force, "manual trigger");
        match spawn_watch_action(&self.state, idx) {
            LaunchOutcome::Launched { pid } => {
                self.notice(format!("launched {} (pid {pid})", cfg.basename()));
                TriggerReply::Ok
            }
            LaunchOutcome::AlreadyRunning => TriggerReply::AlreadyRunning,
            LaunchOutcome::LaunchFailed(_) => {
                // The trigger itself was accepted; the exec failure is logged
                // by the spawner.
                self.notice(format!("failed to launch {}", cfg.basename()));
                TriggerReply::Ok
            }
        }
    }

    /// The filesystem-presence kill switch, checked fresh on every decision.
    fn spawns_inhibited(&self) -> bool {
        self.paths.kill_switch.exists()
    }

    /// Re-scan the configuration directory and fold the result into the
    /// registry. Bumps the modification marker only on an effective change.
    fn reconcile(&self) -> bool {
        let scan = match scan_config_dir(&self.paths.config_dir) {
            Ok(scan) => scan,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "configuration rescan failed");
                return false;
            }
        };

        let changed = {
            let mut inner = self.state.lock();
            let crate::state::StateInner { registry, table } = &mut *inner;
            registry.reconcile(&scan.watches, |idx| table.is_running(idx))
        };

        if changed {
            if let Err(err) = bump_modification_marker(&self.paths.marker) {
                warn!(marker = ?self.paths.marker, error = %err, "bumping marker failed");
            }
        }
        changed
    }

    /// Transient user-facing notice. On-screen display is a collaborator's
    /// concern; here the notice surfaces through the log.
    fn notice(&self, message: String) {
        if self.cfg.with_notifications {
            info!(target: "inkmon::notice", "{message}");
        } else {
            info!("{message}");
        }
    }
}

/// Is the watched filesystem there? Listed in /proc/mounts counts; so does an
/// existing config directory, which covers bind mounts and setups where the
/// "mountpoint" is a plain directory.
fn is_target_mounted(paths: &DaemonPaths) -> bool {
    if let Ok(mounts) = fs::read_to_string("/proc/mounts") {
        let target = paths.mountpoint.to_string_lossy();
        for line in mounts.lines() {
            if line.split_whitespace().nth(1) == Some(target.as_ref()) {
                return true;
            }
        }
    }
    paths.config_dir.is_dir()
}
