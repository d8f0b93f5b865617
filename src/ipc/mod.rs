// src/ipc/mod.rs

//! The local control socket.
//!
//! One live connection is serviced at a time (accepts are strictly
//! sequential, so a second client observes backpressure rather than being
//! silently interleaved). The listener keeps the platform's default accept
//! backlog, so an extra client queues at the socket instead of being
//! refused outright; it still gets no reply until the live connection ends,
//! which is the same signal under the reply-timeout contract below. The
//! protocol is line-oriented text: one command
//! per line, one reply per command, every reply newline-terminated and
//! followed by a single NUL record terminator. A reply is mandatory for
//! every recognized command; the only way for a client to detect "the
//! daemon is busy with someone else" is a reply timeout, so silent drops
//! would be a protocol violation.
//!
//! Trigger decisions are not made here: requests are forwarded to the
//! engine over a channel so every spawn decision stays serialized in one
//! place, sharing the process-table guards with the filesystem-event path.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Idle polling window; a connection with no input for this many windows in
/// a row is dropped.
const IDLE_WINDOW: Duration = Duration::from_secs(1);
const MAX_IDLE_WINDOWS: u32 = 5;

/// Commands are short; anything longer than this is malformed.
const MAX_LINE_LEN: usize = 256;

/// How long we wait for the engine to answer before giving the connection up.
const ENGINE_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// How a manual trigger names its watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerTarget {
    Index(usize),
    Basename(String),
}

/// Engine verdict for a manual trigger, mapped 1:1 to protocol tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReply {
    Ok,
    AlreadyRunning,
    Blocked,
    Inhibited,
    InvalidId,
    InvalidName,
}

impl TriggerReply {
    pub fn token(self) -> &'static str {
        match self {
            TriggerReply::Ok => "OK",
            TriggerReply::AlreadyRunning => "WARN_ALREADY_RUNNING",
            TriggerReply::Blocked => "WARN_SPAWN_BLOCKED",
            TriggerReply::Inhibited => "WARN_SPAWN_INHIBITED",
            TriggerReply::InvalidId => "ERR_INVALID_ID",
            TriggerReply::InvalidName => "ERR_INVALID_NAME",
        }
    }
}

/// One row of a `list`/`gui-list` reply.
#[derive(Debug, Clone)]
pub struct ListRow {
    pub index: usize,
    pub basename: String,
    pub label: Option<String>,
    pub hidden: bool,
}

impl ListRow {
    fn render(&self) -> String {
        match &self.label {
            Some(label) => format!("{}:{}:{}", self.index, self.basename, label),
            None => format!("{}:{}", self.index, self.basename),
        }
    }
}

/// Requests forwarded to the engine.
#[derive(Debug)]
pub enum IpcRequest {
    List {
        reply: oneshot::Sender<Vec<ListRow>>,
    },
    Trigger {
        target: TriggerTarget,
        force: bool,
        reply: oneshot::Sender<TriggerReply>,
    },
}

/// Parsed protocol command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    GuiList,
    Trigger { target: TriggerTarget, force: bool },
    Version,
    FullVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    Malformed(String),
    Unknown(String),
}

const VALID_COMMANDS: &str = "list, gui-list, start:<index>, force-start:<index>, \
                              trigger:<basename>, force-trigger:<basename>, \
                              version, full-version";

/// Parse one command line.
pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let line = line.trim_end_matches(['\n', '\r', '\0']).trim();
    match line {
        "list" => return Ok(Command::List),
        "gui-list" => return Ok(Command::GuiList),
        "version" => return Ok(Command::Version),
        "full-version" => return Ok(Command::FullVersion),
        _ => {}
    }

    if let Some((verb, arg)) = line.split_once(':') {
        let force = matches!(verb, "force-start" | "force-trigger");
        match verb {
            "start" | "force-start" => {
                let index: usize = arg
                    .trim()
                    .parse()
                    .map_err(|_| CommandError::Malformed(format!("invalid watch index: {arg:?}")))?;
                return Ok(Command::Trigger {
                    target: TriggerTarget::Index(index),
                    force,
                });
            }
            "trigger" | "force-trigger" => {
                let name = arg.trim();
                if name.is_empty() {
                    return Err(CommandError::Malformed("empty watch name".into()));
                }
                return Ok(Command::Trigger {
                    target: TriggerTarget::Basename(name.to_string()),
                    force,
                });
            }
            _ => {}
        }
    }

    Err(CommandError::Unknown(line.to_string()))
}

/// Bind the control socket and spawn the accept loop.
///
/// Binding failure is fatal to the daemon; everything past that point only
/// ever drops the offending connection.
pub fn spawn_service(
    socket_path: PathBuf,
    engine_tx: mpsc::Sender<IpcRequest>,
) -> Result<JoinHandle<()>> {
    // A previous instance may have left a stale socket file behind.
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)
            .with_context(|| format!("removing stale socket {socket_path:?}"))?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating socket directory {parent:?}"))?;
    }
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("binding control socket {socket_path:?}"))?;
    info!(socket = ?socket_path, "control socket listening");

    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    if let Err(err) = handle_connection(stream, &engine_tx).await {
                        debug!(error = %err, "client connection ended with an error");
                    }
                }
                Err(err) => warn!(error = %err, "accepting control connection failed"),
            }
        }
    });
    Ok(handle)
}

async fn handle_connection(
    stream: UnixStream,
    engine_tx: &mpsc::Sender<IpcRequest>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut idle_windows = 0u32;

    loop {
        let line = match tokio::time::timeout(IDLE_WINDOW, lines.next_line()).await {
            Err(_elapsed) => {
                idle_windows += 1;
                if idle_windows >= MAX_IDLE_WINDOWS {
                    debug!("client idle too long, dropping connection");
                    return Ok(());
                }
                continue;
            }
            Ok(Ok(None)) => return Ok(()), // EOF
            Ok(Ok(Some(line))) => line,
            Ok(Err(err)) => return Err(err.into()),
        };
        idle_windows = 0;

        if line.len() > MAX_LINE_LEN {
            reply(&mut write_half, "ERR_MALFORMED_CMD").await?;
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }

        match parse_command(&line) {
            Ok(cmd) => dispatch(cmd, engine_tx, &mut write_half).await?,
            Err(CommandError::Malformed(detail)) => {
                debug!(detail, "malformed command");
                reply(&mut write_half, "ERR_MALFORMED_CMD").await?;
            }
            Err(CommandError::Unknown(cmd)) => {
                debug!(cmd, "unknown command");
                reply(
                    &mut write_half,
                    &format!("ERR_INVALID_CMD\nvalid commands: {VALID_COMMANDS}"),
                )
                .await?;
            }
        }
    }
}

async fn dispatch(
    cmd: Command,
    engine_tx: &mpsc::Sender<IpcRequest>,
    out: &mut (impl AsyncWriteExt + Unpin),
) -> Result<()> {
    match cmd {
        Command::Version => reply(out, concat!("inkmon ", env!("CARGO_PKG_VERSION"))).await,
        Command::FullVersion => {
            reply(
                out,
                concat!(
                    "inkmon ",
                    env!("CARGO_PKG_VERSION"),
                    " (",
                    env!("CARGO_PKG_DESCRIPTION"),
                    ")"
                ),
            )
            .await
        }
        Command::List | Command::GuiList => {
            let gui = matches!(cmd, Command::GuiList);
            let (tx, rx) = oneshot::channel();
            let rows = ask(engine_tx, IpcRequest::List { reply: tx }, rx).await?;
            let body: String = rows
                .iter()
                .filter(|row| !(gui && row.hidden))
                .map(|row| row.render() + "\n")
                .collect();
            // List replies are terminated by the NUL record alone.
            write_record(out, &body).await
        }
        Command::Trigger { target, force } => {
            let (tx, rx) = oneshot::channel();
            let verdict = ask(
                engine_tx,
                IpcRequest::Trigger {
                    target,
                    force,
                    reply: tx,
                },
                rx,
            )
            .await?;
            reply(out, verdict.token()).await
        }
    }
}

/// Forward a request to the engine and wait (bounded) for its answer.
async fn ask<T>(
    engine_tx: &mpsc::Sender<IpcRequest>,
    request: IpcRequest,
    rx: oneshot::Receiver<T>,
) -> Result<T> {
    engine_tx
        .send(request)
        .await
        .context("engine request channel closed")?;
    tokio::time::timeout(ENGINE_REPLY_TIMEOUT, rx)
        .await
        .context("engine did not answer in time")?
        .context("engine dropped the reply")
}

/// Write one newline-terminated reply followed by the NUL record terminator.
async fn reply(out: &mut (impl AsyncWriteExt + Unpin), text: &str) -> Result<()> {
    write_record(out, &format!("{text}\n")).await
}

async fn write_record(out: &mut (impl AsyncWriteExt + Unpin), body: &str) -> Result<()> {
    out.write_all(body.as_bytes()).await?;
    out.write_all(b"\0").await?;
    out.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_commands() {
        assert_eq!(parse_command("list\n"), Ok(Command::List));
        assert_eq!(parse_command("gui-list"), Ok(Command::GuiList));
        assert_eq!(parse_command("version"), Ok(Command::Version));
        assert_eq!(parse_command("full-version\0"), Ok(Command::FullVersion));
    }

    #[test]
    fn parses_triggers_with_force_variants() {
        assert_eq!(
            parse_command("start:3"),
            Ok(Command::Trigger {
                target: TriggerTarget::Index(3),
                force: false
            })
        );
        assert_eq!(
            parse_command("force-start:0"),
            Ok(Command::Trigger {
                target: TriggerTarget::Index(0),
                force: true
            })
        );
        assert_eq!(
            parse_command("trigger:reader.png"),
            Ok(Command::Trigger {
                target: TriggerTarget::Basename("reader.png".into()),
                force: false
            })
        );
        assert_eq!(
            parse_command("force-trigger:reader.png"),
            Ok(Command::Trigger {
                target: TriggerTarget::Basename("reader.png".into()),
                force: true
            })
        );
    }

    #[test]
    fn rejects_malformed_and_unknown_commands() {
        assert!(matches!(
            parse_command("start:not-a-number"),
            Err(CommandError::Malformed(_))
        ));
        assert!(matches!(
            parse_command("trigger:"),
            Err(CommandError::Malformed(_))
        ));
        assert!(matches!(
            parse_command("restart:1"),
            Err(CommandError::Unknown(_))
        ));
        assert!(matches!(
            parse_command("hello"),
            Err(CommandError::Unknown(_))
        ));
    }
}
