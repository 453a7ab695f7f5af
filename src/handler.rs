//! Interactive commands for the `treewatch` binary.
//!
//! Commands are read line by line from stdin on a background task and
//! forwarded through a channel, so the main loop can `select!` over them
//! together with tree events.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use tree_watcher::{Result, TreeEvent, TreeWatcher};

/// A parsed stdin command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Expand(String),
    Collapse(String),
    Toggle(String),
    ExpandAll,
    List,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown command '{0}' (try 'help')")]
    Unknown(String),
    #[error("'{0}' needs a path")]
    MissingPath(&'static str),
}

pub const HELP: &str = "commands: expand <path>, collapse <path>, toggle <path>, expand-all, list, help, quit";

impl FromStr for Command {
    type Err = ParseError;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let path = |name: &'static str| {
            if rest.is_empty() {
                Err(ParseError::MissingPath(name))
            } else {
                Ok(rest.to_string())
            }
        };

        match word {
            "expand" | "e" => path("expand").map(Command::Expand),
            "collapse" | "c" => path("collapse").map(Command::Collapse),
            "toggle" | "t" => path("toggle").map(Command::Toggle),
            "expand-all" | "expand_all" => Ok(Command::ExpandAll),
            "list" | "ls" => Ok(Command::List),
            "help" | "?" => Ok(Command::Help),
            "quit" | "exit" | "q" => Ok(Command::Quit),
            other => Err(ParseError::Unknown(other.to_string())),
        }
    }
}

/// Reads commands from an async reader on a background task.
pub struct CommandReader {
    rx: mpsc::UnboundedReceiver<std::result::Result<Command, ParseError>>,
}

impl CommandReader {
    pub fn spawn<R>(reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => {
                        if tx.send(line.parse::<Command>()).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "failed to read command input");
                        break;
                    }
                }
            }
            debug!("command input closed");
        });
        Self { rx }
    }

    /// Next command, or `None` once the input is exhausted.
    pub async fn next(&mut self) -> Option<std::result::Result<Command, ParseError>> {
        self.rx.recv().await
    }
}

/// What the main loop should do after a command.
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    Done,
    Listing {
        collapsibles: Vec<String>,
        expandables: Vec<String>,
    },
    Help,
    Quit,
}

/// Run one command against the tree.
///
/// Expansion readiness is not awaited; its events show up on the event
/// stream. `expand-all` runs on its own task for the same reason.
pub fn handle_command(tree: &Arc<TreeWatcher>, command: Command) -> Result<Reply> {
    match command {
        Command::Expand(path) => {
            tree.expand(&path)?;
        }
        Command::Collapse(path) => tree.collapse(&path)?,
        Command::Toggle(path) => {
            tree.toggle_expansion(&path)?;
        }
        Command::ExpandAll => {
            let tree = Arc::clone(tree);
            tokio::spawn(async move {
                if let Err(e) = tree.expand_all().await {
                    warn!(error = %e, "expand-all stopped");
                }
            });
        }
        Command::List => {
            return Ok(Reply::Listing {
                collapsibles: tree.collapsibles(),
                expandables: tree.expandables(),
            })
        }
        Command::Help => return Ok(Reply::Help),
        Command::Quit => return Ok(Reply::Quit),
    }
    Ok(Reply::Done)
}

/// Event stream the main loop prints from.
pub enum Output {
    Single(broadcast::Receiver<TreeEvent>),
    Batched(broadcast::Receiver<Vec<TreeEvent>>),
}

impl Output {
    /// Batches when the tree buffers events, single events otherwise.
    pub fn for_tree(tree: &TreeWatcher) -> Self {
        match tree.subscribe_batches() {
            Some(rx) => Output::Batched(rx),
            None => Output::Single(tree.subscribe()),
        }
    }

    pub async fn next(&mut self) -> std::result::Result<Vec<TreeEvent>, RecvError> {
        match self {
            Output::Single(rx) => rx.recv().await.map(|event| vec![event]),
            Output::Batched(rx) => rx.recv().await,
        }
    }

    /// Everything that arrives until the stream has been quiet for `quiet`.
    /// Used after dispose so the final flushed batch is not lost.
    pub async fn drain(&mut self, quiet: Duration) -> Vec<TreeEvent> {
        let mut events = Vec::new();
        loop {
            match timeout(quiet, self.next()).await {
                Ok(Ok(batch)) => events.extend(batch),
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!(skipped, "event output fell behind")
                }
                Ok(Err(RecvError::Closed)) | Err(_) => break,
            }
        }
        events
    }
}

/// Whether an event is printed.
pub fn is_visible(event: &TreeEvent, show_initial: bool) -> bool {
    match event {
        TreeEvent::Add(add) => show_initial || !add.is_initial,
        _ => true,
    }
}

/// One output line for an event: a JSON object or the human-readable form.
pub fn format_event(event: &TreeEvent, json: bool) -> String {
    if json {
        serde_json::to_string(event).unwrap_or_else(|_| event.to_string())
    } else {
        event.to_string()
    }
}
