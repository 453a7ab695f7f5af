mod handler;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tree_watcher::config::{AppConfig, TreeConfig, WatcherConfig};
use tree_watcher::{TreeEvent, TreeWatcher};

use crate::handler::{CommandReader, Output, Reply};

/// How long to wait for the batch flushed by dispose.
const SHUTDOWN_QUIET: Duration = Duration::from_millis(100);

/// Watch a directory tree, one expanded directory at a time.
#[derive(Parser, Debug)]
#[command(name = "treewatch", version, about)]
struct Cli {
    /// Root directory to watch (defaults to current directory)
    #[arg(default_value = ".")]
    root: PathBuf,

    /// Path to a TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Batch events after this many quiet milliseconds (0 or less prints them one by one)
    #[arg(long, allow_negative_numbers = true)]
    buffer_ms: Option<i64>,

    /// Expand every directory on startup
    #[arg(long)]
    expand_all: bool,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    /// Hide the entries reported by initial directory scans
    #[arg(long)]
    no_initial: bool,
}

impl Cli {
    /// Config values set on the command line.
    fn overrides(&self) -> AppConfig {
        AppConfig {
            watcher: WatcherConfig {
                buffer_delay_ms: self.buffer_ms,
                ..Default::default()
            },
            tree: TreeConfig {
                expand_all: self.expand_all.then_some(true),
                show_initial: self.no_initial.then_some(false),
            },
            ..Default::default()
        }
    }
}

fn print_events(events: &[TreeEvent], show_initial: bool, json: bool) {
    for event in events.iter().filter(|e| handler::is_visible(e, show_initial)) {
        println!("{}", handler::format_event(event, json));
    }
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> tree_watcher::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref(), Some(&cli.overrides()));
    init_tracing(config.log_level());

    let tree = Arc::new(TreeWatcher::with_options(
        &cli.root,
        config.watcher_options(),
    )?);
    let mut output = Output::for_tree(&tree);

    tree.expand(".")?;
    if config.expand_all() {
        handler::handle_command(&tree, handler::Command::ExpandAll)?;
    }

    let show_initial = config.show_initial();
    let mut commands = CommandReader::spawn(tokio::io::stdin());
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            batch = output.next() => match batch {
                Ok(events) => print_events(&events, show_initial, cli.json),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event output fell behind"),
                Err(RecvError::Closed) => break,
            },
            command = commands.next(), if stdin_open => match command {
                Some(Ok(command)) => match handler::handle_command(&tree, command) {
                    Ok(Reply::Quit) => break,
                    Ok(Reply::Listing { collapsibles, expandables }) => {
                        println!("collapsible: {}", collapsibles.join(" "));
                        println!("expandable:  {}", expandables.join(" "));
                    }
                    Ok(Reply::Help) => println!("{}", handler::HELP),
                    Ok(Reply::Done) => {}
                    Err(e) => eprintln!("error: {}", e),
                },
                Some(Err(e)) => eprintln!("error: {}", e),
                // Keep watching until Ctrl-C.
                None => stdin_open = false,
            },
        }
    }

    tree.dispose();
    let remaining = output.drain(SHUTDOWN_QUIET).await;
    print_events(&remaining, show_initial, cli.json);
    info!("shutting down");
    Ok(())
}
