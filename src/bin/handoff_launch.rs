use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use handoff::{Coordinator, FileStore, Handoff, HandoffConfig, Matcher, Role};

/// Stand-in for an application's `main`: hands a `tox:` URI to the running
/// instance, or becomes the running instance.
///
/// Only a successful handoff ends the launch early. Without a URI a second
/// launch keeps running as a client and takes over once the owner is gone.
#[derive(Parser, Debug)]
#[command(name = "handoff-launch", author, version, about, long_about = None)]
struct Args {
    /// Startup argument to hand off (e.g. tox:abc)
    uri: Option<String>,

    /// Application name shared by every instance
    #[arg(long, default_value = "qtox")]
    app: String,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Store location (overrides the config and the default location)
    #[arg(long)]
    store: Option<PathBuf>,

    /// Stay up for this many seconds (default: forever)
    #[arg(long)]
    run_for_secs: Option<u64>,

    /// Delete the store and exit
    #[arg(long)]
    cleanup: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => HandoffConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => HandoffConfig::new(args.app.clone()),
    };
    if args.store.is_some() {
        config.store_path = args.store.clone();
    }

    if args.cleanup {
        let path = config.store_path();
        FileStore::remove(&path).with_context(|| format!("failed to remove {}", path.display()))?;
        info!("removed {}", path.display());
        return Ok(());
    }

    let mut coordinator =
        Coordinator::open_or_standalone(config).context("failed to start coordination")?;
    coordinator.register_event_handler(Matcher::prefix("tox:"), |uri| {
        let uri = String::from_utf8_lossy(uri);
        info!("handling {uri}");
        println!("{uri}");
        true
    });

    if let Some(uri) = &args.uri {
        match coordinator.handoff(uri.as_bytes())? {
            Handoff::HandledLocally => info!("handled {uri} here, continuing as owner"),
            Handoff::HandledRemotely => {
                info!("running instance handled {uri}");
                return Ok(());
            }
            Handoff::Undelivered => {
                info!("running instance did not answer for {uri}");
                return Ok(());
            }
        }
    } else if !coordinator.is_current_owner()? {
        info!("another instance is running, continuing as client");
    }

    let started = Instant::now();
    let run_for = args.run_for_secs.map(Duration::from_secs);
    let interval = coordinator.config().lease.renew_interval();
    loop {
        let was_owner = coordinator.role() == Role::Owner;
        let report = coordinator.tick()?;
        if report.owner && !was_owner {
            info!("took over as owner");
        }
        if report.dispatched + report.unroutable > 0 {
            info!(
                "tick: {} dispatched, {} unroutable, {} pruned",
                report.dispatched, report.unroutable, report.pruned
            );
        }
        if run_for.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
        std::thread::sleep(interval);
    }
    Ok(())
}
