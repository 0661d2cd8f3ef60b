use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};

use routemon::config::MonitorConfig;
use routemon::Pipeline;

#[derive(Parser, Debug)]
#[command(name = "routemon", about = "BGP route-monitoring daemon")]
struct Args {
    /// Configuration document, read at start-up and overwritten on save.
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Scratch directory for operator-initiated dumps.
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// Recovery mode: come up with an empty configuration when the
    /// configured document cannot be loaded.
    #[arg(long)]
    recovery_port: Option<u16>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match MonitorConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => match args.recovery_port {
            Some(port) => {
                error!("configuration load failed: {err}");
                warn!("recovery mode: starting with defaults, operator port {port}");
                MonitorConfig::default()
            }
            None => {
                return Err(err).context(format!(
                    "cannot load configuration from {}",
                    args.config.display()
                ))
            }
        },
    };

    if let Some(dir) = &args.scratch_dir {
        info!("scratch directory: {}", dir.display());
    }

    let pipeline = Pipeline::start(config)?;
    let shutdown = pipeline.shutdown_flag();
    ctrlc::set_handler(move || {
        shutdown.store(true, Ordering::SeqCst);
    })
    .context("cannot install signal handler")?;

    pipeline.run_until_shutdown();
    Ok(())
}
