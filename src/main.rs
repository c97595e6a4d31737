use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use carbond::assembly;
use carbond::config::IniConfig;

#[derive(Parser)]
#[command(name = "carbond", about = "Graphite-compatible time-series storage daemon")]
struct Args {
    /// Config file path
    #[arg(short = 'c', long = "config")]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config = IniConfig::load(&args.config)?;

    // Worker parallelism comes from the top-level config section, so the
    // runtime is built by hand rather than via the attribute macro.
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(n) = config.get("", "parallelism").and_then(|s| s.parse::<usize>().ok()) {
        info!("concurrency level is {}", n);
        builder.worker_threads(n);
    }
    let runtime = builder.build()?;

    runtime.block_on(assembly::build_all_and_run(config))
}
