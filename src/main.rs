use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use portico::supervisor::{ExecLauncher, Supervisor, WORKER_ID_ENV};
use portico::{Args, Error, GatewayConfig, run_worker, shutdown_signal};

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("portico={}", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let worker = args.worker;
    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let result = if worker {
        let id = std::env::var(WORKER_ID_ENV).unwrap_or_else(|_| "-".to_owned());
        info!(worker = %id, pid = std::process::id(), "starting worker");
        run_worker(config)
    } else {
        supervise(config)
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "portico failed");
            ExitCode::FAILURE
        }
    }
}

fn supervise(config: GatewayConfig) -> Result<(), Error> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen,
        workers = config.workers,
        "starting portico"
    );
    for origin in &config.origins {
        info!(origin = %origin.name, authority = %origin.authority, "origin configured");
    }

    let launcher = ExecLauncher::current()?;
    let supervisor = Supervisor::new(launcher, config.workers)
        .with_respawn_delay(config.respawn_delay)
        .with_shutdown_grace(config.shutdown_grace);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(supervisor.run(shutdown_signal()))
}
