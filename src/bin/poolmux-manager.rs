//! Manager child started by the gateway for one pool
//!
//! Detaches from the gateway, starts the pool's backend, prints the backend's
//! `host:port` on stdout once it accepts connections and supervises it until
//! it exits or goes idle.

#[cfg(not(unix))]
fn main() -> anyhow::Result<()> {
    anyhow::bail!("poolmux-manager needs fork(2) and only runs on Unix")
}

#[cfg(unix)]
fn main() -> anyhow::Result<()> {
    use anyhow::Context;
    use poolmux::config::Config;
    use std::sync::Mutex;

    let args = poolmux::manager::ManagerArgs::parse(std::env::args().skip(1))?;
    let config = Config::load(&args.config_path)
        .with_context(|| format!("failed to load {}", args.config_path.display()))?;

    // The gateway only waits for our exit and the readiness line
    if !poolmux::manager::detach()? {
        return Ok(());
    }

    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("poolmux=debug".parse().expect("valid log directive"));

    match &config.manager.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(poolmux::manager::run(args, config))
}
