//! `corebus-node`: a runtime process with an `echo` service, driven until a
//! termination signal arrives.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use corebus_runtime::{
    BusConfig, Context, Definition, FileSource, Registration, Res, Runtime, Trigger,
};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "corebus-node", about = "Run a corebus runtime node", long_about = None)]
struct Cli {
    /// JSON config file merged into the runtime config
    #[arg(short, long, env = "COREBUS_CONFIG")]
    config: Option<PathBuf>,

    /// Bus driver for the default bus config
    #[arg(long, env = "COREBUS_BUS_DRIVER")]
    bus_driver: Option<String>,

    /// Server URL passed to the bus driver
    #[arg(long, env = "COREBUS_BUS_URL")]
    bus_url: Option<String>,

    /// Subject prefix of the default bus config
    #[arg(long, env = "COREBUS_BUS_PREFIX")]
    bus_prefix: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "COREBUS_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    /// Bus config assembled from flags, if any bus flag was given.
    fn bus_config(&self) -> Option<BusConfig> {
        if self.bus_driver.is_none() && self.bus_url.is_none() && self.bus_prefix.is_none() {
            return None;
        }
        let mut config = BusConfig::default();
        if let Some(driver) = &self.bus_driver {
            config = config.with_driver(driver.clone());
        }
        if let Some(prefix) = &self.bus_prefix {
            config = config.with_prefix(prefix.clone());
        }
        if let Some(url) = &self.bus_url {
            config = config.with_setting("url", Value::String(url.clone()));
        }
        Some(config)
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn configure(runtime: &Runtime, cli: &Cli) -> anyhow::Result<()> {
    if let Some(path) = &cli.config {
        runtime.load_config(&FileSource::new(path))?;
    }
    if let Some(bus) = cli.bus_config() {
        runtime.register("", bus)?;
    }

    runtime.register(
        "echo",
        Registration::Service(
            Definition::new(|ctx: Context| async move { (ctx.payload, Res::ok()) })
                .with_desc("returns its payload"),
        ),
    )?;

    let name = runtime.config().name;
    runtime.register(
        "start",
        Trigger::new(move |_ctx: Context| {
            let name = name.clone();
            async move {
                tracing::info!(name = %name, "node is serving");
            }
        }),
    )?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let runtime = Runtime::new();
    if let Err(e) = configure(&runtime, &cli) {
        tracing::error!(error = %format!("{e:#}"), "failed to configure node");
        return ExitCode::FAILURE;
    }
    if let Err(e) = runtime.go().await {
        tracing::error!(error = %format!("{e:#}"), "node failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
