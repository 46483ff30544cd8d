//! goixy binary: CLI, logging, config, and the listen loop.

use anyhow::{Context, Result};
use chrono::Local;
use clap::{ArgAction, Parser};
use goixy::config::{Config, ConfigError};
use goixy::server::{Proxy, ACTIVE_TUNNELS};
use std::fmt;
use std::sync::atomic::Ordering;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// Local SOCKS5/HTTP forwarding proxy over encrypted upstream relays
#[derive(Parser, Debug)]
#[command(name = "goixy")]
#[command(version)]
#[command(about = "Local SOCKS5/HTTP forwarding proxy over encrypted upstream relays")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value_t = 1080)]
    port: u16,

    /// -v for debug logs, -vv to also log payloads
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,
}

/// Renders every log line as `[YYYY-MM-DD HH:MM:SS][<live tunnels>] ...`.
struct LinePrefix;

impl<S, N> FormatEvent<S, N> for LinePrefix
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let ts = Local::now().format("%Y-%m-%d %H:%M:%S");
        write!(
            writer,
            "[{}][{}] ",
            ts,
            ACTIVE_TUNNELS.load(Ordering::Relaxed)
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .event_format(LinePrefix)
        .init();

    if let Err(e) = run(args).await {
        eprintln!("{e:#}");
        std::process::exit(exit_code(&e));
    }
}

/// Unreadable config file exits 1; listen failures, a missing home
/// directory, and invalid config all exit 2.
fn exit_code(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<ConfigError>() {
        Some(config_err) => config_err.exit_code(),
        None => 2,
    }
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load()?;

    let addr = format!("{}:{}", args.host, args.port);
    let proxy = Proxy::bind(&addr, &config)
        .await
        .with_context(|| format!("net listen {addr}"))?;

    info!("goixy v{}", goixy::VERSION);
    info!("listen on port: {addr}");
    proxy.run().await;
    Ok(())
}
