mod cli;

use clap::Parser;
use cli::Cli;
use config::Config;
use dyninst::{ScanReport, Scanner};
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, trace};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // NOTE: The verbosity flag takes precedence over the environment variable
    // for log control. For example, `PROCSCAN_LOG=warn procscan -vv` will
    // still log at the trace level. The environment variable (`PROCSCAN_LOG`)
    // can only set the log level per crate, not override the verbosity flag.
    // Eg. `PROCSCAN_LOG=dyninst=warn procscan -vv` will log at the trace level
    // for all crates except `dyninst` which will log at the warn level.
    let env_filter = EnvFilter::builder()
        .with_env_var("PROCSCAN_LOG")
        .from_env()?
        .add_directive(cli.verbosity.log_level_filter().as_str().parse()?);

    let layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .init();

    // load config
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        _ => {
            let mut candidates = glob::glob("/etc/dyninst/config.d/*.toml")?
                .filter_map(Result::ok)
                .collect::<Vec<_>>();
            candidates.insert(0, "/etc/dyninst/config.toml".into());
            trace!(?candidates, "config file candidates");
            Config::load_multiple(candidates)?
        }
    };
    if let Some(root) = &cli.procfs_root {
        config.discovery.procfs_root = root.clone();
    }
    if let Some(interval) = cli.interval {
        config.discovery.scan_interval = interval;
    }
    debug!(?config, ?cli);

    let mut scanner = Scanner::new(&config.discovery);

    if cli.once {
        let (_, report) = scan(scanner).await?;
        log_report(&report?);
        return Ok(());
    }

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut ticker = time::interval(config.discovery.scan_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            _ = ticker.tick() => {
                let (returned, report) = scan(scanner).await?;
                scanner = returned;
                match report {
                    Ok(report) => log_report(&report),
                    // The scanner is unchanged; the next tick retries.
                    Err(err) => error!(%err, "scan failed"),
                }
            }
        }
    }
    info!("shutdown requested");
    Ok(())
}

/// Scans touch procfs synchronously, so they run off the async workers.
async fn scan(
    mut scanner: Scanner,
) -> anyhow::Result<(Scanner, Result<ScanReport, dyninst::Error>)> {
    let scanned = tokio::task::spawn_blocking(move || {
        let report = scanner.scan();
        (scanner, report)
    })
    .await?;
    Ok(scanned)
}

fn log_report(report: &ScanReport) {
    for process in &report.discovered {
        info!(
            pid = %process.pid,
            exe = ?process.executable.path,
            runtime_id = ?process.tracer.runtime_id,
            service = ?process.tracer.service_name,
            tracer_version = %process.tracer.tracer_version,
            "discovered process"
        );
    }
    for pid in &report.removed {
        info!(%pid, "process exited");
    }
    trace!(
        discovered = report.discovered.len(),
        removed = report.removed.len(),
        "scan complete"
    );
}
