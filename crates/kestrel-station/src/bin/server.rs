use anyhow::{Context, Result};
use clap::Parser;
use kestrel_core::{AccessLevel, BoardState, MemoryStore, QuestionKind};
use kestrel_station::audit::AuditLogger;
use kestrel_station::{
    Dispatcher, LogFormat, Station, StationConfig, load_config, validate_config, write_config,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kestrel-station", about = "Hardware test-station controller")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "/etc/kestrel/station.toml")]
    config: PathBuf,

    /// Write a default TOML configuration file and exit
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit (no socket bind)
    #[arg(long)]
    check_config: bool,

    /// Create the log directory served by get-file if it does not exist
    #[arg(long)]
    create_log_dir: bool,

    /// Directory served by the get-file command
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Address to bind the discovery socket and the TCP listener to
    #[arg(long)]
    bind_ip: Option<IpAddr>,

    /// UDP discovery port
    #[arg(long)]
    discovery_port: Option<u16>,

    /// First TCP port to try for the command listener
    #[arg(long)]
    tcp_base_port: Option<u16>,

    /// Log level filter (e.g. info, kestrel_station=debug)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Drive a simulated test run so clients have something to watch
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        StationConfig::default()
    };

    if let Some(log_dir) = cli.log_dir {
        config.log_dir = log_dir;
    }
    if let Some(bind_ip) = cli.bind_ip {
        config.bind_ip = bind_ip;
    }
    if let Some(port) = cli.discovery_port {
        config.discovery_port = port;
    }
    if let Some(port) = cli.tcp_base_port {
        config.tcp_base_port = port;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    if cli.init_config {
        write_config(&cli.config, &config)?;
        if cli.create_log_dir {
            tokio::fs::create_dir_all(&config.log_dir).await?;
        }
        println!("Wrote config to {}", cli.config.display());
        return Ok(());
    }

    if cli.create_log_dir {
        tokio::fs::create_dir_all(&config.log_dir).await?;
    }

    if cli.check_config {
        validate_config(&config, false)?;
        println!("Config OK: {}", cli.config.display());
        return Ok(());
    }

    if let Err(e) = validate_config(&config, true) {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(config.logging.level.clone()))
            .with_writer(std::io::stderr)
            .init();
        AuditLogger::configuration_error(&cli.config, &e.to_string());
        return Err(e.into());
    }

    let _log_guard = init_tracing(&config)?;
    if config.logging.audit_enabled {
        AuditLogger::configuration_loaded(&cli.config);
    }

    let store = Arc::new(
        MemoryStore::new()
            .with_user("operator", AccessLevel::Operator)
            .with_user("repair", AccessLevel::Technician),
    );
    let station = Station::new(config, store);
    let shutdown = CancellationToken::new();

    let dispatcher = Dispatcher::bind(Arc::clone(&station), shutdown.clone())
        .await
        .context("failed to bind station sockets")?;
    let dispatch = tokio::spawn(dispatcher.run());

    let simulation = cli
        .simulate
        .then(|| tokio::spawn(simulate(Arc::clone(&station), shutdown.clone())));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Interrupt received, stopping");

    shutdown.cancel();
    if let Some(simulation) = simulation
        && let Err(e) = simulation.await
    {
        warn!("Simulation task ended abnormally: {}", e);
    }
    station.shutdown().await;
    match dispatch.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Dispatch loop failed: {}", e),
        Err(e) => error!("Dispatch task ended abnormally: {}", e),
    }
    Ok(())
}

/// Install the global subscriber. The returned guard flushes the file writer
/// and must live until exit.
fn init_tracing(
    config: &StationConfig,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = || EnvFilter::new(config.logging.level.clone());
    let json = config.logging.format == LogFormat::Json;

    let Some(ref log_file) = config.logging.file else {
        let builder = tracing_subscriber::fmt().with_env_filter(filter());
        if json {
            builder.json().init();
        } else {
            builder.init();
        }
        return Ok(None);
    };

    let dir = log_file.parent().unwrap_or(Path::new("."));
    let file_name = log_file
        .file_name()
        .and_then(|name| name.to_str())
        .context("logging.file must include a file name")?;
    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(non_blocking);
    if json {
        builder.json().init();
    } else {
        builder.with_ansi(false).init();
    }
    Ok(Some(guard))
}

/// A scripted run: a handful of test steps, one operator question halfway
/// through, then the printout.
async fn simulate(station: Arc<Station>, shutdown: CancellationToken) {
    const STEPS: [&str; 6] = [
        "POWER ON SELF TEST",
        "MEMORY PATTERN 0x55AA",
        "PCIE LINK TRAINING",
        "FAN TACHOMETER",
        "THERMAL SOAK 10 MIN",
        "NETWORK LOOPBACK",
    ];

    let mut board = BoardState::new("SIM-000001", "FG-1000");
    board.attempt = 1;
    if let Err(e) = station.begin_run(board).await {
        error!("Simulation could not start: {}", e);
        return;
    }

    let mut passed = true;
    for (index, step) in STEPS.iter().enumerate() {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
        }

        if index == STEPS.len() / 2 {
            match ask(&station, &shutdown, "Is the fan spinning?").await {
                Some(answer) if answer == "NO" => passed = false,
                Some(_) => {}
                None => return,
            }
        }

        let status = if passed { "PASS" } else { "FAIL" };
        if let Err(e) = station.append_test(step, status).await {
            warn!("Simulation could not record {:?}: {}", step, e);
        }
        let _ = station
            .append_diagnostic(&format!("step {} elapsed 2000 ms", index + 1), "INFO")
            .await;
        station
            .update_board(|board| {
                board.percent_complete = (((index + 1) * 100) / STEPS.len()) as u8;
                board.passed = passed;
            })
            .await;
    }

    match station.finish_run(passed).await {
        Ok(printout) => info!("Simulated run finished:\n{}", printout),
        Err(e) => error!("Simulation could not finish: {}", e),
    }
}

/// Post a yes/no question and wait for an operator. `None` on shutdown.
async fn ask(station: &Station, shutdown: &CancellationToken, text: &str) -> Option<String> {
    let ticket = match station.post_question(text, QuestionKind::YesNo).await {
        Ok(ticket) => ticket,
        Err(e) => {
            warn!("Could not post question: {}", e);
            return Some(String::new());
        }
    };

    tokio::select! {
        _ = shutdown.cancelled() => {
            station.close_question().await;
            None
        }
        answer = ticket.answer() => Some(answer.unwrap_or_default()),
    }
}
