use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use fluidcnc::{
    init_logging, list_ports, CncController, CncEvent, Config, EventFilter, LogFormat,
    StreamOutcome, TransportKind,
};

#[derive(Parser, Debug)]
#[command(name = "fluidcnc", version, about = "grblHAL machine link")]
struct Cli {
    /// Configuration file (TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured transport
    #[arg(short, long, global = true, value_enum)]
    transport: Option<TransportArg>,

    /// WebSocket bridge URL
    #[arg(long, global = true)]
    url: Option<String>,

    /// Serial port path
    #[arg(long, global = true)]
    port: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum TransportArg {
    Websocket,
    Serial,
    Simulated,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Websocket => TransportKind::WebSocket,
            TransportArg::Serial => TransportKind::Serial,
            TransportArg::Simulated => TransportKind::Simulated,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and print every event until Ctrl-C
    Monitor,
    /// Send one command and wait for its reply
    Send {
        command: String,
        /// Reply timeout in milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
    /// Stream a G-code file
    Stream { file: PathBuf },
    /// Dump firmware settings, writing any `--set N=value` first
    Settings {
        #[arg(long = "set", value_parser = parse_assignment)]
        set: Vec<(u16, String)>,
    },
    /// Show the controller banner and build info
    Info,
    /// Send an emergency stop
    Estop,
    /// List serial ports that look like CNC controllers
    Ports,
}

fn parse_assignment(arg: &str) -> Result<(u16, String), String> {
    let (number, value) = arg
        .trim_start_matches('$')
        .split_once('=')
        .ok_or_else(|| format!("expected N=value, got '{arg}'"))?;
    let number = number
        .trim()
        .parse()
        .map_err(|_| format!("bad setting number '{number}'"))?;
    Ok((number, value.trim().to_string()))
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::default_path()?,
    };
    let mut config = Config::load_or_default(&path)
        .with_context(|| format!("loading {}", path.display()))?;

    if let Some(transport) = cli.transport {
        config.connection.transport = transport.into();
    }
    if let Some(url) = &cli.url {
        config.connection.websocket_url = url.clone();
    }
    if let Some(port) = &cli.port {
        config.connection.serial_port = port.clone();
    }
    config.validate()?;
    Ok(config)
}

fn print_event(event: &CncEvent) {
    match serde_json::to_string(event) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::warn!("Failed to encode event: {}", e),
    }
}

async fn monitor(controller: &CncController) -> anyhow::Result<()> {
    controller
        .bus()
        .subscribe(EventFilter::All, |event| print_event(&event));
    controller.connect_with_retry().await?;
    tokio::signal::ctrl_c().await?;
    Ok(())
}

async fn stream_file(controller: &CncController, file: &PathBuf) -> anyhow::Result<()> {
    let program = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;

    controller.connect().await?;
    let handle = controller.stream_gcode(program.lines())?;
    let mut progress = handle.progress_receiver();

    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let p = *progress.borrow();
            eprintln!("{}/{} acknowledged", p.acknowledged, p.total);
        }
    });

    let outcome = tokio::select! {
        outcome = handle.wait() => outcome,
        _ = tokio::signal::ctrl_c() => {
            controller.stop_stream();
            tokio::time::sleep(controller.config().streaming.stop_settle()).await;
            StreamOutcome::Aborted { reason: "interrupted".to_string() }
        }
    };
    reporter.abort();

    match outcome {
        StreamOutcome::Completed {
            lines_executed,
            lines_failed,
        } => {
            println!("completed: {lines_executed} executed, {lines_failed} failed");
            Ok(())
        }
        other => anyhow::bail!("stream did not complete: {:?}", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    init_logging(format, level)?;

    tracing::debug!(
        "FluidCNC {} (built {})",
        fluidcnc::VERSION,
        fluidcnc::BUILD_DATE
    );

    if let Command::Ports = cli.command {
        for port in list_ports()? {
            println!("{}\t{}", port.port_name, port.description);
        }
        return Ok(());
    }

    let config = load_config(&cli)?;
    let controller = CncController::from_config(config);

    let result = match &cli.command {
        Command::Monitor => monitor(&controller).await,
        Command::Send {
            command,
            timeout_ms,
        } => {
            controller.connect().await?;
            let reply = controller
                .send_and_wait(command, Duration::from_millis(*timeout_ms))
                .await?;
            println!("{}", reply.response);
            Ok(())
        }
        Command::Stream { file } => stream_file(&controller, file).await,
        Command::Settings { set } => {
            controller.connect().await?;
            for (number, value) in set {
                controller.write_setting(*number, value).await?;
            }
            for (number, value) in controller.read_settings().await? {
                println!("${number}={value}");
            }
            Ok(())
        }
        Command::Info => {
            controller.connect().await?;
            let info = controller.firmware_info().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
        Command::Estop => {
            if controller.connect().await.is_err() {
                tracing::warn!("Link unavailable, emergency stop has no target");
            }
            let report = controller.emergency_stop();
            for (link, reason) in &report.failed {
                eprintln!("{link}: {reason}");
            }
            if report.delivered() {
                println!("stopped: {}", report.delivered_to.join(", "));
                Ok(())
            } else {
                anyhow::bail!("emergency stop was not delivered")
            }
        }
        Command::Ports => Ok(()),
    };

    controller.shutdown().await?;
    result
}
