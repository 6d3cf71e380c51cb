use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;

use tide_ingest::config::{Config, ConfigError};
use tide_ingest::ingest::{IngestionService, Outputs, SerialPortOpener, SessionEvent};
use tide_ingest::telemetry::{capture_time, parser, Measurement, TIMESTAMP_FORMAT};

#[derive(Parser)]
#[command(name = "tide-ingest")]
#[command(about = "Tide sensor serial telemetry ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest telemetry from a serial port until Ctrl-C
    Run {
        #[arg(long)]
        config: Option<String>,
        /// Serial device, overrides serial.port
        #[arg(long)]
        port: Option<String>,
        /// Baud rate, overrides serial.baud
        #[arg(long)]
        baud: Option<u32>,
    },
    /// Print the stored measurement history
    History {
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        json: bool,
        /// Only show the newest N measurements
        #[arg(long)]
        last: Option<usize>,
    },
    /// Delete the stored measurement history
    Delete {
        #[arg(long)]
        config: Option<String>,
    },
    /// Parse a single frame and show the extracted fields
    Parse { frame: String },
    /// Validate a configuration file
    Validate { config: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, port, baud } => match load_config(config.as_deref()) {
            Ok(config) => run(config, port, baud).await,
            Err(code) => code,
        },
        Commands::History { config, json, last } => match load_config(config.as_deref()) {
            Ok(config) => history(&config, json, last),
            Err(code) => code,
        },
        Commands::Delete { config } => match load_config(config.as_deref()) {
            Ok(config) => delete(config).await,
            Err(code) => code,
        },
        Commands::Parse { frame } => parse(&frame),
        Commands::Validate { config } => validate(&config),
    }
}

fn load_config(path: Option<&str>) -> Result<Config, ExitCode> {
    let result: Result<Config, ConfigError> = match path {
        Some(path) => Config::from_file(path),
        None => Ok(Config::default()),
    };
    result.map_err(|e| {
        eprintln!("Config error: {}", e);
        ExitCode::FAILURE
    })
}

fn build_service(config: &Config) -> Result<(IngestionService, Outputs), ExitCode> {
    let timeout = config.read_timeout().map_err(|e| {
        eprintln!("Config error: {}", e);
        ExitCode::FAILURE
    })?;
    Ok(IngestionService::new(
        config,
        Arc::new(SerialPortOpener::new(timeout)),
    ))
}

async fn run(config: Config, port: Option<String>, baud: Option<u32>) -> ExitCode {
    let Some(port) = port.or_else(|| config.serial.port.clone()) else {
        eprintln!("No serial port given (use --port or serial.port)");
        return ExitCode::FAILURE;
    };
    let baud = baud.unwrap_or(config.serial.baud);

    let (mut service, outputs) = match build_service(&config) {
        Ok(built) => built,
        Err(code) => return code,
    };

    if let Err(e) = service.start(&port, baud).await {
        eprintln!("Failed to start ingestion: {}", e);
        return ExitCode::FAILURE;
    }

    let Outputs {
        mut frames,
        mut snapshots,
        mut events,
    } = outputs;

    let frame_printer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            println!("{}", frame);
        }
    });
    let snapshot_printer = tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let line = {
                let snapshot = snapshots.borrow_and_update();
                snapshot
                    .last()
                    .map(|latest| format!("{} in window, latest: {}", snapshot.len(), summary(latest)))
            };
            if let Some(line) = line {
                log::info!("{}", line);
            }
        }
    });

    let code = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                service.stop().await;
                break ExitCode::SUCCESS;
            }
            event = events.recv() => match event {
                Some(SessionEvent::LinkLost { error }) => {
                    eprintln!("Serial link lost: {}", error);
                    service.stop().await;
                    break ExitCode::FAILURE;
                }
                Some(SessionEvent::StorageWriteFailed { measurement, error }) => {
                    eprintln!("Measurement not saved ({}): {}", summary(&measurement), error);
                }
                Some(SessionEvent::Started { port, baud, replayed }) => {
                    println!("Reading {} at {} baud, {} measurements in history", port, baud, replayed);
                }
                Some(SessionEvent::Stopped) | None => break ExitCode::SUCCESS,
            }
        }
    };

    frame_printer.abort();
    snapshot_printer.abort();

    let status = service.status();
    println!(
        "{} frames received, {} accepted, {} rejected, {} not saved",
        status.frames_received,
        status.measurements_accepted,
        status.frames_rejected,
        status.storage_failures
    );
    code
}

fn history(config: &Config, json: bool, last: Option<usize>) -> ExitCode {
    let store = tide_ingest::TelemetryStore::new(config.storage.data_file.clone());
    let measurements = match store.load_all() {
        Ok(m) => m,
        Err(e) if e.is_corrupt() => {
            eprintln!("Telemetry log is corrupt: {}", e);
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("Error reading telemetry log: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let skip = last.map_or(0, |n| measurements.len().saturating_sub(n));
    let shown = &measurements[skip..];

    if json {
        return match serde_json::to_string_pretty(shown) {
            Ok(out) => {
                println!("{}", out);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error encoding history: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    if measurements.is_empty() {
        println!("No stored measurements in {}", store.path().display());
        return ExitCode::SUCCESS;
    }

    println!(
        "{} stored measurements in {}",
        measurements.len(),
        store.path().display()
    );
    for m in shown {
        println!("  {}", summary(m));
    }
    ExitCode::SUCCESS
}

async fn delete(config: Config) -> ExitCode {
    let (mut service, _outputs) = match build_service(&config) {
        Ok(built) => built,
        Err(code) => return code,
    };
    match service.delete_history().await {
        Ok(()) => {
            println!("Deleted {}", service.store().path().display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to delete history: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn parse(frame: &str) -> ExitCode {
    let fields = match parser::parse_frame(frame) {
        Ok(fields) => fields,
        Err(rejection) => {
            println!("Rejected: {}", rejection);
            return ExitCode::FAILURE;
        }
    };
    println!("{:#?}", fields);

    match fields.into_measurement(capture_time()) {
        Ok(m) => {
            println!("Accepted: {}", summary(&m));
            ExitCode::SUCCESS
        }
        Err(rejection) => {
            println!("Rejected: {}", rejection);
            ExitCode::FAILURE
        }
    }
}

fn validate(path: &str) -> ExitCode {
    match Config::from_file(path) {
        Ok(config) => {
            println!("Config is valid");
            println!(
                "  serial: {} @ {} baud",
                config.serial.port.as_deref().unwrap_or("(none)"),
                config.serial.baud
            );
            println!("  log: {}", config.storage.data_file.display());
            println!("  window: {} measurements", config.window.capacity);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Config error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn summary(m: &Measurement) -> String {
    format!(
        "{} battery={:.3}V solar={:.3}V range={} rssi={}",
        m.timestamp.format(TIMESTAMP_FORMAT),
        m.battery_voltage,
        m.solar_voltage,
        m.ultrasonic_range,
        m.rssi
    )
}
