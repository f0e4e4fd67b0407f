//! Binary entrypoint for the Homegate CLI.
//!
//! Commands:
//! - `start [--mesh-port <path>] [--no-modem]` - run both links, printing events as JSON lines
//! - `init` - write a starter `config.toml`
//! - `ports` - list serial ports and whether they are busy
//! - `send-sms --to <number> --body <text>` - initialize the modem and send one SMS
//! - `decode <frame>` - decode a MySensors frame and show how it would be routed
//!
//! See the library crate docs for module-level details: `homegate::`.
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use homegate::config::Config;
use homegate::events::GatewayEvent;
use homegate::gateway::Gateway;
use homegate::mesh::codec;
use homegate::metrics;
use homegate::serial::{PortProvider, SystemPorts};
use homegate::settings::{FileSettings, SettingsStore, KEY_PORT};

#[derive(Parser)]
#[command(name = "homegate")]
#[command(about = "Home automation gateway for a MySensors mesh and a GSM modem")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Start {
        /// Try this port first for the MySensors gateway (e.g., /dev/ttyUSB0)
        #[arg(short, long)]
        mesh_port: Option<String>,

        /// Do not open the GSM modem
        #[arg(long)]
        no_modem: bool,
    },
    /// Write a default configuration file
    Init,
    /// List serial ports
    Ports,
    /// Send a single SMS through the modem and exit
    SendSms {
        /// Recipient phone number
        #[arg(long)]
        to: String,
        /// Message text
        #[arg(long)]
        body: String,
        /// Seconds to wait for the modem before giving up
        #[arg(short, long, default_value_t = 60)]
        wait: u64,
    },
    /// Decode a MySensors frame, e.g. "5;1;1;0;2;23"
    Decode { frame: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init | Commands::Decode { .. } => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Start {
            mesh_port,
            no_modem,
        } => {
            let mut config = match pre_config {
                Some(c) => c,
                None => {
                    warn!("No usable config at {}; using defaults", cli.config);
                    Config::default()
                }
            };
            if no_modem {
                config.modem.enabled = false;
            }
            info!("Starting Homegate v{}", env!("CARGO_PKG_VERSION"));

            // A CLI port wins over the one remembered from the last handshake.
            if let Some(port) = mesh_port {
                let mut settings = FileSettings::open(&config.settings.dir, "mysensors")?;
                settings.set_value(KEY_PORT, &port)?;
            }

            let (tx, mut events) = tokio::sync::mpsc::unbounded_channel::<GatewayEvent>();
            let gateway = Gateway::spawn_system(&config, tx)?;

            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => println!("{}", serde_json::to_string(&event)?),
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown requested");
                        break;
                    }
                }
            }
            gateway.shutdown().await;
            info!("Counters: {}", serde_json::to_string(&metrics::snapshot())?);
        }
        Commands::Init => {
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Ports => {
            let config = pre_config.unwrap_or_default();
            for port in SystemPorts::new().available_ports() {
                let line = serde_json::json!({
                    "name": port.name,
                    "busy": port.busy,
                    "reserved": config.mesh.is_reserved(&port.name),
                });
                println!("{}", line);
            }
        }
        Commands::SendSms { to, body, wait } => {
            let mut config = pre_config.unwrap_or_default();
            config.modem.enabled = true;
            let (tx, _events) = tokio::sync::mpsc::unbounded_channel();
            let gateway = Gateway::spawn_system(&config, tx)?;
            let handle = gateway.handle();
            let timeout = Duration::from_secs(wait);

            if !handle.wait_for_modem(timeout, |s| s.ready).await {
                gateway.shutdown().await;
                return Err(anyhow!("modem not initialized after {}s", wait));
            }
            handle.send_sms(&to, &body);
            let queued = handle.modem_snapshot().await.map_or(0, |s| s.backlog);
            if queued == 0 {
                gateway.shutdown().await;
                return Err(anyhow!("modem did not accept the SMS to {}", to));
            }
            let sent = handle
                .wait_for_modem(timeout, |s| s.backlog == 0)
                .await;
            gateway.shutdown().await;
            if !sent {
                return Err(anyhow!("SMS to {} not confirmed by the modem", to));
            }
            info!("SMS sent to {}", to);
        }
        Commands::Decode { frame } => {
            let msg = codec::decode(&frame)?;
            let payload = serde_json::json!({
                "message": msg,
                "route": codec::route(&msg),
                "ack_requested": codec::ack_requested(&frame),
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
    }

    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level_filter())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });
    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Foreground runs also echo to the console
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}
