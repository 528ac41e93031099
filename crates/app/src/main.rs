use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;

use talkwire_app::config::AppConfig;
use talkwire_app::gesture::GestureEvent;
use talkwire_app::runtime::{self, RuntimeOptions};
use talkwire_audio::DeviceManager;
use talkwire_foundation::Shutdown;

#[derive(Parser, Debug)]
#[command(name = "talkwire", about = "Push-to-talk microphone streaming over WebSocket")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "TALKWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Preferred input device name (substring match)
    #[arg(short, long)]
    device: Option<String>,

    /// Target sample rate in Hz
    #[arg(short = 'r', long)]
    sample_rate: Option<u32>,

    /// Receiver host, e.g. 192.168.2.1 or camera.local:8089
    #[arg(long, env = "TALKWIRE_HOST")]
    host: Option<String>,

    /// Receiver path
    #[arg(long)]
    path: Option<String>,

    /// Use ws:// instead of wss://
    #[arg(long)]
    no_tls: bool,

    /// List input devices and exit
    #[arg(long)]
    list_devices: bool,
}

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all("logs")?;
    let file_appender = RollingFileAppender::new(Rotation::DAILY, "logs", "talkwire.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr.and(non_blocking_file))
        .with_env_filter(log_level)
        .init();
    std::mem::forget(guard);
    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    let manager = DeviceManager::new()?;
    let devices = manager.enumerate_devices();
    if devices.is_empty() {
        println!("no input devices found");
        return Ok(());
    }
    for device in devices {
        let marker = if device.is_default { " (default)" } else { "" };
        println!("{}{}", device.name, marker);
    }
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(device) = &cli.device {
        config.device = Some(device.clone());
    }
    if let Some(rate) = cli.sample_rate {
        config.target_sample_rate = rate;
    }
    if let Some(host) = &cli.host {
        config.endpoint.host = host.clone();
    }
    if let Some(path) = &cli.path {
        config.endpoint.path = path.clone();
    }
    if cli.no_tls {
        config.endpoint.tls = false;
    }
    config.validate()?;
    Ok(config)
}

/// Map stdin lines onto the normalized gesture stream. Presentation glue:
/// `p` press, `r` release, `d` drag-away, `q` quit.
fn spawn_stdin_gestures(
    gesture_tx: tokio::sync::mpsc::Sender<GestureEvent>,
    shutdown: Shutdown,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let event = match line.trim() {
                "p" | "press" => GestureEvent::Press,
                "r" | "release" => GestureEvent::Release,
                "d" | "drag" => GestureEvent::DragAway,
                "q" | "quit" => {
                    shutdown.request();
                    break;
                }
                "" => continue,
                other => {
                    tracing::info!("unknown input {other:?}; use p / r / d / q");
                    continue;
                }
            };
            if gesture_tx.send(event).await.is_err() {
                break;
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging().map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    if cli.list_devices {
        return list_devices();
    }

    let config = load_config(&cli)?;
    tracing::info!("Starting Talkwire");

    let shutdown = Shutdown::install();
    let handle = runtime::start(RuntimeOptions { config });
    let stdin_handle = spawn_stdin_gestures(handle.gesture_tx.clone(), shutdown.clone());

    let mut stats_interval = tokio::time::interval(Duration::from_secs(30));
    stats_interval.tick().await; // first tick fires immediately
    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                tracing::info!("Shutdown signal received");
                break;
            }
            _ = stats_interval.tick() => {
                let snapshot = handle.metrics.snapshot();
                tracing::info!(?snapshot, "pipeline status");
            }
        }
    }

    stdin_handle.abort();
    handle.shutdown().await;
    Ok(())
}
