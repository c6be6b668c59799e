use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use resistes_lib::{
    AcquireOptions, AcquireSignal, CsvSink, InjectionConfig, MeasurementSink, ResistEs,
    SessionOptions, link_from_url,
};

/// Configure a ResistES resistivimeter and stream its measurements as CSV.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Instrument address: tcp:host:port or serial:path:baud[:mode].
    url: String,
    /// Injection voltage in volts.
    #[arg(long, default_value_t = 16.55)]
    voltage: f64,
    /// Injection frequency in kilohertz.
    #[arg(long, default_value_t = 976.5625)]
    frequency: f64,
    /// Impulses averaged per measurement.
    #[arg(long, default_value_t = 1)]
    impulses: u8,
    /// Reception channels sampled by the instrument.
    #[arg(long, default_value_t = 1)]
    channels: u8,
    /// Integration count.
    #[arg(long, default_value_t = 1)]
    integration: u16,
    /// Seconds to wait for the configuration acknowledgement.
    #[arg(long, default_value_t = 10.0)]
    timeout: f64,
    /// Seconds to spend draining stale bytes before configuring.
    #[arg(long, default_value_t = 30.0)]
    flush_timeout: f64,
    /// Write the CSV to this file instead of standard output.
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// CSV column delimiter.
    #[arg(long, default_value_t = ';')]
    delimiter: char,
    /// Prefix every row with a UTC date column.
    #[arg(long)]
    timestamps: bool,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn setup_logging(verbosity: &Verbosity<InfoLevel>) {
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    // logs on stderr, measurement rows may be going to stdout
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.verbose);

    if let Err(e) = run_acquisition(cli).await {
        error!("Acquisition failed: {:?}", e);
        process::exit(1);
    }

    Ok(())
}

async fn run_acquisition(cli: Cli) -> Result<()> {
    let delimiter = u8::try_from(cli.delimiter).context("delimiter must be an ASCII character")?;

    let config = InjectionConfig {
        voltage: cli.voltage,
        frequency: cli.frequency,
        impulse_count: cli.impulses,
        channel_count: cli.channels,
        integration_count: cli.integration,
    };

    let link = link_from_url(&cli.url, Duration::from_secs(10))
        .await
        .with_context(|| format!("failed to open {}", cli.url))?;
    let options = SessionOptions {
        ack_timeout: Duration::from_secs_f64(cli.timeout),
        flush_timeout: Duration::from_secs_f64(cli.flush_timeout),
    };
    let mut device = ResistEs::with_options(link, options);

    let status = device
        .set_config(config)
        .await
        .context("failed to configure the instrument")?;
    if !status.run() {
        warn!(
            board_id = status.board_id(),
            "instrument reports itself stopped, only requested measurements will arrive"
        );
    }

    let mut sink: Box<dyn MeasurementSink> = match &cli.output {
        Some(path) => {
            info!(path = %path.display(), "writing CSV file");
            Box::new(
                CsvSink::from_path(path, delimiter)
                    .with_context(|| format!("failed to create {}", path.display()))?,
            )
        }
        None => Box::new(CsvSink::stdout(delimiter)),
    };

    let (tx, mut rx) = mpsc::unbounded_channel();

    let stop_tx = tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("stop requested");
            let _ = stop_tx.send(AcquireSignal::Stop);
        }
    });

    // an empty line on stdin asks the instrument for an extra measurement
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(_)) = lines.next_line().await {
            if tx.send(AcquireSignal::RequestMeasure).is_err() {
                break;
            }
        }
    });

    info!("acquiring, press Enter for an extra measurement, Ctrl-C to stop");
    let acquire_options = AcquireOptions {
        timestamps: cli.timestamps,
        ..AcquireOptions::default()
    };
    let outcome = device.acquire(&mut sink, &acquire_options, &mut rx).await;
    device.close().await.context("failed to close the link")?;
    let stats = outcome.context("acquisition aborted")?;

    info!(
        frames = stats.frames_written,
        rejected = stats.frames_rejected,
        dropped_bytes = stats.bytes_dropped,
        "acquisition finished"
    );
    Ok(())
}
