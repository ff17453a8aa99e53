// rfidlib test application -- CLI tool for exercising the AT and legacy
// ASCII reader backends against real hardware or a scripted mock.
//
// Usage:
//   rfidlib-test-app list
//   rfidlib-test-app --model "PULSAR LR" --host 192.168.2.203 info
//   rfidlib-test-app --model "DeskID UHF v2" --port /dev/ttyUSB0 inventory
//   rfidlib-test-app --model QuasarMX --port /dev/ttyUSB0 inventory --multi
//   rfidlib-test-app --model QuasarMX --mock stress --count 10
//   rfidlib-test-app --model "PULSAR LR" --host 192.168.2.203 watch --duration 30
//   rfidlib-test-app --model "PULSAR LR" --host 192.168.2.203 custom "AT+PWR?"

mod mock;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use rfidlib::ascii::AsciiReaderBuilder;
use rfidlib::at::{AtReaderBuilder, Family};
use rfidlib::{DialectKind, Reader, ReaderEvent, Tag};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// rfidlib test application -- exercises reader backends from the command line.
#[derive(Parser)]
#[command(name = "rfidlib-test-app", version, about)]
struct Cli {
    /// Reader model name (e.g. "PULSAR LR", "DeskID NFC", QuasarMX).
    /// Required for all commands except `list`.
    #[arg(long)]
    model: Option<String>,

    /// Serial port path (e.g. /dev/ttyUSB0, COM3).
    #[arg(long, conflicts_with = "host")]
    port: Option<String>,

    /// Reader IP address or host name.
    #[arg(long)]
    host: Option<String>,

    /// TCP port (default: the model's port).
    #[arg(long)]
    tcp_port: Option<u16>,

    /// Override the default baud rate for this model.
    #[arg(long)]
    baud: Option<u32>,

    /// Instance name used in status records and log output.
    #[arg(long)]
    instance: Option<String>,

    /// Heartbeat interval in seconds (0 disables liveness checking).
    #[arg(long)]
    heartbeat: Option<u32>,

    /// Connect timeout in seconds.
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Skip the hardware/firmware identity check.
    #[arg(long)]
    no_identity_check: bool,

    /// Use a scripted mock reader instead of a real connection.
    #[arg(long, conflicts_with_all = ["port", "host"])]
    mock: bool,

    /// Log at debug level (trace with -vv). `RUST_LOG` takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List all supported reader models.
    List,

    /// Connect and print the reader identity and configuration.
    Info,

    /// Run a single inventory and print the tags.
    Inventory {
        /// Cycle through all multiplexed antennas.
        #[arg(long)]
        multi: bool,

        /// Record antenna faults instead of failing (with --multi).
        #[arg(long)]
        ignore_errors: bool,
    },

    /// Run a continuous inventory and print every batch.
    Watch {
        /// Duration in seconds (0 = run until Ctrl-C).
        #[arg(long, default_value_t = 0)]
        duration: u64,

        /// Cycle through all multiplexed antennas.
        #[arg(long)]
        multi: bool,
    },

    /// Subscribe to reader events and print them in real time.
    Monitor {
        /// Duration in seconds (0 = run until Ctrl-C).
        #[arg(long, default_value_t = 0)]
        duration: u64,
    },

    /// Send a raw command and print the reply lines.
    Custom {
        /// Command text without line terminator.
        command: String,
    },

    /// Print the input pin levels.
    Inputs,

    /// Run back-to-back single inventories and report timings.
    Stress {
        /// Number of inventories.
        #[arg(long, default_value_t = 100)]
        count: u32,
    },
}

// ---------------------------------------------------------------------------
// Reader construction
// ---------------------------------------------------------------------------

fn normalize_model(name: &str) -> String {
    name.to_uppercase().replace([' ', '-', '_'], "")
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn cmd_list() -> Result<()> {
    println!("{:<16} {:<8} {:<16} {:>9} {:>8}", "Model", "Dialect", "Hardware", "Heartbeat", "TCP port");
    for reader in rfidlib::supported_readers() {
        let dialect = match reader.dialect {
            DialectKind::At => "AT",
            DialectKind::Ascii => "ASCII",
        };
        println!(
            "{:<16} {:<8} {:<16} {:>8}s {:>8}",
            reader.name, dialect, reader.hardware_name, reader.default_heartbeat, reader.default_tcp_port
        );
    }
    Ok(())
}

fn create_reader(cli: &Cli) -> Result<Box<dyn Reader>> {
    let model_name = cli
        .model
        .as_deref()
        .context("--model is required for this command")?;
    let wanted = normalize_model(model_name);

    if let Some(model) = rfidlib::at::models::all_models()
        .into_iter()
        .find(|m| normalize_model(m.name) == wanted)
    {
        let family = model.family;
        let mut builder = AtReaderBuilder::new(model.clone());
        if let Some(name) = &cli.instance {
            builder = builder.instance(name);
        }
        if let Some(seconds) = cli.heartbeat {
            builder = builder.heartbeat(seconds);
        }
        if cli.no_identity_check {
            builder = builder.check_identity(false);
        }
        if cli.mock {
            if family != Family::Uhf {
                bail!("--mock is only available for UHF and HF models");
            }
            builder = builder
                .heartbeat(0)
                .connector(Box::new(mock::at_uhf(&model)));
        } else if let Some(host) = &cli.host {
            builder = builder.tcp(host, cli.tcp_port.unwrap_or(model.default_tcp_port));
        } else if let Some(port) = &cli.port {
            builder = builder.serial_port(port);
            if let Some(baud) = cli.baud {
                builder = builder.baud_rate(baud);
            }
        } else {
            bail!("one of --port, --host or --mock is required");
        }
        let reader: Box<dyn Reader> = match family {
            Family::Uhf => Box::new(builder.build_uhf()?),
            Family::Nfc => Box::new(builder.build_nfc()?),
        };
        return Ok(reader);
    }

    if let Some(model) = rfidlib::ascii::models::all_models()
        .into_iter()
        .find(|m| normalize_model(m.name) == wanted)
    {
        let mut builder = AsciiReaderBuilder::new(model.clone());
        if let Some(name) = &cli.instance {
            builder = builder.instance(name);
        }
        if let Some(seconds) = cli.heartbeat {
            builder = builder.heartbeat(seconds);
        }
        if cli.no_identity_check {
            builder = builder.check_identity(false);
        }
        if cli.mock {
            builder = builder
                .heartbeat(0)
                .connector(Box::new(mock::ascii_hf(&model)));
        } else if let Some(host) = &cli.host {
            builder = builder.tcp(host, cli.tcp_port.unwrap_or(model.default_tcp_port));
        } else if let Some(port) = &cli.port {
            builder = builder.serial_port(port);
            if let Some(baud) = cli.baud {
                builder = builder.baud_rate(baud);
            }
        } else {
            bail!("one of --port, --host or --mock is required");
        }
        return Ok(Box::new(builder.build()?));
    }

    bail!("unknown model '{model_name}' (see `rfidlib-test-app list`)")
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn print_tags(tags: &[Tag]) {
    if tags.is_empty() {
        println!("  (no tags)");
    }
    for tag in tags {
        let antenna = tag.antenna.map(|a| a.to_string()).unwrap_or_else(|| "-".into());
        let rssi = tag.rssi.map(|r| format!("{r} dBm")).unwrap_or_default();
        match tag.error_message() {
            Some(error) => println!("  {:<32} ant {antenna:<3} error: {error}", tag.id()),
            None => println!("  {:<32} ant {antenna:<3} {rssi}", tag.id()),
        }
    }
}

fn cmd_info(reader: &dyn Reader) -> Result<()> {
    let info = reader.reader_info();
    let version = |v: Option<rfidlib::Version>| v.map(|v| v.to_string()).unwrap_or_else(|| "?".into());

    println!("Reader Information");
    println!("  Instance:       {}", reader.instance());
    println!("  Hardware:       {} {}", info.hardware_name, version(info.hardware_version));
    println!("  Firmware:       {} {}", info.firmware_name, version(info.firmware_version));
    if let Some(serial) = &info.serial_number {
        println!("  Serial number:  {serial}");
    }
    println!("  Status:         {}", reader.status().status.message());
    Ok(())
}

async fn cmd_inventory(reader: &dyn Reader, multi: bool, ignore_errors: bool) -> Result<()> {
    let tags = if multi {
        reader.get_inventory_multi(ignore_errors).await?
    } else {
        reader.get_inventory().await?
    };
    println!("{} tag(s):", tags.len());
    print_tags(&tags);
    Ok(())
}

async fn cmd_watch(reader: &dyn Reader, duration_secs: u64, multi: bool) -> Result<()> {
    let batches = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let counter = Arc::clone(&batches);
    reader.set_cb_inventory(Some(Arc::new(move |tags: &[Tag]| {
        counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        println!("[inventory] {} tag(s)", tags.len());
        print_tags(tags);
    })));

    if multi {
        reader.start_inventory_multi(false).await?;
    } else {
        reader.start_inventory().await?;
    }
    println!("Continuous inventory running (Ctrl-C to stop)...");

    if duration_secs > 0 {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(duration_secs)) => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    } else {
        tokio::signal::ctrl_c().await?;
    }

    if multi {
        reader.stop_inventory_multi().await?;
    } else {
        reader.stop_inventory().await?;
    }
    reader.set_cb_inventory(None);
    println!(
        "Stopped after {} batch(es).",
        batches.load(std::sync::atomic::Ordering::Relaxed)
    );
    Ok(())
}

async fn cmd_monitor(reader: &dyn Reader, duration_secs: u64) -> Result<()> {
    let mut event_rx = reader.subscribe();

    println!("Monitoring reader events (Ctrl-C to stop)...");

    let deadline = (duration_secs > 0).then(|| Instant::now() + Duration::from_secs(duration_secs));

    loop {
        let timeout = match deadline {
            Some(dl) => {
                let remaining = dl.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    println!("Monitor duration elapsed.");
                    break;
                }
                remaining
            }
            None => Duration::from_secs(3600),
        };

        tokio::select! {
            received = tokio::time::timeout(timeout, event_rx.recv()) => match received {
                Ok(Ok(ReaderEvent::StatusChanged(record))) => {
                    println!("[status] {} {}", record.timestamp, record.status.message());
                }
                Ok(Ok(ReaderEvent::Inventory(tags))) => {
                    println!("[inventory] {} tag(s)", tags.len());
                    print_tags(&tags);
                }
                Ok(Ok(event)) => println!("[event] {event:?}"),
                Ok(Err(RecvError::Lagged(n))) => {
                    println!("[warning] missed {n} events (consumer too slow)");
                }
                Ok(Err(RecvError::Closed)) => {
                    println!("Event channel closed.");
                    break;
                }
                Err(_) => {
                    if deadline.is_some() {
                        println!("Monitor duration elapsed.");
                    }
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(())
}

async fn cmd_custom(reader: &dyn Reader, command: &str) -> Result<()> {
    for line in reader.send_custom_command(command).await? {
        println!("{line}");
    }
    Ok(())
}

async fn cmd_inputs(reader: &dyn Reader) -> Result<()> {
    for (pin, high) in reader.get_inputs().await? {
        println!("  input {pin}: {}", if high { "HIGH" } else { "LOW" });
    }
    Ok(())
}

async fn cmd_stress(reader: &dyn Reader, count: u32) -> Result<()> {
    let mut timings = Vec::with_capacity(count as usize);
    let mut failures = 0u32;
    let started = Instant::now();

    for _ in 0..count {
        let t0 = Instant::now();
        match reader.get_inventory().await {
            Ok(_) => timings.push(t0.elapsed()),
            Err(e) => {
                failures += 1;
                println!("  inventory failed: {e}");
            }
        }
    }

    let total = started.elapsed();
    println!("Stress test: {count} inventories in {:.2}s", total.as_secs_f64());
    println!("  Failures:  {failures}");
    if !timings.is_empty() {
        timings.sort();
        let avg = timings.iter().sum::<Duration>() / timings.len() as u32;
        println!("  Min:       {:?}", timings[0]);
        println!("  Avg:       {avg:?}");
        println!("  Max:       {:?}", timings[timings.len() - 1]);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // The `list` command does not require a reader connection.
    if matches!(cli.command, Command::List) {
        return cmd_list();
    }

    let reader = create_reader(&cli)?;
    reader.set_cb_status(Some(Arc::new(|record: &rfidlib::StatusRecord| {
        tracing::info!(instance = %record.instance, status = record.status.message(), "status changed");
    })));
    reader
        .connect(Duration::from_secs(cli.timeout))
        .await
        .context("failed to connect")?;

    let result = match &cli.command {
        Command::Info => cmd_info(reader.as_ref()),
        Command::Inventory { multi, ignore_errors } => {
            cmd_inventory(reader.as_ref(), *multi, *ignore_errors).await
        }
        Command::Watch { duration, multi } => cmd_watch(reader.as_ref(), *duration, *multi).await,
        Command::Monitor { duration } => cmd_monitor(reader.as_ref(), *duration).await,
        Command::Custom { command } => cmd_custom(reader.as_ref(), command).await,
        Command::Inputs => cmd_inputs(reader.as_ref()).await,
        Command::Stress { count } => cmd_stress(reader.as_ref(), *count).await,
        Command::List => unreachable!("list handled above"),
    };

    reader.disconnect().await.ok();
    result
}
