//! usb-trans probe
//!
//! Exercises the HID and bulk transports against a real device: list what is
//! attached, read HID reports, stream bulk data in or out.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use common::{TransportConfig, setup_logging};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};
use transport::{
    BulkTransport, CancelToken, HidTransport, MultiRequestScope, Transport, UsbHost,
    spawn_dispatcher,
};

#[derive(Parser, Debug)]
#[command(name = "usb-trans-probe")]
#[command(author, version, about = "Probe USB devices through the HID and bulk transports")]
#[command(long_about = "
Talks to a device through the same transports the download tool uses.

EXAMPLES:
    # List every attached device
    usb-trans-probe list

    # Only devices of one vendor
    usb-trans-probe list --filter 15a2

    # Read four HID reports
    usb-trans-probe hid-read --device 15a2:0076 --count 4

    # Stream 16 MiB over bulk IN with four requests in flight
    usb-trans-probe bulk-read --device 1fc9:0146 --bytes 16777216 --pipelined

    # Send a raw image over bulk OUT
    usb-trans-probe bulk-write --device 1fc9:0146 --file image.bin --zlp

CONFIGURATION:
    1. Path specified with --config
    2. ~/.config/usb-trans/transport.toml
    3. /etc/usb-trans/transport.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached USB devices
    List {
        /// Restrict to VID or VID:PID (hex)
        #[arg(long, value_name = "VID[:PID]")]
        filter: Option<String>,
    },

    /// Read reports from a HID device
    HidRead {
        /// Device as VID:PID (hex)
        #[arg(short, long, value_name = "VID:PID")]
        device: String,

        /// Number of reports to read
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },

    /// Read from the bulk IN endpoint
    BulkRead {
        #[arg(short, long, value_name = "VID:PID")]
        device: String,

        /// Total bytes to read
        #[arg(short, long)]
        bytes: usize,

        /// Keep several IN transfers in flight
        #[arg(long)]
        pipelined: bool,
    },

    /// Write a raw file to the bulk OUT endpoint
    BulkWrite {
        #[arg(short, long, value_name = "VID:PID")]
        device: String,

        #[arg(short, long, value_name = "PATH")]
        file: PathBuf,

        /// Terminate with a zero-length packet when needed
        #[arg(long)]
        zlp: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = TransportConfig::default();
        let path = TransportConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = match args.config {
        Some(ref path) => {
            TransportConfig::load(Some(path.clone())).context("Failed to load configuration")?
        }
        None => TransportConfig::load_or_default(None),
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.general.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;
    info!("usb-trans probe v{}", env!("CARGO_PKG_VERSION"));

    let Some(command) = args.command else {
        bail!("No command given, see --help");
    };

    let host = UsbHost::new().context("Failed to initialize libusb")?;
    let dispatcher = spawn_dispatcher(
        host.events(),
        CancelToken::new(),
        config.dispatcher.poll_interval(),
    )
    .context("Failed to start USB dispatcher")?;

    let result = run(&host, &config, command);

    info!("Shutting down USB dispatcher...");
    dispatcher.shutdown();
    result
}

fn run(host: &UsbHost, config: &TransportConfig, command: Command) -> Result<()> {
    match command {
        Command::List { filter } => {
            let filter = filter.as_deref().map(parse_filter).transpose()?;
            let devices = host.devices(filter)?;
            if devices.is_empty() {
                println!("No USB devices found");
            }
            for d in devices {
                println!(
                    "Bus {:03} Device {:03}: ID {:04x}:{:04x}",
                    d.bus_number, d.address, d.vendor_id, d.product_id
                );
            }
            Ok(())
        }
        Command::HidRead { device, count } => hid_read(host, config, &device, count),
        Command::BulkRead {
            device,
            bytes,
            pipelined,
        } => bulk_read(host, config, &device, bytes, pipelined),
        Command::BulkWrite { device, file, zlp } => bulk_write(host, config, &device, &file, zlp),
    }
}

fn hid_read(host: &UsbHost, config: &TransportConfig, device: &str, count: usize) -> Result<()> {
    let (vid, pid) = parse_vid_pid(device)?;
    let hid = HidTransport::new(config);
    hid.open(host.open(vid, pid, config.usb.interface)?)
        .context("Failed to open HID transport")?;

    let mut report = vec![0u8; hid.report_size()?];
    for i in 0..count {
        let n = hid.read(&mut report).with_context(|| format!("Report {} failed", i))?;
        println!("{:3}: {}", i, hex(&report[..n]));
    }
    hid.close()?;
    Ok(())
}

fn bulk_read(
    host: &UsbHost,
    config: &TransportConfig,
    device: &str,
    bytes: usize,
    pipelined: bool,
) -> Result<()> {
    let (vid, pid) = parse_vid_pid(device)?;
    let bulk = BulkTransport::new(config);
    bulk.open(host.open(vid, pid, config.usb.interface)?)
        .context("Failed to open bulk transport")?;

    let size = config.pipeline.request_size;
    let _scope = if pipelined {
        Some(MultiRequestScope::new(&bulk, size, config.pipeline.request_count)?)
    } else {
        None
    };

    let mut buf = vec![0u8; size];
    let mut total = 0;
    let start = Instant::now();
    while total < bytes {
        let n = bulk.read_multi(&mut buf)?;
        if n == 0 {
            debug!("Zero-length read after {} bytes", total);
            break;
        }
        total += n;
    }
    report_throughput("Read", total, start);
    Ok(())
}

fn bulk_write(
    host: &UsbHost,
    config: &TransportConfig,
    device: &str,
    file: &Path,
    zlp: bool,
) -> Result<()> {
    let (vid, pid) = parse_vid_pid(device)?;
    let data =
        std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;

    let mut bulk = BulkTransport::new(config);
    if zlp {
        bulk.set_send_zero_packet(true);
    }
    bulk.open(host.open(vid, pid, config.usb.interface)?)
        .context("Failed to open bulk transport")?;

    let start = Instant::now();
    let written = bulk.write(&data)?;
    report_throughput("Wrote", written, start);
    bulk.close()?;
    Ok(())
}

fn report_throughput(verb: &str, bytes: usize, start: Instant) {
    let secs = start.elapsed().as_secs_f64();
    let rate = if secs > 0.0 {
        bytes as f64 / secs / (1024.0 * 1024.0)
    } else {
        0.0
    };
    println!("{} {} bytes in {:.3}s ({:.2} MiB/s)", verb, bytes, secs, rate);
}

fn hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_hex_u16(s: &str) -> Result<u16> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).with_context(|| format!("Invalid hex id '{}'", s))
}

/// Parse `VID` or `VID:PID`
fn parse_filter(s: &str) -> Result<(u16, Option<u16>)> {
    match s.split_once(':') {
        Some((vid, pid)) => Ok((parse_hex_u16(vid)?, Some(parse_hex_u16(pid)?))),
        None => Ok((parse_hex_u16(s)?, None)),
    }
}

fn parse_vid_pid(s: &str) -> Result<(u16, u16)> {
    match parse_filter(s)? {
        (vid, Some(pid)) => Ok((vid, pid)),
        (_, None) => bail!("Expected VID:PID, got '{}'", s),
    }
}
