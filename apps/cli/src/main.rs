mod observer;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use bleota_core::payload::Packetizer;
use bleota_core::protocol::crc16;
use bleota_core::{
    BleTransport, FirmwareImage, OtaConfig, OtaError, OtaSession, SessionOutcome, SimFault,
    SimulatedDevice,
};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::{error, info};

use observer::CliObserver;

#[derive(Parser, Debug)]
#[command(author, version, about = "BLE OTA firmware update tool", long_about = None)]
struct Args {
    /// Session configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Split an image into packets and print statistics (dry run)
    Packetize {
        /// Firmware image
        file: PathBuf,
        /// Packet size including the 3-byte header
        #[arg(long, default_value_t = bleota_core::protocol::EXPECT_PACKET_SIZE)]
        packet_size: usize,
    },
    /// Print the CRC16 of a file, whole and per sector
    Crc {
        file: PathBuf,
    },
    /// Run a complete update against the built-in simulated device
    Simulate {
        file: PathBuf,
        /// Inject a fault, e.g. refuse-start, checksum:1, missing-channel:command
        #[arg(long = "fault")]
        faults: Vec<SimFault>,
        /// Make the MTU exchange fail
        #[arg(long)]
        mtu_fail: bool,
        /// Largest MTU the simulated device grants
        #[arg(long)]
        max_mtu: Option<u16>,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Update a real device over Bluetooth LE
    Flash {
        file: PathBuf,
        /// Device local name or address
        #[arg(long)]
        device: String,
        /// Seconds to scan for the device
        #[arg(long, default_value_t = 10)]
        scan_timeout: u64,
        /// Report this MTU as granted (the platform stack negotiates it)
        #[arg(long)]
        assume_mtu: Option<u16>,
        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Per-run overrides of the configuration file.
#[derive(ClapArgs, Debug)]
struct Overrides {
    /// MTU to request after connecting
    #[arg(long)]
    mtu: Option<u16>,
    /// Upper bound for the packet size after a successful MTU exchange
    #[arg(long)]
    packet_size: Option<usize>,
    /// Verify the checksum of command ACKs
    #[arg(long)]
    verify_checksum: bool,
    /// Abort when a notification cannot be enabled
    #[arg(long)]
    strict_notifications: bool,
    /// Give up after this many seconds
    #[arg(long, default_value_t = 300)]
    timeout: u64,
}

impl Overrides {
    fn apply(&self, config: &mut OtaConfig) {
        if let Some(mtu) = self.mtu {
            config.mtu_request = mtu;
        }
        if let Some(size) = self.packet_size {
            config.packet_size = size;
        }
        config.verify_command_checksum |= self.verify_checksum;
        config.strict_notifications |= self.strict_notifications;
    }
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        match e.downcast_ref::<OtaError>() {
            Some(ota) => error!("OTA failed (code {}): {}", ota.code(), ota),
            None => error!("Error: {:#}", e),
        }
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => OtaConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => OtaConfig::default(),
    };

    match args.command {
        Commands::Packetize { file, packet_size } => packetize(&file, packet_size, &config),
        Commands::Crc { file } => crc(&file, &config),
        Commands::Simulate {
            file,
            faults,
            mtu_fail,
            max_mtu,
            overrides,
        } => {
            overrides.apply(&mut config);
            let mut device = SimulatedDevice::new("simulated-device").with_faults(faults);
            if mtu_fail {
                device = device.with_fault(SimFault::RejectMtu);
            }
            if let Some(mtu) = max_mtu {
                device = device.with_max_mtu(mtu);
            }
            let image = load_image(&file)?;
            update(config, device.clone(), image.clone(), overrides.timeout)?;
            if device.received_image() != image.as_bytes() {
                bail!("Simulated device holds a different image than was sent");
            }
            info!(bytes = image.len(), "Simulated device verified the image");
            Ok(())
        }
        Commands::Flash {
            file,
            device,
            scan_timeout,
            assume_mtu,
            overrides,
        } => {
            overrides.apply(&mut config);
            flash(
                config,
                &file,
                &device,
                Duration::from_secs(scan_timeout),
                assume_mtu,
                overrides.timeout,
            )
        }
    }
}

fn load_image(path: &Path) -> Result<FirmwareImage> {
    FirmwareImage::from_file(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn packetize(file: &Path, packet_size: usize, config: &OtaConfig) -> Result<()> {
    let image = load_image(file)?;
    let packetizer = Packetizer::new(packet_size, config.sector_size)?;
    let queue = packetizer.packetize(image.as_bytes())?;

    println!("Image:        {} ({} bytes)", file.display(), image.len());
    println!("Packet size:  {} ({} payload bytes)", packet_size, packetizer.max_payload());
    println!("Sectors:      {}", queue.sector_count());
    println!("Packets:      {}", queue.packet_count());
    println!();
    println!("{:>6}  {:>6}  {:>7}  {:>6}", "sector", "bytes", "packets", "crc16");
    for sector in image.sectors(config.sector_size) {
        println!(
            "{:>6}  {:>6}  {:>7}  0x{:04X}",
            sector.index,
            sector.data.len(),
            sector.data.len().div_ceil(packetizer.max_payload()),
            crc16(sector.data)
        );
    }
    Ok(())
}

fn crc(file: &Path, config: &OtaConfig) -> Result<()> {
    let image = load_image(file)?;
    println!("{}: 0x{:04X}", file.display(), crc16(image.as_bytes()));
    for sector in image.sectors(config.sector_size) {
        println!("  sector {:>5}: 0x{:04X}", sector.index, crc16(sector.data));
    }
    Ok(())
}

/// Run one session to the end, stopping it after `timeout_secs`.
fn update<T: BleTransport>(
    config: OtaConfig,
    transport: T,
    image: FirmwareImage,
    timeout_secs: u64,
) -> Result<()> {
    info!(peer = %transport.peer(), bytes = image.len(), "Starting update");
    let mut session =
        OtaSession::with_observer(config, transport, image, Arc::new(CliObserver::new()));
    let stop = session.stop_handle();
    ctrlc::set_handler(move || {
        stop.stop();
    })
    .context("Failed to install Ctrl-C handler")?;
    session.start()?;

    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    let outcome = loop {
        if let Some(outcome) = session.step(Duration::from_millis(500)) {
            break outcome?;
        }
        if Instant::now() >= deadline {
            session.stop();
            bail!(
                "No completion after {}s (state {})",
                timeout_secs,
                session.state()
            );
        }
    };

    match outcome {
        SessionOutcome::Completed => info!("Firmware update successful"),
        SessionOutcome::Stopped => bail!("Update interrupted (state {})", session.state()),
    }
    Ok(())
}

#[cfg(feature = "ble")]
fn flash(
    config: OtaConfig,
    file: &Path,
    device: &str,
    scan_timeout: Duration,
    assume_mtu: Option<u16>,
    timeout_secs: u64,
) -> Result<()> {
    use bleota_core::BtleplugTransport;

    let image = load_image(file)?;
    let mut transport = BtleplugTransport::find(device, scan_timeout)?;
    if let Some(mtu) = assume_mtu {
        transport = transport.with_assumed_mtu(mtu);
    }
    update(config, transport, image, timeout_secs)
}

#[cfg(not(feature = "ble"))]
fn flash(
    _config: OtaConfig,
    _file: &Path,
    _device: &str,
    _scan_timeout: Duration,
    _assume_mtu: Option<u16>,
    _timeout_secs: u64,
) -> Result<()> {
    bail!("BLE support was not compiled in; rebuild with `--features ble`")
}
