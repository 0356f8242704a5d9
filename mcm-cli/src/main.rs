use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use mcm_lib::lin::{DEFAULT_LIN_BAUDRATE, Memory, Operation, PpmBootloadParams};
use mcm_lib::schedule::{FrameOutcome, Schedule};
use mcm_lib::settings::format_mac;
use mcm_lib::uart::{BareUartConfig, DataBits, Parity, StopBits, UartBootloadParams};
use mcm_lib::{NusbTransport, Session, SessionConfig, list_mcm_devices};
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Drive a USB LIN/UART master communication module.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// USB vendor id of the MCM (hex, e.g. 0x1234)
    #[arg(long, value_parser = parse_u16, global = true)]
    vid: Option<u16>,
    /// USB product id of the MCM
    #[arg(long, value_parser = parse_u16, global = true)]
    pid: Option<u16>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached MCMs
    List,
    #[command(flatten)]
    Device(DeviceCommand),
}

/// Commands that talk to one MCM.
#[derive(Subcommand, Debug)]
enum DeviceCommand {
    /// Firmware version, reset reason, uptime and network settings
    Info,
    /// Make the MCM identify itself
    Identify,
    /// Restart the MCM
    Restart,
    /// Read or change a network setting
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Switch the slave supply
    Power {
        #[arg(value_enum)]
        action: PowerAction,
    },
    /// Upgrade the MCM firmware over the air partition
    Upgrade { image: PathBuf },
    /// Stage an Intel HEX file on the MCM
    Hex { file: PathBuf },
    /// Program or verify a LIN slave through the PPM bootloader
    Bootload {
        hexfile: PathBuf,
        #[command(flatten)]
        target: TargetArgs,
        /// LIN bit rate
        #[arg(long, default_value_t = u32::from(DEFAULT_LIN_BAUDRATE))]
        bit_rate: u32,
        /// Address all slaves on the bus
        #[arg(long)]
        broadcast: bool,
    },
    /// Program or verify a chip attached to the UART
    UartBootload {
        hexfile: PathBuf,
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long, default_value_t = 115_200)]
        bit_rate: u32,
        /// Four flash protection keys (hex)
        #[arg(long, value_parser = parse_u32, num_args = 4)]
        flash_keys: Option<Vec<u32>>,
        #[arg(long)]
        full_duplex: bool,
        #[arg(long, default_value_t = 0)]
        tx_pin: u8,
    },
    /// Single LIN master frames
    Lin {
        #[command(subcommand)]
        action: LinAction,
    },
    /// Run a LIN schedule from a JSON description
    Schedule {
        file: PathBuf,
        /// Run only this entry
        #[arg(long)]
        entry: Option<String>,
    },
    /// Bare UART terminal: received bytes go to stdout, stdin lines are sent
    Uart {
        #[arg(long, default_value_t = 115_200)]
        bit_rate: u32,
        #[arg(long, default_value_t = 8, value_parser = clap::value_parser!(u8).range(5..=8))]
        data_bits: u8,
        #[arg(long, value_enum, default_value_t = StopBitsArg::One)]
        stop_bits: StopBitsArg,
        #[arg(long, value_enum, default_value_t = ParityArg::None)]
        parity: ParityArg,
        #[arg(long)]
        half_duplex: bool,
    },
}

#[derive(clap::Args, Debug)]
struct TargetArgs {
    #[arg(long, value_enum, default_value_t = OperationArg::Program)]
    operation: OperationArg,
    #[arg(long, value_enum, default_value_t = MemoryArg::Flash)]
    memory: MemoryArg,
    /// Slave power is switched by hand
    #[arg(long)]
    manual_power: bool,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Get {
        #[arg(value_enum)]
        key: ConfigKey,
    },
    Set {
        #[arg(value_enum)]
        key: ConfigKey,
        value: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ConfigKey {
    Hostname,
    Ssid,
    Password,
    Mac,
    Ip,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PowerAction {
    On,
    Off,
    Status,
}

#[derive(Subcommand, Debug)]
enum LinAction {
    /// Send a wake-up pulse
    Wakeup,
    /// Master-to-slave frame
    M2s {
        #[arg(long, value_parser = parse_u8)]
        id: u8,
        /// Payload as hex, e.g. 0102ff
        #[arg(long, default_value = "")]
        data: String,
        #[arg(long)]
        enhanced: bool,
        #[arg(long, default_value_t = DEFAULT_LIN_BAUDRATE)]
        baud: u16,
    },
    /// Slave-to-master frame
    S2m {
        #[arg(long, value_parser = parse_u8)]
        id: u8,
        #[arg(long, default_value_t = 8)]
        len: u8,
        #[arg(long)]
        enhanced: bool,
        #[arg(long, default_value_t = DEFAULT_LIN_BAUDRATE)]
        baud: u16,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OperationArg {
    Program,
    Verify,
}

impl From<OperationArg> for Operation {
    fn from(value: OperationArg) -> Self {
        match value {
            OperationArg::Program => Operation::Program,
            OperationArg::Verify => Operation::Verify,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum MemoryArg {
    Flash,
    Nvram,
}

impl From<MemoryArg> for Memory {
    fn from(value: MemoryArg) -> Self {
        match value {
            MemoryArg::Flash => Memory::Flash,
            MemoryArg::Nvram => Memory::Nvram,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StopBitsArg {
    #[value(name = "1")]
    One,
    #[value(name = "1.5")]
    OnePointFive,
    #[value(name = "2")]
    Two,
}

impl From<StopBitsArg> for StopBits {
    fn from(value: StopBitsArg) -> Self {
        match value {
            StopBitsArg::One => StopBits::One,
            StopBitsArg::OnePointFive => StopBits::OnePointFive,
            StopBitsArg::Two => StopBits::Two,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ParityArg {
    None,
    Even,
    Odd,
}

impl From<ParityArg> for Parity {
    fn from(value: ParityArg) -> Self {
        match value {
            ParityArg::None => Parity::Disabled,
            ParityArg::Even => Parity::Even,
            ParityArg::Odd => Parity::Odd,
        }
    }
}

fn parse_number(text: &str) -> Result<u64, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid number {:?}: {}", text, e))
}

fn parse_u8(text: &str) -> Result<u8, String> {
    u8::try_from(parse_number(text)?).map_err(|_| format!("{} does not fit in 8 bits", text))
}

fn parse_u16(text: &str) -> Result<u16, String> {
    u16::try_from(parse_number(text)?).map_err(|_| format!("{} does not fit in 16 bits", text))
}

fn parse_u32(text: &str) -> Result<u32, String> {
    u32::try_from(parse_number(text)?).map_err(|_| format!("{} does not fit in 32 bits", text))
}

fn setup_logging(verbosity: &Verbosity<InfoLevel>) {
    // Logs go to stderr so uart output on stdout stays clean
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();

    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry().with(filter).with(console_layer).init();
}

type McmSession = Session<NusbTransport>;

async fn open_session(vid: Option<u16>, pid: Option<u16>) -> Result<McmSession> {
    let mut devices = list_mcm_devices(vid, pid).context("Failed to enumerate USB devices")?;
    if devices.is_empty() {
        bail!("No MCM found");
    }
    if devices.len() > 1 {
        warn!("{} MCMs found, using the first; narrow with --vid/--pid", devices.len());
    }
    let device = Arc::new(devices.remove(0));
    let summary = device.summary();
    info!(
        "Using MCM {:04x}:{:04x} on bus {} address {}",
        summary.vendor_id, summary.product_id, summary.bus_number, summary.device_address
    );

    let mut session = Session::new(SessionConfig::default());
    let removal = session.select_device(device.clone()).await;
    // Keep running without hot-unplug detection if the platform cannot watch
    if let Err(e) = device.watch_removal(removal) {
        warn!("Hot-unplug watch unavailable: {}", e);
    }
    session.connect().await.context("Failed to connect to MCM")?;
    Ok(session)
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.verbose);

    let command = match cli.command {
        Command::List => {
            let summaries: Vec<_> = list_mcm_devices(cli.vid, cli.pid)?
                .iter()
                .map(NusbTransport::summary)
                .collect();
            println!("{}", serde_json::to_string_pretty(&summaries)?);
            return Ok(());
        }
        Command::Device(command) => command,
    };

    let mut session = open_session(cli.vid, cli.pid).await?;
    let result = run(&mut session, command).await;
    if let Err(e) = session.dispose().await {
        warn!("Failed to release MCM: {}", e);
    }
    if let Err(e) = result {
        error!("{:#}", e);
        process::exit(1);
    }
    Ok(())
}

async fn run(session: &mut McmSession, command: DeviceCommand) -> Result<()> {
    match command {
        DeviceCommand::Info => show_info(session).await,
        DeviceCommand::Identify => Ok(session.identify().await?),
        DeviceCommand::Restart => Ok(session.restart().await?),
        DeviceCommand::Config { action } => config(session, action).await,
        DeviceCommand::Power { action } => power(session, action).await,
        DeviceCommand::Upgrade { image } => {
            let image = read_file(&image)?;
            let mut last = None;
            session
                .upgrade_firmware(image, |sent, total| {
                    let percent = if total == 0 { 100 } else { sent * 100 / total };
                    if last != Some(percent) {
                        last = Some(percent);
                        eprint!("\rUpgrading: {:3}%", percent);
                    }
                })
                .await?;
            eprintln!();
            println!("Firmware upgraded, MCM restarting");
            Ok(())
        }
        DeviceCommand::Hex { file } => {
            session.transfer_hex_file(read_file(&file)?).await?;
            println!("Hex file accepted");
            Ok(())
        }
        DeviceCommand::Bootload {
            hexfile,
            target,
            bit_rate,
            broadcast,
        } => {
            let params = PpmBootloadParams {
                bit_rate,
                manual_power: target.manual_power,
                broadcast,
                memory: target.memory.into(),
                operation: target.operation.into(),
            };
            session.bootload_lin_slave(read_file(&hexfile)?, &params).await?;
            println!("{} of {} succeeded", params.operation, params.memory);
            Ok(())
        }
        DeviceCommand::UartBootload {
            hexfile,
            target,
            bit_rate,
            flash_keys,
            full_duplex,
            tx_pin,
        } => {
            let keys = match flash_keys {
                Some(given) => <[u32; 4]>::try_from(given.as_slice())
                    .map_err(|_| anyhow::anyhow!("Expected 4 flash keys, got {}", given.len()))?,
                None => [0; 4],
            };
            let params = UartBootloadParams {
                bit_rate,
                flash_keys: keys,
                manual_power: target.manual_power,
                full_duplex,
                tx_pin,
                memory: target.memory.into(),
                operation: target.operation.into(),
            };
            session.bootload_uart_chip(read_file(&hexfile)?, &params).await?;
            println!("{} of {} succeeded", params.operation, params.memory);
            Ok(())
        }
        DeviceCommand::Lin { action } => {
            session.lin_setup().await?;
            let result = lin(session, action).await;
            if let Err(e) = session.lin_teardown().await {
                warn!("Leaving LIN mode failed: {}", e);
            }
            result
        }
        DeviceCommand::Schedule { file, entry } => {
            let text = std::fs::read_to_string(&file).with_context(|| format!("Failed to read {:?}", file))?;
            let schedule = Schedule::from_json(&text)?;
            session.lin_setup().await?;
            let result = run_schedule(session, &schedule, entry.as_deref()).await;
            if let Err(e) = session.lin_teardown().await {
                warn!("Leaving LIN mode failed: {}", e);
            }
            result
        }
        DeviceCommand::Uart {
            bit_rate,
            data_bits,
            stop_bits,
            parity,
            half_duplex,
        } => {
            let config = BareUartConfig {
                bit_rate,
                data_bits: DataBits::try_from(data_bits)?,
                stop_bits: stop_bits.into(),
                parity: parity.into(),
                half_duplex,
            };
            uart_terminal(session, &config).await
        }
    }
}

async fn show_info(session: &mut McmSession) -> Result<()> {
    let reset_reason = session.reset_reason().await?;
    let info = json!({
        "version": session.version().await?,
        "reset_reason": reset_reason,
        "reset_reason_description": reset_reason.description(),
        "uptime": session.uptime().await?,
        "hostname": session.hostname().await?,
        "wifi_ssid": session.wifi_ssid().await?,
        "wifi_mac": format_mac(&session.wifi_mac().await?),
        "ip": session.ip_info().await?,
        "slave_power": session.is_slave_power_enabled().await?,
    });
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

async fn config(session: &mut McmSession, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let value = match key {
                ConfigKey::Hostname => json!(session.hostname().await?),
                ConfigKey::Ssid => json!(session.wifi_ssid().await?),
                ConfigKey::Password => json!(session.wifi_password().await?),
                ConfigKey::Mac => json!(format_mac(&session.wifi_mac().await?)),
                ConfigKey::Ip => json!(session.ip_info().await?),
            };
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        ConfigAction::Set { key, value } => match key {
            ConfigKey::Hostname => session.set_hostname(&value).await?,
            ConfigKey::Ssid => session.set_wifi_ssid(&value).await?,
            ConfigKey::Password => session.set_wifi_password(&value).await?,
            ConfigKey::Mac | ConfigKey::Ip => bail!("{:?} is read-only", key),
        },
    }
    Ok(())
}

async fn power(session: &mut McmSession, action: PowerAction) -> Result<()> {
    match action {
        PowerAction::On => session.enable_slave_power().await?,
        PowerAction::Off => session.disable_slave_power().await?,
        PowerAction::Status => {}
    }
    let on = session.is_slave_power_enabled().await?;
    println!("Slave power {}", if on { "on" } else { "off" });
    Ok(())
}

async fn lin(session: &mut McmSession, action: LinAction) -> Result<()> {
    match action {
        LinAction::Wakeup => {
            session.lin_wake_up().await?;
            println!("Wake-up sent");
        }
        LinAction::M2s {
            id,
            data,
            enhanced,
            baud,
        } => {
            let payload = hex::decode(&data).with_context(|| format!("Invalid hex payload {:?}", data))?;
            let response = session.lin_master_to_slave(baud, enhanced, id, &payload).await?;
            println!("Sent, response: {}", hex::encode(&response));
        }
        LinAction::S2m { id, len, enhanced, baud } => {
            let data = session.lin_slave_to_master(baud, enhanced, id, len).await?;
            println!("{}", hex::encode(&data));
        }
    }
    Ok(())
}

async fn run_schedule(session: &mut McmSession, schedule: &Schedule, only: Option<&str>) -> Result<()> {
    let entries: Vec<_> = match only {
        Some(name) => vec![
            schedule
                .entry(name)
                .with_context(|| format!("No schedule entry named {:?}", name))?,
        ],
        None => schedule.entries.iter().collect(),
    };
    for entry in entries {
        println!("[{}]", entry.name);
        for outcome in session.run_schedule_entry(schedule.baudrate, entry).await? {
            match outcome {
                FrameOutcome::WokeUp => println!("  wake-up"),
                FrameOutcome::Sent(response) => println!("  sent, response {}", hex::encode(&response)),
                FrameOutcome::Received(data) => println!("  received {}", hex::encode(&data)),
            }
        }
    }
    Ok(())
}

async fn uart_terminal(session: &mut McmSession, config: &BareUartConfig) -> Result<()> {
    let mut modes = session.subscribe_mode();
    let mode_watch = tokio::spawn(async move {
        while modes.changed().await.is_ok() {
            let mode = *modes.borrow_and_update();
            info!("MCM mode: {}", mode);
        }
    });

    session
        .enable_bare_uart(config, |data: &[u8]| {
            let mut stdout = std::io::stdout().lock();
            if let Err(e) = stdout.write_all(data).and_then(|_| stdout.flush()) {
                warn!("Writing UART data to stdout failed: {}", e);
            }
            data.len()
        })
        .await?;
    info!("Bare UART running, Ctrl+C to stop");

    let result = forward_stdin(session).await;
    if let Err(e) = session.disable_bare_uart().await {
        warn!("Disabling bare UART failed: {}", e);
    }
    mode_watch.abort();
    result
}

async fn forward_stdin(session: &mut McmSession) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(mut line) => {
                    line.push('\n');
                    session.write_bare_uart(line.into_bytes()).await?;
                }
                None => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}
