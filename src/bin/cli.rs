//! p1link CLI - Command-line interface
//!
//! Inspects P1Bin record files and raw captures, and talks to a receiver over
//! serial, TCP or WebSocket.

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use p1link_core::cli::{CliResult, ExitCodes};
use p1link_core::core::capture::CaptureLog;
use p1link_core::core::p1bin::{find_matching_p1bin_types, P1BinReader, P1BinType, ReaderOptions, TimeRange};
use p1link_core::core::protocol::{
    reset_mask, FrameOptions, FramedMessage, NmeaFramer, Po4050, Po4050Control, RtcmFramer, RtcmPayload,
    PO4050_RESPONSE_OK,
};
use p1link_core::core::session::DeviceSession;
use p1link_core::core::transport::{list_ports, Transport, TransportAddress};
use p1link_core::{AppConfig, RxSink};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Read size used when framing captures and live data
const CHUNK_SIZE: usize = 4096;

/// CLI output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON format for scripting
    Json,
}

/// p1link CLI
#[derive(Parser, Debug)]
#[command(
    name = "p1link-cli",
    author = "P1Link Team",
    version,
    about = "GNSS/INS receiver link: framing, P1Bin files and device commands",
    long_about = None
)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// Verbose output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit log lines as JSON
    #[arg(long, global = true)]
    log_json: bool,

    /// Configuration file (defaults to the platform config directory)
    #[arg(long, env = "P1LINK_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// P1Bin record file tools
    P1bin {
        #[command(subcommand)]
        action: P1BinAction,
    },

    /// Frame a raw capture file and list the messages found
    Frames {
        /// Capture file
        file: PathBuf,

        /// Only NMEA sentences
        #[arg(long)]
        nmea: bool,

        /// Only RTCM3 frames
        #[arg(long)]
        rtcm: bool,
    },

    /// Print framed messages from a live connection
    Monitor {
        /// serial:///dev/ttyUSB0[:baud], tcp://host[:port] or ws://host:port
        address: String,

        /// Mirror received bytes to this file
        #[arg(short, long)]
        capture: Option<PathBuf>,

        /// Write a timestamp sidecar next to the capture file
        #[arg(long, requires = "capture")]
        timestamps: bool,

        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<f64>,
    },

    /// Send a 4050 reset command and wait for the response
    Reset {
        /// serial:///dev/ttyUSB0[:baud], tcp://host[:port] or ws://host:port
        address: String,

        /// Reset mask (hex); defaults to a software reboot
        #[arg(short, long, value_parser = parse_hex_u32)]
        mask: Option<u32>,

        /// Also wait for the device to reboot
        #[arg(long)]
        reboot: bool,
    },

    /// List available serial ports
    ListPorts,
}

#[derive(Subcommand, Debug)]
enum P1BinAction {
    /// Count records per type
    Summary {
        /// P1Bin file
        file: PathBuf,

        #[command(flatten)]
        filter: TypeFilterArgs,

        /// Relative time range in seconds, START:END (either side may be empty)
        #[arg(long)]
        time: Option<String>,
    },

    /// Write the payloads of each record type to `<prefix>.<TYPE>.bin`
    Extract {
        /// P1Bin file
        file: PathBuf,

        #[command(flatten)]
        filter: TypeFilterArgs,

        /// Output directory (defaults to the input file's directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Output file prefix (defaults to the input file name)
        #[arg(short, long)]
        prefix: Option<String>,
    },

    /// Generate the sidecar index
    Index {
        /// P1Bin file
        file: PathBuf,

        /// Regenerate even if a valid index exists
        #[arg(long)]
        force: bool,
    },
}

#[derive(clap::Args, Debug)]
struct TypeFilterArgs {
    /// Record types: names, partial names, `*` wildcards or numbers; repeat or comma-separate
    #[arg(short = 't', long = "p1bin-type")]
    types: Vec<String>,

    /// Do not use an existing index file
    #[arg(short, long)]
    ignore_index: bool,
}

/// One framed message as printed by `frames` and `monitor`
#[derive(Debug, Serialize)]
struct FrameRow {
    offset: Option<u64>,
    protocol: String,
    message_type: String,
    length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    received_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl FrameRow {
    fn new(message: &FramedMessage, received_at: Option<DateTime<Utc>>) -> Self {
        let detail = match RtcmPayload::from_message(message) {
            Some(RtcmPayload::Po4050(decoded)) => Some(format!("{decoded:?}")),
            Some(RtcmPayload::Opaque(_)) => None,
            None => message.sentence().map(str::to_string),
        };
        Self {
            offset: message.byte_offset,
            protocol: message.protocol().to_string(),
            message_type: message.type_id.to_string(),
            length: message.byte_length,
            received_at,
            detail,
        }
    }

    fn print(&self, format: OutputFormat) -> anyhow::Result<()> {
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string(self)?),
            OutputFormat::Text => {
                let offset = self.offset.map_or_else(|| "-".to_string(), |o| o.to_string());
                match &self.detail {
                    Some(detail) => println!(
                        "{:>10}  {:<5} {:<8} {:>5} B  {}",
                        offset, self.protocol, self.message_type, self.length, detail
                    ),
                    None => println!(
                        "{:>10}  {:<5} {:<8} {:>5} B",
                        offset, self.protocol, self.message_type, self.length
                    ),
                }
            }
        }
        Ok(())
    }
}

fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|e| format!("Invalid hex value '{s}': {e}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    match run(&cli) {
        Ok(result) => {
            match (&result, result.message()) {
                (CliResult::Success(_), Some(msg)) => info!("{}", msg),
                (CliResult::Error(..), Some(msg)) => error!("{}", msg),
                _ => {}
            }
            result.to_exit_code()
        }
        Err(e) => {
            let result = CliResult::from_error(&e);
            error!("{}", result.message().unwrap_or("Unknown error"));
            result.to_exit_code()
        }
    }
}

fn init_logging(verbose: u8, json: bool) {
    let level = match verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    match &cli.config {
        Some(path) => AppConfig::load_from(path).with_context(|| format!("Loading {}", path.display())),
        None => Ok(AppConfig::load().unwrap_or_else(|e| {
            warn!("Using default configuration: {}", e);
            AppConfig::default()
        })),
    }
}

fn run(cli: &Cli) -> anyhow::Result<CliResult> {
    let config = load_config(cli)?;
    match &cli.command {
        Commands::P1bin { action } => match action {
            P1BinAction::Summary { file, filter, time } => p1bin_summary(cli, &config, file, filter, time.as_deref()),
            P1BinAction::Extract { file, filter, output, prefix } => {
                p1bin_extract(&config, file, filter, output.as_deref(), prefix.as_deref())
            }
            P1BinAction::Index { file, force } => {
                let count = P1BinReader::generate_index_file(file, *force)
                    .with_context(|| format!("Indexing {}", file.display()))?;
                Ok(CliResult::Success(Some(format!("Indexed {count} records in {}.", file.display()))))
            }
        },
        Commands::Frames { file, nmea, rtcm } => frames(cli, file, *nmea, *rtcm),
        Commands::Monitor { address, capture, timestamps, duration } => {
            monitor(cli, &config, address, capture.as_deref(), *timestamps, *duration)
        }
        Commands::Reset { address, mask, reboot } => reset(&config, address, *mask, *reboot),
        Commands::ListPorts => {
            for port in list_ports()? {
                println!("{}", port.port_name);
            }
            Ok(CliResult::success())
        }
    }
}

// ============ P1Bin ============

fn reader_options(config: &AppConfig, filter: &TypeFilterArgs) -> anyhow::Result<Option<ReaderOptions>> {
    let mut options = ReaderOptions::from(&config.p1bin);
    if filter.ignore_index {
        options = options.ignore_index(true);
    }
    if !filter.types.is_empty() {
        let types = find_matching_p1bin_types(&filter.types)?;
        if types.is_empty() {
            return Ok(None);
        }
        options = options.message_types(types);
    }
    Ok(Some(options))
}

fn p1bin_summary(
    cli: &Cli,
    config: &AppConfig,
    file: &Path,
    filter: &TypeFilterArgs,
    time: Option<&str>,
) -> anyhow::Result<CliResult> {
    let Some(mut options) = reader_options(config, filter)? else {
        return Ok(CliResult::error(ExitCodes::INVALID_ARGS, "No matching record types."));
    };
    if let Some(time) = time {
        options = options.time_range(time.parse::<TimeRange>()?);
    }

    info!("Loading {}.", file.display());
    let mut reader = P1BinReader::open(file, options).with_context(|| format!("Opening {}", file.display()))?;
    for record in reader.by_ref() {
        record.with_context(|| format!("Reading {}", file.display()))?;
    }

    let counts: BTreeMap<String, usize> =
        reader.message_counts().iter().map(|(t, count)| (t.name(), *count)).collect();
    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&counts)?),
        OutputFormat::Text => {
            println!("{:<24} {:>10}", "Type", "Count");
            println!("{:-<35}", "");
            for (name, count) in &counts {
                println!("{name:<24} {count:>10}");
            }
        }
    }
    Ok(CliResult::success())
}

fn p1bin_extract(
    config: &AppConfig,
    file: &Path,
    filter: &TypeFilterArgs,
    output: Option<&Path>,
    prefix: Option<&str>,
) -> anyhow::Result<CliResult> {
    let Some(options) = reader_options(config, filter)? else {
        return Ok(CliResult::error(ExitCodes::INVALID_ARGS, "No matching record types."));
    };
    let output_dir = output
        .map(Path::to_path_buf)
        .or_else(|| file.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    let prefix = match prefix {
        Some(prefix) => prefix.to_string(),
        None => file.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default(),
    };
    fs::create_dir_all(&output_dir)?;

    let reader = P1BinReader::open(file, options).with_context(|| format!("Opening {}", file.display()))?;
    let mut outputs: BTreeMap<P1BinType, BufWriter<File>> = BTreeMap::new();
    for record in reader {
        let record = record.with_context(|| format!("Reading {}", file.display()))?.record;
        let out = match outputs.entry(record.message_type) {
            std::collections::btree_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::btree_map::Entry::Vacant(entry) => {
                let path = output_dir.join(format!("{prefix}.{}.bin", record.message_type));
                info!("Writing {}.", path.display());
                entry.insert(BufWriter::new(File::create(&path)?))
            }
        };
        out.write_all(&record.contents)?;
    }
    for out in outputs.values_mut() {
        out.flush()?;
    }
    Ok(CliResult::Success(Some(format!("Extracted {} record types.", outputs.len()))))
}

// ============ Framing ============

/// Framers selected on the command line; both when neither flag is given
struct Framers {
    nmea: Option<NmeaFramer>,
    rtcm: Option<RtcmFramer>,
}

impl Framers {
    fn new(nmea: bool, rtcm: bool) -> Self {
        let both = !nmea && !rtcm;
        Self {
            nmea: (nmea || both).then(NmeaFramer::new),
            rtcm: (rtcm || both).then(RtcmFramer::new),
        }
    }

    fn on_data(&mut self, data: &[u8]) -> Vec<FramedMessage> {
        let mut messages = Vec::new();
        if let Some(framer) = &mut self.nmea {
            messages.extend(framer.on_data(data));
        }
        if let Some(framer) = &mut self.rtcm {
            messages.extend(framer.on_data(data, FrameOptions { offset: true, raw: false }));
        }
        messages.sort_by_key(|m| m.byte_offset);
        messages
    }
}

fn frames(cli: &Cli, file: &Path, nmea: bool, rtcm: bool) -> anyhow::Result<CliResult> {
    let data = fs::read(file).with_context(|| format!("Reading {}", file.display()))?;
    let mut framers = Framers::new(nmea, rtcm);

    let mut count = 0usize;
    for chunk in data.chunks(CHUNK_SIZE) {
        for message in framers.on_data(chunk) {
            FrameRow::new(&message, None).print(cli.format)?;
            count += 1;
        }
    }
    Ok(CliResult::Success(Some(format!("Framed {count} messages from {} B.", data.len()))))
}

// ============ Device ============

fn monitor(
    cli: &Cli,
    config: &AppConfig,
    address: &str,
    capture: Option<&Path>,
    timestamps: bool,
    duration: Option<f64>,
) -> anyhow::Result<CliResult> {
    let address: TransportAddress = address.parse()?;
    let sink = match capture {
        Some(path) => Some(Box::new(CaptureLog::create(path, timestamps)?) as Box<dyn RxSink>),
        None => None,
    };
    let mut transport = address.open(&config.session, sink)?;
    info!("Connected to {}.", transport.connection_info());

    let deadline = duration.and_then(|secs| Duration::try_from_secs_f64(secs).ok()).map(|d| Instant::now() + d);
    let mut framers = Framers::new(false, false);
    while deadline.map_or(true, |d| Instant::now() < d) {
        let data = transport.read(CHUNK_SIZE, config.session.rx_byte_timeout(), true)?;
        if data.is_empty() {
            continue;
        }
        let received_at = transport.last_rx_time();
        for message in framers.on_data(&data) {
            FrameRow::new(&message, received_at).print(cli.format)?;
        }
    }

    let stats = transport.stats();
    transport.stop()?;
    Ok(CliResult::Success(Some(format!(
        "Received {} B, dropped {} B.",
        stats.bytes_received, stats.bytes_dropped
    ))))
}

fn reset(config: &AppConfig, address: &str, mask: Option<u32>, reboot: bool) -> anyhow::Result<CliResult> {
    let address: TransportAddress = address.parse()?;
    let transport = address.open(&config.session, None)?;
    let mut session = DeviceSession::new(transport, config.session.clone());

    let mask = mask.unwrap_or(reset_mask::SOFTWARE);
    session.flush_rx()?;
    session.send_po4050(&Po4050::Control(Po4050Control::Reset { mask }))?;

    let result = match session.wait_for_po4050_response(config.session.response_timeout())? {
        None => CliResult::timeout("No response to reset command."),
        Some(code) if code != PO4050_RESPONSE_OK => {
            CliResult::error(ExitCodes::PROTOCOL_ERROR, format!("Device rejected reset. [code={code}]"))
        }
        Some(_) => {
            if reboot && !session.wait_for_reboot_default()? {
                CliResult::error(ExitCodes::REBOOT_NOT_DETECTED, "Reboot not detected.")
            } else {
                CliResult::Success(Some(format!("Reset accepted. [mask=0x{mask:08X}]")))
            }
        }
    };
    session.stop()?;
    Ok(result)
}
