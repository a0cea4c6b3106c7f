//! `updi-prog` — a CLI collaborator around the `updi_prog` library (§6/§1:
//! the CLI is not core, it wires flags to a `SessionConfig` and calls the
//! library).

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

use updi_prog::device::RegionKind;
use updi_prog::hex;
use updi_prog::link::SerialPortTransport;
use updi_prog::nvm::NvmError;
use updi_prog::session::{Session, SessionConfig, SessionError};

#[derive(Parser, Debug)]
#[command(name = "updi-prog")]
#[command(about = "Host-side programmer for UPDI AVR microcontrollers")]
struct Cli {
    /// Serial device path, e.g. /dev/ttyUSB0
    #[arg(short, long)]
    port: String,

    /// Target part name, e.g. atmega4809
    #[arg(short, long)]
    device: String,

    #[arg(short, long, default_value_t = 115_200)]
    baud: u32,

    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(short = 'q', long)]
    quiet: bool,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Read the signature and compare to the device descriptor.
    Ping,
    /// Read `length` bytes from `region` at `offset`.
    Read {
        region: String,
        #[arg(short, long, default_value_t = 0)]
        offset: u32,
        #[arg(short = 'b', long)]
        length: Option<u32>,
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Write literal bytes or a raw binary file to `region` at `offset`.
    Write {
        region: String,
        #[arg(short, long, default_value_t = 0)]
        offset: u32,
        #[arg(short = 'l', long)]
        literal: Option<String>,
        #[arg(short, long)]
        file: Option<PathBuf>,
        #[arg(long)]
        erase: bool,
        #[arg(long)]
        verify: bool,
    },
    /// Program a full Intel HEX file across whichever regions its
    /// segments route to (§6 AVR-HEX convention, §8 scenario S5).
    Program {
        file: PathBuf,
        #[arg(long)]
        erase: bool,
        #[arg(long)]
        verify: bool,
        /// Abort on the first `VerifyMismatch` instead of writing every
        /// segment and reporting the first one found.
        #[arg(long)]
        fail_fast: bool,
    },
    /// Erase the whole device, or one region.
    Erase { region: Option<String> },
    /// Read back and compare literal bytes.
    Verify {
        region: String,
        #[arg(short, long, default_value_t = 0)]
        offset: u32,
        #[arg(short = 'l', long)]
        literal: String,
    },
    /// Pulse target reset and leave programming mode.
    Reset,

    // Out-of-scope USB/HID debugger actions (§1, §6): recognised only far
    // enough to report tool-not-found rather than silently accepting them.
    Getvoltage,
    Getsupplyvoltage,
    Setsupplyvoltage,
    Getusbvoltage,
    RebootDebugger,
    Makeuf2,
}

/// Exit codes (§6 "Exit codes"), fixed so verify-failure is always
/// distinguishable from a connection fault.
mod exit_code {
    pub const SUCCESS: u8 = 0;
    pub const UNSUPPORTED_MEMORY: u8 = 1;
    pub const VERIFY_FAILURE: u8 = 2;
    pub const DEVICE_ID_MISMATCH: u8 = 3;
    pub const TOOL_NOT_FOUND: u8 = 4;
    pub const LOCK_STATE_BLOCKED: u8 = 5;
    pub const OTHER: u8 = 6;
}

fn init_tracing(verbose: u8, quiet: bool) {
    use tracing_subscriber::EnvFilter;
    let level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn parse_region(s: &str) -> Result<RegionKind, String> {
    match s.to_ascii_lowercase().as_str() {
        "flash" => Ok(RegionKind::Flash),
        "eeprom" => Ok(RegionKind::Eeprom),
        "fuses" => Ok(RegionKind::Fuses),
        "lockbits" => Ok(RegionKind::Lockbits),
        "signatures" => Ok(RegionKind::Signatures),
        "user_row" | "userrow" => Ok(RegionKind::UserRow),
        "boot_row" | "bootrow" => Ok(RegionKind::BootRow),
        "config_words" | "configwords" => Ok(RegionKind::ConfigWords),
        other => Err(format!("unknown region: {other}")),
    }
}

fn parse_literal(s: &str) -> Vec<u8> {
    s.split(|c| c == ',' || c == ' ')
        .filter(|p| !p.is_empty())
        .map(|p| u8::from_str_radix(p.trim_start_matches("0x"), 16).unwrap_or(0))
        .collect()
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(exit_code::OTHER)
        }
    }
}

fn run(cli: Cli) -> Result<u8, Box<dyn std::error::Error>> {
    if matches!(
        cli.action,
        Action::Getvoltage
            | Action::Getsupplyvoltage
            | Action::Setsupplyvoltage
            | Action::Getusbvoltage
            | Action::RebootDebugger
            | Action::Makeuf2
    ) {
        eprintln!(
            "{:?} is a USB/HID debugger transport action, unsupported over the serialUPDI transport",
            cli.action
        );
        return Ok(exit_code::TOOL_NOT_FOUND);
    }

    let read_timeout = Duration::from_secs(1);
    let transport = SerialPortTransport::open(&cli.port, cli.baud, read_timeout)
        .map_err(|e| format!("opening {}: {e}", cli.port))?;

    let config = SessionConfig {
        baud: cli.baud,
        read_timeout,
        ..SessionConfig::default()
    };

    let mut session = Session::start_session(&cli.device, Box::new(transport), &config)?;

    let reset_first = matches!(cli.action, Action::Reset);
    let result = dispatch(&mut session, &cli.action);
    session.end_session(reset_first)?;

    match result {
        Ok(()) => Ok(exit_code::SUCCESS),
        Err(e) => Ok(session_exit_code(&e)),
    }
}

fn dispatch(session: &mut Session, action: &Action) -> Result<(), SessionError> {
    match action {
        Action::Ping => {
            let id = session.ping()?;
            println!("signature: {:02X} {:02X} {:02X}", id[0], id[1], id[2]);
            Ok(())
        }
        Action::Read {
            region,
            offset,
            length,
            file,
        } => {
            let kind = parse_region(region).map_err(SessionError::ToolError)?;
            let len = length.unwrap_or(0) as usize;
            let data = session.read(kind, *offset, len)?;
            if let Some(path) = file {
                std::fs::write(path, &data).map_err(|e| SessionError::ToolError(e.to_string()))?;
            } else {
                println!("{}", hex_dump(&data));
            }
            Ok(())
        }
        Action::Write {
            region,
            offset,
            literal,
            file,
            erase,
            verify,
        } => {
            let kind = parse_region(region).map_err(SessionError::ToolError)?;
            if *erase {
                session.erase(Some(kind))?;
            }
            let data = match (literal, file) {
                (Some(l), _) => parse_literal(l),
                (None, Some(path)) => {
                    std::fs::read(path).map_err(|e| SessionError::ToolError(e.to_string()))?
                }
                (None, None) => {
                    return Err(SessionError::ToolError("write requires --literal or --file".into()))
                }
            };
            session.write(kind, *offset, &data)?;
            if *verify {
                session.verify(kind, *offset, &data)?;
            }
            Ok(())
        }
        Action::Program {
            file,
            erase,
            verify,
            fail_fast,
        } => {
            let text = std::fs::read_to_string(file).map_err(|e| SessionError::ToolError(e.to_string()))?;
            let segments = hex::parse_hex(&text)?;
            session.write_from_segments(&segments, *erase, *verify, *fail_fast)
        }
        Action::Erase { region } => {
            let kind = region
                .as_deref()
                .map(parse_region)
                .transpose()
                .map_err(SessionError::ToolError)?;
            session.erase(kind)
        }
        Action::Verify { region, offset, literal } => {
            let kind = parse_region(region).map_err(SessionError::ToolError)?;
            let data = parse_literal(literal);
            session.verify(kind, *offset, &data)
        }
        Action::Reset => Ok(()), // end_session(reset_first) handles the pulse on the way out
        Action::Getvoltage
        | Action::Getsupplyvoltage
        | Action::Setsupplyvoltage
        | Action::Getusbvoltage
        | Action::RebootDebugger
        | Action::Makeuf2 => unreachable!("filtered out in run()"),
    }
}

fn session_exit_code(e: &SessionError) -> u8 {
    match e {
        SessionError::Nvm(NvmError::UnsupportedMemory(_)) => exit_code::UNSUPPORTED_MEMORY,
        SessionError::VerifyMismatch { .. } => exit_code::VERIFY_FAILURE,
        SessionError::DeviceIdMismatch => exit_code::DEVICE_ID_MISMATCH,
        SessionError::Locked => exit_code::LOCK_STATE_BLOCKED,
        SessionError::ToolError(_) => exit_code::TOOL_NOT_FOUND,
        _ => exit_code::OTHER,
    }
}

fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}
