use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use simplelog::LevelFilter;

use stmisp::format::{self, STDIO_PATH};
use stmisp::{
    parse_baud_rate, AddressSelector, Config, ExecAddress, Flashing, InputLength, MemoryType,
    PageSelector, SerialConfig, SerialTransport, Selector, WorkspaceSpec,
};

#[derive(Parser)]
#[command(
    name = "stmisp",
    version,
    about = "Flash STM32 MCUs through the ROM UART bootloader"
)]
struct Cli {
    /// Serial port the bootloader is attached to, e.g. /dev/ttyUSB0 or COM3
    #[arg(short, long)]
    port: Option<String>,
    /// Baud rate
    #[arg(short, long, default_value = "57600", value_parser = parse_baud_rate)]
    baud: u32,
    /// Memory area to work on
    #[arg(short = 'M', long = "memory", value_enum, default_value_t = MemoryType::Flash)]
    memory_type: MemoryType,
    /// Region as [+]address[:length], a leading + makes it relative to the memory start
    #[arg(short = 'S', long, conflicts_with = "pages")]
    address: Option<AddressSelector>,
    /// Flash pages as start_page[:n_pages]
    #[arg(short = 's', long)]
    pages: Option<PageSelector>,
    /// Erase the whole flash
    #[arg(short = 'E', long, conflicts_with_all = ["pages", "address"])]
    full_erase: bool,
    /// Read back every written block
    #[arg(short, long)]
    verify: bool,
    /// Rewrites of a block that fails verification
    #[arg(short = 'n', long, default_value_t = 10)]
    retries: u32,
    /// Start execution at [+]address once done, 0 is the flash start
    #[arg(short, long)]
    go: Option<ExecAddress>,
    /// Leave the device in the bootloader once done
    #[arg(short = 'K', long)]
    no_reset: bool,
    /// Skip the INIT byte, the bootloader is already synchronised
    #[arg(short = 'c', long)]
    no_init: bool,
    /// Treat input files as raw binary and always write raw binary
    #[arg(short, long)]
    force_binary: bool,
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone, PartialEq, Eq)]
enum Command {
    /// Show device information
    Info,
    /// Read memory to a file, - for stdout
    Read { path: String },
    /// Write a file to memory, - for stdin
    Write { path: String },
    /// Erase flash pages
    Erase,
    /// Remove write protection from all flash
    WriteUnprotect,
    /// Write-protect flash sectors
    WriteProtect {
        #[arg(required = true)]
        sectors: Vec<u8>,
    },
    /// Enable readout protection
    ReadProtect,
    /// Disable readout protection, mass-erasing flash
    ReadUnprotect,
    /// Reset the device
    Reset,
    /// Only start execution, at --go or the flash start
    Go,
    /// List serial ports
    List,
}

impl Command {
    /// Protection commands make the device reset on its own.
    fn self_resets(&self) -> bool {
        matches!(
            self,
            Command::WriteUnprotect
                | Command::WriteProtect { .. }
                | Command::ReadProtect
                | Command::ReadUnprotect
                | Command::Reset
        )
    }
}

impl Cli {
    fn check(&self) -> Result<()> {
        if self.verify && !matches!(self.command, Command::Write { .. }) {
            bail!("--verify only makes sense with write");
        }
        if (self.pages.is_some() || self.full_erase) && self.memory_type != MemoryType::Flash {
            bail!("page-based addressing is available only for flash");
        }
        if self.command == Command::Erase && self.memory_type != MemoryType::Flash {
            bail!("only flash can be erased");
        }
        let executes = self.go.is_some() || self.command == Command::Go;
        if executes && !matches!(self.memory_type, MemoryType::Flash | MemoryType::Ram) {
            bail!("execution is only possible from flash or RAM");
        }
        Ok(())
    }

    fn workspace_spec(&self, data_length: Option<u32>) -> WorkspaceSpec {
        let selector = match (self.address, self.pages) {
            (Some(address), _) => Some(Selector::Address(address)),
            (None, Some(pages)) => Some(Selector::Pages(pages)),
            (None, None) if self.full_erase => Some(Selector::Pages(PageSelector::full())),
            (None, None) => None,
        };
        let execute = match (&self.command, self.go) {
            (Command::Go, None) => Some(ExecAddress {
                address: 0,
                relative: false,
            }),
            (_, go) => go,
        };
        WorkspaceSpec {
            memory_type: self.memory_type,
            selector,
            data_length,
            execute,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _ = simplelog::TermLogger::init(
        cli.log_level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    if cli.command == Command::List {
        for port in SerialTransport::scan_ports()? {
            println!("{}", port);
        }
        return Ok(());
    }
    cli.check()?;
    let Some(port) = cli.port.as_deref() else {
        bail!("--port is required");
    };

    let mut input = match &cli.command {
        Command::Write { path } => Some(format::open_input(path, cli.force_binary)?),
        _ => None,
    };
    let data_length = match input.as_ref().map(|i| i.length) {
        Some(InputLength::Known(n)) => Some(n),
        _ => None,
    };
    let spec = cli.workspace_spec(data_length);

    let config = Config {
        init: !cli.no_init,
        verify: cli.verify,
        retries: cli.retries,
        reset: !cli.no_reset,
        show_progress: cli.command != Command::Read {
            path: STDIO_PATH.to_string(),
        },
    };
    let serial = SerialConfig {
        baud_rate: cli.baud,
        ..SerialConfig::default()
    };
    let mut flashing = Flashing::new_from_serial(port, &serial, config)
        .with_context(|| format!("failed to connect to the bootloader on {}", port))?;
    let self_resets = cli.command.self_resets();
    flashing.run_operation::<anyhow::Error, _>(&spec, self_resets, |flashing, ws| {
        match &cli.command {
            Command::Info => flashing.dump_info(),
            Command::Read { path } => {
                let mut output = format::open_output(path, cli.force_binary, ws.start)?;
                flashing.read(ws, &mut output)?;
                output.finish()?;
            }
            Command::Write { .. } => {
                if let Some(input) = input.as_mut() {
                    flashing.write(ws, &mut input.reader, input.length)?;
                }
            }
            Command::Erase => flashing.erase(ws)?,
            Command::WriteUnprotect => flashing.write_unprotect()?,
            Command::WriteProtect { sectors } => flashing.write_protect(sectors)?,
            Command::ReadProtect => flashing.readout_protect()?,
            Command::ReadUnprotect => flashing.readout_unprotect()?,
            Command::Reset => flashing.reset()?,
            Command::Go | Command::List => {}
        }
        Ok(())
    })
}
