use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use uki_tool::pcr::{self, resolve_banks, MeasureConfig, PcrBank, SectionInputs};
use uki_tool::tpm::{PcrReading, Platform, TPM_PCR_INDEX_KERNEL_IMAGE};
use uki_tool::unified_sections::UnifiedSection;

use crate::output::{plain_line, JsonMode, PcrReport};

/// The default log level.
///
/// 2 corresponds to the level INFO.
const DEFAULT_LOG_LEVEL: usize = 2;

/// Pre-calculate and show PCR values for unified kernel images.
#[derive(Parser)]
#[command(version)]
pub struct Cli {
    /// Silence all output
    #[arg(short, long)]
    quiet: bool,
    /// Verbose mode (-v, -vv, etc.)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Select TPM bank (SHA1, SHA256, SHA384, SHA512), may be repeated
    #[arg(long = "bank", value_name = "DIGEST", global = true)]
    banks: Vec<String>,
    /// Output as JSON
    #[arg(long, value_enum, value_name = "MODE", global = true)]
    json: Option<JsonMode>,
    /// Same as --json=pretty
    #[arg(short = 'j', global = true)]
    pretty_json: bool,
    #[clap(subcommand)]
    commands: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current PCR values
    Status,
    /// Calculate expected PCR values
    Calculate(CalculateCommand),
}

#[derive(Parser)]
struct CalculateCommand {
    /// Path to Linux kernel image
    #[arg(long)]
    linux: Option<PathBuf>,
    /// Path to os-release file
    #[arg(long)]
    osrel: Option<PathBuf>,
    /// Path to file with kernel command line
    #[arg(long)]
    cmdline: Option<PathBuf>,
    /// Path to initrd image
    #[arg(long)]
    initrd: Option<PathBuf>,
    /// Path to splash bitmap
    #[arg(long)]
    splash: Option<PathBuf>,
    /// Path to Devicetree file
    #[arg(long)]
    dtb: Option<PathBuf>,
    /// Use current PCR values
    #[arg(short, long)]
    current: bool,
}

impl CalculateCommand {
    fn inputs(&self) -> SectionInputs {
        let mut inputs = SectionInputs::new();
        let paths = [
            (UnifiedSection::Linux, &self.linux),
            (UnifiedSection::OsRel, &self.osrel),
            (UnifiedSection::CmdLine, &self.cmdline),
            (UnifiedSection::Initrd, &self.initrd),
            (UnifiedSection::Splash, &self.splash),
            (UnifiedSection::Dtb, &self.dtb),
        ];
        for (section, path) in paths {
            if let Some(path) = path {
                inputs.set(section, path.clone());
            }
        }
        inputs
    }
}

/// Options shared by all commands.
struct GlobalArgs {
    banks: Vec<PcrBank>,
    json: JsonMode,
    platform: Platform,
}

impl Cli {
    pub fn call(self, module: &str) {
        stderrlog::new()
            .module(module)
            .module("uki_tool")
            .show_level(false)
            .quiet(self.quiet)
            .verbosity(DEFAULT_LOG_LEVEL + usize::from(self.verbose))
            .init()
            .expect("Failed to setup logger.");

        if let Err(e) = self.run() {
            log::error!("{e:#}");
            std::process::exit(1);
        };
    }

    fn run(self) -> Result<()> {
        let json = match (self.pretty_json, self.json) {
            (true, _) => JsonMode::Pretty,
            (false, mode) => mode.unwrap_or_default(),
        };

        let args = GlobalArgs {
            banks: resolve_banks(&self.banks)?,
            json,
            platform: Platform::from_env(),
        };

        self.commands.unwrap_or(Commands::Status).call(&args)
    }
}

impl Commands {
    fn call(self, args: &GlobalArgs) -> Result<()> {
        match self {
            Commands::Status => status(args),
            Commands::Calculate(command) => calculate(args, command),
        }
    }
}

fn calculate(args: &GlobalArgs, command: CalculateCommand) -> Result<()> {
    let config = MeasureConfig::new(args.banks.clone(), command.inputs(), command.current)?;

    let states = pcr::calculate(&config, &args.platform)?;

    match PcrReport::from_states(&states).to_json(args.json)? {
        Some(json) => println!("{json}"),
        None => {
            for state in &states {
                let line = plain_line(TPM_PCR_INDEX_KERNEL_IMAGE, state.bank(), state.value());
                println!("{line}");
            }
        }
    }

    Ok(())
}

fn status(args: &GlobalArgs) -> Result<()> {
    let validation = args.platform.validate_stub(&args.banks)?;

    let readings = args.platform.read_stub_pcrs(&args.banks)?;

    match PcrReport::from_readings(&readings).to_json(args.json)? {
        Some(json) => println!("{json}"),
        None => print_readings(&readings)?,
    }

    if !validation.is_consistent() {
        // Descriptions go to stderr, values to stdout.
        io::stdout().flush()?;
        eprintln!("# INCONSISTENT: these values may not match what the running kernel measured");
    }

    Ok(())
}

fn print_readings(readings: &[PcrReading]) -> Result<()> {
    let mut last_pcr = None;
    for reading in readings {
        if last_pcr != Some(reading.pcr.index) {
            io::stdout().flush()?;
            eprintln!(
                "# PCR[{}] {}{}",
                reading.pcr.index,
                reading.pcr.description,
                if reading.is_zero() { " (NOT SET!)" } else { "" }
            );
            last_pcr = Some(reading.pcr.index);
        }

        println!(
            "{}",
            plain_line(reading.pcr.index, reading.bank, &reading.value)
        );
    }

    Ok(())
}
