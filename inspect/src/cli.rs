use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use uki_tool::kernel::{identify_kernel, inspect_kernel, KernelInfo};

/// The default log level.
///
/// 2 corresponds to the level INFO.
const DEFAULT_LOG_LEVEL: usize = 2;

/// Identify and inspect kernel images.
#[derive(Parser)]
#[command(version)]
pub struct Cli {
    /// Silence all output
    #[arg(short, long)]
    quiet: bool,
    /// Verbose mode (-v, -vv, etc.)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[clap(subcommand)]
    commands: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the kernel type: uki, pe or unknown
    KernelIdentify(KernelCommand),
    /// Print the kernel type and the metadata embedded in a UKI
    KernelInspect(KernelCommand),
}

#[derive(Parser)]
struct KernelCommand {
    /// Kernel image
    kernel: PathBuf,
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

        if let Err(e) = self.commands.call() {
            log::error!("{e:#}");
            std::process::exit(1);
        };
    }
}

impl Commands {
    pub fn call(self) -> Result<()> {
        match self {
            Commands::KernelIdentify(args) => {
                println!("{}", identify_kernel(&args.kernel)?);
            }
            Commands::KernelInspect(args) => {
                print!("{}", render(&inspect_kernel(&args.kernel)?));
            }
        }
        Ok(())
    }
}

fn render(info: &KernelInfo) -> String {
    let mut lines = vec![format!("Kernel Type: {}", info.kernel_type)];

    if let Some(metadata) = &info.metadata {
        if let Some(cmdline) = &metadata.cmdline {
            lines.push(format!("    Cmdline: {cmdline}"));
        }
        if let Some(uname) = &metadata.uname {
            lines.push(format!("    Version: {uname}"));
        }
        lines.push(format!("         OS: {}", metadata.os_name));
    }

    lines.join("\n") + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;
    use uki_tool::kernel::{KernelType, UkiMetadata};

    #[test]
    fn renders_pe_without_metadata() {
        let info = KernelInfo {
            kernel_type: KernelType::Pe,
            metadata: None,
        };
        expect![[r#"
            Kernel Type: pe
        "#]]
        .assert_eq(&render(&info));
    }

    #[test]
    fn renders_uki_metadata() {
        let info = KernelInfo {
            kernel_type: KernelType::Uki,
            metadata: Some(UkiMetadata {
                cmdline: None,
                uname: Some("6.6.1".into()),
                os_name: "Linux".into(),
            }),
        };
        expect![[r#"
            Kernel Type: uki
                Version: 6.6.1
                     OS: Linux
        "#]]
        .assert_eq(&render(&info));
    }
}
