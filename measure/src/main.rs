mod cli;
mod output;

use clap::Parser;

use cli::Cli;

fn main() {
    Cli::parse().call(module_path!())
}
