//! CTF Forge CLI: turn a raw CTF archive into runnable, indexed challenges.
//!
//! Generates challenge files with a language model, builds the challenge
//! index, and maps public writeups onto it.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
