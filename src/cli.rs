use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "lorawan-ingest",
    version,
    about = "Writes LoRaWAN uplink measurements to InfluxDB"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Subscribe to the broker and ingest uplinks until stopped.
    Live,
    /// Ingest a captured JSON array of uplink events, then exit.
    Replay(ReplayArgs),
}

#[derive(Args, Debug, PartialEq)]
pub struct ReplayArgs {
    /// JSON file holding an array of raw uplinks or wrapped events.
    pub file: PathBuf,
}

impl Cli {
    pub fn command(self) -> Commands {
        self.command.unwrap_or(Commands::Live)
    }
}
