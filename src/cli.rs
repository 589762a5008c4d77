use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;

/// The command line interface for serial bridge.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    pub config: Option<PathBuf>,

    /// Serial port to read, overrides the config
    #[arg(short, long)]
    pub port: Option<String>,

    /// Baud rate, overrides the config
    #[arg(short, long)]
    pub baud: Option<u32>,

    /// Port the server listens on, overrides the config
    #[arg(short, long)]
    pub listen_port: Option<u16>,

    /// Also decode sensor readings and log them
    #[arg(short, long)]
    pub monitor: bool,

    /// Read from a mocked sensor instead of a real serial port
    #[arg(long)]
    pub mock: bool,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// Apply the overrides given on the command line.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(port) = &self.port {
            config.port = port.clone();
        }

        if let Some(baud) = self.baud {
            config.baud = baud;
        }

        if let Some(listen_port) = self.listen_port {
            config.listen_port = listen_port;
        }
    }
}

/// Commands available in the command line interface.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Examples for user convenience.
    #[command(subcommand)]
    Examples(Examples),

    /// List the serial ports of this machine.
    Ports,
}

/// Helpful examples for users.
#[derive(Subcommand, Debug, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,

    /// Show an example JSON request for changing the serial settings.
    UpdateSettings,
}

/// Print what the command asks for.
pub fn handle_command(command: Commands) {
    match command {
        Commands::Examples(Examples::Config) => {
            println!("{}", Config::example().serialize_pretty());
        }
        Commands::Examples(Examples::UpdateSettings) => {
            let example = serde_json::json!({
                "com_port": "/dev/ttyACM0",
                "baud_rate": 115_200,
            });
            println!("{example:#}");
        }
        Commands::Ports => {
            for port in crate::serial::connection::available_ports() {
                println!("{port}");
            }
        }
    }
}
