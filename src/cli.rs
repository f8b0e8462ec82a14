use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::config::{default_config_path, Config};

#[derive(Parser, Debug)]
#[command(name = "hostkeeper")]
#[command(about = "Provision and supervise hosts joining container clusters")]
#[command(version)]
pub struct Args {
    /// Path to the config file [default: ~/.hostkeeper/config.yaml]
    #[arg(short, long, value_name = "FILE", env = "HOSTKEEPER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Override the interface the API listens on
    #[arg(long, value_name = "ADDR")]
    pub listen_interface: Option<String>,

    /// Override the port the API listens on
    #[arg(long, value_name = "PORT")]
    pub listen_port: Option<u16>,

    /// Path to a .env file to load before reading the config
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,
}

// ============================================================================
// SBIO: Pure argument handling
// ============================================================================

impl Args {
    /// Config file to read and whether it was asked for explicitly
    pub fn config_path(&self) -> (PathBuf, bool) {
        match &self.config {
            Some(path) => (path.clone(), true),
            None => (default_config_path(), false),
        }
    }

    /// Log filter for the `-v` count
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }

    /// Apply command line overrides on top of `config`
    pub fn apply(&self, mut config: Config) -> Config {
        if let Some(interface) = &self.listen_interface {
            config.listen.interface = interface.clone();
        }
        if let Some(port) = self.listen_port {
            config.listen.port = port;
        }
        config
    }
}
