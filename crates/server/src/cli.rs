//! CLI argument parsing.

use anyhow::Context;
use clap::{Parser, Subcommand};

/// Export server: asynchronous export of logs, anomalies and metrics.
#[derive(Parser, Debug)]
#[command(name = "stupid-server", version, about)]
pub struct Cli {
    /// Configuration profile ({PROFILE}_KEY variables take precedence over KEY)
    #[arg(long, env = "STUPID_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Bind address override
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port override
    #[arg(long, global = true)]
    pub port: Option<u16>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Command {
    /// Start the HTTP server (default)
    #[default]
    Serve,
    /// Run one cleanup sweep over the export directory and exit
    Cleanup,
}

impl Cli {
    /// Load `.env`, build the configuration and apply flag overrides.
    pub fn load_config(&self) -> anyhow::Result<stupid_core::Config> {
        stupid_core::config::load_dotenv();
        let mut config = match self.profile.as_deref() {
            Some(profile) => stupid_core::Config::for_profile(profile),
            None => stupid_core::Config::from_env(),
        };
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}
