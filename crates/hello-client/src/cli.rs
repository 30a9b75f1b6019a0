use clap::{Parser, Subcommand};
use cs_domain::config::{ClientConfig, ConfigSeverity};

/// Reference device client: opens a session to the device gateway and keeps
/// it up until Ctrl-C.
#[derive(Debug, Parser)]
#[command(name = "cs-hello-client", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the client (default when no subcommand is given).
    Run {
        /// Do not re-arm retries after a failed start.
        #[arg(long)]
        no_supervise: bool,
    },
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the resolved device identity (key masked).
    Identity,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

/// Load the configuration from `CS_CONFIG` (or `castar.toml`).  Returns the
/// parsed config and the path that was used.
pub fn load_config() -> anyhow::Result<(ClientConfig, String)> {
    let config_path = std::env::var("CS_CONFIG").unwrap_or_else(|_| "castar.toml".into());
    let config = ClientConfig::load(&config_path)
        .map_err(|e| anyhow::anyhow!("loading {config_path}: {e}"))?;
    Ok((config, config_path))
}

/// Print every validation issue.  Returns false when any is an error.
pub fn validate(config: &ClientConfig, config_path: &str) -> bool {
    let issues = config.validate();

    if issues.is_empty() {
        println!("Config OK ({config_path})");
        return true;
    }

    let error_count = issues
        .iter()
        .filter(|e| e.severity == ConfigSeverity::Error)
        .count();
    let warning_count = issues.len() - error_count;

    for issue in &issues {
        println!("{issue}");
    }
    println!("\n{error_count} error(s), {warning_count} warning(s) in {config_path}");

    error_count == 0
}

pub fn show(config: &ClientConfig) -> anyhow::Result<()> {
    let output = toml::to_string_pretty(config)?;
    print!("{output}");
    Ok(())
}
