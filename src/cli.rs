use clap::Parser;

/// Relays Telegram channel posts into linked MAX messenger channels.
#[derive(Parser, Debug)]
#[command(name = "telegram-max-bridge", version, about)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "CONFIG_PATH", default_value = "config.yaml")]
    pub config: String,
}
