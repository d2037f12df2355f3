use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "veil", about = "Privacy-enforcing reverse proxy for LLM APIs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the proxy (default).
    Run(RunArgs),
    /// Generate an API key. The plaintext is printed exactly once.
    Keygen(KeygenArgs),
    /// Revoke an API key by id or plaintext.
    Revoke(RevokeArgs),
}

#[derive(Args, Default)]
pub struct RunArgs {
    /// Listen address, e.g. 127.0.0.1:8089.
    #[arg(long, env = "LISTEN_ADDR")]
    pub listen_addr: Option<String>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[derive(Args)]
pub struct KeygenArgs {
    /// Role bound to the key: admin, operator, or viewer.
    #[arg(long, default_value = "viewer")]
    pub role: String,

    /// Human-readable label stored with the key.
    #[arg(long, default_value = "")]
    pub label: String,
}

#[derive(Args)]
pub struct RevokeArgs {
    /// Key id (12 hex chars) or the plaintext key.
    pub key: String,
}
