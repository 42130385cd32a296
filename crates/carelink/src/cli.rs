//! Command-line definitions. Kept free of crate-internal imports so
//! `build.rs` can include it directly for man page generation.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Probe the Carelink API through the resilient request coordinator and
/// realtime connection manager.
#[derive(Parser, Debug)]
#[command(name = "carelink", version, about, arg_required_else_help = true)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Config file to use instead of the platform default
    #[arg(long, global = true, env = "CARELINK_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Accept invalid TLS certificates (local development only)
    #[arg(short = 'k', long, global = true)]
    pub insecure: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send one HTTP request and print the response body
    Request(RequestArgs),

    /// Connect to the realtime endpoint and print events as JSON lines
    Listen(ListenArgs),

    /// Inspect or write configuration
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
pub struct RequestArgs {
    /// HTTP method (GET, POST, PUT, PATCH, DELETE)
    pub method: String,

    /// Path relative to the API base URL; may carry a query string
    pub path: String,

    /// Query parameter (repeatable)
    #[arg(short = 'p', long = "param", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub params: Vec<(String, String)>,

    /// JSON request body
    #[arg(long, value_name = "BODY")]
    pub json: Option<String>,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Room to join after every (re)connect (repeatable)
    #[arg(long = "room", value_name = "ID")]
    pub rooms: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the config file path
    Path,

    /// Print the effective configuration as TOML
    Show,

    /// Write a config file with the given endpoints
    Init {
        /// HTTP API root, e.g. https://api.carelink.example/v1
        #[arg(long, value_name = "URL")]
        base_url: String,

        /// Realtime WebSocket URL, e.g. wss://api.carelink.example/realtime
        #[arg(long, value_name = "URL")]
        realtime_endpoint: Option<String>,

        /// Signed-in user id sent during the realtime handshake
        #[arg(long)]
        user_id: Option<String>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Read a session token from stdin and store it in the system keyring
    SetToken,
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))
}
