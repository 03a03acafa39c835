// petri-debug - remote debugger for compiled Petri nets

mod console;
mod exit_codes;

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use petri_debug_client::sha1_hex;
use petri_debug_peer::{DebugPeer, PeerConfig, StaticNet};

use exit_codes::{EXIT_ERROR, EXIT_SUCCESS, EXIT_USAGE};

#[derive(Parser)]
#[command(name = "petri-debug")]
#[command(about = "Attach to a running Petri net, or serve a stub net to attach to")]
#[command(long_version = long_version())]
#[command(version)]
struct Cli {
    /// More logging (-v info, -vv debug, -vvv trace). RUST_LOG wins when set.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach to a net and open a debugging console
    #[command(after_help = "\
Examples:
  petri-debug attach --source net.cpp
  petri-debug attach --source net.cpp --host 10.0.0.5 --port 12345
  echo 'start' | petri-debug attach --source net.lua --settings debug.toml")]
    Attach {
        /// Generated source of the net (its SHA-1 identifies the build)
        #[arg(long, short = 's')]
        source: PathBuf,

        /// Peer host (overrides debugger.hostname)
        #[arg(long, env = "PETRI_DEBUG_HOST")]
        host: Option<String>,

        /// Peer port (overrides debugger.port)
        #[arg(long, env = "PETRI_DEBUG_PORT")]
        port: Option<u16>,

        /// Settings file (.json or .toml) instead of the user settings
        #[arg(long)]
        settings: Option<PathBuf>,

        /// Entity ids of the net; states for other ids end the session
        #[arg(long, value_delimiter = ',')]
        states: Option<Vec<u64>>,
    },

    /// Run a debug peer over a stub net with fixed active states
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,

        /// Port to listen on (0 picks a free port)
        #[arg(long, default_value_t = 12345)]
        port: u16,

        /// SHA-1 of the net source the peer claims to run
        #[arg(long)]
        hash: String,

        /// Active state reported while running, as <id>:<count> (repeatable)
        #[arg(long = "state", value_parser = parse_state)]
        states: Vec<(u64, u64)>,

        /// Net variable visible to Lua evaluators, as <name>=<value> (repeatable)
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, i64)>,

        /// Evaluator symbol prefix
        #[arg(long, default_value = "Petri")]
        prefix: String,
    },

    /// Print the SHA-1 of a net source, as sent with `start`
    Hash {
        source: PathBuf,
    },
}

fn long_version() -> &'static str {
    if cfg!(debug_assertions) {
        concat!(
            env!("CARGO_PKG_VERSION"),
            " (", env!("GIT_COMMIT_HASH"), ")",
            "\nbuild:   debug",
            "\ntarget:  ", env!("TARGET"),
        )
    } else {
        concat!(
            env!("CARGO_PKG_VERSION"),
            " (", env!("GIT_COMMIT_HASH"), ")",
            "\nbuild:   release",
            "\ntarget:  ", env!("TARGET"),
        )
    }
}

fn parse_state(s: &str) -> Result<(u64, u64), String> {
    let (id, count) = s
        .split_once(':')
        .ok_or_else(|| format!("expected <id>:<count>, got '{}'", s))?;
    let id = id.trim().parse().map_err(|_| format!("invalid state id '{}'", id))?;
    let count = count.trim().parse().map_err(|_| format!("invalid token count '{}'", count))?;
    Ok((id, count))
}

fn parse_var(s: &str) -> Result<(String, i64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <name>=<value>, got '{}'", s))?;
    let value = value.trim().parse().map_err(|_| format!("invalid value '{}'", value))?;
    Ok((name.trim().to_string(), value))
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp(None)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Attach { source, host, port, settings, states } => {
            console::cmd_attach(console::AttachArgs { source, host, port, settings, states })
        }
        Commands::Serve { bind, port, hash, states, vars, prefix } => {
            cmd_serve(bind, port, hash, states, vars, prefix)
        }
        Commands::Hash { source } => cmd_hash(source),
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn args(msg: impl Into<String>) -> Self {
        Self { code: EXIT_USAGE, message: msg.into(), hint: None }
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self { code: EXIT_ERROR, message: msg.into(), hint: None }
    }

    /// Add a hint to an existing error.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

// ============================================================================
// serve
// ============================================================================

fn cmd_serve(
    bind: String,
    port: u16,
    hash: String,
    states: Vec<(u64, u64)>,
    vars: Vec<(String, i64)>,
    prefix: String,
) -> Result<(), CliError> {
    let mut net = StaticNet::new(hash).with_states(states);
    for (name, value) in &vars {
        net = net.with_variable(name, *value);
    }

    let mut peer = DebugPeer::new();
    let config = PeerConfig { bind: format!("{}:{}", bind, port), prefix, ..PeerConfig::default() };
    peer.start(config, Arc::new(net)).map_err(|e| {
        CliError::other(format!("cannot listen on {}:{}: {}", bind, port, e))
            .with_hint("is another peer already using this port?")
    })?;

    if let Some(addr) = peer.bound_addr() {
        println!("Listening on {}", addr);
    }
    peer.wait();
    println!("Debugging session ended.");
    Ok(())
}

// ============================================================================
// hash
// ============================================================================

fn cmd_hash(source: PathBuf) -> Result<(), CliError> {
    let bytes = fs::read(&source)
        .map_err(|e| CliError::args(format!("{}: {}", source.display(), e)))?;
    println!("{}", sha1_hex(&bytes));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_state() {
        assert_eq!(parse_state("7:2"), Ok((7, 2)));
        assert_eq!(parse_state(" 12 : 0 "), Ok((12, 0)));
        assert!(parse_state("7").is_err());
        assert!(parse_state("x:1").is_err());
    }

    #[test]
    fn test_parse_var() {
        assert_eq!(parse_var("tokens=21"), Ok(("tokens".to_string(), 21)));
        assert_eq!(parse_var("delta=-3"), Ok(("delta".to_string(), -3)));
        assert!(parse_var("tokens").is_err());
        assert!(parse_var("tokens=many").is_err());
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
