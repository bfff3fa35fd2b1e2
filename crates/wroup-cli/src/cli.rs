//! Clap CLI definitions for Wroup.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  wroup host --group party               Advertise a group and accept members
  wroup host --group party --attr mood=calm
  wroup browse --timeout-ms 5000         List groups nearby
  wroup join 192.168.49.1:9999           Join a group and chat over stdin";

/// Wroup — ad-hoc peer discovery and group messaging.
#[derive(Parser, Debug)]
#[command(name = "wroup", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Advertise a group and run as its owner. Stdin lines go to every member.
    Host {
        /// Group name to advertise.
        #[arg(long)]
        group: String,
        /// Extra service attribute, as key=value. Repeatable.
        #[arg(long = "attr", value_parser = parse_attr)]
        attrs: Vec<(String, String)>,
    },
    /// Run one discovery round and list the groups found.
    Browse {
        /// Override the configured discovery timeout.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Join the group whose owner listens on ADDR. Stdin lines go to the owner.
    Join {
        /// Group owner address, e.g. 192.168.49.1:9999.
        addr: SocketAddr,
    },
}

/// Parse a `key=value` attribute.
pub fn parse_attr(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_attr() {
        assert_eq!(parse_attr("a=b").unwrap(), ("a".to_string(), "b".to_string()));
        assert_eq!(parse_attr("a=b=c").unwrap(), ("a".to_string(), "b=c".to_string()));
        assert_eq!(parse_attr("a=").unwrap(), ("a".to_string(), String::new()));
        assert!(parse_attr("=b").is_err());
        assert!(parse_attr("ab").is_err());
    }

    #[test]
    fn test_parse_host() {
        let cli = Cli::try_parse_from([
            "wroup", "--config", "/tmp/w.toml", "host", "--group", "party", "--attr", "x=1",
            "--attr", "y=2",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/w.toml")));
        match cli.command {
            Commands::Host { group, attrs } => {
                assert_eq!(group, "party");
                assert_eq!(attrs.len(), 2);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_join_requires_socket_addr() {
        assert!(Cli::try_parse_from(["wroup", "join", "not-an-addr"]).is_err());
        let cli = Cli::try_parse_from(["wroup", "join", "10.0.0.1:9999"]).unwrap();
        assert!(matches!(cli.command, Commands::Join { .. }));
    }
}
