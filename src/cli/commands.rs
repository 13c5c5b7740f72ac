use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "loopwire")]
#[command(about = "Client for the local backend IPC protocol")]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect, authenticate and ask the backend for its health
    ///
    /// Example: loopwire health
    Health,

    /// Show the backend configuration
    ///
    /// Served from the local cache when it is younger than --max-age-secs.
    ///
    /// Examples:
    ///   loopwire config
    ///   loopwire config --max-age-secs 0 --json
    Config {
        /// Oldest cached copy to accept, in seconds
        #[arg(long)]
        max_age_secs: Option<u64>,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Send an opaque application request and print the reply
    ///
    /// Examples:
    ///   loopwire request session.list
    ///   loopwire request chat.send --body "hello"
    Request {
        /// Request kind understood by the backend
        kind: String,
        /// UTF-8 request body
        #[arg(short, long)]
        body: Option<String>,
        /// Override the request timeout, in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Print where the settings file lives
    SettingsPath,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_command() {
        let cli = Cli::try_parse_from(["loopwire", "-v", "config", "--max-age-secs", "5", "--json"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Config { max_age_secs, json } => {
                assert_eq!(max_age_secs, Some(5));
                assert!(json);
            }
            _ => panic!("expected config command"),
        }
    }

    #[test]
    fn test_parse_request_command() {
        let cli = Cli::try_parse_from(["loopwire", "request", "chat.send", "--body", "hi"]).unwrap();
        match cli.command {
            Commands::Request { kind, body, timeout_ms } => {
                assert_eq!(kind, "chat.send");
                assert_eq!(body.as_deref(), Some("hi"));
                assert_eq!(timeout_ms, None);
            }
            _ => panic!("expected request command"),
        }
    }

    #[test]
    fn test_request_requires_kind() {
        assert!(Cli::try_parse_from(["loopwire", "request"]).is_err());
    }
}
