use clap::{Parser, Subcommand};

const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8080";

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the near-duplicate detection daemon
    Daemon {
        /// Address to listen on
        #[clap(long, default_value = "0.0.0.0:8080")]
        bind: String,
    },

    /// Submit a text to a running daemon and print the result
    Submit {
        /// The text to check for near-duplicates
        text: String,

        /// Daemon endpoint
        #[clap(long, default_value = DEFAULT_ENDPOINT)]
        endpoint: String,
    },

    /// Show index and flush stats of a running daemon
    Stats {
        /// Daemon endpoint
        #[clap(long, default_value = DEFAULT_ENDPOINT)]
        endpoint: String,
    },
}
