use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub struct Args {
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub debug: bool,
    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Runs the bucket (blob store) server.
    Bucket {
        /// Address to listen on; overrides BUCKET_SERVER_HOST.
        #[arg(short, long)]
        listen: Option<IpAddr>,
        /// TCP port to listen on; overrides BUCKET_SERVER_PORT.
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Runs the hub (scheduler) server.
    Hub {
        /// Address to listen on; overrides PIPE_HUB_HOST.
        #[arg(short, long)]
        listen: Option<IpAddr>,
        /// TCP port to listen on; overrides PIPE_WORKER_PORT.
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Runs a worker until stopped or its restart interval passes.
    Worker,
    /// Runs a single step in this process; used by subprocess-mode workers.
    Job {
        /// Step to run; falls back to the STEP_ID environment variable.
        #[arg(long)]
        step_id: Option<String>,
    },
    /// Submits a DAG read from a JSON file holding a list of steps.
    Submit { file: PathBuf },
    /// Prints per-scope step counts from the hub.
    Stats,
}
