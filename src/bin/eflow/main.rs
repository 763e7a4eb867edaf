mod args;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::{select, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use crate::args::{Args, Mode};
use stepflow_rs::bucket::{self, BucketClient, BucketStore};
use stepflow_rs::config::{
    BucketClientConfig, BucketServerConfig, HubClientConfig, HubConfig,
    WorkerConfig,
};
use stepflow_rs::hub::{self, server::HubServer, HubClient, HubStore};
use stepflow_rs::types::step::Step;
use stepflow_rs::worker::{self, runner::ShellRunner, Worker};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    // Cancellation on ctrl-c.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    let result = match args.mode {
        Mode::Bucket { listen, port } => {
            run_bucket(cancel, listen, port).await
        },
        Mode::Hub { listen, port } => run_hub(cancel, listen, port).await,
        Mode::Worker => run_worker(cancel).await,
        Mode::Job { step_id } => run_job(step_id).await,
        Mode::Submit { file } => run_submit(file).await,
        Mode::Stats => run_stats().await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "encountered runtime error");
            ExitCode::FAILURE
        },
    }
}

async fn run_bucket(
    cancel: CancellationToken,
    listen: Option<std::net::IpAddr>,
    port: Option<u16>,
) -> Result<()> {
    let mut cfg = BucketServerConfig::from_env();
    if let Some(listen) = listen {
        cfg.host = listen.to_string();
    }
    if let Some(port) = port {
        cfg.port = port;
    }

    let store = Arc::new(BucketStore::new(&cfg.dir, cfg.max_memory)?);
    let listener = TcpListener::bind((cfg.host.as_str(), cfg.port))
        .await
        .context("failed to listen for connections")?;

    bucket::serve(listener, store, cancel).await
}

async fn run_hub(
    cancel: CancellationToken,
    listen: Option<std::net::IpAddr>,
    port: Option<u16>,
) -> Result<()> {
    let mut cfg = HubConfig::from_env();
    if let Some(listen) = listen {
        cfg.host = listen.to_string();
    }
    if let Some(port) = port {
        cfg.port = port;
    }

    let store = HubStore::open(&cfg.db_path, (&cfg).into())?;
    let bucket = BucketClient::new(&BucketClientConfig::from_env());
    let server = Arc::new(HubServer::new(store, bucket));

    let listener = TcpListener::bind((cfg.host.as_str(), cfg.port))
        .await
        .context("failed to listen for connections")?;

    hub::serve(listener, server, cancel).await
}

async fn run_worker(cancel: CancellationToken) -> Result<()> {
    let cfg = WorkerConfig::from_env();
    let hub_cfg = HubClientConfig::from_env();
    let runner = Arc::new(ShellRunner::new(cfg.scratch_dir.clone()));

    let worker = Worker::new(cfg, hub_cfg, runner)?;

    // On ctrl-c the process simply exits; queued transactions are durable
    // and drain on the next start, and leases expire at the hub.
    select! {
        r = worker.run() => r,
        _ = cancel.cancelled() => {
            info!("interrupted");
            Ok(())
        },
    }
}

async fn run_job(step_id: Option<String>) -> Result<()> {
    let step_id = match step_id {
        Some(id) => id,
        None => std::env::var("STEP_ID").context("STEP_ID is not set")?,
    };

    let cfg = WorkerConfig::from_env();
    let hub = HubClient::new(&HubClientConfig::from_env());
    let runner = ShellRunner::new(cfg.scratch_dir.clone());

    worker::job(&hub, &runner, &step_id, cfg.job_timeout).await
}

async fn run_submit(file: std::path::PathBuf) -> Result<()> {
    let text = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let steps: Vec<Step> = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", file.display()))?;

    let hub = HubClient::new(&HubClientConfig::from_env());
    let count = steps.len();
    hub.submit(steps).await?;
    info!(count, "submitted");

    Ok(())
}

async fn run_stats() -> Result<()> {
    let hub = HubClient::new(&HubClientConfig::from_env());
    let stats = hub.stats().await?;

    print!("{}", serde_yaml::to_string(&stats)?);

    Ok(())
}
