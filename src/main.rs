use anyhow::{Context, Result};
use clap::Parser;
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use hopwatch::export::{export_json, generate_report};
use hopwatch::lookup::{DnsLookup, new_geo_resolver};
use hopwatch::probe::AnyProber;
use hopwatch::trace::{Controller, Event, EventReceiver, RunOutcome};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG overrides -v
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let config = args.to_config().context("Invalid arguments")?;
    let geo = new_geo_resolver(&args.geoip, args.geoip_db.as_deref())
        .context("Failed to set up geolocation")?;
    let dns = Arc::new(DnsLookup::new());

    let prober = AnyProber::from_config(&config);
    let controller = Controller::new(config, prober, dns.clone())?
        .with_hostname_resolver(dns)
        .with_geo_resolver(geo.clone());

    // Cancellation token for graceful shutdown
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        cancel_clone.cancel();
    });

    let consumer = controller.events().map(|rx| tokio::spawn(log_events(rx)));

    let outcome = controller.run(&cancel).await;
    if let Some(consumer) = consumer {
        consumer.await.ok();
    }
    geo.close();

    match outcome {
        Ok(RunOutcome::Completed) => {}
        Ok(RunOutcome::Cancelled) => info!("interrupted, showing partial results"),
        Err(e) => {
            return Err(e).with_context(|| format!("Trace to {} failed", args.target));
        }
    }

    let snapshot = controller.snapshot();
    let stdout = io::stdout().lock();
    if args.json {
        export_json(&snapshot, stdout)?;
    } else {
        generate_report(&snapshot, stdout)?;
    }

    Ok(())
}

/// Progress on stderr while the run is going
async fn log_events(mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            Event::HopUpdated { ttl, round } => debug!(ttl, round, "hop updated"),
            Event::RoundCompleted { round } => info!(round = round + 1, "round completed"),
            Event::Done => debug!("all rounds completed"),
            Event::Error { cause } if cause.is_cancelled() => debug!("run cancelled"),
            Event::Error { cause } => warn!(error = %cause, "run stopped"),
        }
    }
}
