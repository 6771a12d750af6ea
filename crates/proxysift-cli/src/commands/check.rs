//! The `check` command: full validation pipeline.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use proxysift_core::config::ValidatorConfig;
use proxysift_core::dedup::dedupe_and_rank;
use proxysift_core::output;
use proxysift_core::probe::HttpProber;
use proxysift_core::scheduler::{LiveEndpoint, ValidationScheduler};
use proxysift_core::supervisor::{CoreHost, locate_binary};
use proxysift_core::validator::BatchValidator;
use tracing::info;

use crate::CheckArgs;

/// Run the validation pipeline end-to-end.
///
/// Only two conditions are fatal: an unreadable input file and a missing
/// core binary. Everything else is isolated to the offending endpoint or
/// batch and shows up in the final counts.
pub async fn run(args: CheckArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ValidatorConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ValidatorConfig::default(),
    };
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    config.validate().context("invalid configuration")?;

    let (candidates, stats) = output::read_candidates(&args.input).await?;
    if candidates.is_empty() {
        bail!("no endpoint uris found in {}", args.input.display());
    }

    let binary = locate_binary(args.binary.as_deref())?;
    info!(binary = %binary.display(), "using core binary");
    println!(
        "loaded {} endpoints from {} ({} lines)",
        candidates.len(),
        args.input.display(),
        stats.lines
    );

    let config = Arc::new(config);
    let host = Arc::new(CoreHost::new(binary, config.kill_grace));
    let prober = Arc::new(HttpProber::new(
        config.probe_target.clone(),
        config.expect_status,
        config.probe_timeout,
        config.connect_timeout,
    ));
    let validator = BatchValidator::new(host, prober, Arc::clone(&config));
    let scheduler = ValidationScheduler::new(validator, Arc::clone(&config));

    let outcome = scheduler.run(candidates).await?;
    let processed = outcome.processed;
    let dead = outcome.dead();
    let (survivors, duplicates) = dedupe_and_rank(outcome.live);
    output::write_survivors(&args.output, &survivors).await?;

    println!(
        "processed {} endpoints: {} live, {} dead, {} duplicates removed",
        processed,
        survivors.len(),
        dead,
        duplicates
    );
    println!("live endpoints written to {}", args.output.display());
    print_top(&survivors, args.top);

    Ok(())
}

/// Print the best survivors, ascending latency.
fn print_top(survivors: &[LiveEndpoint], top: usize) {
    if survivors.is_empty() {
        return;
    }
    println!("\ntop {} by latency:", top.min(survivors.len()));
    for endpoint in survivors.iter().take(top) {
        let descriptor = &endpoint.candidate.descriptor;
        let mut tag = descriptor.tag.clone();
        tag.truncate(50);
        println!(
            "{:>5} ms  {:<22}  {}",
            endpoint.latency_ms,
            descriptor.endpoint(),
            tag
        );
    }
}
