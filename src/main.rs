use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use places_grid::{collect, init_tracing, AppConfig, CollectionProgress, Phase, ProgressObserver};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = AppConfig::from_env();

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("interrupt received; saving finished units (Ctrl-C again to abort)");
        signal_token.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second interrupt; aborting");
            std::process::exit(130);
        }
    });

    let observer: ProgressObserver = Arc::new(|progress: CollectionProgress| {
        if progress.processed % 25 == 0 || progress.processed == progress.total {
            let phase = match progress.phase {
                Phase::Search => "search",
                Phase::Details => "details",
            };
            info!(phase, processed = progress.processed, total = progress.total, "progress");
        }
    });

    let report = collect(&config, Some(observer), cancel)
        .await
        .context("collection failed")?;

    println!(
        "cells searched:      {} ({} from cache, {} failed, {} saturated)",
        report.cells_searched + report.cells_from_cache,
        report.cells_from_cache,
        report.cells_failed,
        report.cells_saturated,
    );
    println!("entities:            {}", report.entities_total);
    println!(
        "details:             {} fetched, {} from cache",
        report.details_fetched, report.details_from_cache
    );
    println!("failed permanently:  {}", report.failed_permanent);
    println!("suspected duplicates: {}", report.suspected_duplicates);
    if report.cancelled {
        println!("run interrupted; rerun to resume from the cache");
    } else {
        println!(
            "wrote {} records to {}",
            report.output_count,
            config.output_file.display()
        );
    }
    Ok(())
}
