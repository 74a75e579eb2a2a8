use std::future::Future;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::info;

use crate::pipeline::Pipeline;
use crate::scraper::PageSource;

/// Run the pipeline every `every` until `shutdown` resolves.
///
/// Runs execute inline, so they never overlap and shutdown is only observed
/// between runs. Returns how many runs were started.
pub async fn watch<S: PageSource>(
    pipeline: &Pipeline<'_, S>,
    terms: &[String],
    max_pages: u32,
    every: Duration,
    immediate: bool,
    shutdown: impl Future<Output = ()>,
) -> usize {
    let start = if immediate {
        Instant::now()
    } else {
        Instant::now() + every
    };
    let mut ticker = interval_at(start, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    info!(
        "Scheduler started. Job will run every {:.1} hours",
        every.as_secs_f64() / 3600.0
    );

    let mut runs = 0;
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                runs += 1;
                let summary = pipeline.run_once(terms, max_pages).await;
                println!("Run {}: {}", runs, summary);
            }
        }
    }

    info!(runs, "Scheduler shut down");
    runs
}
