use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::db::{Database, Feed, NewPost};
use crate::fetcher::{FetchError, Fetcher};

/// Outcome of one scrape of one feed.
pub struct ScrapeResult {
    pub feed: Feed,
    /// Number of posts saved, or why the fetch failed
    pub result: Result<usize, FetchError>,
}

impl ScrapeResult {
    /// One-line report printed by the collection loop.
    pub fn summary(&self) -> String {
        match &self.result {
            Ok(count) => format!("{}: saved {} post(s)", self.feed.name, count),
            Err(e) if e.is_network() => format!("{}: feed unreachable: {}", self.feed.name, e),
            Err(e) => format!("{}: feed unreadable: {}", self.feed.name, e),
        }
    }
}

/// Parses `<number><unit>` with unit one of `ms`, `s`, `m`, `h`. Zero is rejected.
pub fn parse_interval(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits.parse().ok()?;

    let duration = match unit {
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value.checked_mul(60)?),
        "h" => Duration::from_secs(value.checked_mul(3600)?),
        _ => return None,
    };

    if duration.is_zero() {
        None
    } else {
        Some(duration)
    }
}

/// Fetches the least-recently-fetched feed, stores its items as posts and
/// records when (and whether) the fetch succeeded. A fetch failure is part of
/// the returned result; only storage failures are errors.
pub async fn scrape_next_feed(
    db: &Database,
    fetcher: &Fetcher,
    deadline: Duration,
) -> anyhow::Result<Option<ScrapeResult>> {
    let feed = match db.get_next_feed_to_fetch().await? {
        Some(feed) => feed,
        None => return Ok(None),
    };

    info!("Fetching feed: {} ({})", feed.name, feed.url);

    let document = match fetcher.fetch(&feed.url, deadline).await {
        Ok(document) => document,
        Err(e) => {
            warn!("Failed to fetch feed '{}': {}", feed.name, e);
            db.mark_feed_fetched(feed.id, Some(&e.to_string())).await?;
            return Ok(Some(ScrapeResult {
                feed,
                result: Err(e),
            }));
        }
    };

    let mut count = 0;
    for item in &document.channel.items {
        if item.link.is_empty() {
            warn!("Skipping item with no link: {}", item.title);
            continue;
        }

        db.upsert_post(NewPost {
            feed_id: feed.id,
            title: &item.title,
            url: &item.link,
            description: &item.description,
            published_at: item.pub_date,
        })
        .await?;

        count += 1;
    }

    db.mark_feed_fetched(feed.id, None).await?;
    info!("Saved {} posts for feed '{}'", count, feed.name);

    Ok(Some(ScrapeResult {
        feed,
        result: Ok(count),
    }))
}

/// Scrapes one feed per tick until `shutdown` resolves. A failing feed or
/// cycle is logged and the loop moves on. Shutdown also cancels a scrape in
/// flight; the interrupted feed keeps its old fetch time and is picked first
/// next run.
pub async fn run<F>(db: &Database, fetcher: &Fetcher, interval: Duration, deadline: Duration, shutdown: F)
where
    F: Future<Output = ()>,
{
    println!("Collecting feeds every {:?}", interval);

    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Stopping feed collection");
                return;
            }
            _ = ticker.tick() => {
                tokio::select! {
                    _ = &mut shutdown => {
                        info!("Stopping feed collection, abandoning scrape in progress");
                        return;
                    }
                    outcome = scrape_next_feed(db, fetcher, deadline) => match outcome {
                        Ok(Some(scraped)) => println!("{}", scraped.summary()),
                        Ok(None) => info!("No feeds to fetch"),
                        Err(e) => error!("Scrape cycle failed: {:#}", e),
                    },
                }
            }
        }
    }
}
