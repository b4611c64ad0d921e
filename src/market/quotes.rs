//! Per-tick quote collection.
//!
//! A `QuoteBook` holds only fresh, sane quotes: anything missing, older than
//! the staleness window, or crossed is recorded as stale instead. Consumers
//! skip work that needs a stale symbol; they never see a zero price.

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use tracing::debug;

use crate::broker::PriceFeed;
use crate::types::{EngineError, Quote};

#[derive(Debug, Clone, Default)]
pub struct QuoteBook {
    quotes: HashMap<String, Quote>,
    stale: Vec<String>,
    pub taken_at: Option<DateTime<Utc>>,
}

impl QuoteBook {
    /// Query the feed for every symbol concurrently.
    pub async fn collect(feed: &dyn PriceFeed, symbols: &[String], now: DateTime<Utc>, max_age: Duration) -> Self {
        let results = join_all(symbols.iter().map(|s| feed.latest_quote(s))).await;

        let mut book = Self {
            taken_at: Some(now),
            ..Self::default()
        };
        for (symbol, quote) in symbols.iter().zip(results) {
            match quote {
                Some(q) if q.is_sane() && !q.is_stale(now, max_age) => {
                    book.quotes.insert(symbol.clone(), q);
                }
                Some(q) => {
                    debug!(symbol = %symbol, quote = %q, "Quote stale or insane, skipping");
                    book.stale.push(symbol.clone());
                }
                None => {
                    debug!(symbol = %symbol, "No quote available");
                    book.stale.push(symbol.clone());
                }
            }
        }
        book
    }

    /// Build a book directly from quotes already known to be fresh.
    pub fn from_quotes(quotes: impl IntoIterator<Item = Quote>) -> Self {
        Self {
            quotes: quotes.into_iter().map(|q| (q.symbol.clone(), q)).collect(),
            ..Self::default()
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&Quote> {
        self.quotes.get(symbol)
    }

    /// The quote for `symbol`, or `StaleQuote`.
    pub fn require(&self, symbol: &str) -> Result<&Quote, EngineError> {
        self.quotes.get(symbol).ok_or_else(|| EngineError::StaleQuote {
            symbol: symbol.to_string(),
        })
    }

    pub fn is_fresh(&self, symbol: &str) -> bool {
        self.quotes.contains_key(symbol)
    }

    pub fn stale_symbols(&self) -> &[String] {
        &self.stale
    }

    pub fn iter(&self) -> impl Iterator<Item = &Quote> {
        self.quotes.values()
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }
}
