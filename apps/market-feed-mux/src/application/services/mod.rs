//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `Feed`: Shared interest registry, upstream diff flushing and routing
//! - `Subscription`: Client handle with a symbol set and batched delivery
//! - `MarketData`: Per-symbol facade over Quote, Trade, Summary and Profile
//! - `QuoteBook`: Reference-counted per-symbol quote models

mod feed;
mod market_data;
mod quote_book;
mod subscription;

pub use feed::{Feed, SUBSCRIPTION_SERVICE};
pub use market_data::{EventKind, MarketData, MarketDataListener};
pub use quote_book::{QuoteBook, QuoteModel, QuoteSnapshot};
pub use subscription::{EventCallback, Subscription};
