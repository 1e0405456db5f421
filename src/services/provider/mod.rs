//! Provider API access: HTTP client, payload extraction, lineup and guide fetching

pub mod client;
pub mod fetcher;
pub mod payload;

pub use client::{Endpoint, HttpProviderApi, ProviderApi, RetryPolicy};
pub use fetcher::{FetchOptions, GuideFetch, GuideFetcher};
