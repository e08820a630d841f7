//! Outbound internet access: the resilient fetch client and the URL policy
//! that keeps it off private networks.

pub mod fetch;
pub mod url_guard;

pub use fetch::{FetchError, FetchOptions, FetchResult, Fetcher};
pub use url_guard::{check_public_url, validate_public_url, UrlPolicyError};
