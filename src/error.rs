//! Error types for fleet-dns.

use std::net::SocketAddr;

use thiserror::Error;

/// Errors that can occur in the DNS server.
#[derive(Debug, Error)]
pub enum DnsError {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// JSON decoding error (records file, alias files)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error (health probes, http-json sources)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Failed to parse an address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// A local query that cannot be decomposed into instance/group segments
    #[error("Malformed query: {0}")]
    MalformedQuery(String),

    /// A criteria query carrying nothing but a health strategy
    #[error("Ambiguous query: no selective criteria")]
    AmbiguousQuery,

    /// Alias expansion failed for every resolution target
    #[error("Failures occurred when resolving alias domains: {0}")]
    AliasResolution(String),

    /// No upstream recursors are configured
    #[error("No recursors configured")]
    NoRecursors,

    /// A single recursor exchange did not complete within its budget
    #[error("Exchange with {recursor} timed out")]
    ExchangeTimeout {
        /// The recursor that failed to answer in time.
        recursor: SocketAddr,
    },

    /// A recursor exchange failed
    #[error("Exchange failed: {0}")]
    Exchange(String),

    /// A self-query upcheck got no valid answer
    #[error("Upcheck failed: {0}")]
    Upcheck(String),

    /// The listeners did not come up within the startup budget
    #[error("timed out waiting for server to bind")]
    BindTimeout,
}
