//! qsync Client
//!
//! Query client facade over the qsync engine: cached queries and infinite
//! queries, mutation hooks with optimistic updates, an HTTP transport, TOML
//! configuration and tracing setup.

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod telemetry;

pub use client::{MutationHandle, QueryClient, QueryOptions, QueryState};
pub use config::{AuthConfig, ClientConfig, MutationDefaults, CONFIG_ENV};
pub use error::{ClientError, ClientResult};
pub use http::HttpTransport;
pub use telemetry::init_tracing;

pub use qsync_core::{HttpMethod, MutationOperation, QueryKey};
pub use qsync_mutation::{MutationOptions, ProviderContext, ProviderResult};
