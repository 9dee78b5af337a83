//! Mutation options and the optimistic data provider hook.

use qsync_core::QueryOperation;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// What the provider sees for one affected cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderContext<'a> {
    pub query_model: &'a str,
    pub query_operation: &'a QueryOperation,
    pub query_args: Option<&'a Value>,
    pub current_data: &'a Value,
    pub mutation_args: &'a Value,
}

/// Provider decision for one affected cache entry.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderResult {
    /// Leave the entry untouched.
    Skip,
    /// Apply the default optimistic patch.
    ProceedDefault,
    /// Store this value instead of the default patch.
    Update(Value),
}

/// Per-key callback overriding the default optimistic patch.
pub type OptimisticDataProvider =
    Arc<dyn Fn(&ProviderContext<'_>) -> ProviderResult + Send + Sync>;

/// Options of one mutation hook.
#[derive(Clone)]
pub struct MutationOptions {
    /// Patch affected optimistic queries before the server responds.
    pub optimistic_update: bool,
    /// Refetch affected queries after the mutation succeeds.
    pub invalidate_queries: bool,
    pub optimistic_data_provider: Option<OptimisticDataProvider>,
}

impl Default for MutationOptions {
    fn default() -> Self {
        Self {
            optimistic_update: false,
            invalidate_queries: true,
            optimistic_data_provider: None,
        }
    }
}

impl MutationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn optimistic(mut self, enabled: bool) -> Self {
        self.optimistic_update = enabled;
        self
    }

    pub fn invalidate(mut self, enabled: bool) -> Self {
        self.invalidate_queries = enabled;
        self
    }

    pub fn with_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn(&ProviderContext<'_>) -> ProviderResult + Send + Sync + 'static,
    {
        self.optimistic_data_provider = Some(Arc::new(provider));
        self
    }

    /// Ask the provider about one entry. Without a provider the default patch
    /// applies.
    pub fn consult(&self, ctx: &ProviderContext<'_>) -> ProviderResult {
        match &self.optimistic_data_provider {
            Some(provider) => provider(ctx),
            None => ProviderResult::ProceedDefault,
        }
    }
}

impl fmt::Debug for MutationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOptions")
            .field("optimistic_update", &self.optimistic_update)
            .field("invalidate_queries", &self.invalidate_queries)
            .field(
                "optimistic_data_provider",
                &self.optimistic_data_provider.as_ref().map(|_| "<fn>"),
            )
            .finish()
    }
}
