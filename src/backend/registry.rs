use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{PricingInfo, SharedClient};
use crate::error::{Error, Result};

/// Constructor invoked by the pool whenever a fresh client is needed.
/// Construction failures are not retried here; retry policy lives in the pool.
pub type ClientConstructor =
    Arc<dyn Fn(&BackendSettings) -> Result<SharedClient> + Send + Sync>;

/// Effective per-backend configuration a client is constructed with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub concurrency_limit: usize,
    pub specializations: Vec<String>,
    /// Externally supplied trust weight fed into consensus scoring.
    pub trust_weight: f64,
    /// Per-token pricing; when set, responses carry an estimated cost.
    pub pricing: Option<PricingInfo>,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: None,
            api_key: None,
            request_timeout: Duration::from_secs(60),
            max_retries: 2,
            concurrency_limit: 4,
            specializations: Vec::new(),
            trust_weight: 1.0,
            pricing: None,
        }
    }
}

/// Partial settings merged over a descriptor's defaults, key by key.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverride {
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub concurrency_limit: Option<usize>,
    pub specializations: Option<Vec<String>>,
    pub trust_weight: Option<f64>,
    pub pricing: Option<PricingInfo>,
}

impl BackendSettings {
    pub fn merged_with(&self, overrides: &SettingsOverride) -> BackendSettings {
        BackendSettings {
            endpoint: overrides.endpoint.clone().or_else(|| self.endpoint.clone()),
            model: overrides.model.clone().or_else(|| self.model.clone()),
            api_key: overrides.api_key.clone().or_else(|| self.api_key.clone()),
            request_timeout: overrides.request_timeout.unwrap_or(self.request_timeout),
            max_retries: overrides.max_retries.unwrap_or(self.max_retries),
            concurrency_limit: overrides.concurrency_limit.unwrap_or(self.concurrency_limit),
            specializations: overrides
                .specializations
                .clone()
                .unwrap_or_else(|| self.specializations.clone()),
            trust_weight: overrides.trust_weight.unwrap_or(self.trust_weight),
            pricing: overrides.pricing.clone().or_else(|| self.pricing.clone()),
        }
    }
}

/// Registered backend: logical name, match patterns, constructor and defaults.
/// Immutable after registration.
#[derive(Clone)]
pub struct BackendDescriptor {
    pub name: String,
    pub patterns: Vec<String>,
    pub defaults: BackendSettings,
    constructor: ClientConstructor,
}

impl BackendDescriptor {
    pub fn new(
        name: impl Into<String>,
        patterns: Vec<String>,
        defaults: BackendSettings,
        constructor: ClientConstructor,
    ) -> Self {
        Self {
            name: name.into(),
            patterns,
            defaults,
            constructor,
        }
    }
}

impl fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("name", &self.name)
            .field("patterns", &self.patterns)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

/// Maps logical model names to backend constructors. Registration order is
/// preserved and drives pattern-match precedence.
pub struct BackendRegistry {
    entries: RwLock<Vec<BackendDescriptor>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Adds a descriptor. Registering a new name never removes earlier
    /// entries; an exact-name duplicate shadows nothing since exact lookup
    /// returns the first registration.
    pub fn register(&self, descriptor: BackendDescriptor) {
        info!(
            backend = %descriptor.name,
            patterns = ?descriptor.patterns,
            "Registering backend"
        );
        self.entries.write().push(descriptor);
    }

    /// Exact name first across all entries, then prefix/substring patterns,
    /// first match wins in registration order.
    pub fn resolve(&self, model_name: &str) -> Result<BackendDescriptor> {
        let entries = self.entries.read();

        if let Some(entry) = entries.iter().find(|e| e.name == model_name) {
            return Ok(entry.clone());
        }

        for entry in entries.iter() {
            for pattern in &entry.patterns {
                if model_name.starts_with(pattern.as_str())
                    || model_name.contains(pattern.as_str())
                {
                    debug!(
                        model = model_name,
                        backend = %entry.name,
                        pattern = %pattern,
                        "Resolved model via pattern"
                    );
                    return Ok(entry.clone());
                }
            }
        }

        Err(Error::UnknownBackend(model_name.to_string()))
    }

    /// Merges overrides over the descriptor's defaults and invokes the
    /// constructor. A constructor failure carries the backend name and cause.
    pub fn construct(
        &self,
        descriptor: &BackendDescriptor,
        overrides: &SettingsOverride,
    ) -> Result<SharedClient> {
        let settings = descriptor.defaults.merged_with(overrides);
        debug!(backend = %descriptor.name, "Constructing backend client");

        (descriptor.constructor)(&settings).map_err(|e| match e {
            err @ Error::Construction { .. } => err,
            other => Error::construction(&descriptor.name, other.to_string()),
        })
    }

    /// Every registered name and pattern, for diagnostics.
    pub fn list_available(&self) -> Vec<String> {
        let entries = self.entries.read();
        let mut names = Vec::new();
        for entry in entries.iter() {
            names.push(entry.name.clone());
            for pattern in &entry.patterns {
                names.push(format!("{}*", pattern));
            }
        }
        names
    }

    pub fn descriptors(&self) -> Vec<BackendDescriptor> {
        self.entries.read().clone()
    }

    /// Backends whose specializations include the given context tag. When no
    /// backend claims the tag, every backend is considered eligible so an
    /// unknown domain still gets a best-effort answer.
    pub fn eligible_for(&self, context_tag: &str) -> Vec<BackendDescriptor> {
        let entries = self.entries.read();
        let specialized: Vec<_> = entries
            .iter()
            .filter(|e| {
                e.defaults
                    .specializations
                    .iter()
                    .any(|s| s == context_tag)
            })
            .cloned()
            .collect();

        if specialized.is_empty() {
            entries.clone()
        } else {
            specialized
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendClient, BackendResponse, GenerationRequest};
    use async_trait::async_trait;

    struct NullClient {
        name: String,
    }

    #[async_trait]
    impl BackendClient for NullClient {
        async fn generate(&self, request: &GenerationRequest) -> Result<BackendResponse> {
            Ok(BackendResponse::ok(
                &self.name,
                &request.id,
                "ok",
                Duration::from_millis(1),
            ))
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        async fn close(&self) {}

        fn backend_name(&self) -> &str {
            &self.name
        }
    }

    fn null_constructor(name: &str) -> ClientConstructor {
        let name = name.to_string();
        Arc::new(move |_settings| {
            Ok(Arc::new(NullClient { name: name.clone() }) as SharedClient)
        })
    }

    fn descriptor(name: &str, patterns: &[&str]) -> BackendDescriptor {
        BackendDescriptor::new(
            name,
            patterns.iter().map(|p| p.to_string()).collect(),
            BackendSettings::default(),
            null_constructor(name),
        )
    }

    #[test]
    fn test_exact_match_beats_pattern() {
        let registry = BackendRegistry::new();
        registry.register(descriptor("gpt", &["gpt-"]));
        registry.register(descriptor("gpt-4o", &[]));

        // Exact name wins even though "gpt-" would match first by pattern.
        let resolved = registry.resolve("gpt-4o").unwrap();
        assert_eq!(resolved.name, "gpt-4o");
    }

    #[test]
    fn test_pattern_order_is_registration_order() {
        let registry = BackendRegistry::new();
        registry.register(descriptor("first", &["claude"]));
        registry.register(descriptor("second", &["claude-3"]));

        let resolved = registry.resolve("claude-3-sonnet").unwrap();
        assert_eq!(resolved.name, "first");
    }

    #[test]
    fn test_unknown_model() {
        let registry = BackendRegistry::new();
        registry.register(descriptor("gpt", &["gpt-"]));

        match registry.resolve("llama") {
            Err(Error::UnknownBackend(name)) => assert_eq!(name, "llama"),
            other => panic!("expected UnknownBackend, got {:?}", other.map(|d| d.name)),
        }
    }

    #[test]
    fn test_settings_merge_override_wins_per_key() {
        let defaults = BackendSettings {
            model: Some("base".to_string()),
            max_retries: 2,
            ..Default::default()
        };
        let overrides = SettingsOverride {
            max_retries: Some(5),
            ..Default::default()
        };

        let merged = defaults.merged_with(&overrides);
        assert_eq!(merged.max_retries, 5);
        assert_eq!(merged.model.as_deref(), Some("base"));
    }

    #[test]
    fn test_construct_wraps_failure_with_backend_name() {
        let registry = BackendRegistry::new();
        let failing: ClientConstructor =
            Arc::new(|_| Err(Error::validation("missing api key")));
        registry.register(BackendDescriptor::new(
            "broken",
            vec![],
            BackendSettings::default(),
            failing,
        ));

        let descriptor = registry.resolve("broken").unwrap();
        match registry.construct(&descriptor, &SettingsOverride::default()) {
            Err(Error::Construction { backend, .. }) => assert_eq!(backend, "broken"),
            other => panic!("expected Construction error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn test_eligible_for_falls_back_to_all() {
        let registry = BackendRegistry::new();
        let mut settings = BackendSettings::default();
        settings.specializations = vec!["land_law".to_string()];
        registry.register(BackendDescriptor::new(
            "specialist",
            vec![],
            settings,
            null_constructor("specialist"),
        ));
        registry.register(descriptor("generalist", &[]));

        let eligible = registry.eligible_for("land_law");
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].name, "specialist");

        let eligible = registry.eligible_for("astrophysics");
        assert_eq!(eligible.len(), 2);
    }

    #[test]
    fn test_list_available() {
        let registry = BackendRegistry::new();
        registry.register(descriptor("gpt", &["gpt-"]));
        let listing = registry.list_available();
        assert!(listing.contains(&"gpt".to_string()));
        assert!(listing.contains(&"gpt-*".to_string()));
    }
}
