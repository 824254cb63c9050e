// Orchestrates one question across every eligible backend and merges the
// answers into a single consensus result.

pub mod cache;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tracing::{debug, info, warn};

use crate::backend::http::HttpBackend;
use crate::backend::{BackendDescriptor, BackendRegistry, BackendResponse, GenerationRequest};
use crate::config::{AppConfig, DispatchSettings};
use crate::consensus::{ConsensusEngine, ConsensusResult};
use crate::error::{Error, Result};
use crate::pool::{BackendPoolStats, ClientPool, GlobalPoolStats};
use crate::resilience::{CircuitBreaker, CircuitSnapshot, RateLimiter};

pub use cache::ResultCache;

/// Retry pacing for a failed backend call within one dispatch.
const CALL_BACKOFF_BASE_MS: u64 = 100;
const CALL_BACKOFF_CAP: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub query: String,
    pub context_tag: String,
    pub caller_id: String,
    /// Overrides the configured confidence floor for this call.
    pub min_confidence: Option<f64>,
}

impl DispatchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            context_tag: "general".to_string(),
            caller_id: "anonymous".to_string(),
            min_confidence: None,
        }
    }

    pub fn with_context(mut self, context_tag: impl Into<String>) -> Self {
        self.context_tag = context_tag.into();
        self
    }

    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = caller_id.into();
        self
    }

    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = Some(min_confidence.clamp(0.0, 1.0));
        self
    }
}

/// Front door of the crate. Owns the pool, breaker, rate limiter and
/// consensus engine; never touches process-global state.
pub struct Dispatcher {
    registry: Arc<BackendRegistry>,
    breaker: Arc<CircuitBreaker>,
    pool: Arc<ClientPool>,
    limiter: RateLimiter,
    engine: ConsensusEngine,
    result_cache: Option<ResultCache>,
    settings: DispatchSettings,
    warm: Vec<String>,
}

impl Dispatcher {
    pub fn new(registry: Arc<BackendRegistry>, config: &AppConfig) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker.failure_threshold,
            config.breaker.reset_timeout(),
        ));
        let pool = Arc::new(ClientPool::new(
            Arc::clone(&registry),
            Arc::clone(&breaker),
            config.pool.to_pool_config(),
        ));
        let limiter = RateLimiter::new(
            config.rate_limit.requests_per_window,
            config.rate_limit.window(),
        );
        let engine = ConsensusEngine::new(config.consensus.clone());
        let result_cache = config
            .cache
            .enabled
            .then(|| ResultCache::new(config.cache.ttl()));

        info!(
            backends = registry.len(),
            cache = config.cache.enabled,
            "Dispatcher assembled"
        );

        Self {
            registry,
            breaker,
            pool,
            limiter,
            engine,
            result_cache,
            settings: config.dispatch.clone(),
            warm: config.warm_backends(),
        }
    }

    /// Builds a dispatcher whose backends all speak the OpenAI-compatible
    /// HTTP protocol, registered from the enabled config entries.
    pub fn from_config(config: &AppConfig) -> Self {
        let registry = Arc::new(BackendRegistry::new());
        let mut entries: Vec<_> = config
            .backends
            .iter()
            .filter(|(_, e)| e.enabled)
            .collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        for (name, entry) in entries {
            let mut patterns = Vec::new();
            if let Some(model) = &entry.model {
                patterns.push(model.clone());
            }
            registry.register(BackendDescriptor::new(
                name.clone(),
                patterns,
                entry.to_settings(),
                HttpBackend::constructor(name.clone()),
            ));
        }

        Self::new(registry, config)
    }

    /// Starts pool maintenance workers and preconstructs clients for
    /// backends flagged for warm-up.
    pub async fn start(&self) {
        self.pool.start();
        if !self.warm.is_empty() {
            self.pool.warm_up(&self.warm).await;
        }
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        info!("Dispatcher shut down");
    }

    pub async fn dispatch(&self, request: DispatchRequest) -> Result<ConsensusResult> {
        let query = request.query.trim().to_string();
        if query.is_empty() {
            return Err(Error::invalid_input("query must not be empty"));
        }
        if query.chars().count() > self.settings.max_query_chars {
            return Err(Error::invalid_input(format!(
                "query exceeds the {} character limit",
                self.settings.max_query_chars
            )));
        }

        if !self.limiter.check(&request.caller_id) {
            return Err(Error::RateLimited {
                caller: request.caller_id,
            });
        }

        let required = request
            .min_confidence
            .unwrap_or(self.settings.min_confidence);

        if let Some(cached) = self
            .result_cache
            .as_ref()
            .and_then(|c| c.get(&query, &request.context_tag, required))
        {
            debug!(caller = %request.caller_id, "Serving cached consensus result");
            return Ok(cached);
        }

        let descriptors: Vec<BackendDescriptor> = self
            .registry
            .eligible_for(&request.context_tag)
            .into_iter()
            .filter(|d| !self.breaker.is_open(&d.name))
            .collect();
        if descriptors.is_empty() {
            return Err(Error::NoBackendsAvailable);
        }

        debug!(
            context = %request.context_tag,
            backends = descriptors.len(),
            "Dispatching query"
        );

        let trust_weights: HashMap<String, f64> = descriptors
            .iter()
            .map(|d| (d.name.clone(), d.defaults.trust_weight))
            .collect();

        let base = GenerationRequest::new(query.clone(), request.context_tag.clone());
        let mut join_set = JoinSet::new();
        for descriptor in &descriptors {
            let pool = Arc::clone(&self.pool);
            let breaker = Arc::clone(&self.breaker);
            let name = descriptor.name.clone();
            let retries = descriptor.defaults.max_retries;
            let call = base
                .clone()
                .with_timeout(descriptor.defaults.request_timeout);
            join_set.spawn(async move {
                let outcome = call_backend(pool, breaker, name.clone(), call, retries).await;
                (name, outcome)
            });
        }

        let mut responses: Vec<BackendResponse> = Vec::with_capacity(descriptors.len());
        let collect = async {
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((name, Ok(response))) => {
                        debug!(backend = %name, latency_ms = response.latency.as_millis() as u64, "Backend answered");
                        responses.push(response);
                    }
                    Ok((name, Err(e))) => {
                        warn!(backend = %name, "Backend excluded from consensus: {}", e);
                    }
                    Err(e) => warn!("Backend task failed to join: {}", e),
                }
            }
        };
        match self.settings.global_deadline() {
            Some(deadline) => {
                if timeout(deadline, collect).await.is_err() {
                    warn!(
                        deadline_ms = deadline.as_millis() as u64,
                        completed = responses.len(),
                        "Global deadline expired, abandoning pending backends"
                    );
                    join_set.abort_all();
                }
            }
            None => collect.await,
        }

        let merged = self.engine.merge(&responses, &trust_weights)?;
        if merged.confidence < required {
            return Err(Error::LowConfidence {
                confidence: merged.confidence,
                required,
                result: Box::new(merged),
            });
        }

        if let Some(cache) = &self.result_cache {
            cache.insert(&query, &request.context_tag, required, merged.clone());
        }

        info!(
            confidence = merged.confidence,
            contributors = merged.contributors.len(),
            outliers = merged.outliers.len(),
            "Dispatch complete"
        );
        Ok(merged)
    }

    pub fn pool_stats(&self) -> Vec<BackendPoolStats> {
        self.pool.stats_all()
    }

    pub fn global_stats(&self) -> GlobalPoolStats {
        self.pool.global_stats()
    }

    pub fn known_models(&self) -> Vec<String> {
        self.registry.list_available()
    }

    pub fn breaker_snapshot(&self) -> Vec<CircuitSnapshot> {
        self.breaker.snapshot()
    }
}

/// One backend's leg of a dispatch. Failed attempts are retried with
/// jittered exponential backoff up to the backend's configured retries; every
/// failed attempt is charged to the lease and the breaker.
async fn call_backend(
    pool: Arc<ClientPool>,
    breaker: Arc<CircuitBreaker>,
    name: String,
    request: GenerationRequest,
    max_retries: u32,
) -> Result<BackendResponse> {
    let per_call = request.timeout.unwrap_or(Duration::from_secs(60));
    let mut delays = ExponentialBackoff::from_millis(CALL_BACKOFF_BASE_MS)
        .max_delay(CALL_BACKOFF_CAP)
        .map(jitter)
        .take(max_retries as usize);

    loop {
        let mut lease = pool.acquire(&name).await?;
        let started = Instant::now();
        let outcome = timeout(per_call, lease.client().generate(&request)).await;

        let failure = match outcome {
            Ok(Ok(response)) if response.is_valid() => {
                lease.record_success();
                breaker.record_success(&name);
                return Ok(response);
            }
            Ok(Ok(response)) => Error::backend(
                &name,
                response
                    .error
                    .unwrap_or_else(|| "blank response text".to_string()),
            ),
            Ok(Err(e)) => e,
            Err(_) => Error::Timeout {
                backend: name.clone(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            },
        };

        lease.record_failure();
        if failure.is_backend_failure() {
            breaker.record_failure(&name);
        }
        drop(lease);

        match delays.next() {
            Some(delay) => {
                warn!(backend = %name, retry_in_ms = delay.as_millis() as u64, "Backend call failed, retrying: {}", failure);
                tokio::time::sleep(delay).await;
            }
            None => return Err(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendClient, BackendSettings, SharedClient};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const AGREED: &str =
        "O direito real de habitacao garante ao conjuge sobrevivente permanencia no imovel da familia.";
    const AGREED_ALT: &str =
        "O conjuge sobrevivente tem direito real de habitacao sobre o imovel da familia, com permanencia garantida.";
    const OFF_TOPIC: &str =
        "A receita tradicional de caldo verde leva couve, batata e um fio de azeite no final.";

    #[derive(Clone)]
    struct ScriptedClient {
        name: String,
        text: Arc<Mutex<String>>,
        delay: Duration,
        fail_remaining: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedClient {
        fn new(name: &str, text: &str) -> Self {
            Self {
                name: name.to_string(),
                text: Arc::new(Mutex::new(text.to_string())),
                delay: Duration::ZERO,
                fail_remaining: Arc::new(AtomicUsize::new(0)),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn failing(self, times: usize) -> Self {
            self.fail_remaining.store(times, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl BackendClient for ScriptedClient {
        async fn generate(&self, request: &GenerationRequest) -> Result<BackendResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let remaining = self.fail_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                if remaining != usize::MAX {
                    self.fail_remaining.fetch_sub(1, Ordering::SeqCst);
                }
                return Err(Error::backend(&self.name, "scripted failure"));
            }
            let text = self.text.lock().clone();
            Ok(BackendResponse::ok(&self.name, &request.id, text, self.delay)
                .with_confidence(0.7))
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        async fn close(&self) {}

        fn backend_name(&self) -> &str {
            &self.name
        }
    }

    fn descriptor_for(client: &ScriptedClient, specializations: Vec<String>) -> BackendDescriptor {
        let defaults = BackendSettings {
            specializations,
            request_timeout: Duration::from_secs(5),
            max_retries: 1,
            ..Default::default()
        };
        let template = client.clone();
        BackendDescriptor::new(
            client.name.clone(),
            Vec::new(),
            defaults,
            Arc::new(move |_settings: &BackendSettings| {
                Ok(Arc::new(template.clone()) as SharedClient)
            }),
        )
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.rate_limit.requests_per_window = 100;
        config
    }

    fn dispatcher_with(clients: &[&ScriptedClient], config: &AppConfig) -> Dispatcher {
        let registry = Arc::new(BackendRegistry::new());
        for client in clients {
            registry.register(descriptor_for(client, Vec::new()));
        }
        Dispatcher::new(registry, config)
    }

    #[tokio::test]
    async fn test_dispatch_merges_agreeing_backends() {
        let a = ScriptedClient::new("alfa", AGREED);
        let b = ScriptedClient::new("beta", AGREED);
        let c = ScriptedClient::new("gama", AGREED);
        let d = dispatcher_with(&[&a, &b, &c], &test_config());

        let result = d
            .dispatch(DispatchRequest::new("Quem tem direito real de habitacao?"))
            .await
            .unwrap();

        assert_eq!(result.contributors.len(), 3);
        assert!(result.confidence >= 0.8);
        assert_eq!(result.text, AGREED);
        d.shutdown().await;
    }

    #[tokio::test]
    async fn test_blank_and_oversized_queries_rejected() {
        let a = ScriptedClient::new("alfa", AGREED);
        let mut config = test_config();
        config.dispatch.max_query_chars = 10;
        let d = dispatcher_with(&[&a], &config);

        let err = d.dispatch(DispatchRequest::new("   ")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = d
            .dispatch(DispatchRequest::new("uma pergunta bem mais longa que dez"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(a.calls.load(Ordering::SeqCst), 0);
        d.shutdown().await;
    }

    #[tokio::test]
    async fn test_rate_limit_per_caller() {
        let a = ScriptedClient::new("alfa", AGREED);
        let mut config = test_config();
        config.rate_limit.requests_per_window = 2;
        let d = dispatcher_with(&[&a], &config);

        let request = DispatchRequest::new("pergunta valida sobre habitacao").with_caller("tenant-1");
        d.dispatch(request.clone()).await.unwrap();
        d.dispatch(request.clone()).await.unwrap();

        let err = d.dispatch(request).await.unwrap_err();
        assert!(matches!(err, Error::RateLimited { caller } if caller == "tenant-1"));

        // A different caller still gets through.
        d.dispatch(
            DispatchRequest::new("pergunta valida sobre habitacao").with_caller("tenant-2"),
        )
        .await
        .unwrap();
        d.shutdown().await;
    }

    #[tokio::test]
    async fn test_degraded_dispatch_excludes_failed_backend() {
        let a = ScriptedClient::new("alfa", AGREED);
        let b = ScriptedClient::new("beta", AGREED);
        let broken = ScriptedClient::new("gama", AGREED).failing(usize::MAX);
        let d = dispatcher_with(&[&a, &b, &broken], &test_config());

        let result = d
            .dispatch(DispatchRequest::new("Quem tem direito real de habitacao?"))
            .await
            .unwrap();

        assert_eq!(result.contributors.len(), 2);
        assert!(!result.contributors.contains(&"gama".to_string()));
        d.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_circuits_leave_no_backends() {
        let a = ScriptedClient::new("alfa", AGREED);
        let b = ScriptedClient::new("beta", AGREED);
        let d = dispatcher_with(&[&a, &b], &test_config());

        for name in ["alfa", "beta"] {
            for _ in 0..5 {
                d.breaker.record_failure(name);
            }
        }

        let err = d
            .dispatch(DispatchRequest::new("pergunta valida sobre habitacao"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoBackendsAvailable));
        d.shutdown().await;
    }

    #[tokio::test]
    async fn test_low_confidence_error_carries_result() {
        let a = ScriptedClient::new("alfa", AGREED);
        let b = ScriptedClient::new("beta", AGREED_ALT);
        let d = dispatcher_with(&[&a, &b], &test_config());

        let err = d
            .dispatch(
                DispatchRequest::new("Quem tem direito real de habitacao?")
                    .with_min_confidence(0.95),
            )
            .await
            .unwrap_err();

        match err {
            Error::LowConfidence {
                confidence,
                required,
                result,
            } => {
                assert!(confidence < 0.95);
                assert!((required - 0.95).abs() < f64::EPSILON);
                assert_eq!(result.contributors.len(), 2);
            }
            other => panic!("expected LowConfidence, got {:?}", other),
        }
        d.shutdown().await;
    }

    #[tokio::test]
    async fn test_cache_serves_repeat_queries() {
        let a = ScriptedClient::new("alfa", AGREED);
        let mut config = test_config();
        config.cache.enabled = true;
        let d = dispatcher_with(&[&a], &config);

        let request = DispatchRequest::new("Quem tem direito real de habitacao?");
        let first = d.dispatch(request.clone()).await.unwrap();

        *a.text.lock() = OFF_TOPIC.to_string();
        let second = d.dispatch(request).await.unwrap();

        assert_eq!(first.text, second.text);
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        d.shutdown().await;
    }

    #[tokio::test]
    async fn test_specialized_backends_preferred_for_tag() {
        let legal_a = ScriptedClient::new("lex-a", AGREED);
        let legal_b = ScriptedClient::new("lex-b", AGREED);
        let generalist = ScriptedClient::new("geral", OFF_TOPIC);

        let registry = Arc::new(BackendRegistry::new());
        registry.register(descriptor_for(&legal_a, vec!["juridico".to_string()]));
        registry.register(descriptor_for(&legal_b, vec!["juridico".to_string()]));
        registry.register(descriptor_for(&generalist, Vec::new()));
        let d = Dispatcher::new(registry, &test_config());

        let result = d
            .dispatch(
                DispatchRequest::new("Quem tem direito real de habitacao?")
                    .with_context("juridico"),
            )
            .await
            .unwrap();

        let mut contributors = result.contributors.clone();
        contributors.sort_unstable();
        assert_eq!(contributors, vec!["lex-a".to_string(), "lex-b".to_string()]);
        assert_eq!(generalist.calls.load(Ordering::SeqCst), 0);
        d.shutdown().await;
    }

    #[tokio::test]
    async fn test_global_deadline_abandons_slow_backend() {
        let a = ScriptedClient::new("alfa", AGREED);
        let b = ScriptedClient::new("beta", AGREED);
        let slow = ScriptedClient::new("lento", AGREED).with_delay(Duration::from_secs(30));
        let mut config = test_config();
        config.dispatch.global_deadline_seconds = 1;
        let d = dispatcher_with(&[&a, &b, &slow], &config);

        let started = Instant::now();
        let result = d
            .dispatch(DispatchRequest::new("Quem tem direito real de habitacao?"))
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(result.contributors.len(), 2);
        assert!(!result.contributors.contains(&"lento".to_string()));
        d.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_call_is_retried() {
        let flaky = ScriptedClient::new("alfa", AGREED).failing(1);
        let d = dispatcher_with(&[&flaky], &test_config());

        let result = d
            .dispatch(DispatchRequest::new("Quem tem direito real de habitacao?"))
            .await
            .unwrap();

        assert_eq!(result.contributors, vec!["alfa".to_string()]);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
        d.shutdown().await;
    }

    #[tokio::test]
    async fn test_unconstructible_backend_does_not_sink_dispatch() {
        let a = ScriptedClient::new("alfa", AGREED);
        let b = ScriptedClient::new("beta", AGREED);

        let registry = Arc::new(BackendRegistry::new());
        registry.register(descriptor_for(&a, Vec::new()));
        registry.register(descriptor_for(&b, Vec::new()));
        registry.register(BackendDescriptor::new(
            "fantasma",
            Vec::new(),
            BackendSettings::default(),
            Arc::new(|_settings: &BackendSettings| {
                Err(Error::construction("fantasma", "no such binary"))
            }),
        ));
        let d = Dispatcher::new(registry, &test_config());

        let result = d
            .dispatch(DispatchRequest::new("Quem tem direito real de habitacao?"))
            .await
            .unwrap();

        assert_eq!(result.contributors.len(), 2);
        assert!(!result.contributors.contains(&"fantasma".to_string()));
        d.shutdown().await;
    }

    #[tokio::test]
    async fn test_dispatch_is_idempotent() {
        let a = ScriptedClient::new("alfa", AGREED);
        let b = ScriptedClient::new("beta", AGREED);
        let d = dispatcher_with(&[&a, &b], &test_config());

        let request = DispatchRequest::new("Quem tem direito real de habitacao?");
        let first = d.dispatch(request.clone()).await.unwrap();
        let second = d.dispatch(request).await.unwrap();

        assert_eq!(first.text, second.text);
        assert_eq!(first.confidence, second.confidence);
        d.shutdown().await;
    }

    #[tokio::test]
    async fn test_diagnostics_expose_pool_and_breaker() {
        let a = ScriptedClient::new("alfa", AGREED);
        let d = dispatcher_with(&[&a], &test_config());

        d.dispatch(DispatchRequest::new("Quem tem direito real de habitacao?"))
            .await
            .unwrap();

        assert_eq!(d.known_models(), vec!["alfa".to_string()]);
        let stats = d.pool_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].acquisitions, 1);
        assert_eq!(d.global_stats().total_acquisitions, 1);
        assert!(d.breaker_snapshot().is_empty());
        d.shutdown().await;
    }
}
