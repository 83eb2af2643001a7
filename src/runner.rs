use crate::error::HarnessError;
use crate::evaluation::Evaluator;
use crate::models::{ChatMessage, EvaluationResult, MetricRecord, Scenario, StoredResult};
use crate::store::ReportingStore;
use futures::future::try_join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Result of one evaluation run
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// Cache key the result is stored under
    pub key: String,
    pub result: EvaluationResult,
    /// True when the result came from the reporting store
    pub cached: bool,
}

/// Runs a set of evaluators over a scenario, memoizing results in a store
pub struct EvaluationRun {
    store: Arc<dyn ReportingStore>,
    evaluators: Vec<Arc<dyn Evaluator>>,
    evaluator_timeout: Option<Duration>,
}

impl EvaluationRun {
    /// Create a run over `evaluators`; later evaluators sharing a name with
    /// an earlier one are dropped
    pub fn new(store: Arc<dyn ReportingStore>, evaluators: Vec<Arc<dyn Evaluator>>) -> Self {
        let mut seen = HashSet::new();
        let evaluators = evaluators
            .into_iter()
            .filter(|evaluator| {
                let unique = seen.insert(evaluator.name().to_string());
                if !unique {
                    warn!(evaluator = evaluator.name(), "Ignoring duplicate evaluator");
                }
                unique
            })
            .collect();

        Self {
            store,
            evaluators,
            evaluator_timeout: None,
        }
    }

    /// Deadline applied to each evaluator call
    pub fn with_evaluator_timeout(mut self, limit: Option<Duration>) -> Self {
        self.evaluator_timeout = limit;
        self
    }

    pub fn evaluator_names(&self) -> Vec<&str> {
        self.evaluators.iter().map(|e| e.name()).collect()
    }

    /// Evaluate the scenario, or return the stored result for it.
    ///
    /// Dropping the returned future cancels every outstanding evaluator call;
    /// nothing is written until all evaluators have finished.
    pub async fn run(&self, scenario: &Scenario) -> Result<RunOutcome, HarnessError> {
        let names = self.evaluator_names();
        let key = scenario.cache_key(names.as_slice());

        if let Some(entry) = self.store.get(&key).await? {
            info!(scenario = scenario.identifier(), key = %key, "Using cached evaluation result");
            return Ok(RunOutcome {
                key,
                result: entry.result,
                cached: true,
            });
        }

        info!(
            scenario = scenario.identifier(),
            evaluators = self.evaluators.len(),
            "Running evaluators"
        );
        let input = scenario.conversation_input();
        let output = scenario.conversation_output();
        let records = try_join_all(
            self.evaluators
                .iter()
                .map(|evaluator| self.invoke(evaluator.as_ref(), input, output)),
        )
        .await?;

        let result: EvaluationResult = records.into_iter().collect();
        if result.has_errors() {
            warn!(
                scenario = scenario.identifier(),
                key = %key,
                "Some evaluators failed; the degraded result stays cached under this key until it expires (use --no-cache to re-evaluate)"
            );
        }
        debug!(metrics = result.len(), key = %key, "Persisting evaluation result");
        self.store
            .put(StoredResult::new(&key, scenario.identifier(), result.clone()))
            .await?;

        Ok(RunOutcome {
            key,
            result,
            cached: false,
        })
    }

    /// Call one evaluator, turning evaluator-scoped failures into a
    /// degraded record
    async fn invoke(
        &self,
        evaluator: &dyn Evaluator,
        input: &[ChatMessage],
        output: &ChatMessage,
    ) -> Result<MetricRecord, HarnessError> {
        let name = evaluator.name();
        let call = evaluator.evaluate(input, output);

        let outcome = match self.evaluator_timeout {
            Some(limit) => match timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => Err(HarnessError::EvaluatorUnavailable {
                    evaluator: name.to_string(),
                    reason: format!("No result within {:?}", limit),
                }),
            },
            None => call.await,
        };

        match outcome {
            Ok(mut record) => {
                if record.name != name {
                    warn!(evaluator = name, record = %record.name, "Evaluator returned a record under another name");
                    record.name = name.to_string();
                }
                debug!(evaluator = name, "Evaluator finished");
                Ok(record)
            }
            Err(err) if err.is_evaluator_scoped() => {
                warn!(evaluator = name, "Evaluator failed: {}", err);
                Ok(MetricRecord::degraded(name, &err))
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::tests::ScriptedChatClient;
    use crate::chat::ChatClient;
    use crate::evaluation::builtin_evaluators;
    use crate::models::{MetricValue, Severity};
    use crate::store::{DiskStore, MemoryStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Evaluator returning a fixed outcome after an optional delay
    struct StubEvaluator {
        name: String,
        outcome: Result<f64, HarnessError>,
        delay: Option<Duration>,
        calls: AtomicUsize,
    }

    impl StubEvaluator {
        fn scoring(name: &str, score: f64) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                outcome: Ok(score),
                delay: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(name: &str, err: HarnessError) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                outcome: Err(err),
                delay: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn slow(name: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                outcome: Ok(3.0),
                delay: Some(delay),
                calls: AtomicUsize::new(0),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Evaluator for StubEvaluator {
        fn name(&self) -> &str {
            &self.name
        }

        async fn evaluate(
            &self,
            _input: &[ChatMessage],
            _output: &ChatMessage,
        ) -> Result<MetricRecord, HarnessError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.outcome {
                Ok(score) => Ok(MetricRecord::numeric(&self.name, *score, "stub reason")),
                Err(err) => Err(err.clone()),
            }
        }
    }

    fn pirate_scenario() -> Scenario {
        Scenario::new(
            "pirate-joke",
            vec![
                ChatMessage::system("Always respond in Japanese."),
                ChatMessage::user("Tell me a joke about a pirate."),
            ],
            ChatMessage::assistant("海賊が好きな文字は？ アール（R）！"),
        )
    }

    #[tokio::test]
    async fn test_pirate_scenario_with_builtin_evaluators() {
        let judge = Arc::new(ScriptedChatClient::always(
            r#"{"score": 4, "reason": "Clear, natural and on topic."}"#,
        ));
        let client: Arc<dyn ChatClient> = judge.clone();
        let store = Arc::new(MemoryStore::new());
        let run = EvaluationRun::new(store.clone(), builtin_evaluators(client, "gpt-4o-mini", 0.0));

        let first = run.run(&pirate_scenario()).await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.result.len(), 3);
        for name in ["coherence", "fluency", "relevance"] {
            let record = first.result.get(name).unwrap();
            assert!(!record.reason.is_empty());
            assert!(matches!(record.value, Some(MetricValue::Number(_))));
        }
        assert_eq!(judge.call_count(), 3);

        let second = run.run(&pirate_scenario()).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.result, first.result);
        assert_eq!(judge.call_count(), 3);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_cache_hit_survives_restart() {
        let temp_dir = tempdir().unwrap();
        let coherence = StubEvaluator::scoring("coherence", 5.0);

        {
            let store = Arc::new(DiskStore::open(temp_dir.path()).await.unwrap());
            let run = EvaluationRun::new(store, vec![coherence.clone()]);
            assert!(!run.run(&pirate_scenario()).await.unwrap().cached);
        }

        let store = Arc::new(DiskStore::open(temp_dir.path()).await.unwrap());
        let run = EvaluationRun::new(store, vec![coherence.clone()]);
        let outcome = run.run(&pirate_scenario()).await.unwrap();

        assert!(outcome.cached);
        assert_eq!(coherence.call_count(), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_yields_degraded_record() {
        let store = Arc::new(MemoryStore::new());
        let run = EvaluationRun::new(
            store,
            vec![
                StubEvaluator::scoring("coherence", 4.0),
                StubEvaluator::failing(
                    "fluency",
                    HarnessError::EvaluationFailed {
                        evaluator: "fluency".to_string(),
                        reason: "judge refused".to_string(),
                    },
                ),
                StubEvaluator::failing(
                    "relevance",
                    HarnessError::EvaluatorUnavailable {
                        evaluator: "relevance".to_string(),
                        reason: "connection reset".to_string(),
                    },
                ),
            ],
        );

        let outcome = run.run(&pirate_scenario()).await.unwrap();
        let result = outcome.result;

        assert_eq!(result.len(), 3);
        assert_eq!(
            result.get("coherence").unwrap().value,
            Some(MetricValue::Number(4.0))
        );
        for name in ["fluency", "relevance"] {
            let record = result.get(name).unwrap();
            assert!(record.value.is_none());
            assert_eq!(record.diagnostics[0].severity, Severity::Error);
        }
        assert!(result.has_errors());
        for (key, record) in &result.metrics {
            assert_eq!(key, &record.name);
        }
    }

    #[tokio::test]
    async fn test_degraded_result_is_served_from_cache() {
        let store = Arc::new(MemoryStore::new());
        let relevance = StubEvaluator::failing(
            "relevance",
            HarnessError::EvaluatorUnavailable {
                evaluator: "relevance".to_string(),
                reason: "connection reset".to_string(),
            },
        );
        let run = EvaluationRun::new(
            store.clone(),
            vec![StubEvaluator::scoring("coherence", 4.0), relevance.clone()],
        );

        let first = run.run(&pirate_scenario()).await.unwrap();
        let second = run.run(&pirate_scenario()).await.unwrap();

        assert!(first.result.has_errors());
        assert!(second.cached);
        assert!(second.result.get("relevance").unwrap().is_degraded());
        assert_eq!(relevance.call_count(), 1);

        let fresh = EvaluationRun::new(Arc::new(MemoryStore::new()), vec![relevance.clone()]);
        assert!(!fresh.run(&pirate_scenario()).await.unwrap().cached);
        assert_eq!(relevance.call_count(), 2);
    }

    #[tokio::test]
    async fn test_timeout_degrades_pending_evaluator() {
        let store = Arc::new(MemoryStore::new());
        let run = EvaluationRun::new(
            store,
            vec![
                StubEvaluator::scoring("coherence", 4.0),
                StubEvaluator::slow("fluency", Duration::from_secs(30)),
            ],
        )
        .with_evaluator_timeout(Some(Duration::from_millis(20)));

        let outcome = run.run(&pirate_scenario()).await.unwrap();
        let fluency = outcome.result.get("fluency").unwrap();

        assert!(fluency.is_degraded());
        assert!(fluency.reason.contains("unavailable"));
        assert!(outcome.result.get("coherence").unwrap().value.is_some());
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_without_write() {
        let store = Arc::new(MemoryStore::new());
        let run = EvaluationRun::new(
            store.clone(),
            vec![
                StubEvaluator::scoring("coherence", 4.0),
                StubEvaluator::failing(
                    "fluency",
                    HarnessError::Authentication("token expired".to_string()),
                ),
            ],
        );

        let err = run.run(&pirate_scenario()).await.unwrap_err();
        assert!(matches!(err, HarnessError::Authentication(_)));
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_persists_nothing() {
        let store = Arc::new(MemoryStore::new());
        let run = EvaluationRun::new(
            store.clone(),
            vec![
                StubEvaluator::scoring("coherence", 4.0),
                StubEvaluator::slow("fluency", Duration::from_secs(30)),
            ],
        );

        let cancelled = timeout(Duration::from_millis(20), run.run(&pirate_scenario())).await;
        assert!(cancelled.is_err());
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_evaluators_run_concurrently() {
        let store = Arc::new(MemoryStore::new());
        let run = EvaluationRun::new(
            store,
            vec![
                StubEvaluator::slow("coherence", Duration::from_millis(200)),
                StubEvaluator::slow("fluency", Duration::from_millis(200)),
                StubEvaluator::slow("relevance", Duration::from_millis(200)),
            ],
        );

        let start = std::time::Instant::now();
        run.run(&pirate_scenario()).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(550));
    }

    #[tokio::test]
    async fn test_different_evaluator_set_is_not_a_cache_hit() {
        let store = Arc::new(MemoryStore::new());
        let coherence = StubEvaluator::scoring("coherence", 4.0);

        let narrow = EvaluationRun::new(store.clone(), vec![coherence.clone()]);
        narrow.run(&pirate_scenario()).await.unwrap();

        let wide = EvaluationRun::new(
            store.clone(),
            vec![coherence.clone(), StubEvaluator::scoring("fluency", 5.0)],
        );
        let outcome = wide.run(&pirate_scenario()).await.unwrap();

        assert!(!outcome.cached);
        assert_eq!(outcome.result.len(), 2);
        assert_eq!(coherence.call_count(), 2);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_duplicate_evaluators_are_dropped() {
        let store = Arc::new(MemoryStore::new());
        let first = StubEvaluator::scoring("coherence", 4.0);
        let duplicate = StubEvaluator::scoring("coherence", 1.0);
        let run = EvaluationRun::new(store, vec![first.clone(), duplicate.clone()]);

        assert_eq!(run.evaluator_names(), vec!["coherence"]);
        let outcome = run.run(&pirate_scenario()).await.unwrap();
        assert_eq!(
            outcome.result.get("coherence").unwrap().value,
            Some(MetricValue::Number(4.0))
        );
        assert_eq!(duplicate.call_count(), 0);
    }
}
