use crate::error::HarnessError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Speaker of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A role-tagged chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Score produced by an evaluator, numeric or categorical
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Category(String),
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Number(n) => write!(f, "{:.1}", n),
            MetricValue::Category(c) => write!(f, "{}", c),
        }
    }
}

/// Severity of a diagnostic attached to a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub message: String,
    pub severity: Severity,
}

impl Diagnostic {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Info,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Warning,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Error,
        }
    }
}

/// Qualitative label for a score on the 1 to 5 judging scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    Unacceptable,
    Poor,
    Average,
    Good,
    Exceptional,
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Rating::Unacceptable => "Unacceptable",
            Rating::Poor => "Poor",
            Rating::Average => "Average",
            Rating::Good => "Good",
            Rating::Exceptional => "Exceptional",
        };
        write!(f, "{}", label)
    }
}

/// Interpretation derived from a metric's value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interpretation {
    pub rating: Rating,
    /// True when the score falls below the pass mark of 4
    pub failed: bool,
}

impl Interpretation {
    pub fn from_score(score: f64) -> Self {
        let rating = if score >= 5.0 {
            Rating::Exceptional
        } else if score >= 4.0 {
            Rating::Good
        } else if score >= 3.0 {
            Rating::Average
        } else if score >= 2.0 {
            Rating::Poor
        } else {
            Rating::Unacceptable
        };

        Self {
            rating,
            failed: score < 4.0,
        }
    }
}

/// Output of one evaluator for one scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Evaluated dimension, e.g. "coherence"
    pub name: String,
    /// Score, absent on a degraded record
    pub value: Option<MetricValue>,
    /// Human-readable justification
    pub reason: String,
    #[serde(default)]
    pub interpretation: Option<Interpretation>,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl MetricRecord {
    /// Create a scored record with its interpretation derived from the score
    pub fn numeric(name: impl Into<String>, score: f64, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(MetricValue::Number(score)),
            reason: reason.into(),
            interpretation: Some(Interpretation::from_score(score)),
            diagnostics: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Record substituted for an evaluator that failed
    pub fn degraded(name: impl Into<String>, err: &HarnessError) -> Self {
        Self {
            name: name.into(),
            value: None,
            reason: err.to_string(),
            interpretation: None,
            diagnostics: vec![Diagnostic::error(err.to_string())],
            metadata: BTreeMap::new(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }
}

/// Metric records keyed by metric name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub metrics: BTreeMap<String, MetricRecord>,
}

impl EvaluationResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record under its own name, replacing any earlier record of
    /// that name
    pub fn insert(&mut self, record: MetricRecord) {
        self.metrics.insert(record.name.clone(), record);
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<&MetricRecord> {
        self.metrics.get(name)
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// True if any metric carries an error diagnostic
    pub fn has_errors(&self) -> bool {
        self.metrics.values().any(MetricRecord::is_degraded)
    }
}

impl FromIterator<MetricRecord> for EvaluationResult {
    fn from_iter<I: IntoIterator<Item = MetricRecord>>(iter: I) -> Self {
        let mut result = EvaluationResult::new();
        for record in iter {
            result.insert(record);
        }
        result
    }
}

/// One fixed conversation and the assistant reply being judged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    identifier: String,
    conversation_input: Vec<ChatMessage>,
    conversation_output: ChatMessage,
}

impl Scenario {
    pub fn new(
        identifier: impl Into<String>,
        conversation_input: Vec<ChatMessage>,
        conversation_output: ChatMessage,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            conversation_input,
            conversation_output,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn conversation_input(&self) -> &[ChatMessage] {
        &self.conversation_input
    }

    pub fn conversation_output(&self) -> &ChatMessage {
        &self.conversation_output
    }

    /// Deterministic key over the scenario and the evaluator set.
    ///
    /// Evaluator names are sorted first so the key does not depend on the
    /// order evaluators were registered in. Every field is length-prefixed.
    pub fn cache_key<S: AsRef<str>>(&self, evaluator_names: &[S]) -> String {
        let mut names: Vec<&str> = evaluator_names.iter().map(|n| n.as_ref()).collect();
        names.sort_unstable();
        names.dedup();

        let mut hasher = Sha256::new();
        let mut update = |field: &str| {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        };

        update(&self.identifier);
        for name in names {
            update(name);
        }
        for message in &self.conversation_input {
            update(&message.role.to_string());
            update(&message.content);
        }
        update(&self.conversation_output.role.to_string());
        update(&self.conversation_output.content);

        format!("{:x}", hasher.finalize())
    }
}

/// Evaluation result as persisted in the reporting store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub key: String,
    pub scenario_id: String,
    pub created_at: DateTime<Utc>,
    pub result: EvaluationResult,
}

impl StoredResult {
    pub fn new(key: impl Into<String>, scenario_id: impl Into<String>, result: EvaluationResult) -> Self {
        Self {
            key: key.into(),
            scenario_id: scenario_id.into(),
            created_at: Utc::now(),
            result,
        }
    }
}
