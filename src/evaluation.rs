use crate::chat::{ChatClient, CompletionOptions};
use crate::error::HarnessError;
use crate::models::{ChatMessage, Diagnostic, MetricRecord, Role};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

const MIN_SCORE: f64 = 1.0;
const MAX_SCORE: f64 = 5.0;

/// Scores one assistant reply to a conversation
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Name of the metric this evaluator produces
    fn name(&self) -> &str;

    async fn evaluate(
        &self,
        input: &[ChatMessage],
        output: &ChatMessage,
    ) -> Result<MetricRecord, HarnessError>;
}

/// Quality dimension judged by a [`JudgeEvaluator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rubric {
    Coherence,
    Fluency,
    Relevance,
}

impl Rubric {
    pub const ALL: [Rubric; 3] = [Rubric::Coherence, Rubric::Fluency, Rubric::Relevance];

    pub fn metric_name(&self) -> &'static str {
        match self {
            Rubric::Coherence => "coherence",
            Rubric::Fluency => "fluency",
            Rubric::Relevance => "relevance",
        }
    }

    /// What the judge is asked to assess
    fn criteria(&self) -> &'static str {
        match self {
            Rubric::Coherence => {
                "Coherence measures how well the response reads as a whole: ideas are \
                 logically ordered, connected, and easy to follow, and the response \
                 directly and sensibly addresses the user's request."
            }
            Rubric::Fluency => {
                "Fluency measures the quality of the language itself: grammar, \
                 vocabulary range, sentence structure, and how natural the text reads \
                 to a proficient speaker of the language it is written in. Judge only \
                 the writing, not whether the content is correct."
            }
            Rubric::Relevance => {
                "Relevance measures how well the response addresses the user's request \
                 and follows the instructions in the conversation, including any \
                 constraints set by the system message, without drifting off topic."
            }
        }
    }

    /// Anchors for each point of the 1 to 5 scale
    fn scale(&self) -> &'static str {
        match self {
            Rubric::Coherence => {
                "1 - Incoherent: disjointed or nonsensical.\n\
                 2 - Poorly coherent: fragmented, hard to follow.\n\
                 3 - Partially coherent: understandable but with gaps.\n\
                 4 - Coherent: well organized with clear connections.\n\
                 5 - Highly coherent: seamless, sophisticated flow."
            }
            Rubric::Fluency => {
                "1 - Emergent: frequent errors, barely readable.\n\
                 2 - Basic: simple sentences with noticeable errors.\n\
                 3 - Competent: clear with occasional errors.\n\
                 4 - Proficient: varied structure, few errors.\n\
                 5 - Exceptional: polished and natural throughout."
            }
            Rubric::Relevance => {
                "1 - Irrelevant: does not address the request.\n\
                 2 - Weak: touches the topic but misses the point.\n\
                 3 - Partial: addresses the request with notable gaps.\n\
                 4 - Relevant: addresses the request and its constraints.\n\
                 5 - Fully relevant: complete, precise, honours every constraint."
            }
        }
    }
}

/// Evaluator that asks a judge model to score a reply against a rubric
pub struct JudgeEvaluator {
    rubric: Rubric,
    client: Arc<dyn ChatClient>,
    model: String,
    temperature: f32,
}

impl JudgeEvaluator {
    pub fn new(rubric: Rubric, client: Arc<dyn ChatClient>, model: impl Into<String>) -> Self {
        Self {
            rubric,
            client,
            model: model.into(),
            temperature: 0.0,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Build the judging conversation
    fn build_judge_messages(&self, input: &[ChatMessage], output: &ChatMessage) -> Vec<ChatMessage> {
        let system = format!(
            "You are an impartial judge evaluating the {name} of an AI assistant's response.\n\n\
             {criteria}\n\n\
             Rate the response on this scale:\n{scale}\n\n\
             Return only JSON of the form {{\"score\": <integer 1-5>, \"reason\": \"<one or two sentences>\"}}.",
            name = self.rubric.metric_name(),
            criteria = self.rubric.criteria(),
            scale = self.rubric.scale(),
        );

        let user = format!(
            "Conversation:\n{}\n\nResponse to Evaluate:\n{}",
            render_conversation(input),
            output.content
        );

        vec![ChatMessage::system(system), ChatMessage::user(user)]
    }

    fn unavailable(&self, reason: impl Into<String>) -> HarnessError {
        HarnessError::EvaluatorUnavailable {
            evaluator: self.rubric.metric_name().to_string(),
            reason: reason.into(),
        }
    }

    fn failed(&self, reason: impl Into<String>) -> HarnessError {
        HarnessError::EvaluationFailed {
            evaluator: self.rubric.metric_name().to_string(),
            reason: reason.into(),
        }
    }

    /// Turn the judge's reply into a metric record
    fn parse_judgement(&self, response: &str) -> Result<MetricRecord, HarnessError> {
        if response.trim().is_empty() {
            return Err(self.failed("Judge returned an empty response"));
        }

        let parsed = parse_json_response(response).map_err(|e| self.failed(format!("{:#}", e)))?;
        let score = extract_score(&parsed).ok_or_else(|| self.failed("Judge response has no numeric score"))?;

        if !(MIN_SCORE..=MAX_SCORE).contains(&score) {
            return Err(self.failed(format!(
                "Score {} is outside the {}-{} scale",
                score, MIN_SCORE, MAX_SCORE
            )));
        }

        let reason = parsed
            .get("reason")
            .and_then(|r| r.as_str())
            .map(str::trim)
            .filter(|r| !r.is_empty());

        let mut record = MetricRecord::numeric(
            self.rubric.metric_name(),
            score,
            reason.unwrap_or("No reason provided"),
        );
        if serde_json::from_str::<Value>(response.trim()).is_err() {
            record
                .diagnostics
                .push(Diagnostic::info("Judge wrapped its JSON verdict in other text"));
        }
        if reason.is_none() {
            record
                .diagnostics
                .push(Diagnostic::warning("Judge did not explain its score"));
        }

        Ok(record)
    }
}

#[async_trait]
impl Evaluator for JudgeEvaluator {
    fn name(&self) -> &str {
        self.rubric.metric_name()
    }

    async fn evaluate(
        &self,
        input: &[ChatMessage],
        output: &ChatMessage,
    ) -> Result<MetricRecord, HarnessError> {
        if output.content.trim().is_empty() {
            return Err(self.failed("The response to evaluate is empty"));
        }

        let messages = self.build_judge_messages(input, output);
        let options = CompletionOptions {
            temperature: Some(self.temperature),
        };

        debug!(evaluator = self.name(), model = %self.model, "Requesting judgement");
        let response = self
            .client
            .complete(&messages, &self.model, &options)
            .await
            .map_err(|err| match err {
                HarnessError::ServiceUnavailable(reason) => self.unavailable(reason),
                HarnessError::InvalidRequest(reason) => self.failed(reason),
                other => other,
            })?;

        let mut record = self.parse_judgement(&response.message.content)?;
        record
            .metadata
            .insert("judge_model".to_string(), self.model.clone());
        for (key, value) in response.metadata {
            if key.ends_with("_tokens") {
                record.metadata.insert(format!("judge_{}", key), value);
            }
        }

        Ok(record)
    }
}

/// The coherence, fluency and relevance evaluators sharing one judge
pub fn builtin_evaluators(
    client: Arc<dyn ChatClient>,
    model: &str,
    temperature: f32,
) -> Vec<Arc<dyn Evaluator>> {
    Rubric::ALL
        .iter()
        .map(|rubric| {
            Arc::new(JudgeEvaluator::new(*rubric, client.clone(), model).with_temperature(temperature))
                as Arc<dyn Evaluator>
        })
        .collect()
}

fn render_conversation(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| {
            let label = match m.role {
                Role::System => "System",
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            format!("{}: {}", label, m.content.trim())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse JSON from the response, handling embedded JSON
fn parse_json_response(response: &str) -> Result<Value> {
    match serde_json::from_str(response) {
        Ok(parsed) => Ok(parsed),
        Err(_) => try_extract_embedded_json(response),
    }
}

/// Try to extract JSON that might be embedded in text
fn try_extract_embedded_json(response: &str) -> Result<Value> {
    match response.find('{') {
        Some(start) => match response.rfind('}') {
            Some(end) if end > start => serde_json::from_str(&response[start..=end])
                .context("Failed to parse extracted JSON"),
            _ => bail!("Found opening brace but no closing brace in response"),
        },
        None => bail!("No JSON found in response"),
    }
}

/// Read the score as a number or a numeric string
fn extract_score(parsed: &Value) -> Option<f64> {
    match parsed.get("score")? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
