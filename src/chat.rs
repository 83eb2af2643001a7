use crate::config::{Config, CredentialSource, RetryPolicy};
use crate::error::HarnessError;
use crate::models::{ChatMessage, Role};
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

const COGNITIVE_SERVICES_RESOURCE: &str = "https://cognitiveservices.azure.com";

/// Per-request generation options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionOptions {
    pub temperature: Option<f32>,
}

/// Reply from the chat completion service
#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    /// The assistant message
    pub message: ChatMessage,
    /// Metadata about the response (tokens used, etc.)
    pub metadata: BTreeMap<String, String>,
}

/// A chat completion service
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        model: &str,
        options: &CompletionOptions,
    ) -> Result<ModelResponse, HarnessError>;
}

/// Header carrying the credential on each request
#[derive(Debug, Clone, PartialEq)]
pub struct AuthHeader {
    pub name: &'static str,
    pub value: String,
}

/// Source of the credential sent to the chat completion service
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn authorization(&self) -> Result<AuthHeader, HarnessError>;
}

/// Static API key sent in the `api-key` header
pub struct ApiKeyCredential {
    key: String,
}

impl ApiKeyCredential {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// Read the key from the named environment variable
    pub fn from_env(var: &str) -> Result<Self, HarnessError> {
        match std::env::var(var) {
            Ok(key) if !key.trim().is_empty() => Ok(Self::new(key)),
            _ => Err(HarnessError::ConfigurationMissing(var.to_string())),
        }
    }
}

#[async_trait]
impl CredentialProvider for ApiKeyCredential {
    async fn authorization(&self) -> Result<AuthHeader, HarnessError> {
        Ok(AuthHeader {
            name: "api-key",
            value: self.key.clone(),
        })
    }
}

/// Bearer token from the signed-in Azure CLI account.
///
/// The token is fetched on first use and reused for the life of the process.
pub struct AzureCliCredential {
    token: Mutex<Option<String>>,
}

impl Default for AzureCliCredential {
    fn default() -> Self {
        Self::new()
    }
}

impl AzureCliCredential {
    pub fn new() -> Self {
        Self {
            token: Mutex::new(None),
        }
    }

    async fn fetch_token() -> Result<String, HarnessError> {
        debug!("Requesting access token from Azure CLI");
        let output = Command::new("az")
            .args([
                "account",
                "get-access-token",
                "--resource",
                COGNITIVE_SERVICES_RESOURCE,
                "--query",
                "accessToken",
                "--output",
                "tsv",
            ])
            .output()
            .await
            .map_err(|e| HarnessError::Authentication(format!("Failed to run Azure CLI: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HarnessError::Authentication(format!(
                "Azure CLI could not provide a token: {}",
                stderr.trim()
            )));
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(HarnessError::Authentication(
                "Azure CLI returned an empty token".to_string(),
            ));
        }
        Ok(token)
    }
}

#[async_trait]
impl CredentialProvider for AzureCliCredential {
    async fn authorization(&self) -> Result<AuthHeader, HarnessError> {
        let mut cached = self.token.lock().await;
        let token = match cached.as_ref() {
            Some(token) => token.clone(),
            None => {
                let token = Self::fetch_token().await?;
                *cached = Some(token.clone());
                token
            }
        };

        Ok(AuthHeader {
            name: "Authorization",
            value: format!("Bearer {}", token),
        })
    }
}

/// Build the credential provider selected by the configuration
pub fn credential_from_config(config: &Config) -> Result<Arc<dyn CredentialProvider>, HarnessError> {
    match config.credential.unwrap_or(CredentialSource::AzureCli) {
        CredentialSource::ApiKey => Ok(Arc::new(ApiKeyCredential::from_env(&config.env_var_api_key)?)),
        CredentialSource::AzureCli => Ok(Arc::new(AzureCliCredential::new())),
    }
}

/// Client for Azure OpenAI chat completion deployments
pub struct AzureChatClient {
    http: reqwest::Client,
    endpoint: String,
    api_version: String,
    credential: Arc<dyn CredentialProvider>,
}

impl AzureChatClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_version: impl Into<String>,
        credential: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_version: api_version.into(),
            credential,
        }
    }

    /// Create a client from the configuration's endpoint and credential
    pub fn from_config(config: &Config) -> Result<Self, HarnessError> {
        config.validate()?;
        let credential = credential_from_config(config)?;
        Ok(Self::new(&config.endpoint, &config.api_version, credential))
    }

    fn completions_url(&self, deployment: &str) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions",
            self.endpoint.trim_end_matches('/'),
            deployment
        )
    }

    /// Build the chat completion request
    fn build_request(
        &self,
        messages: &[ChatMessage],
        model: &str,
        options: &CompletionOptions,
    ) -> Result<CreateChatCompletionRequest, HarnessError> {
        let request_messages = messages
            .iter()
            .map(to_request_message)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| HarnessError::InvalidRequest(format!("Failed to build message: {}", e)))?;

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(model).messages(request_messages);
        if let Some(temperature) = options.temperature {
            builder.temperature(temperature);
        }

        builder
            .build()
            .map_err(|e| HarnessError::InvalidRequest(format!("Failed to build chat completion request: {}", e)))
    }

    /// Execute the request and classify failures
    async fn execute_request(
        &self,
        model: &str,
        request: &CreateChatCompletionRequest,
    ) -> Result<CreateChatCompletionResponse, HarnessError> {
        let auth = self.credential.authorization().await?;

        let response = self
            .http
            .post(self.completions_url(model))
            .query(&[("api-version", self.api_version.as_str())])
            .header(auth.name, auth.value)
            .json(request)
            .send()
            .await
            .map_err(|e| HarnessError::ServiceUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        response
            .json::<CreateChatCompletionResponse>()
            .await
            .map_err(|e| HarnessError::ServiceUnavailable(format!("Malformed completion response: {}", e)))
    }
}

#[async_trait]
impl ChatClient for AzureChatClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        model: &str,
        options: &CompletionOptions,
    ) -> Result<ModelResponse, HarnessError> {
        let request = self.build_request(messages, model, options)?;
        debug!(model, messages = messages.len(), "Sending chat completion request");
        let response = self.execute_request(model, &request).await?;
        Ok(extract_model_response(response))
    }
}

fn to_request_message(message: &ChatMessage) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    let content = message.content.clone();
    let request_message = match message.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(content)
            .build()?
            .into(),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(content)
            .build()?
            .into(),
        Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(content)
            .build()?
            .into(),
    };
    Ok(request_message)
}

fn classify_status(status: StatusCode, body: String) -> HarnessError {
    let detail = format!("{}: {}", status, body.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => HarnessError::Authentication(detail),
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => HarnessError::InvalidRequest(detail),
        _ => HarnessError::ServiceUnavailable(detail),
    }
}

/// Extract ModelResponse from the API response
fn extract_model_response(response: CreateChatCompletionResponse) -> ModelResponse {
    let content = match response.choices.first() {
        Some(choice) => choice.message.content.clone().unwrap_or_default(),
        None => String::new(),
    };

    let mut metadata = BTreeMap::new();
    metadata.insert("model".to_string(), response.model.clone());
    if let Some(usage) = response.usage {
        metadata.insert("prompt_tokens".to_string(), usage.prompt_tokens.to_string());
        metadata.insert("completion_tokens".to_string(), usage.completion_tokens.to_string());
        metadata.insert("total_tokens".to_string(), usage.total_tokens.to_string());
    }

    ModelResponse {
        message: ChatMessage::assistant(content),
        metadata,
    }
}

/// Chat client that retries transient failures with capped exponential backoff
pub struct RetryingChatClient {
    inner: Arc<dyn ChatClient>,
    policy: RetryPolicy,
}

impl RetryingChatClient {
    pub fn new(inner: Arc<dyn ChatClient>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let delay = self
            .policy
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(16));
        Duration::from_millis(delay.min(self.policy.max_delay_ms))
    }
}

#[async_trait]
impl ChatClient for RetryingChatClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        model: &str,
        options: &CompletionOptions,
    ) -> Result<ModelResponse, HarnessError> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(messages, model, options).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_transient() && attempt < self.policy.max_retries => {
                    let delay = self.backoff(attempt);
                    let delay_ms = delay.as_millis() as u64;
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.policy.max_retries,
                        delay_ms,
                        "Chat completion failed, retrying: {}",
                        err
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
