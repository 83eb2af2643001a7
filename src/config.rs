use crate::error::HarnessError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const ENDPOINT_VAR: &str = "AZURE_OPENAI_ENDPOINT";
pub const DEPLOYMENT_VAR: &str = "AZURE_OPENAI_DEPLOYMENT_NAME";
pub const API_VERSION_VAR: &str = "AZURE_OPENAI_API_VERSION";
pub const API_KEY_VAR: &str = "AZURE_OPENAI_API_KEY";

/// How the chat client authenticates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    /// Static key read from the variable named by `env_var_api_key`
    ApiKey,
    /// Bearer token obtained from the Azure CLI login
    AzureCli,
}

/// Retry policy for transient chat completion failures
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 propagates the first failure
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Configuration for a single agent run and its evaluation
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Chat completion service URL
    #[serde(default)]
    pub endpoint: String,
    /// Deployment (model) identifier
    #[serde(default)]
    pub deployment: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Environment variable name containing the API key
    #[serde(default = "default_api_key_env")]
    pub env_var_api_key: String,
    /// Credential used for the chat client; chosen from the environment when absent
    #[serde(default)]
    pub credential: Option<CredentialSource>,
    #[serde(default = "default_agent_name")]
    pub agent_name: String,
    #[serde(default = "default_agent_instructions")]
    pub agent_instructions: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_user_prompt")]
    pub user_prompt: String,
    /// Identifier of the evaluated scenario, part of the cache key
    #[serde(default = "default_scenario_id")]
    pub scenario_id: String,
    /// Directory holding cached evaluation results
    #[serde(default = "default_storage_path")]
    pub storage_path: String,
    /// Cached results older than this are evaluated again
    #[serde(default = "default_cache_ttl_days")]
    pub cache_ttl_days: u32,
    /// Temperature for judge model requests
    #[serde(default = "default_judge_temperature")]
    pub judge_temperature: f32,
    /// Deadline for each evaluator; none when absent
    #[serde(default)]
    pub evaluator_timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_api_version() -> String {
    "2024-10-21".to_string()
}

fn default_api_key_env() -> String {
    API_KEY_VAR.to_string()
}

fn default_agent_name() -> String {
    "Joker".to_string()
}

fn default_agent_instructions() -> String {
    "You are good at telling jokes.".to_string()
}

fn default_system_prompt() -> String {
    "You are a helpful assistant. Always respond in Japanese.".to_string()
}

fn default_user_prompt() -> String {
    "Tell me a joke about a pirate.".to_string()
}

fn default_scenario_id() -> String {
    "pirate-joke".to_string()
}

fn default_storage_path() -> String {
    ".eval-cache".to_string()
}

fn default_cache_ttl_days() -> u32 {
    14
}

fn default_judge_temperature() -> f32 {
    0.0
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            deployment: String::new(),
            api_version: default_api_version(),
            env_var_api_key: default_api_key_env(),
            credential: None,
            agent_name: default_agent_name(),
            agent_instructions: default_agent_instructions(),
            system_prompt: default_system_prompt(),
            user_prompt: default_user_prompt(),
            scenario_id: default_scenario_id(),
            storage_path: default_storage_path(),
            cache_ttl_days: default_cache_ttl_days(),
            judge_temperature: default_judge_temperature(),
            evaluator_timeout_secs: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config: {}", path.display()))
    }

    /// Build the configuration from the process environment
    pub fn from_env() -> Result<Self, HarnessError> {
        Self::default().with_lookup(|key| std::env::var(key).ok())
    }

    /// Overlay values found through `lookup` and validate the result.
    ///
    /// Endpoint and deployment from the environment take precedence over
    /// the run file.
    pub fn with_lookup<F>(mut self, lookup: F) -> Result<Self, HarnessError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(endpoint) = non_empty(ENDPOINT_VAR) {
            self.endpoint = endpoint;
        }
        if let Some(deployment) = non_empty(DEPLOYMENT_VAR) {
            self.deployment = deployment;
        }
        if let Some(api_version) = non_empty(API_VERSION_VAR) {
            self.api_version = api_version;
        }
        if self.credential.is_none() {
            self.credential = Some(match non_empty(self.env_var_api_key.as_str()) {
                Some(_) => CredentialSource::ApiKey,
                None => CredentialSource::AzureCli,
            });
        }

        self.validate()?;
        Ok(self)
    }

    /// Check that every required key is present
    pub fn validate(&self) -> Result<(), HarnessError> {
        let required = [
            (ENDPOINT_VAR, &self.endpoint),
            (DEPLOYMENT_VAR, &self.deployment),
        ];

        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(HarnessError::ConfigurationMissing(key.to_string()));
            }
        }

        Ok(())
    }

    /// The evaluator deadline, if one is configured
    pub fn evaluator_timeout(&self) -> Option<std::time::Duration> {
        self.evaluator_timeout_secs
            .map(std::time::Duration::from_secs)
    }

    /// The cache entry lifetime
    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.cache_ttl_days))
    }
}
