use crate::chat::{ChatClient, CompletionOptions, ModelResponse};
use crate::error::HarnessError;
use crate::models::ChatMessage;
use std::sync::Arc;
use tracing::info;

/// Chat client bound to a deployment and a fixed set of instructions
pub struct Agent {
    name: String,
    instructions: String,
    client: Arc<dyn ChatClient>,
    deployment: String,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        instructions: impl Into<String>,
        client: Arc<dyn ChatClient>,
        deployment: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            client,
            deployment: deployment.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send the conversation, prefixed with the agent's instructions
    pub async fn run(&self, messages: &[ChatMessage]) -> Result<ModelResponse, HarnessError> {
        let mut conversation = Vec::with_capacity(messages.len() + 1);
        if !self.instructions.trim().is_empty() {
            conversation.push(ChatMessage::system(self.instructions.clone()));
        }
        conversation.extend_from_slice(messages);

        info!(agent = %self.name, deployment = %self.deployment, "Running agent");
        self.client
            .complete(&conversation, &self.deployment, &CompletionOptions::default())
            .await
    }
}
