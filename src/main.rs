use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod agent;
mod chat;
mod config;
mod error;
mod evaluation;
mod models;
mod output;
mod runner;
mod store;

use crate::agent::Agent;
use crate::chat::{AzureChatClient, ChatClient, RetryingChatClient};
use crate::config::Config;
use crate::evaluation::builtin_evaluators;
use crate::models::{ChatMessage, Scenario};
use crate::output::{EvaluationReport, OutputFormat, Report};
use crate::runner::EvaluationRun;
use crate::store::{DiskStore, MemoryStore, ReportingStore};

/// Ask a chat agent for a joke and judge the reply for coherence, fluency and relevance
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Optional TOML run file; AZURE_OPENAI_* variables override its endpoint and deployment
    run_file: Option<PathBuf>,

    /// Output format: plain or json
    #[arg(short, long, default_value = "plain")]
    output: OutputFormat,

    /// Verbose output - log each request
    #[arg(short, long)]
    verbose: bool,

    /// Print the agent's reply without evaluating it
    #[arg(long)]
    skip_eval: bool,

    /// Evaluate without reading or writing the on-disk result cache.
    /// Results with failed evaluators are cached too, so use this to retry them
    /// before the cache entry expires
    #[arg(long)]
    no_cache: bool,

    /// Directory for cached evaluation results
    #[arg(long)]
    storage_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut config = match &args.run_file {
        Some(path) => Config::from_file(path)?.with_lookup(|key| std::env::var(key).ok())?,
        None => Config::from_env()?,
    };
    if let Some(path) = &args.storage_path {
        config.storage_path = path.display().to_string();
    }

    if matches!(args.output, OutputFormat::Plain) {
        println!("Using endpoint: {}", config.endpoint);
        println!("Using deployment: {}", config.deployment);
    }

    let client: Arc<dyn ChatClient> = Arc::new(RetryingChatClient::new(
        Arc::new(AzureChatClient::from_config(&config)?),
        config.retry.clone(),
    ));

    let agent = Agent::new(
        &config.agent_name,
        &config.agent_instructions,
        client.clone(),
        &config.deployment,
    );
    let conversation = vec![
        ChatMessage::system(&config.system_prompt),
        ChatMessage::user(&config.user_prompt),
    ];
    let response = agent.run(&conversation).await?;

    let evaluation = if args.skip_eval {
        None
    } else {
        let store: Arc<dyn ReportingStore> = if args.no_cache {
            Arc::new(MemoryStore::new())
        } else {
            Arc::new(
                DiskStore::open(&config.storage_path)
                    .await?
                    .with_ttl(config.cache_ttl()),
            )
        };

        let run = EvaluationRun::new(
            store,
            builtin_evaluators(client.clone(), &config.deployment, config.judge_temperature),
        )
        .with_evaluator_timeout(config.evaluator_timeout());

        let scenario = Scenario::new(
            &config.scenario_id,
            conversation.clone(),
            response.message.clone(),
        );
        Some(EvaluationReport::from(run.run(&scenario).await?))
    };

    let report = Report {
        agent: agent.name().to_string(),
        deployment: config.deployment.clone(),
        conversation,
        response: response.message,
        response_metadata: response.metadata,
        evaluation,
    };
    output::print_report(&report, args.output);

    Ok(())
}

/// Log to stderr so stdout carries only the report
fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "joke_eval=debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
