//! `compare`: stream one prompt to several models side by side.

use anyhow::{Context, Result, bail};
use clap::Args;
use colored::Colorize;
use orchestrator::{MemoryPersistence, Orchestrator, RunOutcome, RunReport, StateEvent};
use shared::{
    config::ENV_API_KEY,
    models::{Message, MessageStatus},
};
use std::{path::PathBuf, sync::Arc};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::warn;
use uuid::Uuid;

use super::config::load_validated;
use crate::logging::initialize_tracing;

/// Arguments of `polychat compare`.
#[derive(Args, Debug)]
#[command(about = "Send one prompt to several models and print every answer", long_about = None)]
pub struct CompareArgs {
    /// Model identifier; repeat the flag for every model to compare
    #[arg(long = "model", short, required = true)]
    pub models: Vec<String>,

    /// Completions to request from every model
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=16))]
    pub runs: u32,

    /// Path to the configuration file (optional)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Image file to attach to the prompt; may be repeated
    #[arg(long = "image")]
    pub images: Vec<PathBuf>,

    /// Print streaming state changes to stderr while the runs are in flight
    #[arg(long)]
    pub watch: bool,

    /// Prompt sent to every model
    pub prompt: String,
}

/// Streams the prompt to every model and prints the answers with their stats.
///
/// # Errors
/// Returns an error when configuration, image import or the session setup fails.
pub async fn run(args: CompareArgs) -> Result<()> {
    let config = load_validated(args.config.clone())?;
    initialize_tracing(&config.logging)?;
    if config.api.api_key.is_none() {
        warn!("no API key configured; set {ENV_API_KEY} or api.api_key");
    }

    let orchestrator = Arc::new(
        Orchestrator::with_http(config, Arc::new(MemoryPersistence::new()))
            .context("failed to build the HTTP client")?,
    );
    let session = orchestrator
        .create_session(args.models.clone())
        .await
        .context("failed to create session")?;

    let mut image_ids = Vec::with_capacity(args.images.len());
    for path in &args.images {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read image {}", path.display()))?;
        let id = orchestrator
            .import_image(bytes, None)
            .await
            .with_context(|| format!("failed to import image {}", path.display()))?;
        image_ids.push(id);
    }

    let watcher = args.watch.then(|| spawn_watcher(orchestrator.subscribe()));
    let interrupt = spawn_interrupt_handler(Arc::clone(&orchestrator));

    let reports = orchestrator
        .send_prompt(session.id, &args.prompt, &image_ids, args.runs)
        .await
        .context("failed to send prompt")?;

    interrupt.abort();
    if let Some(watcher) = watcher {
        watcher.abort();
    }
    orchestrator.flush().await;

    for report in &reports {
        print_report(&orchestrator, report);
    }
    print_summary(&orchestrator, session.id, &session.models);

    if !reports.is_empty()
        && reports
            .iter()
            .all(|report| matches!(report.outcome, RunOutcome::Failed(_)))
    {
        bail!("every run failed");
    }
    Ok(())
}

fn spawn_interrupt_handler(orchestrator: Arc<Orchestrator>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let cancelled = orchestrator.abort_all();
            eprintln!("{}", format!("Aborting {cancelled} run(s)...").yellow());
        }
    })
}

fn spawn_watcher(mut events: broadcast::Receiver<StateEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(StateEvent::StreamingChanged {
                    model_id, streaming, ..
                }) => {
                    let state = if streaming { "streaming".cyan() } else { "idle".dimmed() };
                    eprintln!("[{model_id}] {state}");
                }
                Ok(StateEvent::ModelError { model_id, error: Some(error), .. }) => {
                    eprintln!("[{model_id}] {}", error.red());
                }
                Ok(StateEvent::CostVerified {
                    model_id, verification, ..
                }) => {
                    eprintln!("[{model_id}] cost {}", verification.outcome());
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn run_label(report: &RunReport) -> String {
    match report.key.run_index {
        Some(index) => format!("{} #{index}", report.key.model_id),
        None => report.key.model_id.clone(),
    }
}

fn status_label(message: &Message) -> colored::ColoredString {
    match message.status {
        MessageStatus::Complete => message.status.as_str().green(),
        MessageStatus::Error => message.status.as_str().red(),
        MessageStatus::Aborted => message.status.as_str().yellow(),
        MessageStatus::Streaming => message.status.as_str().cyan(),
    }
}

fn print_report(orchestrator: &Orchestrator, report: &RunReport) {
    println!("\n{}", format!("== {} ==", run_label(report)).bold().cyan());

    let Some(message) = orchestrator.state().message(
        report.key.session_id,
        &report.key.model_id,
        report.message_id,
    ) else {
        println!("{}", "(message missing)".red());
        return;
    };

    println!("{}", report_details(&message, report).join(" | "));

    if let Some(reasoning) = message.reasoning.as_deref().filter(|text| !text.is_empty()) {
        println!("{}", reasoning.dimmed());
    }
    if !message.content.is_empty() {
        println!("{}", message.content);
    }
    for id in &message.image_ids {
        println!("{} {id}", "image:".magenta());
    }
    if let Some(error) = &message.error {
        println!("{} {error}", "error:".red().bold());
    }
}

/// Status line of one run: status, timings, usage and cost.
fn report_details(message: &Message, report: &RunReport) -> Vec<String> {
    let mut details = vec![format!("status: {}", status_label(message))];
    if let Some(completed) = message.completed_at {
        details.push(format!("latency: {} ms", completed.millis_since(&message.created_at)));
    }
    if let Some(first) = message.first_token_at {
        details.push(format!("first token: {} ms", first.millis_since(&message.created_at)));
    }
    if let Some(usage) = report.usage {
        details.push(format!(
            "tokens: {} in / {} out",
            usage.prompt_tokens, usage.completion_tokens
        ));
    }
    if let Some(cost) = report.cost {
        details.push(format!("cost: ${cost:.6}"));
    }
    if report.fallback_used {
        details.push("fallback".yellow().to_string());
    }
    details
}

fn print_summary(orchestrator: &Orchestrator, session_id: Uuid, models: &[String]) {
    println!("\n{}", "Usage".green().bold());
    for model_id in models {
        match orchestrator.state().stats(session_id, model_id) {
            Some(stats) => println!(
                "- {model_id}: {} in / {} out tokens, ${:.6}",
                stats.input_tokens, stats.output_tokens, stats.cost
            ),
            None => println!("- {model_id}: {}", "no completed run".dimmed()),
        }
    }
    if let Some(session) = orchestrator.state().session(session_id) {
        println!(
            "Total: {} tokens, ${:.6}",
            session.token_count, session.total_cost
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator::supervisor::{RunKey, RunStopReason};
    use shared::models::{MessageRole, TokenUsage};
    use std::time::Duration;

    fn report(usage: Option<TokenUsage>, cost: Option<f64>) -> RunReport {
        RunReport {
            key: RunKey::new(Uuid::new_v4(), "openai/gpt-4o", None),
            message_id: Uuid::new_v4(),
            outcome: RunOutcome::Completed,
            fallback_used: false,
            usage,
            cost,
            stop_reason: RunStopReason::Completed,
            elapsed: Duration::from_millis(120),
        }
    }

    #[test]
    fn test_report_details_include_usage_and_cost() {
        let message = Message::new(Uuid::new_v4(), "openai/gpt-4o", MessageRole::Assistant, "hi", None);

        let details = report_details(&message, &report(Some(TokenUsage::new(12, 2)), Some(0.00042)));

        assert!(details.contains(&"tokens: 12 in / 2 out".to_string()));
        assert!(details.contains(&"cost: $0.000420".to_string()));
    }

    #[test]
    fn test_report_details_skip_unknown_cost() {
        let message = Message::new(Uuid::new_v4(), "m", MessageRole::Assistant, "", None);

        let details = report_details(&message, &report(Some(TokenUsage::default()), None));

        assert!(details.contains(&"tokens: 0 in / 0 out".to_string()));
        assert!(!details.iter().any(|detail| detail.starts_with("cost:")));
    }
}
