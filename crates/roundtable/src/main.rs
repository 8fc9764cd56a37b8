use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use roundtable::{follow, GatewayConfig, Stage, StageConfig};
use tracing::{info, warn};
use turn_coordination::EventFilter;

/// Run a multi-character conversation on one topic.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Stage config (TOML). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Topic to discuss
    #[arg(long)]
    topic: Option<String>,

    #[arg(long)]
    session_id: Option<String>,

    /// Comma-separated persona ids taking part
    #[arg(long, value_delimiter = ',')]
    participants: Vec<String>,

    /// Stop the session after this many seconds
    #[arg(long)]
    run_for_secs: Option<u64>,

    /// Fixed RNG seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Use an OpenAI-compatible endpoint instead of scripted lines
    #[arg(long)]
    http_url: Option<String>,

    /// Model name for the HTTP endpoint
    #[arg(long, default_value = "default")]
    model: String,

    /// Print utterances only
    #[arg(long, default_value_t = false)]
    quiet: bool,
}

fn apply_args(config: &mut StageConfig, args: &Args) {
    if let Some(topic) = &args.topic {
        config.session.topic = topic.clone();
    }
    if let Some(id) = &args.session_id {
        config.session.id = Some(id.clone());
    }
    if !args.participants.is_empty() {
        config.session.participants = args.participants.clone();
    }
    if let Some(seed) = args.seed {
        config.turns.seed = Some(seed);
    }
    if let Some(url) = &args.http_url {
        config.gateway = GatewayConfig::Http {
            url: url.clone(),
            model: args.model.clone(),
            api_key_env: None,
            temperature: 0.8,
            max_tokens: 200,
        };
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => StageConfig::load(path)
            .with_context(|| format!("Failed to load stage config {}", path.display()))?,
        None => StageConfig::from_env(),
    };
    apply_args(&mut config, &args);

    let stage = Stage::from_config(&config).context("Failed to set up the stage")?;
    // Subscribe before starting so the opening events are not missed
    let transcript = stage
        .coordinator()
        .event_bus()
        .subscribe_filtered(EventFilter::new());
    let handle = stage.start().context("Failed to start the session")?;
    info!(session_id = %handle.session_id(), topic = %config.session.topic, "Roundtable starting");

    let quiet = args.quiet;
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        follow(transcript, &mut stdout, quiet).await
    });

    let deadline = async {
        match args.run_for_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = handle.stopped() => {}
        _ = deadline => info!("Run time elapsed, stopping"),
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl-C: {e}");
            }
            info!("Interrupted, stopping");
        }
    }

    if !handle.is_stopped() {
        stage
            .coordinator()
            .stop_session(handle.session_id())
            .await
            .context("Failed to stop the session")?;
    }

    let summary = printer.await.context("Transcript task failed")?;
    info!(
        utterances = summary.utterances,
        reactive_turns = summary.reactive_turns,
        dropped_triggers = summary.dropped_triggers,
        failed_generations = summary.failed_generations,
        "Roundtable finished"
    );
    Ok(())
}
