use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use elisa_core::cancellation::CancellationRegistry;
use elisa_core::config::EngineConfig;
use elisa_core::session_store::SessionStore;
use elisa_memory::BuildMemory;
use elisa_observability::{init_process_logging, ProcessKind};
use elisa_orchestrator::controller::{PipelineController, PipelineDeps};
use elisa_orchestrator::test_phase::NullTestRunner;
use elisa_orchestrator::teaching::NoopTeachingEngine;
use elisa_providers::{OpenAiConfig, OpenAiLanguageModel};
use elisa_server::{serve, AppState, ServerConfig};
use elisa_types::{RestartMode, Spec};

#[derive(Parser, Debug)]
#[command(name = "elisa-engine")]
#[command(about = "Headless Elisa build orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 3000)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long, default_value_t = false)]
        in_process: bool,
    },
    /// Runs one build to completion against stdout, skipping the HTTP/WS
    /// surface entirely — useful for scripted or CI invocations.
    Run {
        prompt: String,
        #[arg(long)]
        workspace: Option<String>,
    },
    Chat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { hostname, port, state_dir, in_process } => {
            let state_dir = resolve_state_dir(state_dir);
            let (_guard, logging_info) =
                init_process_logging(ProcessKind::Engine, &elisa_observability::canonical_logs_dir_from_root(&state_dir), 14)?;
            let config = EngineConfig::from_env(&state_dir).await;
            let deps = build_pipeline_deps(&state_dir, &config).await?;
            let mut server_config = ServerConfig::from_env();
            server_config.dev_mode = in_process;
            let state = AppState::new(deps, server_config);
            let addr: SocketAddr = format!("{hostname}:{port}").parse().context("invalid hostname or port")?;
            log_startup_paths(&state_dir, &addr, &logging_info);
            serve(addr, state).await?;
        }
        Command::Run { prompt, workspace } => {
            tracing_subscriber::fmt().with_env_filter("info").with_target(false).init();
            let state_dir = resolve_state_dir(None);
            let config = EngineConfig::from_env(&state_dir).await;
            let deps = build_pipeline_deps(&state_dir, &config).await?;

            let spec = Spec::from_value(serde_json::json!({ "goal": prompt }))?;
            let workspace_path = workspace.unwrap_or_else(|| {
                state_dir.join("workspaces").join(uuid::Uuid::new_v4().to_string()).display().to_string()
            });

            let cancellations = CancellationRegistry::new();
            let sessions = SessionStore::new(cancellations.clone());
            let handle = sessions.create(spec, workspace_path, RestartMode::Continue).await;
            let cancel = cancellations.token_for(&handle.id).await;

            let mut events = handle.bus.subscribe();
            let printer = tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    println!("[{}] {}", event.kind, event.payload);
                }
            });

            let controller = PipelineController::new(handle, cancel, deps);
            controller.run().await;
            printer.abort();
        }
        Command::Chat => {
            tracing_subscriber::fmt().with_env_filter("info").with_target(false).init();
            println!("Interactive chat mode is planned; use `run` or `serve` for now.");
        }
    }

    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("ELISA_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".elisa-state")
}

fn log_startup_paths(state_dir: &PathBuf, addr: &SocketAddr, logging_info: &elisa_observability::LoggingInitInfo) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting elisa-engine on http://{addr}");
    info!(
        "startup paths: exe={} cwd={} state_dir={} logs_dir={}",
        exe.display(),
        cwd.display(),
        state_dir.display(),
        logging_info.logs_dir,
    );
}

async fn build_pipeline_deps(state_dir: &std::path::Path, config: &EngineConfig) -> anyhow::Result<PipelineDeps> {
    let model = Arc::new(OpenAiLanguageModel::new(OpenAiConfig {
        api_key: config.openai_api_key.clone(),
        base_url: config.openai_base_url.clone().unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        default_model: config.openai_model.clone(),
        workshop_code: config.openai_workshop_code.clone(),
        student_id: config.openai_student_id.clone(),
    }));

    let memory_path = config.memory_path_or_default(state_dir);
    let memory = BuildMemory::open(memory_path).await?;

    Ok(PipelineDeps {
        model,
        test_runner: Arc::new(NullTestRunner),
        teaching: Arc::new(NoopTeachingEngine),
        memory,
        output_limit_fallback_model: config.output_limit_fallback_model.clone(),
        judge_threshold: config.judge_min_score,
        retry_limit: 2,
    })
}
