//! rlm 命令行：对一份文档（或会话中保存的文档）运行一次递归查询
//!
//! 轨迹 JSON 输出到 stdout；`--events` 时过程事件以 SSE 行写到 stderr。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use rlm_engine::config::{load_config, AppConfig};
use rlm_engine::engine::{channel_notifier, event_stream};
use rlm_engine::llm::ModelClient;
use rlm_engine::store::{ExecutionStore, InMemoryStore};
use rlm_engine::{observability, ExecutionRequest, ExecutionService};

#[derive(Parser, Debug)]
#[command(name = "rlm")]
#[command(about = "Answer a query over a very large document with recursive agent programs")]
#[command(version)]
struct Cli {
    /// Query to answer
    #[arg(short, long)]
    query: String,

    /// Read the document from this file
    #[arg(long, conflicts_with = "session")]
    context_file: Option<PathBuf>,

    /// Use a stored session (its document and memory)
    #[arg(long)]
    session: Option<String>,

    /// Model id (defaults to [llm] default_model)
    #[arg(short, long)]
    model: Option<String>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stream progress events to stderr as SSE lines
    #[arg(long)]
    events: bool,
}

async fn open_store(cfg: &AppConfig) -> anyhow::Result<Arc<dyn ExecutionStore>> {
    match cfg.store.database_url.as_deref() {
        #[cfg(feature = "async-sqlite")]
        Some(url) => {
            let store = rlm_engine::store::SqliteStore::connect(url)
                .await
                .with_context(|| format!("Failed to open store at {}", url))?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "async-sqlite"))]
        Some(url) => {
            tracing::warn!(url, "database_url set but built without async-sqlite; using in-memory store");
            Ok(Arc::new(InMemoryStore::new()))
        }
        None => Ok(Arc::new(InMemoryStore::new())),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let cli = Cli::parse();

    let cfg = load_config(cli.config.clone()).context("Failed to load configuration")?;

    let context = match &cli.context_file {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?,
        ),
        None => None,
    };

    let store = open_store(&cfg).await?;
    let service = ExecutionService::new(
        ModelClient::from_config(&cfg),
        store,
        cfg.agent_config(None),
        cfg.engine.max_context_size,
    );

    let (notifier, printer) = if cli.events {
        let (tx, rx) = mpsc::unbounded_channel();
        let printer = tokio::spawn(async move {
            let stream = event_stream(rx, Duration::from_secs(1));
            tokio::pin!(stream);
            while let Some(event) = stream.next().await {
                eprint!("{}", event.to_sse());
            }
        });
        (Some(channel_notifier(tx)), Some(printer))
    } else {
        (None, None)
    };

    let request = ExecutionRequest {
        query: cli.query,
        context,
        session_id: cli.session,
        model: cli.model,
    };
    let outcome = service.execute(request, notifier).await;

    if let Some(printer) = printer {
        let _ = printer.await;
    }

    let outcome = match outcome {
        Ok(outcome) => outcome,
        // 参数类错误：退出码 2，与运行失败区分
        Err(err) if err.is_input_error() => {
            eprintln!("error: {}", err);
            std::process::exit(2);
        }
        Err(err) => return Err(anyhow::Error::new(err).context("Execution failed")),
    };
    println!("{}", serde_json::to_string_pretty(&outcome.trace)?);
    Ok(())
}
