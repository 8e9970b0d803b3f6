// src/main.rs
//! Dispatch Engine
//!
//! Routes one query to a pooled task handler and streams the answer to
//! stdout. Queries that mention URLs go to the URL retrieval handler,
//! everything else to the completion handler.
//!
//! ```text
//! dispatch-engine [--model <id>] [--print-config] <query...>
//! ```

use anyhow::{bail, Context, Result};
use dispatch_engine::handlers::builtin_registry;
use dispatch_engine::handlers::url_retrieval::extract_urls;
use dispatch_engine::observability::telemetry::TelemetryRecorder;
use dispatch_engine::observability::{init_metrics, init_tracing, LogSink};
use dispatch_engine::runtime::{
    AgentPool, Dispatcher, Environment, ExecutionContext, HandlerConfig, HandlerType,
};
use dispatch_engine::utils::config::EngineConfig;
use futures::StreamExt;
use std::io::Write;
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_MODEL: &str = "gpt-4o-mini";

struct Args {
    model: String,
    print_config: bool,
    query: String,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut model = DEFAULT_MODEL.to_string();
        let mut print_config = false;
        let mut words = Vec::new();

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--model" => model = args.next().context("--model needs a value")?,
                "--print-config" => print_config = true,
                _ => words.push(arg),
            }
        }

        Ok(Self {
            model,
            print_config,
            query: words.join(" "),
        })
    }
}

fn handler_config(ctx: &ExecutionContext, model: &str) -> HandlerConfig {
    if extract_urls(ctx, 1).is_empty() {
        HandlerConfig::new(
            "completion",
            "Completion",
            HandlerType::Completion,
            Environment::HostedModel,
            model,
        )
        .with_instructions("Answer concisely.")
    } else {
        HandlerConfig::new(
            "url-retrieval",
            "URL Retrieval",
            HandlerType::UrlRetrieval,
            Environment::ThirdPartyApi,
            model,
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse()?;
    let config = EngineConfig::load()?;

    if args.print_config {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    init_tracing(&config.logging)?;
    init_metrics(&config.metrics)?;

    info!("Starting Dispatch Engine v{}", dispatch_engine::VERSION);

    if args.query.trim().is_empty() {
        bail!("usage: dispatch-engine [--model <id>] [--print-config] <query...>");
    }

    let telemetry = Arc::new(TelemetryRecorder::new(
        config.telemetry.clone(),
        Arc::new(LogSink),
    ));
    telemetry.start();

    let pool = Arc::new(
        AgentPool::new(config.pool.clone())
            .with_runtime_config(config.runtime.clone())
            .with_telemetry(Arc::clone(&telemetry)),
    );
    AgentPool::init_global(Arc::clone(&pool))?;
    pool.start_sweeper();

    let registry = Arc::new(builtin_registry(&config)?);
    let dispatcher = Dispatcher::new(registry, Arc::clone(&pool));

    let user = std::env::var("USER").unwrap_or_else(|_| "anonymous".to_string());
    let ctx = ExecutionContext::new(&args.query, user, &args.model, "en-US");
    let handler = handler_config(&ctx, &args.model);
    info!("Dispatching to {} handler", handler.handler_type);

    let run = async {
        let mut stream = dispatcher.dispatch_streaming(handler, ctx).await?;
        let mut stdout = std::io::stdout();
        while let Some(chunk) = stream.next().await {
            stdout.write_all(chunk.as_bytes())?;
            stdout.flush()?;
        }
        writeln!(stdout)?;
        anyhow::Ok(())
    };

    let outcome = tokio::select! {
        result = run => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Received shutdown signal, cleaning up...");
            Ok(())
        }
    };

    let cleared = pool.shutdown().await;
    telemetry.shutdown().await;
    info!("Shut down {} handlers", cleared);

    outcome
}
