//! Snapshot Migrator
//!
//! Runs migration pipelines described by a YAML configuration, either once
//! from the command line or behind the REST API.
//!
//! ```text
//! snapshot-migrator --config migrator.yaml validate
//! snapshot-migrator --config migrator.yaml run refresh-staging --run-id refresh-1
//! snapshot-migrator --config migrator.yaml status refresh-1
//! snapshot-migrator --config migrator.yaml serve --api-addr 0.0.0.0:8090
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use snapshot_migrator::controlplane::generate_run_id;
use snapshot_migrator::migration::store::{FileRunStore, MemoryRunStore, RunStateStoreRef};
use snapshot_migrator::{
    ApiServer, CompositeEventSink, Identifiers, MigrationOrchestrator, MigratorConfig,
    PipelineDefinition, PipelineRunState, PrometheusEventSink, ResourceId, RunManager,
    TracingEventSink,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Snapshot Migrator - resumable snapshot migration pipelines
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(long, short, env = "MIGRATOR_CONFIG", default_value = "migrator.yaml", global = true)]
    config: PathBuf,

    /// Environment profile to run under
    #[arg(long, env = "MIGRATOR_PROFILE", global = true)]
    profile: Option<String>,

    /// Directory for run state files (overrides the config file)
    #[arg(long, env = "STATE_DIR", global = true)]
    state_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a pipeline run, or resume it when the run id already exists
    Run {
        /// Pipeline name
        pipeline: String,

        /// Run id; generated when absent
        #[arg(long)]
        run_id: Option<String>,

        /// Pipeline input as NAME=ID (repeatable)
        #[arg(long = "input", value_parser = parse_input)]
        inputs: Vec<(String, String)>,
    },

    /// Check pipeline definitions and input wiring
    Validate,

    /// Print one stored run, or list them all
    Status {
        run_id: Option<String>,
    },

    /// Serve the REST API plus metrics and health endpoints
    Serve {
        /// REST API bind address (overrides the config file)
        #[arg(long, env = "API_ADDR")]
        api_addr: Option<SocketAddr>,

        /// Metrics server bind address
        #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
        metrics_addr: SocketAddr,
    },
}

fn parse_input(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, id)) if !name.is_empty() && !id.is_empty() => Ok((name.to_string(), id.to_string())),
        _ => Err(format!("expected NAME=ID, got {:?}", s)),
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Snapshot Migrator");
    info!("  Version: {}", snapshot_migrator::VERSION);
    info!("  Config: {}", args.config.display());

    let migrator = Migrator::build(&args).await?;

    match args.command {
        Command::Run {
            ref pipeline,
            ref run_id,
            ref inputs,
        } => migrator.run(pipeline, run_id.clone(), inputs).await,
        Command::Validate => migrator.validate(),
        Command::Status { ref run_id } => migrator.status(run_id.as_deref()).await,
        Command::Serve {
            api_addr,
            metrics_addr,
        } => migrator.serve(api_addr, metrics_addr).await,
    }
}

// =============================================================================
// Wiring
// =============================================================================

struct Migrator {
    config: MigratorConfig,
    pipelines: Vec<PipelineDefinition>,
    orchestrator: Arc<MigrationOrchestrator>,
}

impl Migrator {
    async fn build(args: &Args) -> Result<Self> {
        let config = MigratorConfig::load(&args.config)
            .with_context(|| format!("loading configuration {}", args.config.display()))?;
        let base = args.config.parent().map(Path::to_path_buf).unwrap_or_default();
        let profile = config.profile(args.profile.as_deref())?.clone();
        let pipelines = config
            .pipelines(&profile, &base)
            .context("building pipelines")?;

        let store: RunStateStoreRef = match args.state_dir.clone().or_else(|| config.state_dir.clone()) {
            Some(dir) => Arc::new(
                FileRunStore::open(dir.clone())
                    .await
                    .with_context(|| format!("opening state directory {}", dir.display()))?,
            ),
            None => {
                warn!("No state directory configured; run state is kept in memory");
                Arc::new(MemoryRunStore::new())
            }
        };

        let events = CompositeEventSink::new()
            .with(Arc::new(TracingEventSink))
            .with(Arc::new(PrometheusEventSink::new(prometheus::default_registry())?));

        // credentials and wire clients are out of scope; runs are rehearsed
        let (_world, clients) = config.simulation.build(&profile);
        info!(
            profile = %profile.name,
            source = %profile.source.account_id,
            destination = %profile.destination.account_id,
            "Using the simulated control plane"
        );

        let mut orchestrator = MigrationOrchestrator::new(
            config.orchestrator.clone(),
            Arc::new(clients),
            store,
            Arc::new(events),
        );
        if let Some(model) = config.waiter_model(&base)? {
            orchestrator = orchestrator.with_waiters(model);
        }

        Ok(Self {
            config,
            pipelines,
            orchestrator: Arc::new(orchestrator),
        })
    }

    fn pipeline(&self, name: &str) -> Result<&PipelineDefinition> {
        self.pipelines
            .iter()
            .find(|p| p.name == name)
            .with_context(|| format!("unknown pipeline {}", name))
    }

    async fn run(&self, pipeline: &str, run_id: Option<String>, inputs: &[(String, String)]) -> Result<()> {
        let definition = self.pipeline(pipeline)?;

        let cancel = CancellationToken::new();
        let signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling run");
                signal.cancel();
            }
        });

        let existing = match &run_id {
            Some(id) => self.orchestrator.store().load(id).await?.is_some(),
            None => false,
        };
        let run_id = run_id.unwrap_or_else(|| generate_run_id(pipeline));

        let result = if existing {
            info!(run_id = %run_id, "Resuming stored run");
            self.orchestrator.resume(definition, &run_id, cancel).await
        } else {
            let inputs: Identifiers = inputs
                .iter()
                .map(|(name, id)| (name.clone(), ResourceId::new(id.as_str())))
                .collect();
            self.orchestrator.start(definition, &run_id, inputs, cancel).await
        };

        match result {
            Ok(state) => print_state(&state),
            Err(e) => {
                if let Some(state) = e.run_state() {
                    print_state(state)?;
                }
                Err(e).with_context(|| format!("run {} did not complete", run_id))
            }
        }
    }

    fn validate(&self) -> Result<()> {
        for pipeline in &self.pipelines {
            self.orchestrator
                .validate(pipeline)
                .with_context(|| format!("pipeline {}", pipeline.name))?;
            println!(
                "{}: {} stages, inputs [{}]",
                pipeline.name,
                pipeline.stages.len(),
                pipeline.inputs.join(", ")
            );
        }
        println!("{} pipelines valid", self.pipelines.len());
        Ok(())
    }

    async fn status(&self, run_id: Option<&str>) -> Result<()> {
        let store = self.orchestrator.store();
        match run_id {
            Some(id) => {
                let state = store.load(id).await?.with_context(|| format!("run {} not found", id))?;
                print_state(&state)
            }
            None => {
                for state in store.list().await? {
                    println!(
                        "{:<48} {:<16} {:<32} {}",
                        state.run_id,
                        state.status.to_string(),
                        state.pipeline,
                        state.updated_at.to_rfc3339()
                    );
                }
                Ok(())
            }
        }
    }

    async fn serve(&self, api_addr: Option<SocketAddr>, metrics_addr: SocketAddr) -> Result<()> {
        let runs = Arc::new(RunManager::new(self.orchestrator.clone()));
        for pipeline in &self.pipelines {
            runs.register(pipeline.clone())?;
        }

        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(metrics_addr).await {
                error!("Metrics server error: {:#}", e);
            }
        });

        let mut api_config = self.config.api.clone();
        if let Some(addr) = api_addr {
            api_config.rest_addr = addr;
        }
        let server = Arc::new(ApiServer::new(api_config, runs));

        let signal = server.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                signal.shutdown();
            }
        });

        server.run().await?;
        info!("Migrator shutdown complete");
        Ok(())
    }
}

fn print_state(state: &PipelineRunState) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(state)?);
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "tower=warn", "tower_http=info", "axum=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    // logs go to stderr; stdout carries command output
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{header, Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    fn plain(status: StatusCode, body: String) -> Response<Body> {
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        response
    }

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    match encoder.encode(&prometheus::gather(), &mut buffer) {
                        Ok(()) => {
                            let mut response = Response::new(Body::from(buffer));
                            if let Ok(value) = header::HeaderValue::from_str(encoder.format_type()) {
                                response.headers_mut().insert(header::CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => plain(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                    }
                }
                "/healthz" | "/livez" | "/readyz" => plain(StatusCode::OK, "ok".into()),
                _ => plain(StatusCode::NOT_FOUND, "not found".into()),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .context("metrics server")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert_eq!(
            parse_input("cluster=alpha-events").unwrap(),
            ("cluster".to_string(), "alpha-events".to_string())
        );
        assert!(parse_input("cluster").is_err());
        assert!(parse_input("=x").is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let args = Args::try_parse_from([
            "snapshot-migrator",
            "--config",
            "conf/migrator.yaml",
            "run",
            "refresh-staging",
            "--run-id",
            "refresh-1",
            "--input",
            "cluster=alpha",
        ])
        .unwrap();
        assert_eq!(args.config, PathBuf::from("conf/migrator.yaml"));
        match args.command {
            Command::Run { pipeline, run_id, inputs } => {
                assert_eq!(pipeline, "refresh-staging");
                assert_eq!(run_id.as_deref(), Some("refresh-1"));
                assert_eq!(inputs, vec![("cluster".to_string(), "alpha".to_string())]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
