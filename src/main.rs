use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::Shell;
use cytoflow_engine::engine::{Engine, default_registry, open_engine};
use cytoflow_engine::hashing::compute_sha256;
use cytoflow_engine::lockfile::generate_lock;
use cytoflow_engine::manifest::{Manifest, manifest_dir};
use cytoflow_engine::observability::{MetricsCollector, log_snapshot};
#[cfg(feature = "metrics-server")]
use cytoflow_engine::observability::server::MetricsServer;
use cytoflow_engine::run::RunProvenance;
use cytoflow_engine::scheduler::{ParallelismPolicy, WorkerPlan};
use cytoflow_engine::validation::validate_manifest;
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
#[cfg(feature = "metrics-server")]
use std::net::SocketAddr;

fn main() -> Result<()> {
    let Cli {
        store,
        config,
        command,
    } = Cli::parse();

    let otlp_endpoint_for_tracing = match &command {
        Commands::Run { otlp_endpoint, .. } => otlp_endpoint.clone(),
        _ => None,
    };
    configure_tracing(otlp_endpoint_for_tracing.as_deref())?;

    let globals = Globals { store, config };
    let command_result = match command {
        Commands::Init { manifest } => init_experiment(&globals, &manifest),
        Commands::Define {
            experiment,
            manifest,
        } => define_pipeline(&globals, &experiment, &manifest),
        Commands::Run {
            experiment,
            resume,
            parallelism,
            workers,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            metrics_listen,
            otlp_endpoint,
        } => {
            let _ = otlp_endpoint; // consumed by tracing configuration
            run_experiment(
                &globals,
                RunOptions {
                    experiment,
                    resume,
                    parallelism,
                    workers,
                    print_metrics,
                    metrics_json,
                    metrics_prometheus,
                    metrics_listen,
                },
            )
        }
        Commands::Experiments => list_experiments(&globals),
        Commands::Runs { experiment } => list_runs(&globals, &experiment),
        Commands::Provenance { run, json } => show_provenance(&globals, &run, json),
        Commands::Validate { manifest } => validate_manifest_cmd(&manifest),
        Commands::Lock { manifest, output } => lock_manifest(&manifest, &output),
        Commands::ListStages => list_stages(),
        Commands::Digest { path } => {
            let digest = compute_sha256(&path)?;
            println!("{}  {}", digest, path.display());
            Ok(())
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut io::stdout());
            Ok(())
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                    vec![KeyValue::new("service.name", "cytoflow")],
                )))
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .install_simple()?;

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
            return Ok(());
        }
    }

    #[cfg(not(feature = "otel"))]
    if let Some(endpoint) = otlp_endpoint {
        eprintln!(
            "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
            endpoint
        );
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;

    Ok(())
}

struct Globals {
    store: Option<PathBuf>,
    config: Option<PathBuf>,
}

impl Globals {
    fn engine(&self) -> Result<Engine> {
        open_engine(self.config.as_deref(), self.store.as_deref())
    }
}

fn load_manifest(path: &Path) -> Result<Manifest> {
    let manifest = Manifest::load(path)?;
    let registry = default_registry()?;
    let report = validate_manifest(&manifest, &manifest_dir(path), &registry);
    for warning in &report.warnings {
        warn!(file = %path.display(), "{warning}");
    }
    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %path.display(), "{error_msg}");
        }
        bail!("Manifest validation failed with {} error(s)", report.errors.len());
    }
    Ok(manifest)
}

fn init_experiment(globals: &Globals, manifest_path: &Path) -> Result<()> {
    let manifest = load_manifest(manifest_path)?;
    let engine = globals.engine()?;

    let experiment = engine.create_experiment(&manifest.experiment, &manifest.owner)?;
    for sample in manifest.load_samples(&manifest_dir(manifest_path))? {
        engine.register_sample(&experiment.id, sample)?;
    }
    let definition = engine.define_pipeline(&experiment.id, &manifest.pipeline)?;

    info!(
        experiment = %experiment.name,
        version = definition.version,
        "Experiment initialised"
    );
    println!("{}", experiment.id);
    Ok(())
}

fn define_pipeline(globals: &Globals, experiment: &str, manifest_path: &Path) -> Result<()> {
    let manifest = load_manifest(manifest_path)?;
    let engine = globals.engine()?;
    let experiment = engine.experiments().find_experiment(experiment)?;

    for sample in manifest.load_samples(&manifest_dir(manifest_path))? {
        engine.register_sample(&experiment.id, sample)?;
    }
    let definition = engine.define_pipeline(&experiment.id, &manifest.pipeline)?;
    info!(
        experiment = %experiment.name,
        version = definition.version,
        "Pipeline definition updated"
    );
    println!("{}", definition.version);
    Ok(())
}

struct RunOptions {
    experiment: String,
    resume: Option<String>,
    parallelism: Option<ParallelismPolicy>,
    workers: Option<usize>,
    print_metrics: bool,
    metrics_json: Option<PathBuf>,
    metrics_prometheus: Option<PathBuf>,
    metrics_listen: Option<String>,
}

fn run_experiment(globals: &Globals, options: RunOptions) -> Result<()> {
    let mut engine = globals.engine()?;
    if options.parallelism.is_some() || options.workers.is_some() {
        let policy = options.parallelism.unwrap_or_default();
        engine = engine.with_plan(WorkerPlan::new(policy, options.workers));
    }
    let metrics_handle = engine.metrics();

    #[cfg(feature = "metrics-server")]
    let metrics_server = if let Some(addr_str) = &options.metrics_listen {
        let addr: SocketAddr = addr_str
            .parse()
            .with_context(|| format!("Invalid metrics listen address: {addr_str}"))?;
        Some(MetricsServer::start(addr, metrics_handle.clone())?)
    } else {
        None
    };

    #[cfg(not(feature = "metrics-server"))]
    if let Some(addr_str) = &options.metrics_listen {
        warn!(
            "Metrics server feature not enabled; ignoring --metrics-listen={}.",
            addr_str
        );
    }

    let experiment = engine.experiments().find_experiment(&options.experiment)?;
    let outcome = match &options.resume {
        Some(run_id) => {
            let run = engine.get_run(run_id)?;
            if run.experiment_id != experiment.id {
                bail!(
                    "Run {} belongs to experiment {}, not '{}'",
                    run.id,
                    run.experiment_id,
                    options.experiment
                );
            }
            engine.resume_run(run_id)
        }
        None => engine.run_experiment(&experiment.id),
    };

    write_metrics(&metrics_handle, &options)?;

    #[cfg(feature = "metrics-server")]
    if let Some(mut server) = metrics_server {
        server.stop();
    }

    let provenance = outcome?;
    print_provenance(&provenance);
    if !provenance.succeeded() {
        let failure = provenance
            .first_failure
            .as_ref()
            .map(|f| format!("first failure at '{}': {}", f.stage_instance_id, f.error))
            .unwrap_or_else(|| "run did not complete".to_string());
        bail!("Run {} {}; {}", provenance.run.id, provenance.run.status, failure);
    }
    Ok(())
}

fn write_metrics(metrics: &MetricsCollector, options: &RunOptions) -> Result<()> {
    if !(options.print_metrics || options.metrics_json.is_some() || options.metrics_prometheus.is_some()) {
        return Ok(());
    }
    let snapshot = metrics.snapshot();
    if options.print_metrics {
        log_snapshot(&snapshot);
    }
    if let Some(path) = &options.metrics_json {
        ensure_parent(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, &snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = &options.metrics_prometheus {
        ensure_parent(path)?;
        fs::write(path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn print_provenance(provenance: &RunProvenance) {
    let run = &provenance.run;
    println!(
        "run {} ({}) experiment {} definition v{} attempt {}",
        run.id, run.status, run.experiment_id, run.graph_version, run.attempt
    );
    for stage in &provenance.stages {
        let key = stage
            .artifact_key
            .as_ref()
            .map(|k| k.short().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<20} {:<9} {:<12} {:>7} ms  attempts={}",
            stage.stage_instance_id, stage.status, key, stage.duration_ms, stage.attempts
        );
        if let Some(err) = &stage.error {
            println!("      error: {err}");
        }
        if let Some(reason) = &stage.skip_reason {
            println!("      skipped: {reason}");
        }
        for decision in &stage.decisions {
            println!("      decision: {decision}");
        }
    }
    if let Some(failure) = &provenance.first_failure {
        println!("first failure: {} ({})", failure.stage_instance_id, failure.error);
    }
    if !provenance.skipped.is_empty() {
        println!("skipped: {}", provenance.skipped.join(", "));
    }
}

fn list_experiments(globals: &Globals) -> Result<()> {
    let engine = globals.engine()?;
    for experiment in engine.experiments().list_experiments()? {
        let version = experiment
            .current_graph_version
            .map(|v| format!("v{v}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<24} owner={} samples={} definition={}",
            experiment.id,
            experiment.name,
            experiment.owner,
            experiment.samples.len(),
            version
        );
    }
    Ok(())
}

fn list_runs(globals: &Globals, experiment: &str) -> Result<()> {
    let engine = globals.engine()?;
    let experiment = engine.experiments().find_experiment(experiment)?;
    for run in engine.experiments().list_runs(&experiment.id)? {
        println!(
            "{}  {:<9} v{} created={} attempt={}",
            run.id,
            run.status,
            run.graph_version,
            run.created_at.to_rfc3339(),
            run.attempt
        );
    }
    Ok(())
}

fn show_provenance(globals: &Globals, run_id: &str, json: bool) -> Result<()> {
    let engine = globals.engine()?;
    let provenance = engine.get_run_provenance(run_id)?;
    if json {
        serde_json::to_writer_pretty(io::stdout(), &provenance)
            .context("Failed to write provenance JSON")?;
        println!();
    } else {
        print_provenance(&provenance);
    }
    Ok(())
}

fn validate_manifest_cmd(manifest_path: &Path) -> Result<()> {
    load_manifest(manifest_path)?;
    info!(file = %manifest_path.display(), "Manifest validation passed");
    Ok(())
}

fn lock_manifest(manifest_path: &Path, output_path: &Path) -> Result<()> {
    let manifest = load_manifest(manifest_path)?;
    ensure_parent(output_path)?;
    let registry = default_registry()?;
    let lock = generate_lock(&manifest, &manifest_dir(manifest_path), &registry, output_path)?;
    info!(
        lockfile = %output_path.display(),
        stages = lock.stages.len(),
        "Lockfile generated successfully"
    );
    Ok(())
}

fn list_stages() -> Result<()> {
    let registry = default_registry()?;
    println!("Available stages:");
    for definition in registry.definitions() {
        let params: Vec<&str> = definition
            .params
            .specs()
            .iter()
            .map(|spec| spec.name.as_str())
            .collect();
        println!(
            "- {} -> {} [{}] {}",
            definition.id(),
            definition.output,
            params.join(", "),
            definition.description
        );
    }
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "cytoflow",
    version,
    about = "Content-addressed pipeline engine for cytometry analyses"
)]
struct Cli {
    /// Store directory (defaults to the config file, then $CYTOFLOW_STORE, then .cytoflow).
    #[arg(long, global = true, value_hint = ValueHint::DirPath)]
    store: Option<PathBuf>,
    /// Engine configuration file (YAML).
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an experiment from a manifest, ingest its samples and store its pipeline.
    Init { manifest: PathBuf },
    /// Store a new pipeline definition version for an existing experiment.
    Define { experiment: String, manifest: PathBuf },
    /// Execute the current definition of an experiment.
    Run {
        experiment: String,
        /// Resume an earlier run of this experiment instead of starting a new one.
        #[arg(long)]
        resume: Option<String>,
        /// Overrides the configured parallelism policy.
        #[arg(long, value_enum)]
        parallelism: Option<ParallelismPolicy>,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long = "metrics-listen")]
        metrics_listen: Option<String>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
    },
    Experiments,
    Runs { experiment: String },
    Provenance {
        run: String,
        #[arg(long)]
        json: bool,
    },
    Validate { manifest: PathBuf },
    Lock { manifest: PathBuf, output: PathBuf },
    ListStages,
    Digest {
        #[arg(long)]
        path: PathBuf,
    },
    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}
