//! stepwise — a declarative, multi-protocol API test runner.
//!
//! This binary is the CLI entry point: it loads a workflow document,
//! resolves its imports, runs it through the orchestrator, and prints a
//! report. `serve` instead exposes the runner as a JSON-RPC tool over
//! stdio, for embedding in an agent loop.
//!
//! ```bash
//! stepwise run --file workflow.yaml
//! stepwise validate --file workflow.yaml
//! stepwise info --file workflow.yaml
//! stepwise serve
//! ```

mod condition;
mod document;
mod errors;
mod executor;
mod jsonpath;
mod limits;
mod orchestrator;
mod resolver;
mod rpc;
mod telemetry;
mod transport;
mod validator;
mod vars;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use uuid::Uuid;

use executor::Executor;
use limits::{validate_limits, ExecutionLimits};
use orchestrator::Orchestrator;
use resolver::{Resolver, SearchPaths};
use telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use transport::TransportRegistry;
use vars::Scope;

#[derive(Parser)]
#[command(name = "stepwise")]
#[command(about = "Declarative, multi-protocol API test runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolves and runs a workflow document.
    Run {
        /// Path to the workflow document (YAML or JSON).
        #[arg(short, long)]
        file: PathBuf,

        /// Path to write the JSON report to (stdout if omitted).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Halts the run at the first failing root step/group.
        #[arg(long, default_value = "false")]
        fail_fast: bool,

        /// Enables exporting traces to an OpenTelemetry collector.
        #[arg(long, default_value = "false")]
        otel: bool,

        /// OTLP collector endpoint. Defaults to
        /// `OTEL_EXPORTER_OTLP_ENDPOINT` or `http://localhost:4317`.
        #[arg(long)]
        otel_endpoint: Option<String>,

        /// Suppresses informational logs; only errors are printed.
        #[arg(long, short = 's', default_value = "false")]
        silent: bool,

        /// Enables debug-level logs.
        #[arg(long, short = 'v', default_value = "false")]
        verbose: bool,

        /// Custom execution ID, otherwise a UUID v4 is generated.
        #[arg(long)]
        execution_id: Option<String>,
    },

    /// Resolves a workflow document without running it, catching import
    /// cycles, missing imports, and malformed YAML/JSON early.
    Validate {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Prints a summary of a workflow's steps, groups, and imports.
    Info {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Runs the JSON-RPC 2.0 server over stdio, exposing `stepwise_run`,
    /// `stepwise_validate`, and `stepwise_info` as tools.
    Serve,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, output, fail_fast, otel, otel_endpoint, silent, verbose, execution_id } => {
            let exec_id = execution_id.unwrap_or_else(|| Uuid::new_v4().to_string());

            let mut telemetry_config = TelemetryConfig::from_env();
            telemetry_config.log_level = if silent {
                Level::ERROR
            } else if verbose {
                Level::DEBUG
            } else {
                Level::INFO
            };
            if otel {
                if let Some(endpoint) = otel_endpoint {
                    telemetry_config.otlp_endpoint = Some(endpoint);
                } else if telemetry_config.otlp_endpoint.is_none() {
                    telemetry_config.otlp_endpoint = Some("http://localhost:4317".to_string());
                }
            }

            if let Err(e) = init_telemetry(telemetry_config) {
                if !silent {
                    eprintln!("Warning: failed to initialize telemetry: {e}");
                }
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                    .try_init();
            }

            let exit_code = run_workflow(&file, output.as_deref(), fail_fast, &exec_id, silent).await;

            shutdown_telemetry();
            std::process::exit(exit_code);
        }

        Commands::Validate { file } => {
            let mut resolver = Resolver::new(SearchPaths::default());
            match resolver.resolve(&file) {
                Ok((workflow, components)) => {
                    println!(
                        "{} resolves cleanly: {} step(s), {} group(s), {} registered component(s)",
                        file.display(),
                        workflow.steps.len(),
                        workflow.groups.len(),
                        components.len()
                    );
                }
                Err(e) => {
                    eprintln!("{}", e.user_message());
                    std::process::exit(1);
                }
            }
        }

        Commands::Info { file } => {
            let mut resolver = Resolver::new(SearchPaths::default());
            match resolver.resolve(&file) {
                Ok((workflow, components)) => {
                    println!("{} (v{})", workflow.name, workflow.version.as_deref().unwrap_or("unset"));
                    if let Some(description) = &workflow.description {
                        println!("  {description}");
                    }
                    println!("  {} step(s), {} group(s), {} registered component(s)", workflow.steps.len(), workflow.groups.len(), components.len());
                    for step in &workflow.steps {
                        println!("  - {}", step.name.as_deref().unwrap_or("(unnamed step)"));
                    }
                    for group in &workflow.groups {
                        println!("  - [{}] {} ({} step(s))", if group.parallel { "parallel" } else { "sequential" }, group.name, group.steps.len());
                    }
                }
                Err(e) => {
                    eprintln!("{}", e.user_message());
                    std::process::exit(1);
                }
            }
        }

        Commands::Serve => {
            let mut telemetry_config = TelemetryConfig::from_env();
            telemetry_config.log_to_stderr = true;
            if init_telemetry(telemetry_config).is_err() {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                    .try_init();
            }

            let transports = Arc::new(TransportRegistry::new());
            let limits = Arc::new(ExecutionLimits::from_env());
            rpc::serve(transports, limits).await;

            shutdown_telemetry();
        }
    }
}

/// Resolves, runs, and reports on a workflow document. Returns the process
/// exit code (0 if every step passed, 1 otherwise).
async fn run_workflow(file: &PathBuf, output: Option<&std::path::Path>, fail_fast: bool, execution_id: &str, silent: bool) -> i32 {
    if !silent {
        info!(execution_id = %execution_id, "stepwise starting");
    }
    let start_time = chrono::Utc::now();

    let mut resolver = Resolver::new(SearchPaths::default());
    let (workflow, components) = match resolver.resolve(file) {
        Ok(resolved) => resolved,
        Err(e) => {
            error!(error = %e, "failed to resolve workflow");
            return 1;
        }
    };
    if !silent {
        info!(workflow = %workflow.name, steps = workflow.steps.len(), groups = workflow.groups.len(), "workflow resolved");
    }

    let limits = Arc::new(ExecutionLimits::from_env());
    let limit_check = validate_limits(workflow.step_count(), workflow.total_retry_budget(), &limits);
    if !limit_check.passed {
        for violation in &limit_check.violations {
            error!(limit = violation.limit_name, "{}", violation.message);
        }
        return 1;
    }

    let mut scope = Scope::new();
    scope.set("execution_id", serde_json::Value::String(execution_id.to_string()));
    scope.extend(&workflow.variables);

    let transports = Arc::new(TransportRegistry::new());
    let executor = Executor::new(transports, Arc::new(components), limits.clone());
    let orchestrator = Orchestrator::new(executor);

    let report = match tokio::time::timeout(limits.max_execution_time, orchestrator.run(&workflow, &mut scope, fail_fast)).await {
        Ok(report) => report,
        Err(_) => {
            error!(max_execution_time = ?limits.max_execution_time, "workflow exceeded its overall execution timeout");
            return 1;
        }
    };
    let passed = report.all_passed();

    let end_time = chrono::Utc::now();
    if !silent {
        info!(passed, halted_early = report.halted_early, "stepwise finished");
    }

    let output_doc = serde_json::json!({
        "execution_id": execution_id,
        "workflow": report.name,
        "status": if passed { "passed" } else { "failed" },
        "start_time": start_time.to_rfc3339(),
        "end_time": end_time.to_rfc3339(),
        "halted_early": report.halted_early,
        "captures": report.captures,
        "steps": report.steps.iter().map(step_report_to_json).collect::<Vec<_>>(),
    });

    match output {
        Some(path) => {
            let json = serde_json::to_string_pretty(&output_doc).expect("report is always serializable");
            if let Err(e) = std::fs::write(path, json) {
                eprintln!("failed to write report: {e}");
            } else if !silent {
                println!("report saved to: {}", path.display());
            }
        }
        None => {
            if !silent {
                let json = serde_json::to_string_pretty(&output_doc).expect("report is always serializable");
                println!("\n--- Execution Report ---\n{json}");
            }
        }
    }

    if passed {
        0
    } else {
        1
    }
}

fn step_report_to_json(report: &executor::StepReport) -> serde_json::Value {
    serde_json::json!({
        "name": report.name,
        "status": format!("{:?}", report.status).to_lowercase(),
        "duration_ms": report.duration.as_millis() as u64,
        "error": report.error,
        "validations": report.validations.iter().map(|v| serde_json::json!({
            "kind": v.kind,
            "expected": v.expected,
            "actual": v.actual,
            "passed": v.passed,
            "error": v.error,
        })).collect::<Vec<_>>(),
        "children": report.children.iter().map(step_report_to_json).collect::<Vec<_>>(),
    })
}
