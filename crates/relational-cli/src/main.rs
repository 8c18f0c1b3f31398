use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

use contracts::{BatchRequest, EngineConfig, ProgressEvent, ShadowVectorProfile, Speaker};
use relational_api::{serve, BatchOutcome, EngineApi};
use relational_core::{sample_pair, validate_profile, CancelHandle};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn print_usage() {
    println!("relational-cli <command> [--config engine.json] [--json]");
    println!("commands:");
    println!("  validate <profile.json> [profile_b.json]");
    println!("  simulate <profile_a.json> <profile_b.json> [n] [seed] [sqlite_path]");
    println!("    runs a Monte Carlo batch and persists it when sqlite_path is given");
    println!("  demo [n] [seed]");
    println!("    runs a batch over the built-in sample pair");
    println!("  runs [sqlite_path]");
    println!("  serve [addr] [sqlite_path]");
    println!("    default addr: 127.0.0.1:8080");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Positional arguments with the option flags pulled out.
struct Invocation {
    positional: Vec<String>,
    config_path: Option<PathBuf>,
    json: bool,
}

fn parse_invocation(args: &[String]) -> Result<Invocation, String> {
    let mut positional = Vec::new();
    let mut config_path = None;
    let mut json = false;

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = iter.next().ok_or_else(|| "missing value for --config".to_string())?;
                config_path = Some(PathBuf::from(path));
            }
            "--json" => json = true,
            _ => positional.push(arg.clone()),
        }
    }

    Ok(Invocation {
        positional,
        config_path,
        json,
    })
}

fn parse_count(value: Option<&String>, label: &str, default: usize) -> Result<usize, String> {
    match value {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| format!("invalid {label}: {raw}")),
        None => Ok(default),
    }
}

fn parse_seed(value: Option<&String>) -> Result<u64, String> {
    match value {
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|_| format!("invalid seed: {raw}")),
        None => Ok(0),
    }
}

fn parse_socket_addr(value: Option<&String>) -> Result<SocketAddr, String> {
    let raw = value.map(String::as_str).unwrap_or("127.0.0.1:8080");
    raw.parse::<SocketAddr>()
        .map_err(|_| format!("invalid addr: {raw}"))
}

fn default_sqlite_path() -> String {
    env::var("RELATIONAL_SQLITE_PATH")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "relational_runs.sqlite".to_string())
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig, String> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let raw = fs::read_to_string(path)
        .map_err(|err| format!("failed to read config {}: {err}", path.display()))?;
    serde_json::from_str(&raw).map_err(|err| format!("invalid config {}: {err}", path.display()))
}

fn load_profile(path: Option<&String>, label: &str) -> Result<ShadowVectorProfile, String> {
    let path = path.ok_or_else(|| format!("missing {label}"))?;
    let raw = fs::read_to_string(path).map_err(|err| format!("failed to read {path}: {err}"))?;
    serde_json::from_str(&raw).map_err(|err| format!("invalid profile {path}: {err}"))
}

fn run_validate(invocation: &Invocation) -> Result<bool, String> {
    if invocation.positional.len() < 2 {
        return Err("missing profile".to_string());
    }

    let mut valid = true;
    let parties = [Speaker::AgentA, Speaker::AgentB];
    let paths = invocation.positional.iter().skip(1).take(parties.len());
    for (party, path) in parties.into_iter().zip(paths) {
        let profile = load_profile(Some(path), "profile")?;
        match validate_profile(&profile, party) {
            Ok(()) => println!("ok profile_id={} party={party}", profile.profile_id),
            Err(err) => {
                valid = false;
                println!("invalid profile_id={} party={party}: {err}", profile.profile_id);
            }
        }
    }
    Ok(valid)
}

async fn run_batch(
    config: EngineConfig,
    request: BatchRequest,
    sqlite_path: Option<String>,
    json: bool,
) -> Result<(), String> {
    let mut api = EngineApi::from_config(config).map_err(|err| err.to_string())?;
    if let Some(path) = sqlite_path.as_deref() {
        api.attach_sqlite_store(path)
            .map_err(|err| format!("failed to attach sqlite store: {err}"))?;
    }

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ProgressEvent>();
    let reporter = tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            info!(
                batch_id = %event.batch_id,
                completed = event.completed,
                failed = event.failed,
                total = event.total,
                percent = event.percent,
                "cli.progress"
            );
        }
    });

    let outcome = api
        .simulate(request, &progress_tx, CancelHandle::new())
        .await;
    drop(progress_tx);
    let _ = reporter.await;

    let outcome = outcome.map_err(|err| format!("batch failed: {err}"))?;
    if let Some(error) = api.last_persistence_error() {
        return Err(format!("persistence error after simulation: {error}"));
    }

    print_outcome(&outcome, json)?;
    if let Some(path) = sqlite_path {
        println!("persisted batch_id={} sqlite={path}", outcome.result.batch_id);
    }
    Ok(())
}

fn print_outcome(outcome: &BatchOutcome, json: bool) -> Result<(), String> {
    if json {
        let encoded = serde_json::to_string_pretty(outcome).map_err(|err| err.to_string())?;
        println!("{encoded}");
        return Ok(());
    }

    let analysis = &outcome.analysis;
    println!("{}", outcome.result);
    if let Some(axis) = outcome.result.primary_collapse_vector {
        println!("primary collapse vector: {axis:?}");
    }
    println!(
        "homeostasis {:.0}% ci: [{:.3}, {:.3}]",
        analysis.homeostasis_ci.level * 100.0,
        analysis.homeostasis_ci.lower,
        analysis.homeostasis_ci.upper
    );
    println!(
        "resilience {:.0}% ci: [{:.3}, {:.3}]",
        analysis.resilience_ci.level * 100.0,
        analysis.resilience_ci.lower,
        analysis.resilience_ci.upper
    );
    for scenario in &analysis.top_risk_scenarios {
        println!(
            "risk axis={:?} collapses={} rate={:.3} mean_severity={:.3}",
            scenario.axis, scenario.n_collapses, scenario.collapse_rate, scenario.mean_severity
        );
    }
    println!(
        "recommendation: {:?} ({})",
        analysis.recommendation,
        analysis.recommendation.summary()
    );
    for exclusion in &outcome.result.exclusions {
        println!(
            "excluded timeline={} reason={:?}: {}",
            exclusion.index, exclusion.reason, exclusion.message
        );
    }
    Ok(())
}

async fn run_simulate(invocation: &Invocation) -> Result<(), String> {
    let args = &invocation.positional;
    let profile_a = load_profile(args.get(1), "profile_a")?;
    let profile_b = load_profile(args.get(2), "profile_b")?;
    let n = parse_count(args.get(3), "n", 100)?;
    let seed = parse_seed(args.get(4))?;
    let sqlite_path = args.get(5).cloned().filter(|path| !path.trim().is_empty());

    let config = load_config(invocation.config_path.as_ref())?;
    run_batch(
        config,
        BatchRequest::new(profile_a, profile_b, n, seed),
        sqlite_path,
        invocation.json,
    )
    .await
}

async fn run_demo(invocation: &Invocation) -> Result<(), String> {
    let args = &invocation.positional;
    let n = parse_count(args.get(1), "n", 50)?;
    let seed = parse_seed(args.get(2))?;
    let (profile_a, profile_b) = sample_pair();

    let config = load_config(invocation.config_path.as_ref())?;
    run_batch(
        config,
        BatchRequest::new(profile_a, profile_b, n, seed),
        None,
        invocation.json,
    )
    .await
}

fn run_list(invocation: &Invocation) -> Result<(), String> {
    let sqlite_path = invocation
        .positional
        .get(1)
        .cloned()
        .filter(|path| !path.trim().is_empty())
        .unwrap_or_else(default_sqlite_path);

    let mut api = EngineApi::from_config(EngineConfig::default()).map_err(|err| err.to_string())?;
    api.attach_sqlite_store(&sqlite_path)
        .map_err(|err| format!("failed to attach sqlite store: {err}"))?;
    let batches = api
        .list_batches(200)
        .map_err(|err| format!("failed to list batches: {err}"))?;

    if batches.is_empty() {
        println!("no batches in {sqlite_path}");
    }
    for batch in batches {
        let homeostasis = batch
            .homeostasis_rate
            .map(|rate| format!("{rate:.3}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{} seed={} status={} n={}/{} homeostasis={}",
            batch.batch_id,
            batch.base_seed,
            batch.status,
            batch.n_simulations,
            batch.n_requested,
            homeostasis
        );
        if let Some(error) = batch.error {
            println!("  error: {error}");
        }
    }
    Ok(())
}

fn exit_usage(err: &str) -> ! {
    eprintln!("error: {err}");
    print_usage();
    std::process::exit(2);
}

#[tokio::main]
async fn main() {
    init_tracing();

    let args: Vec<String> = env::args().collect();
    let invocation = match parse_invocation(&args) {
        Ok(invocation) => invocation,
        Err(err) => exit_usage(&err),
    };

    match invocation.positional.first().map(String::as_str) {
        Some("validate") => match run_validate(&invocation) {
            Ok(true) => {}
            Ok(false) => std::process::exit(1),
            Err(err) => exit_usage(&err),
        },
        Some("simulate") => {
            if let Err(err) = run_simulate(&invocation).await {
                eprintln!("error: {err}");
                std::process::exit(1);
            }
        }
        Some("demo") => {
            if let Err(err) = run_demo(&invocation).await {
                eprintln!("error: {err}");
                std::process::exit(1);
            }
        }
        Some("runs") => {
            if let Err(err) = run_list(&invocation) {
                eprintln!("error: {err}");
                std::process::exit(1);
            }
        }
        Some("serve") => {
            let addr = match parse_socket_addr(invocation.positional.get(1)) {
                Ok(addr) => addr,
                Err(err) => exit_usage(&err),
            };
            let config = match load_config(invocation.config_path.as_ref()) {
                Ok(config) => config,
                Err(err) => exit_usage(&err),
            };
            println!("serving api on http://{addr}");
            if let Err(err) = serve(addr, config, invocation.positional.get(2).cloned()).await {
                eprintln!("server error: {err}");
                std::process::exit(1);
            }
        }
        _ => {
            print_usage();
        }
    }
}
