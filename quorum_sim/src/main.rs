//! Quorum token simulator CLI
//!
//! Runs the named scenarios over one or more seeds, records an action log
//! for later inspection, or replays a recorded log fault-free.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use quorum_core::{OmissionPolicy, ProtocolConfig};
use quorum_sim::scenarios::ScenarioId;
use quorum_sim::{read_action_log, write_action_log, RunExport, RunReport};
use quorum_sim::{ScenarioResult, ScenarioRunner, SimConfig, Simulator};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Quorum token simulator
#[derive(Parser, Debug)]
#[command(name = "quorum-sim")]
#[command(about = "Deterministic simulation of quorum-replicated token ownership", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of consecutive seeds to run
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Initial server count
    #[arg(long, default_value = "5")]
    servers: usize,

    /// Initial client count
    #[arg(long, default_value = "5")]
    clients: usize,

    /// Tokens allocated to each initial client
    #[arg(long, default_value = "3")]
    tokens_per_client: usize,

    /// Steps before new operations stop
    #[arg(long, default_value = "300")]
    steps: u64,

    /// Scenario to run (baseline, omission_safety, membership_churn,
    /// replay_idempotence, linearization_order, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Record one lossy run and write its action log here
    #[arg(long)]
    export_log: Option<String>,

    /// Replay an action log fault-free
    #[arg(long, conflicts_with = "export_log")]
    replay: Option<String>,

    /// Omission rate of faulty clients when recording
    #[arg(long, default_value = "0.2")]
    client_omission: f64,

    /// Omission rate of faulty servers when recording
    #[arg(long, default_value = "0.3")]
    server_omission: f64,

    /// Let faulty agents drop their own requests and resends too
    #[arg(long)]
    omit_requests: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,
}

impl Args {
    fn omission_policy(&self) -> OmissionPolicy {
        if self.omit_requests {
            OmissionPolicy::AllOutgoing
        } else {
            OmissionPolicy::ExemptOperationStarts
        }
    }

    fn sim_config(&self, seed: u64, protocol: ProtocolConfig) -> SimConfig {
        SimConfig::default()
            .with_seed(seed)
            .with_population(self.servers, self.clients)
            .with_tokens_per_client(self.tokens_per_client)
            .with_steps(self.steps)
            .with_protocol(protocol)
    }
}

/// Logs or prints a single run and judges it.
fn summarize(args: &Args, sim: &Simulator, report: &RunReport) -> Result<bool> {
    let conservation = sim.oracle().check_conservation(&report.final_db);
    let passed = report.drained && report.liveness.is_live() && conservation.is_ok();

    if args.json {
        println!("{}", RunExport::from_report(report).to_json()?);
        return Ok(passed);
    }

    info!(
        "steps={} drained={} servers={} clients={} actions={}",
        report.total_steps,
        report.drained,
        report.servers,
        report.clients,
        report.log.len()
    );
    info!(
        "delivered={} omitted={} resends={} stale_writes={}",
        report.network.delivered,
        report.metrics.omitted_inbound + report.metrics.omitted_outbound,
        report.metrics.resends,
        report.metrics.stale_writes
    );
    if !report.liveness.is_live() {
        error!("stuck clients: {:?}", report.liveness.stuck);
    }
    if let Err(reason) = conservation {
        error!("conservation violated: {}", reason);
    }
    Ok(passed)
}

/// Records one lossy run and writes its log.
fn run_record(args: &Args, seed: u64, path: &str) -> Result<bool> {
    let protocol = ProtocolConfig {
        omission_policy: args.omission_policy(),
        ..ProtocolConfig::lossy(args.client_omission, args.server_omission)
    };
    let mut sim = Simulator::new(args.sim_config(seed, protocol))?;
    let report = sim.run()?;

    write_action_log(&report.log, path).context("exporting action log")?;
    if !args.json {
        info!("Wrote {} log entries to {}", report.log.len(), path);
    }
    summarize(args, &sim, &report)
}

/// Replays a recorded log with every fault off.
fn run_replay(args: &Args, seed: u64, path: &str) -> Result<bool> {
    let log = read_action_log(path).context("loading replay log")?;
    if !args.json {
        info!("Replaying {} log entries from {}", log.len(), path);
    }

    let config = args.sim_config(seed, ProtocolConfig::fault_free()).replaying(log);
    let mut sim = Simulator::new(config)?;
    let report = sim.run()?;
    summarize(args, &sim, &report)
}

fn run_scenarios(args: &Args, base_seed: u64) -> Result<bool> {
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse().map_err(|e: String| anyhow!(e))?]
    };

    let mut all_results: Vec<ScenarioResult> = Vec::new();
    let mut failed_count = 0;

    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);

        let runner = ScenarioRunner::new(seed)
            .with_population(args.servers, args.clients)
            .with_tokens_per_client(args.tokens_per_client)
            .with_steps(args.steps)
            .with_omission_policy(args.omission_policy());

        for scenario in &scenarios {
            let result = runner.run(*scenario);

            if !args.json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED", scenario.name(), seed);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }

            if !result.passed {
                failed_count += 1;
            }

            all_results.push(result);
        }
    }

    let total = all_results.len();
    let passed = total - failed_count;

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "steps": r.total_steps,
                    "pays_finished": r.metrics.pays_finished,
                    "omitted": r.metrics.messages_omitted,
                    "divergences": r.metrics.divergences,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("All {} scenario runs passed", total);
        } else {
            error!("{}/{} scenario runs failed", failed_count, total);

            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    Ok(failed_count == 0)
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    if !args.json {
        info!("Quorum token simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        args.seed
    };

    let outcome = match (&args.replay, &args.export_log) {
        (Some(path), _) => run_replay(&args, base_seed, path),
        (None, Some(path)) => run_record(&args, base_seed, path),
        (None, None) => run_scenarios(&args, base_seed),
    };

    match outcome {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(2);
        }
    }
}
