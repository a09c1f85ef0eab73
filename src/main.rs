//! CLI entry point for the driftgate rebalancer.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::{Parser, Subcommand};

use driftgate::class::AssetClass;
use driftgate::config::Config;
use driftgate::engine::{self, Approval, CycleOutcome, Rebalancer};
use driftgate::error::Error;
use driftgate::events::{EventSink, JsonlSink, NullSink};
use driftgate::gateway::MarketGateway;
use driftgate::ledger::{CostBasis, PnlLedger};
use driftgate::paper::PaperGateway;
use driftgate::permission::PermissionBroker;
use driftgate::valuation;

#[derive(Parser)]
#[command(name = "driftgate")]
#[command(about = "Ratio-targeted portfolio rebalancer with PnL gates and a stable floor")]
#[command(version)]
struct Cli {
    /// Path to config.toml
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Path to the offline exchange scenario (balances + prices)
    #[arg(long, default_value = "scenario.json")]
    scenario: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run all configured instances on their intervals
    Run {
        /// Compute plans without executing anything
        #[arg(long)]
        dry_run: bool,

        /// Only run the named instance
        #[arg(long)]
        instance: Option<String>,
    },

    /// Run a single cycle per instance and exit
    Cycle {
        /// Compute the plan without executing
        #[arg(long)]
        dry_run: bool,

        /// Skip the confirmation prompt (for automation/cron)
        #[arg(long)]
        force: bool,

        /// Only run the named instance
        #[arg(long)]
        instance: Option<String>,
    },

    /// Show the current snapshot: class values and leg ratios vs targets
    Status,

    /// Per-asset FIFO cost basis and unrealized PnL
    Pnl,

    /// Ask the permission broker whether a purchase is allowed right now
    Permission {
        /// Notional to spend, in quote units
        #[arg(long)]
        amount: f64,

        /// Asset class to buy into (stable, alts, btc, eth)
        #[arg(long)]
        class: String,

        /// Instance whose targets govern the decision (default: first)
        #[arg(long)]
        instance: Option<String>,
    },

    /// Seed a cost-basis lot for a balance held before tracking began
    Seed {
        #[arg(long)]
        asset: String,

        #[arg(long)]
        quantity: f64,

        #[arg(long)]
        price: f64,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config: {e}");
            process::exit(1);
        }
    };

    let gateway: Arc<dyn MarketGateway> = match PaperGateway::from_scenario_file(&cli.scenario) {
        Ok(gateway) => Arc::new(gateway),
        Err(e) => {
            eprintln!("Error loading scenario: {e}");
            process::exit(1);
        }
    };

    let ledger = match config.ledger_path() {
        Some(path) => match PnlLedger::with_journal(&path) {
            Ok(ledger) => Arc::new(ledger),
            Err(e) => {
                eprintln!("Error opening ledger journal: {e}");
                process::exit(1);
            }
        },
        None => Arc::new(PnlLedger::new()),
    };

    let result = match cli.command {
        Command::Run { dry_run, instance } => {
            run_instances(&config, gateway, ledger, dry_run, instance.as_deref())
        }
        Command::Cycle {
            dry_run,
            force,
            instance,
        } => run_once(&config, gateway, ledger, dry_run, force, instance.as_deref()),
        Command::Status => show_status(&config, gateway.as_ref()),
        Command::Pnl => show_pnl(&config, gateway.as_ref(), &ledger),
        Command::Permission {
            amount,
            class,
            instance,
        } => query_permission(&config, gateway, amount, &class, instance.as_deref()),
        Command::Seed {
            asset,
            quantity,
            price,
        } => {
            ledger.seed(&asset, quantity, price);
            println!("Seeded {quantity} {asset} @ {price}");
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn open_sink(config: &Config) -> Arc<dyn EventSink> {
    match JsonlSink::open(&config.events_path()) {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            // Notification delivery is best-effort; run without it
            log::warn!("event log unavailable ({e}); events will be dropped");
            Arc::new(NullSink)
        }
    }
}

fn select_instances<'a>(
    config: &'a Config,
    name: Option<&str>,
) -> driftgate::error::Result<Vec<&'a driftgate::config::InstanceConfig>> {
    match name {
        Some(name) => config
            .instance(name)
            .map(|i| vec![i])
            .ok_or_else(|| Error::Config(format!("no instance named '{name}'"))),
        None => Ok(config.instances.iter().collect()),
    }
}

fn run_instances(
    config: &Config,
    gateway: Arc<dyn MarketGateway>,
    ledger: Arc<PnlLedger>,
    dry_run: bool,
    only: Option<&str>,
) -> driftgate::error::Result<()> {
    let sink = open_sink(config);
    let instances = select_instances(config, only)?;
    let stop = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::new();
    for instance in instances {
        let mut engine = Rebalancer::new(
            instance.clone(),
            config,
            Arc::clone(&gateway),
            Arc::clone(&ledger),
            Arc::clone(&sink),
        );
        let stop = Arc::clone(&stop);
        let name = instance.name.clone();
        handles.push(
            std::thread::Builder::new()
                .name(name)
                .spawn(move || {
                    if dry_run {
                        loop_dry_run(&mut engine, &stop);
                    } else {
                        engine.run_loop(&stop);
                    }
                })
                .map_err(Error::Audit)?,
        );
    }
    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}

fn loop_dry_run(engine: &mut Rebalancer, stop: &AtomicBool) {
    use std::sync::atomic::Ordering;
    while !stop.load(Ordering::Relaxed) {
        match engine.run_cycle(Approval::DryRun) {
            CycleOutcome::Planned(plan) => engine::display_plan(&plan),
            CycleOutcome::Skipped(reason) => log::info!("[dry-run] no action: {reason}"),
            CycleOutcome::Aborted(e) => log::error!("[dry-run] cycle aborted: {e}"),
            CycleOutcome::Completed(_) => {}
        }
        std::thread::sleep(engine.interval());
    }
}

fn run_once(
    config: &Config,
    gateway: Arc<dyn MarketGateway>,
    ledger: Arc<PnlLedger>,
    dry_run: bool,
    force: bool,
    only: Option<&str>,
) -> driftgate::error::Result<()> {
    let sink = open_sink(config);
    for instance in select_instances(config, only)? {
        let mut engine = Rebalancer::new(
            instance.clone(),
            config,
            Arc::clone(&gateway),
            Arc::clone(&ledger),
            Arc::clone(&sink),
        );
        let approval = if dry_run {
            Approval::DryRun
        } else if force {
            Approval::Auto
        } else {
            Approval::Confirm
        };
        println!("== {} ==", instance.name);
        match engine.run_cycle(approval) {
            CycleOutcome::Completed(summary) => println!(
                "{} executed, {} failed, {} skipped (${:.2} moved, state {})",
                summary.executed(),
                summary.failed(),
                summary.skipped(),
                summary.executed_notional(),
                summary.state,
            ),
            CycleOutcome::Planned(plan) => {
                if dry_run {
                    engine::display_plan(&plan);
                }
                println!("\nNot executed.");
            }
            CycleOutcome::Skipped(reason) => println!("No action: {reason}"),
            CycleOutcome::Aborted(e) => println!("Cycle aborted: {e}"),
        }
    }
    Ok(())
}

fn show_status(config: &Config, gateway: &dyn MarketGateway) -> driftgate::error::Result<()> {
    let snapshot = valuation::value_portfolio(gateway, &config.gateway)?;
    println!(
        "Portfolio: ${:.2} total, ${:.2} stable free",
        snapshot.total,
        snapshot.stable_free_value()
    );
    if !snapshot.degraded.is_empty() {
        println!("Degraded (no price): {}", snapshot.degraded.join(", "));
    }

    println!("\nHOLDINGS:");
    for holding in &snapshot.holdings {
        println!(
            "  {:8} {:>16.8} @ ${:>12.4} = ${:>10.2}  [{}]",
            holding.asset,
            holding.total_quantity(),
            holding.price,
            holding.value,
            holding.class,
        );
    }

    for instance in &config.instances {
        let tracked: f64 = instance
            .legs
            .iter()
            .map(|l| snapshot.leg_value(l))
            .sum();
        println!("\n{} (tracked ${tracked:.2}):", instance.name);
        for leg in &instance.legs {
            let value = snapshot.leg_value(leg);
            let ratio = if tracked > 0.0 { value / tracked } else { 0.0 };
            println!(
                "  {:10} ${:>10.2}  {:>5.1}%  (target {:.1}%)",
                leg.name,
                value,
                ratio * 100.0,
                leg.target * 100.0,
            );
        }
    }
    Ok(())
}

fn show_pnl(
    config: &Config,
    gateway: &dyn MarketGateway,
    ledger: &PnlLedger,
) -> driftgate::error::Result<()> {
    let snapshot = valuation::value_portfolio(gateway, &config.gateway)?;
    let holdings: Vec<(String, f64, f64)> = snapshot
        .holdings
        .iter()
        .filter(|h| h.class != AssetClass::Stable)
        .map(|h| (h.asset.clone(), h.total_quantity(), h.price))
        .collect();

    println!("COST BASIS (FIFO):");
    println!(
        "  {:8} {:>16} {:>12} {:>12} {:>12}",
        "Asset", "Held", "Price", "AvgCost", "Unrealized"
    );
    for row in ledger.report(&holdings) {
        match row.basis {
            CostBasis::Known {
                avg_cost,
                unrealized,
            } => println!(
                "  {:8} {:>16.8} {:>12.4} {:>12.4} {:>+12.2}",
                row.asset, row.held, row.price, avg_cost, unrealized
            ),
            CostBasis::Unknown => println!(
                "  {:8} {:>16.8} {:>12.4} {:>12} {:>12}",
                row.asset, row.held, row.price, "?", "no data"
            ),
        }
    }
    println!("\nAssets marked 'no data' need a seeded lot before they can be sold.");
    Ok(())
}

fn query_permission(
    config: &Config,
    gateway: Arc<dyn MarketGateway>,
    amount: f64,
    class: &str,
    instance: Option<&str>,
) -> driftgate::error::Result<()> {
    let class = AssetClass::parse(class)?;
    let instance = match instance {
        Some(name) => config
            .instance(name)
            .ok_or_else(|| Error::Config(format!("no instance named '{name}'")))?,
        None => &config.instances[0],
    };
    let sink = open_sink(config);
    let broker = PermissionBroker::new(gateway, sink, config.gateway.clone(), instance);
    let decision = broker.request(amount, class);
    print!("{decision}");
    Ok(())
}
