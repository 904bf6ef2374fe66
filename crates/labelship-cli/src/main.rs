use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;

use labelship::config::{CONFIG_FILE, CliOverrides, LabelshipConfig};
use labelship::merge::{DocumentSource, MergeMode, MergeOutcome, MergeRequest};
use labelship::rates::ShopResult;
use labelship::reporter::Reporter;
use labelship::runtime::Runtime;
use labelship::types::{
    BulkRun, LabelDocument, Order, OrderId, OrderOutcome, RunStatus, SHIPPING_KIND,
};

mod logging;

use logging::{LogFormat, TracingReporter};

/// Exit status when some orders of a run failed.
const EXIT_PARTIAL: u8 = 2;
/// Exit status when every processed order failed.
const EXIT_ALL_FAILED: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "labelship", version)]
#[command(about = "Multi-carrier shipping labels for marketplace orders")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Store directory (overrides `store.dir`)
    #[arg(long, global = true)]
    store_dir: Option<PathBuf>,

    /// Name recorded as the actor of every change
    #[arg(long, global = true, default_value = "cli")]
    actor: String,

    /// Reclaim leases older than this when a batch starts (e.g. 5m)
    #[arg(long, global = true)]
    lease_timeout: Option<String>,

    /// Stop starting new orders after this long (e.g. 30m)
    #[arg(long, global = true)]
    deadline: Option<String>,

    /// Never pick a rate with a longer transit estimate
    #[arg(long, global = true)]
    max_eta_days: Option<u32>,

    /// Log format on stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Print results as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load or refresh orders from a JSON array file.
    ImportOrders {
        #[arg(long)]
        file: PathBuf,
    },
    /// Quote every provider for one order and flag the cheapest rate.
    Shop {
        #[arg(long)]
        order_id: OrderId,
    },
    /// Buy labels for a batch of orders.
    CreateLabels {
        /// Comma-separated order IDs
        #[arg(long = "order-ids", value_delimiter = ',', required = true)]
        order_ids: Vec<OrderId>,

        /// Merge the purchased labels into one printable file
        #[arg(long)]
        merge: bool,
    },
    /// Void an order's active label.
    Void {
        #[arg(long)]
        order_id: OrderId,
    },
    /// Inspect or release order leases.
    Locks {
        #[command(subcommand)]
        cmd: LockCommands,
    },
    /// Merge a day's label documents for printing.
    Merge {
        #[arg(long, default_value = SHIPPING_KIND)]
        kind: String,

        #[arg(long, value_enum, default_value_t = SourceArg::All)]
        source: SourceArg,

        /// Day to collect, YYYY-MM-DD (default: today, UTC)
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Mark the collected orders as printed
        #[arg(long)]
        print: bool,
    },
    /// Register a manually uploaded label document.
    UploadLabel {
        #[arg(long)]
        url: String,

        #[arg(long)]
        order_id: Option<OrderId>,

        #[arg(long, default_value = SHIPPING_KIND)]
        kind: String,
    },
    /// Browse bulk-run records.
    History {
        #[command(subcommand)]
        cmd: HistoryCommands,
    },
}

#[derive(Subcommand, Debug)]
enum LockCommands {
    /// Show lease state; lists every locked order when no IDs are given.
    Status {
        #[arg(long = "order-ids", value_delimiter = ',')]
        order_ids: Vec<OrderId>,
    },
    /// Release leases regardless of holder.
    Release {
        #[arg(long = "order-ids", value_delimiter = ',', required = true)]
        order_ids: Vec<OrderId>,
    },
    /// Release every lease older than the sweep timeout.
    Sweep {
        /// Overrides `leases.sweep_timeout` (e.g. 10m)
        #[arg(long)]
        older_than: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum HistoryCommands {
    /// Most recent runs first.
    List {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// One run with its per-order results.
    Show {
        run_id: String,

        #[arg(long)]
        failures_only: bool,
    },
    /// Record that the run's summary mail went out.
    MarkMailed { run_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SourceArg {
    Purchased,
    Uploaded,
    All,
}

impl SourceArg {
    fn sources(self) -> Vec<DocumentSource> {
        match self {
            SourceArg::Purchased => vec![DocumentSource::Purchased],
            SourceArg::Uploaded => vec![DocumentSource::Uploaded],
            SourceArg::All => vec![DocumentSource::Purchased, DocumentSource::Uploaded],
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let overrides = CliOverrides {
        store_dir: cli.store_dir.clone(),
        lease_timeout: cli.lease_timeout.as_deref().map(parse_duration).transpose()?,
        deadline: cli.deadline.as_deref().map(parse_duration).transpose()?,
        max_eta_days: cli.max_eta_days,
        merge_labels: matches!(cli.cmd, Commands::CreateLabels { merge: true, .. }),
    };
    let config = LabelshipConfig::load_or_default(&cli.config)?.with_overrides(overrides);
    let runtime = Runtime::from_config(config)?;

    let mut reporter = TracingReporter;
    let actor = cli.actor.as_str();
    let json = cli.json;

    match cli.cmd {
        Commands::ImportOrders { file } => {
            let (added, refreshed) = import_orders(&runtime, &file)?;
            if json {
                print_json(&json!({ "added": added, "refreshed": refreshed }))?;
            } else {
                println!("imported {added} new order(s), refreshed {refreshed}");
            }
        }
        Commands::Shop { order_id } => {
            let result = runtime.shopper().shop(order_id, actor, &mut reporter)?;
            if json {
                print_json(&json!({
                    "order_id": order_id,
                    "best": result.best(),
                    "rates": result.all(),
                }))?;
            } else {
                print_shop(order_id, &result, runtime.config().batch.max_eta_days);
            }
        }
        Commands::CreateLabels { order_ids, .. } => {
            let run = runtime
                .orchestrator()
                .create_labels(&order_ids, actor, &mut reporter)?;
            if json {
                print_json(&run)?;
            } else {
                print_run(&run, false);
            }
            return Ok(run_exit_code(&run));
        }
        Commands::Void { order_id } => {
            let shipment = runtime
                .orchestrator()
                .void_shipment(order_id, actor, &mut reporter)?;
            if json {
                print_json(&shipment)?;
            } else {
                println!(
                    "voided label {} ({} {}) for order {order_id}",
                    shipment.label_id, shipment.carrier, shipment.tracking_number
                );
            }
        }
        Commands::Locks { cmd } => run_locks(&runtime, cmd, json, &mut reporter)?,
        Commands::Merge {
            kind,
            source,
            date,
            print,
        } => {
            let request = MergeRequest {
                kind,
                sources: source.sources(),
                date: date.unwrap_or_else(|| Utc::now().date_naive()),
                mode: if print {
                    MergeMode::Print
                } else {
                    MergeMode::Preview
                },
            };
            let outcome = runtime
                .printer()
                .merge_for_print(&request, actor, &mut reporter)?;
            print_merge(&outcome, json)?;
        }
        Commands::UploadLabel {
            url,
            order_id,
            kind,
        } => {
            if url.trim().is_empty() {
                bail!("--url cannot be empty");
            }
            let document = runtime.store().add_label_document(LabelDocument {
                id: 0,
                order_id,
                url,
                kind,
                uploaded_at: Utc::now(),
            })?;
            if json {
                print_json(&document)?;
            } else {
                println!("uploaded document {} ({})", document.id, document.kind);
            }
        }
        Commands::History { cmd } => run_history(&runtime, cmd, json)?,
    }

    Ok(ExitCode::SUCCESS)
}

fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s).with_context(|| format!("invalid duration: {s}"))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_exit_code(run: &BulkRun) -> ExitCode {
    if run.all_failed() {
        ExitCode::from(EXIT_ALL_FAILED)
    } else if run.status == RunStatus::Partial {
        ExitCode::from(EXIT_PARTIAL)
    } else {
        ExitCode::SUCCESS
    }
}

/// Insert new orders; refresh the marketplace fields of known ones.
fn import_orders(runtime: &Runtime, path: &Path) -> Result<(usize, usize)> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read orders file {}", path.display()))?;
    let orders: Vec<Order> = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse orders file {}", path.display()))?;

    let store = runtime.store();
    let (mut added, mut refreshed) = (0, 0);
    for incoming in orders {
        if store.refresh_order(incoming)? {
            refreshed += 1;
        } else {
            added += 1;
        }
    }
    Ok((added, refreshed))
}

fn run_locks(
    runtime: &Runtime,
    cmd: LockCommands,
    json: bool,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    match cmd {
        LockCommands::Status { order_ids } if order_ids.is_empty() => {
            let locked = runtime.store().locked_orders()?;
            if json {
                let rows: Vec<_> = locked
                    .iter()
                    .map(|o| {
                        json!({
                            "order_id": o.id,
                            "holder": o.lock_holder,
                            "since": o.lock_started_at,
                        })
                    })
                    .collect();
                print_json(&rows)?;
            } else if locked.is_empty() {
                println!("no locked orders");
            } else {
                for order in &locked {
                    println!(
                        "{}: locked by {} since {}",
                        order.id,
                        order.lock_holder.as_deref().unwrap_or("unknown"),
                        order
                            .lock_started_at
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| "unknown".to_string())
                    );
                }
            }
        }
        LockCommands::Status { order_ids } => {
            let status = runtime.leases().status(&order_ids)?;
            if json {
                print_json(&status)?;
            } else {
                for id in &order_ids {
                    let state = match status.get(id) {
                        Some(true) => "locked",
                        Some(false) => "unlocked",
                        None => "not found",
                    };
                    println!("{id}: {state}");
                }
            }
        }
        LockCommands::Release { order_ids } => {
            let released = runtime.leases().force_release(&order_ids)?;
            reporter.info(&format!("released {released} lease(s)"));
            if json {
                print_json(&json!({ "released": released }))?;
            } else {
                println!("released {released} lease(s)");
            }
        }
        LockCommands::Sweep { older_than } => {
            let stale_after = match older_than {
                Some(s) => parse_duration(&s)?,
                None => runtime.config().leases.sweep_timeout,
            };
            let released = runtime.leases().sweep(stale_after)?;
            if json {
                let ids: Vec<OrderId> = released.iter().map(|r| r.order_id).collect();
                print_json(&json!({ "released": ids }))?;
            } else {
                for lease in &released {
                    println!(
                        "released {} (held by {})",
                        lease.order_id,
                        lease.holder.as_deref().unwrap_or("unknown")
                    );
                }
                println!("swept {} stale lease(s)", released.len());
            }
        }
    }
    Ok(())
}

fn run_history(runtime: &Runtime, cmd: HistoryCommands, json: bool) -> Result<()> {
    let history = runtime.history();
    match cmd {
        HistoryCommands::List { limit } => {
            let runs = history.list_runs(limit)?;
            if json {
                return print_json(&runs);
            }
            if runs.is_empty() {
                println!("no bulk runs recorded");
            }
            for run in &runs {
                println!(
                    "{}  {:<9}  {}  ok={} failed={} by {}{}",
                    run.id,
                    run.status,
                    run.started_at.to_rfc3339(),
                    run.success_count,
                    run.failed_count,
                    run.created_by,
                    if run.mail_sent { "  (mailed)" } else { "" }
                );
            }
        }
        HistoryCommands::Show {
            run_id,
            failures_only,
        } => {
            let mut run = history
                .get_run(&run_id)?
                .with_context(|| format!("bulk run {run_id} not found"))?;
            if failures_only {
                run.results = history.failures(&run_id)?;
            }
            if json {
                return print_json(&run);
            }
            print_run(&run, failures_only);
        }
        HistoryCommands::MarkMailed { run_id } => {
            history.mark_mail_sent(&run_id)?;
            println!("marked {run_id} as mailed");
        }
    }
    Ok(())
}

fn print_shop(order_id: OrderId, result: &ShopResult, max_eta_days: u32) {
    match result.best() {
        Some(best) => println!(
            "order {order_id}: cheapest is {} {} {} at {:.2} {}",
            best.source, best.carrier, best.service, best.price, best.currency
        ),
        None => println!("order {order_id}: no rate within {max_eta_days} day(s)"),
    }
    for rate in result.all() {
        let eta = rate
            .eta_days
            .map(|d| format!("{d}d"))
            .unwrap_or_else(|| "?".to_string());
        println!(
            "  {} {:<10} {:<8} {:<12} {:>8.2} {} eta={eta}",
            if rate.is_cheapest { "*" } else { " " },
            rate.source,
            rate.carrier,
            rate.service,
            rate.price,
            rate.currency
        );
    }
}

fn print_run(run: &BulkRun, failures_only: bool) {
    println!("run_id: {}", run.id);
    println!("status: {}", run.status);
    println!("created_by: {}", run.created_by);
    println!("started_at: {}", run.started_at.to_rfc3339());
    println!("finished_at: {}", run.finished_at.to_rfc3339());
    println!(
        "processed: {} (succeeded {}, failed {})",
        run.processed_count, run.success_count, run.failed_count
    );
    if !run.providers_used.is_empty() {
        println!("providers: {}", run.providers_used.join(", "));
    }
    if !run.locked_out_order_ids.is_empty() {
        let ids: Vec<String> = run.locked_out_order_ids.iter().map(u64::to_string).collect();
        println!("locked_out: {}", ids.join(", "));
    }
    if run.deadline_exceeded {
        println!("deadline_exceeded: true");
    }
    if let Some(url) = &run.merged_artifact_url {
        println!("merged: {url}");
    }
    println!();

    for result in &run.results {
        let id = result.order_id;
        match &result.outcome {
            OrderOutcome::Purchased {
                source,
                tracking_number,
                carrier,
                cost,
                retries_attempted,
                sync_warning,
                notified,
                ..
            } => {
                println!(
                    "order {id}: purchased via {source} ({carrier} {tracking_number}, {cost:.2}) retries={retries_attempted}"
                );
                if let Some(warning) = sync_warning {
                    println!("  warning: {warning}");
                }
                if *notified {
                    println!("  multi-SKU notice sent");
                }
            }
            OrderOutcome::Skipped { reason, .. } if !failures_only => {
                println!("order {id}: skipped ({reason})");
            }
            OrderOutcome::Skipped { .. } => {}
            OrderOutcome::Failed {
                kind,
                message,
                retries_attempted,
                ..
            } => {
                println!("order {id}: failed [{kind}] {message} (retries={retries_attempted})");
            }
        }
    }
}

fn print_merge(outcome: &MergeOutcome, json: bool) -> Result<()> {
    if json {
        let value = match outcome {
            MergeOutcome::NothingToMerge => json!({ "outcome": "nothing_to_merge" }),
            MergeOutcome::Single { url, order_id } => {
                json!({ "outcome": "single", "url": url, "order_id": order_id })
            }
            MergeOutcome::Merged {
                url,
                pages,
                documents,
                skipped,
            } => json!({
                "outcome": "merged",
                "url": url,
                "pages": pages,
                "documents": documents,
                "skipped": skipped,
            }),
        };
        return print_json(&value);
    }

    match outcome {
        MergeOutcome::NothingToMerge => println!("nothing to merge"),
        MergeOutcome::Single { url, .. } => println!("single document: {url}"),
        MergeOutcome::Merged {
            url,
            pages,
            documents,
            skipped,
        } => {
            println!("merged {documents} document(s), {pages} page(s): {url}");
            for url in skipped {
                println!("  skipped: {url}");
            }
        }
    }
    Ok(())
}
