use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tabula_core::{EngineConfig, FilterValue, MutationKind, MutationRequest, QuerySpec, ResourceName, SortSpec};
use tabula_ops::{CascadeGraph, CascadeReport, MutationCoordinator, Notice};
use tabula_source::{MemoryBackend, Record};
use tabula_store::{spawn_query_input, QueryState, StatsState, ViewController, ViewState};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tabulactl", version, about = "Tabula CLI: drive paginated views against an in-memory console backend")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Simulated backend latency per call
    #[arg(long = "latency-ms", global = true, default_value_t = 0)]
    latency_ms: u64,

    /// Number of seeded pending rows (every fifth has no email)
    #[arg(long = "seed", global = true, default_value_t = 10)]
    seed: i64,

    /// Page size (default: TABULA_PAGE_SIZE)
    #[arg(long = "page-size", global = true)]
    page_size: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List a resource, optionally loading more pages
    Ls {
        /// Resource, e.g. "pending" or "subscriptions"
        resource: String,
        /// Free-text search
        #[arg(long = "search")]
        search: Option<String>,
        /// Filter as key=value (repeatable; empty value clears)
        #[arg(long = "filter", action = ArgAction::Append)]
        filters: Vec<String>,
        /// Sort field; prefix with '-' for descending
        #[arg(long = "sort")]
        sort: Option<String>,
        /// Pages to load (1 = first page only)
        #[arg(long = "pages", default_value_t = 1)]
        pages: u32,
    },
    /// Show derived counters for a resource
    Stats {
        resource: String,
    },
    /// Run a mutation and wait for its cascade
    Mutate {
        /// Kind, e.g. "mark-pending-complete", "bulk-process-pending", "cancel-subscription"
        kind: String,
        /// Target row id
        #[arg(long = "target")]
        target: Option<String>,
        /// JSON payload, e.g. '{"all":true}'
        #[arg(long = "payload")]
        payload: Option<String>,
    },
    /// Type a search into the debounced input, one keystroke per prefix
    Search {
        resource: String,
        text: String,
        /// Gap between keystrokes
        #[arg(long = "gap-ms", default_value_t = 100)]
        gap_ms: u64,
    },
}

fn init_tracing() {
    let env = std::env::var("TABULA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TABULA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TABULA_METRICS_ADDR; expected host:port");
        }
    }
}

/// Console-shaped data: pending reviews, legacy imports, a few subscriptions,
/// users and knowledge-base entries.
fn seed(be: &MemoryBackend, pending: i64) {
    be.insert(
        ResourceName::PENDING,
        (1..=pending).map(|i| {
            let r = Record::new(i).with("status", "pending").with("name", format!("applicant {}", i));
            if i % 5 == 3 { r } else { r.with("email", format!("applicant{}@example.org", i)) }
        }),
    );
    be.insert(
        ResourceName::LEGACY,
        (101..=106).map(|i| Record::new(i).with("email", format!("legacy{}@example.org", i)).with("processed", i % 2 == 0)),
    );
    be.insert(
        ResourceName::SUBSCRIPTIONS,
        (201..=203).map(|i| Record::new(i).with("email", format!("member{}@example.org", i)).with("status", "active")),
    );
    be.insert(ResourceName::USERS, [("ada", "admin"), ("grace", "staff"), ("linus", "staff")].into_iter().enumerate().map(
        |(n, (name, role))| Record::new(301 + n as i64).with("name", name).with("role", role),
    ));
    be.insert(
        ResourceName::KNOWLEDGE_BASE,
        (401..=404).map(|i| Record::new(i).with("title", format!("article {}", i))),
    );
}

fn parse_filter(raw: &str) -> Result<(String, Option<FilterValue>)> {
    let (k, v) = raw.split_once('=').ok_or_else(|| anyhow!("filter must be key=value, got {:?}", raw))?;
    let value = if v.is_empty() { None } else { Some(FilterValue::parse(v)) };
    Ok((k.trim().to_string(), value))
}

fn parse_sort(raw: &str) -> SortSpec {
    match raw.strip_prefix('-') {
        Some(field) => SortSpec::desc(field),
        None => SortSpec::asc(raw),
    }
}

fn print_view(out: Output, resource: &ResourceName, view: &ViewState<Record>) -> Result<()> {
    match out {
        Output::Human => {
            println!("{} • {} of {} loaded{}", resource, view.len(), view.total_count, if view.has_more() { " • more available" } else { "" });
            if let Some(e) = &view.error { println!("error: {}", e); }
            for r in &view.items {
                println!("  {:<6} {}", r.id.to_string(), serde_json::Value::Object(r.fields.clone()));
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(view)?),
    }
    Ok(())
}

fn print_stats(out: Output, resource: &ResourceName, stats: &StatsState) -> Result<()> {
    match out {
        Output::Human => {
            let parts: Vec<String> = stats.counters.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            println!("{} stats: {}", resource, if parts.is_empty() { "(none)".to_string() } else { parts.join(" ") });
            if let Some(e) = &stats.error { println!("error: {}", e); }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(stats)?),
    }
    Ok(())
}

#[derive(Serialize)]
struct MutateReport<'a> {
    kind: &'a MutationKind,
    summary: String,
    result: &'a tabula_core::WriteResult,
    cascade: &'a CascadeReport,
    notices: &'a [Notice],
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = EngineConfig::from_env();
    let page_size = cli.page_size.unwrap_or(cfg.page_size);

    let mut backend = MemoryBackend::console();
    if cli.latency_ms > 0 { backend = backend.with_latency(Duration::from_millis(cli.latency_ms)); }
    seed(&backend, cli.seed);
    let backend = Arc::new(backend);

    match cli.command {
        Commands::Ls { resource, search, filters, sort, pages } => {
            let resource = ResourceName::from(resource);
            let mut q = QuerySpec::new(page_size).with_search(search.as_deref()).with_sort(sort.as_deref().map(parse_sort));
            for raw in &filters {
                let (k, v) = parse_filter(raw)?;
                q = q.with_filter(&k, v);
            }
            info!(resource = %resource, params = ?q.to_params(), "ls invoked");
            let view = ViewController::new(resource.clone(), backend.clone());
            view.mount(q).await;
            for _ in 1..pages.max(1) {
                if !view.load_more().await.is_applied() { break; }
            }
            print_view(cli.output, &resource, &view.current())?;
        }
        Commands::Stats { resource } => {
            let resource = ResourceName::from(resource);
            info!(resource = %resource, "stats invoked");
            let view = ViewController::new(resource.clone(), backend.clone());
            view.refresh_stats().await;
            print_stats(cli.output, &resource, &view.stats())?;
        }
        Commands::Mutate { kind, target, payload } => {
            let kind = MutationKind::from(kind.as_str());
            let mut req = MutationRequest::new(kind.clone());
            req.target = target;
            if let Some(raw) = payload {
                req = req.with_payload(serde_json::from_str(&raw).context("--payload is not valid JSON")?);
            }
            info!(kind = %kind, "mutate invoked");

            let coord = MutationCoordinator::from_config(backend.clone(), CascadeGraph::console(), &cfg);
            let mut views = Vec::new();
            for name in [ResourceName::PENDING, ResourceName::SUBSCRIPTIONS, ResourceName::LEGACY, ResourceName::USERS, ResourceName::KNOWLEDGE_BASE] {
                let v = Arc::new(ViewController::new(name, backend.clone()));
                v.mount(QuerySpec::new(page_size)).await;
                coord.register(v.clone());
                views.push(v);
            }
            let mut notices = coord.subscribe();

            let outcome = match coord.mutate(req).await {
                Ok(o) => o,
                Err(e) => {
                    eprintln!("mutation failed: {}", e);
                    return Err(anyhow!(e));
                }
            };
            let cascade = outcome.cascade.join().await;
            let mut seen = Vec::new();
            while let Ok(n) = notices.try_recv() { seen.push(n); }

            match cli.output {
                Output::Human => {
                    println!("{}: {}", outcome.kind, outcome.result.summary());
                    if let Some(bulk) = outcome.result.bulk() {
                        for f in &bulk.failures { println!("  failed {}: {}", f.id, f.error); }
                    }
                    let refreshed: Vec<String> = cascade.refreshed.iter().map(|t| t.to_string()).collect();
                    println!("refreshed: {}", refreshed.join(", "));
                    for (t, e) in &cascade.failed { println!("refresh failed: {} ({})", t, e); }
                    for v in &views {
                        if cascade.refreshed.iter().any(|t| &t.resource == v.resource()) {
                            print_view(cli.output, v.resource(), &v.current())?;
                            if v.stats().is_loaded() { print_stats(cli.output, v.resource(), &v.stats())?; }
                        }
                    }
                }
                Output::Json => {
                    let report = MutateReport {
                        kind: &outcome.kind,
                        summary: outcome.result.summary(),
                        result: &outcome.result,
                        cascade: &cascade,
                        notices: &seen,
                    };
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
            }
        }
        Commands::Search { resource, text, gap_ms } => {
            let resource = ResourceName::from(resource);
            info!(resource = %resource, text = %text, gap_ms, debounce_ms = cfg.debounce_ms, "search invoked");
            let view = Arc::new(ViewController::new(resource.clone(), backend.clone()));
            let initial = QuerySpec::new(page_size);
            let want = initial.with_search(Some(&text));
            view.mount(initial.clone()).await;
            let mut version = view.subscribe();
            let (input, specs, input_task) = spawn_query_input(QueryState::new(initial, cfg.debounce()));
            let follower = view.follow(specs);
            let mut typed = String::new();
            for ch in text.chars() {
                typed.push(ch);
                input.search(typed.clone());
                tokio::time::sleep(Duration::from_millis(gap_ms)).await;
            }
            drop(input);
            if let Err(e) = input_task.await { warn!(error = %e, "query input task failed"); }
            if let Err(e) = follower.await { warn!(error = %e, "query follower failed"); }
            loop {
                let cur = view.current();
                if cur.error.is_some() || (!cur.is_busy() && cur.last_applied_query.as_ref() == Some(&want)) { break; }
                if version.changed().await.is_err() { break; }
            }
            print_view(cli.output, &resource, &view.current())?;
        }
    }

    Ok(())
}
