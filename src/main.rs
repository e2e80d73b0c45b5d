use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Request, Response};
use miniprof::cli::{Cli, OutputFormat};
use miniprof::client::{
    ClientOptions, CorrelationClient, HttpFetcher, InProcessTransport, ObservedCall,
    ObserverRegistry, ResultSummary,
};
use miniprof::config::ProfilerConfig;
use miniprof::context::InstrumentationContext;
use miniprof::profile::{Profile, ProfileId};
use miniprof::profiler::{Completion, Profiler};
use miniprof::protocol;
use miniprof::serde_millis::to_millis;
use miniprof::store::{EvictionTask, ProfileStore};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

/// Origin of the simulated application
const ORIGIN: &str = "http://localhost:3000";

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_config(args: &Cli) -> Result<ProfilerConfig> {
    let mut config = match &args.config {
        Some(path) => ProfilerConfig::from_file(path)?,
        None => ProfilerConfig::default(),
    };
    if let Some(base) = &args.base_path {
        config = config.with_base_url_path(base.clone());
    }
    if let Some(secs) = args.retention_secs {
        config.retention_secs = secs;
    }
    config
        .validate()
        .map_err(|e| anyhow!("Invalid config: {}", e))?;
    Ok(config)
}

/// One handled request as seen from the page
struct Exchange {
    url: Url,
    headers: HeaderMap,
    completion: Completion,
}

/// Run one request through the profiler with `work` as the handler
fn serve<F>(profiler: &Profiler, request: Request<()>, html: bool, work: F) -> Result<Exchange>
where
    F: FnOnce(&mut InstrumentationContext) -> Result<()>,
{
    let url = Url::parse(&request.uri().to_string())?;
    let (parts, ()) = request.into_parts();
    let mut ctx = profiler
        .start(&parts)
        .with_context(|| format!("request {} was not profiled", url))?;

    work(&mut ctx)?;

    let mut response = Response::new(());
    if html {
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
    }
    let completion = profiler.complete(ctx, &parts.headers, &mut response)?;
    Ok(Exchange {
        url,
        headers: response.headers().clone(),
        completion,
    })
}

fn work(micros: u64) {
    thread::sleep(Duration::from_micros(micros));
}

fn render_page(ctx: &mut InstrumentationContext) -> Result<()> {
    ctx.with_child("load settings", |ctx| {
        // same query, same cost: flagged as a duplicate
        ctx.record_sub_event("SELECT value FROM settings", Duration::from_micros(150));
        ctx.record_sub_event("SELECT value FROM settings", Duration::from_micros(150));
    });
    ctx.with_child("render layout", |ctx| {
        ctx.with_child("render header", |_| work(200));
        ctx.with_child("render body", |_| work(400));
    });
    Ok(())
}

fn load_item(profiler: &Profiler, ctx: &mut InstrumentationContext, item: usize) -> Result<()> {
    ctx.with_child("authenticate", |ctx| {
        ctx.measure_sub_event("SELECT * FROM sessions WHERE token = ?", || work(100));
    });
    ctx.with_child("load item", |ctx| {
        ctx.measure_sub_event(format!("SELECT * FROM items WHERE id = {}", item), || {
            work(300)
        });
    });

    // the first item also warms the price cache through an internal call
    if item == 0 {
        let warm = serve(
            profiler,
            Request::post(format!("{}/internal/prices/warm", ORIGIN)).body(())?,
            false,
            |ctx| {
                ctx.with_child("warm prices", |_| work(250));
                Ok(())
            },
        )?;
        if let Completion::Stored { id, .. } = warm.completion {
            ctx.add_related_id(id);
        }
    }
    Ok(())
}

/// Issue `requests` XHR calls spread over `threads` workers
fn issue_xhr_requests(profiler: &Profiler, requests: usize, threads: usize) -> Result<Vec<Exchange>> {
    thread::scope(|scope| -> Result<Vec<Exchange>> {
        let workers: Vec<_> = (0..threads)
            .map(|worker| {
                scope.spawn(move || -> Result<Vec<Exchange>> {
                    let mut exchanges = Vec::new();
                    for item in (worker..requests).step_by(threads) {
                        let request = Request::get(format!("{}/api/items/{}", ORIGIN, item))
                            .header(protocol::REQUESTED_WITH_HEADER, protocol::XHR_MARKER)
                            .body(())?;
                        exchanges.push(serve(profiler, request, false, |ctx| {
                            load_item(profiler, ctx, item)
                        })?);
                    }
                    Ok(exchanges)
                })
            })
            .collect();

        let mut exchanges = Vec::with_capacity(requests);
        for worker in workers {
            let batch = worker
                .join()
                .map_err(|_| anyhow!("request worker panicked"))??;
            exchanges.extend(batch);
        }
        Ok(exchanges)
    })
}

/// Feed every observed call to the correlation client and wait for all fetches
async fn correlate(
    store: Arc<ProfileStore>,
    options: ClientOptions,
    calls: &[Exchange],
) -> Result<(Vec<ResultSummary>, u64)> {
    let page_id = options.current_id.clone();
    let fetcher = HttpFetcher::new(InProcessTransport::new(store), options.path.clone());
    let client = CorrelationClient::start(options, fetcher);

    let registry = ObserverRegistry::new();
    registry.register(Arc::new(client.clone()));
    for call in calls {
        registry.notify(&ObservedCall {
            url: call.url.clone(),
            headers: call.headers.clone(),
        });
    }

    let mut results = vec![client.fetch_once(page_id.clone()).await?];
    for id in client.known_ids().into_iter().filter(|id| id != &page_id) {
        results.push(client.fetch_once(id).await?);
    }
    Ok((results, client.fetches_started()))
}

#[derive(Serialize)]
struct Report {
    page_id: ProfileId,
    bootstrap: Option<String>,
    results: Vec<ResultSummary>,
    fetches_started: u64,
    stored_profiles: usize,
}

fn print_tree(profile: &Profile) {
    println!("=== Timing Tree: {} ===", profile.name());
    for node in profile.root().walk() {
        let indent = node.depth() as usize * 2;
        println!(
            "{:indent$}{} {:.3} ms ({:.3} ms self)",
            "",
            node.name(),
            to_millis(node.duration()),
            to_millis(node.duration_without_children()),
            indent = indent
        );
        for event in node.sub_events() {
            println!(
                "{:indent$}- {} {:.3} ms{}",
                "",
                event.description,
                to_millis(event.duration),
                if event.is_duplicate { " (duplicate)" } else { "" },
                indent = indent + 2
            );
        }
    }
    println!();
}

fn print_text(report: &Report) {
    println!("page profile: {}", report.page_id);
    if let Some(script) = &report.bootstrap {
        println!("bootstrap: {}", script);
    }
    println!();
    println!("{:<22} {:<6} {:<28} {:>12}", "ID", "METHOD", "PATH", "DURATION");
    println!("─────────────────────────────────────────────────────────────────────");
    for result in &report.results {
        println!(
            "{:<22} {:<6} {:<28} {:>9.3} ms",
            result.id.as_str(),
            result.method,
            result.url_path,
            to_millis(result.duration)
        );
    }
    println!("─────────────────────────────────────────────────────────────────────");
    println!(
        "fetched {} profiles ({} fetches), {} stored",
        report.results.len(),
        report.fetches_started,
        report.stored_profiles
    );
}

fn main() -> Result<()> {
    let args = Cli::parse();

    if args.threads == 0 {
        bail!("Invalid value for --threads: 0 (must be >= 1)");
    }

    init_tracing(args.debug);

    let config = load_config(&args)?;
    let store = Arc::new(ProfileStore::new());
    let eviction = EvictionTask::spawn(
        Arc::clone(&store),
        config.eviction_interval(),
        config.retention(),
    );
    let profiler = Profiler::new(config, Arc::clone(&store)).with_machine_name("localhost");
    let base_path = profiler.config().base_url_path.clone();

    let page = serve(
        &profiler,
        Request::get(format!("{}/", ORIGIN)).body(())?,
        true,
        render_page,
    )?;
    let Completion::Stored {
        id: page_id,
        script: bootstrap,
    } = page.completion
    else {
        bail!("page profile was discarded");
    };
    info!(%page_id, "page profiled");

    let calls = issue_xhr_requests(&profiler, args.requests, args.threads)?;

    let options = ClientOptions::new(base_path, page_id.clone(), Url::parse(ORIGIN)?.origin());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let (results, fetches_started) =
        runtime.block_on(correlate(Arc::clone(&store), options, &calls))?;

    if args.tree {
        let profile = store
            .get(&page_id)
            .with_context(|| format!("page profile {} missing from store", page_id))?;
        print_tree(&profile);
    }

    let report = Report {
        page_id,
        bootstrap,
        results,
        fetches_started,
        stored_profiles: store.len(),
    };
    match args.format {
        OutputFormat::Text => print_text(&report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    eviction.shutdown();
    Ok(())
}
