use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use snafu::{ResultExt, Snafu};
use tracing::{error, info, warn};

use spectre::analysis::drain::store::TemplateStore;
use spectre::analysis::drain::DrainConfig;
use spectre::analysis::BaselineCache;
use spectre::api::{ApiContext, ApiServer};
use spectre::block_store::{BlockCache, BlockStore, BlockStoreError};
use spectre::config::Opts;
use spectre::graph::namespace_impact::NamespaceImpactDetector;
use spectre::graph::reconcile::Reconciler;
use spectre::graph::revalidate::Revalidator;
use spectre::graph::ttl::TtlCleaner;
use spectre::graph::{GraphBuilder, GraphClient, GraphError};
use spectre::integrations::config_store::ConfigStore;
use spectre::integrations::manager::IntegrationManager;
use spectre::integrations::IntegrationContext;
use spectre::kubernetes::{run_config_poller, WatcherFleet};
use spectre::lifecycle::{TaskGroup, SHUTDOWN_DEADLINE};
use spectre::mcp::McpHandler;
use spectre::pipeline::Pipeline;
use spectre::tools::cluster::{self, ClusterToolContext};
use spectre::tools::ToolRegistry;

#[derive(Debug, Snafu)]
enum StartupError {
    #[snafu(display("graph engine unavailable: {}", source))]
    Graph { source: GraphError },

    #[snafu(display("block store failed to open: {}", source))]
    Store { source: BlockStoreError },
}

fn init_logging(opts: &Opts) {
    use tracing_subscriber::prelude::*;

    let filter = tracing_subscriber::EnvFilter::try_new(&opts.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // In stdio mode stdout carries the protocol; all diagnostics go to
    // stderr.
    if opts.stdio {
        let fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        tracing_subscriber::registry().with(filter).with(fmt).init();
    } else {
        let fmt = tracing_subscriber::fmt::layer();
        tracing_subscriber::registry().with(filter).with(fmt).init();
    }
}

#[tokio::main]
async fn main() {
    let opts = Opts::parse();
    init_logging(&opts);

    if let Err(error) = run(opts).await {
        error!(message = "fatal startup error", %error);
        std::process::exit(exitcode::SOFTWARE);
    }
}

async fn run(opts: Opts) -> Result<(), StartupError> {
    info!(message = "spectre starting", version = env!("CARGO_PKG_VERSION"));

    // Storage and graph first; both are fatal when unavailable at startup.
    let graph = GraphClient::connect(&opts.graph_config())
        .await
        .context(GraphSnafu)?;
    graph.init_schema().await.context(GraphSnafu)?;

    let cache = BlockCache::new(opts.block_cache_bytes());
    let store = Arc::new(
        BlockStore::open(opts.blocks_dir(), opts.segment_size, cache)
            .await
            .context(StoreSnafu)?,
    );

    let templates = TemplateStore::new(DrainConfig::default(), Some(opts.templates_path()));
    if let Err(error) = templates.load().await {
        warn!(message = "template snapshot unusable, starting fresh", %error);
    }
    let baselines = Arc::new(BaselineCache::new());
    let tools = ToolRegistry::new();

    // Kubernetes is optional: without a cluster the store, graph, and
    // integrations still serve queries.
    let kube = match kube::Client::try_default().await {
        Ok(client) => Some(client),
        Err(error) => {
            warn!(message = "no Kubernetes client, watchers disabled", %error);
            None
        }
    };

    // Event pipeline and its sinks.
    let mut pipeline = Pipeline::new(opts.event_queue_capacity);
    let queue = pipeline.queue();
    let builder = GraphBuilder::new(graph.clone());
    let impact = NamespaceImpactDetector::new(graph.clone());
    pipeline.add_sink(Arc::clone(&store));
    pipeline.add_sink(builder);
    pipeline.add_sink(Arc::clone(&impact));
    let handle = pipeline.handle();

    cluster::register(
        &tools,
        ClusterToolContext {
            store: Arc::clone(&store),
            graph: graph.clone(),
            queue: Arc::clone(&queue),
        },
    );

    let integration_context = IntegrationContext {
        kube: kube.clone(),
        graph: graph.clone(),
        templates: Arc::clone(&templates),
        baselines: Arc::clone(&baselines),
        tools: Arc::clone(&tools),
        secrets_namespace: opts.secrets_namespace.clone(),
    };
    let manager = IntegrationManager::new(
        ConfigStore::new(opts.integrations_config.clone()),
        integration_context,
    );

    let mcp = McpHandler::new(Arc::clone(&tools));

    // Stage 1: ingress (watchers and servers).
    let mut ingress = TaskGroup::new("ingress");
    let fleet = kube.clone().map(|client| WatcherFleet::new(client, handle.clone()));
    if let Some(fleet) = &fleet {
        let poller_fleet = Arc::clone(fleet);
        let path = opts.watch_config.clone();
        let token = ingress.token();
        ingress.spawn("watch-config-poller", async move {
            run_config_poller(path, poller_fleet, token).await;
        });
    }

    let api_context = ApiContext {
        store: Arc::clone(&store),
        graph: graph.clone(),
        queue: Arc::clone(&queue),
        fleet: fleet.clone(),
        manager: Arc::clone(&manager),
        mcp: Arc::clone(&mcp),
        mcp_path: opts.mcp_path.clone(),
        limiter: Arc::new(tokio::sync::Semaphore::new(opts.max_concurrent_requests)),
    };
    let api = ApiServer::new(([0, 0, 0, 0], opts.port).into(), api_context);
    let api_token = ingress.token();
    ingress.spawn("http-api", async move {
        api.run(api_token).await;
    });

    if opts.stdio {
        let stdio_mcp = Arc::clone(&mcp);
        let token = ingress.token();
        ingress.spawn("mcp-stdio", async move {
            spectre::mcp::stdio::run(stdio_mcp, token).await;
        });
    }

    // Stage 2: the pipeline.
    let mut pipeline_group = TaskGroup::new("pipeline");
    let pipeline_token = pipeline_group.token();
    pipeline_group.spawn("event-pipeline", async move {
        pipeline.run(pipeline_token).await;
    });

    // Stage 3: background jobs. Each is wrapped in a recover boundary.
    let mut background = TaskGroup::new("background");
    {
        let graph = graph.clone();
        background.spawn_recoverable("edge-revalidator", move |token| {
            let revalidator = Revalidator::new(graph.clone());
            async move { revalidator.run(token).await }
        });
    }
    if let Some(client) = kube.clone() {
        let graph = graph.clone();
        let path = opts.watch_config.clone();
        background.spawn_recoverable("graph-reconciler", move |token| {
            let reconciler = Reconciler::new(graph.clone(), client.clone(), path.clone());
            async move { reconciler.run(token).await }
        });
    }
    {
        let graph = graph.clone();
        background.spawn_recoverable("ttl-cleaner", move |token| {
            let cleaner = TtlCleaner::new(graph.clone());
            async move { cleaner.run(token).await }
        });
    }
    {
        let impact = Arc::clone(&impact);
        background.spawn_recoverable("namespace-impact", move |token| {
            let impact = Arc::clone(&impact);
            async move { impact.run(token).await }
        });
    }
    {
        let templates = Arc::clone(&templates);
        background.spawn_recoverable("template-rebalancer", move |token| {
            let templates = Arc::clone(&templates);
            async move { templates.run_rebalancer(token).await }
        });
    }
    {
        let manager = Arc::clone(&manager);
        background.spawn_recoverable("integration-manager", move |token| {
            let manager = Arc::clone(&manager);
            async move { manager.run(token).await }
        });
    }

    info!(message = "spectre started", port = opts.port, stdio = opts.stdio);
    wait_for_shutdown_signal().await;
    info!(message = "shutdown signal received");

    // Staged shutdown: stop ingress, drain the pipeline, flush the open
    // block, stop background jobs, then the process can exit.
    if let Some(fleet) = &fleet {
        fleet.stop().await;
    }
    ingress.shutdown(Duration::from_secs(5)).await;
    pipeline_group.shutdown(Duration::from_secs(10)).await;
    if let Err(error) = store.flush().await {
        error!(message = "failed to flush open block file", %error);
    }
    background.shutdown(SHUTDOWN_DEADLINE).await;

    info!(message = "spectre stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(error) => {
                error!(message = "cannot install SIGTERM handler", %error);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
