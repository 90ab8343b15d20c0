mod handlers;

use std::{
    fs::File,
    io::BufReader,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use argp::FromArgs;
use axum::{
    Router,
    extract::{ConnectInfo, FromRef},
    http::{Request, StatusCode, header},
};
use mergebot_core::config::Config;
use mergebot_github::{
    Gateway,
    backend::Backend,
    cache::ResponseCache,
    client::CachedClient,
    dummy::DummyBackend,
    http::ReqwestTransport,
    rest::RestBackend,
};
use mergebot_jobs::{PendingSet, Processor};
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    ServiceBuilderExt,
    normalize_path::NormalizePathLayer,
    timeout::TimeoutLayer,
    trace::{DefaultOnResponse, MakeSpan, TraceLayer},
};
use tracing::{Level, Span};
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::handlers::build_router;

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Approve and merge pull requests on behalf of their reviewers.
struct Args {
    #[argp(option, default = "PathBuf::from(\"config.yml\")")]
    /// configuration file
    config: PathBuf,
    #[argp(switch)]
    /// do not write anything to GitHub, only log what would be done
    dry_run: bool,
    #[argp(switch)]
    /// log at debug level by default
    debug: bool,
    #[argp(option)]
    /// serve pull requests from YAML fixtures in this directory instead of GitHub
    dummy_git: Option<PathBuf>,
}

#[derive(Clone, FromRef)]
pub struct AppState {
    config: Arc<Config>,
    processor: Arc<Processor>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Args = argp::parse_args_or_exit(argp::DEFAULT);
    let default_level = if args.debug { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let env_filter =
        EnvFilter::builder().with_default_directive(default_level.into()).from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let config = Arc::new(load_config(&args.config)?);
    let (backend, client) = create_backend(&config, args.dummy_git.as_deref())?;
    if args.dry_run {
        tracing::info!("Dry run: nothing will be written to GitHub");
    }
    let gateway = Arc::new(Gateway::new(backend, args.dry_run));
    let pending = Arc::new(PendingSet::new());
    let processor = Arc::new(Processor::new(gateway, config.clone(), pending));

    // Queue everything open before accepting events
    let queued = processor.rescan().await.context("Failed to load permissions")?;
    tracing::info!("Queued {queued} open pull requests");

    let mut scheduler =
        mergebot_jobs::cron::create(processor.clone()).await.context("Failed to create scheduler")?;

    let state = AppState { config: config.clone(), processor: processor.clone() };
    let router = app(state).into_make_service_with_connect_info::<SocketAddr>();
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.server.port));
    let listener = TcpListener::bind(addr).await.with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Web server: Listening on {}", addr);

    let web_server = async {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("Web server error");
        tracing::info!("Web server stopped");
        processor.shutdown();
        result
    };
    let queue_processor = async {
        let result = processor.run().await;
        if result.is_err() {
            processor.shutdown();
        }
        result
    };
    let result = tokio::try_join!(web_server, queue_processor).map(|_| ());

    if let Some(scheduler) = &mut scheduler
        && let Err(e) = scheduler.shutdown().await
    {
        tracing::error!("Failed to shut down scheduler: {e}");
    }
    if let Some(client) = client
        && let Err(e) = client.save_cache(&config.cache.path)
    {
        tracing::error!("Failed to save cache: {e:?}");
    }
    match &result {
        Ok(()) => tracing::info!("Shut down gracefully"),
        Err(e) => tracing::error!("{e:?}"),
    }
    result
}

fn load_config(path: &Path) -> Result<Config> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let config: Config = serde_yaml::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    config.validate().with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

type Backends = (Arc<dyn Backend>, Option<Arc<CachedClient>>);

fn create_backend(config: &Config, dummy_git: Option<&Path>) -> Result<Backends> {
    if let Some(dir) = dummy_git {
        tracing::info!("Using dummy pull requests from {}", dir.display());
        let backend = DummyBackend::load_dir(config.github.bot_user.clone(), dir)?;
        return Ok((Arc::new(backend), None));
    }
    let token = config.github.resolve_token();
    if token.is_none() {
        tracing::warn!("No GitHub token configured, requests will be anonymous");
    }
    let transport = ReqwestTransport::new(Duration::from_secs(60))
        .context("Failed to create HTTP client")?;
    let cache = ResponseCache::load(&config.cache.path, config.cache.max_entries);
    let client = Arc::new(CachedClient::new(
        Arc::new(transport),
        config.github.api_url.clone(),
        token,
        cache,
    ));
    Ok((Arc::new(RestBackend::new(client.clone())), Some(client)))
}

fn app(state: AppState) -> Router {
    let sensitive_headers: Arc<[_]> = vec![header::AUTHORIZATION].into();
    let middleware = ServiceBuilder::new()
        .sensitive_request_headers(sensitive_headers.clone())
        .sensitive_response_headers(sensitive_headers)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(RequestSpan { level: Level::INFO })
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(120),
        ))
        .layer(NormalizePathLayer::trim_trailing_slash());
    build_router().with_state(state).layer(middleware)
}

async fn shutdown_signal() {
    if let Err(e) = wait_for_signal().await {
        tracing::error!("Failed to listen for shutdown signals: {e}");
    }
    tracing::info!("Shutdown requested");
}

async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await
    }
}

#[derive(Debug, Clone)]
pub struct RequestSpan {
    level: Level,
}

impl<B> MakeSpan<B> for RequestSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let forwarded_for = request
            .headers()
            .get("X-Forwarded-For")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.split(',').next())
            .and_then(|s| IpAddr::from_str(s.trim()).ok());
        let ip = forwarded_for
            .or_else(|| {
                request.extensions().get::<ConnectInfo<SocketAddr>>().map(|ConnectInfo(a)| a.ip())
            })
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));
        let event = request
            .headers()
            .get("X-GitHub-Event")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        macro_rules! make_span {
            ($level:expr) => {
                tracing::span!(
                    $level,
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    ip = %ip,
                    github_event = %event,
                )
            }
        }
        match self.level {
            Level::ERROR => make_span!(Level::ERROR),
            Level::WARN => make_span!(Level::WARN),
            Level::INFO => make_span!(Level::INFO),
            Level::DEBUG => make_span!(Level::DEBUG),
            Level::TRACE => make_span!(Level::TRACE),
        }
    }
}
