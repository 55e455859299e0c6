use anyhow::{anyhow, bail, Context};
use bifrost_fastproxy::body::ResponseBuilder;
use bifrost_fastproxy::config::{validate, EngineConfig};
use bifrost_fastproxy::logging::{self, parse_log_format, parse_log_level};
use bifrost_fastproxy::proxy_env::EnvProxyResolver;
use bifrost_fastproxy::transport::StaticTransportManager;
use bifrost_fastproxy::{ProxyBuilder, RemoteAddr};
use clap::Parser;
use hyper::body::Incoming;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Parser)]
#[clap(
    version,
    about = "HTTP/1.1 reverse proxy with pooled upstream connections and protocol upgrades"
)]
struct Args {
    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(short, long, value_name = "ADDR", help = "Listen address (e.g., 127.0.0.1:8080)")]
    listen: Option<String>,

    #[clap(short, long, value_name = "URL", help = "Upstream URL (e.g., http://backend:3000)")]
    target: Option<String>,

    #[clap(long, value_name = "NAME", help = "Transport settings to use for the target")]
    transport: Option<String>,

    #[clap(long, help = "Tag outbound requests with the debug header")]
    debug: bool,

    #[clap(long, value_name = "LEVEL", value_parser = parse_log_level, help = "trace, debug, info, warn or error")]
    log_level: Option<bifrost_fastproxy::config::LogLevel>,

    #[clap(long, value_name = "FORMAT", value_parser = parse_log_format, help = "text or json")]
    log_format: Option<bifrost_fastproxy::config::LogFormat>,

    #[clap(long, value_name = "FILE", help = "Write a sample configuration file and exit")]
    generate_config: Option<String>,
}

fn load_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => {
            if !Path::new(path).exists() {
                bail!("Configuration file not found: {}", path);
            }
            EngineConfig::from_file(path).map_err(|e| anyhow!("Failed to load {}: {}", path, e))?
        }
        None => EngineConfig::default(),
    };

    if let Some(listen) = &args.listen {
        config.listen_addr = listen.parse().context("invalid listen address")?;
    }
    if let Some(target) = &args.target {
        config.target = Some(target.clone());
    }
    if let Some(transport) = &args.transport {
        config.transport = transport.clone();
    }
    if args.debug {
        config.debug = true;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }
    config
        .transports
        .entry(config.transport.clone())
        .or_default();
    Ok(config)
}

fn generate_sample_config(path: &str) -> anyhow::Result<()> {
    let mut config = EngineConfig::default();
    config.target = Some("http://backend.example.com:3000".to_string());
    config
        .to_file(path)
        .map_err(|e| anyhow!("Failed to write {}: {}", path, e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.generate_config {
        generate_sample_config(path)?;
        println!("Sample configuration file generated: {}", path);
        return Ok(());
    }

    let config = load_config(&args)?;
    logging::init(&config.logging).context("failed to initialize logging")?;

    let validation = validate(&config);
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    if !validation.is_valid() {
        for e in &validation.errors {
            error!("{}", e);
        }
        bail!("invalid configuration");
    }

    let target_raw = config
        .target
        .clone()
        .ok_or_else(|| anyhow!("no target configured (use --target or the config file)"))?;
    let target = Url::parse(&target_raw).with_context(|| format!("invalid target {}", target_raw))?;

    let transports = Arc::new(StaticTransportManager::new(config.transports.clone()));
    let builder = ProxyBuilder::new(transports.clone(), Arc::new(EnvProxyResolver::from_env()), config.debug)
        .with_max_response_header_bytes(config.max_response_header_bytes);
    builder.update(&transports.snapshot());
    let builder = Arc::new(builder);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!("Listening on {} -> {}", config.listen_addr, target);

    let shutdown = CancellationToken::new();
    let transport_name = Arc::new(config.transport.clone());
    let target = Arc::new(target);

    loop {
        let (stream, remote) = tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            },
        };

        let builder = Arc::clone(&builder);
        let transport_name = Arc::clone(&transport_name);
        let target = Arc::clone(&target);
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            let service = service_fn(move |mut req: Request<Incoming>| {
                req.extensions_mut().insert(RemoteAddr(remote.to_string()));
                let builder = Arc::clone(&builder);
                let transport_name = Arc::clone(&transport_name);
                let target = Arc::clone(&target);
                let cancel = shutdown.child_token();
                async move {
                    let response = match builder.build(&transport_name, &target, false, false) {
                        Ok(proxy) => proxy.serve_with_cancel(req, cancel).await,
                        Err(e) => ResponseBuilder::from_error(&e),
                    };
                    Ok::<_, Infallible>(response)
                }
            });

            if let Err(e) = ServerBuilder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await
            {
                debug!("connection from {} ended: {}", remote, e);
            }
        });
    }

    shutdown.cancel();
    Ok(())
}
