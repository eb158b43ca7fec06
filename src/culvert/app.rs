use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::culvert::registry::Registry;
use crate::culvert::tunnel::{client::ClientOptions, server::ServerOptions};
use crate::culvert::{api, config, logging, net, telemetry};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    let server_enabled = cfg.server.is_some();
    let clients_enabled = !cfg.clients.is_empty();
    let api_enabled = !cfg.api_addr.trim().is_empty();

    // The API on its own is a valid deployment: tunnels can be started through it.
    if !server_enabled && !clients_enabled && !api_enabled {
        anyhow::bail!("config: nothing to run (set api_addr and/or [server] and/or [[clients]])");
    }

    tracing::info!(
        config = %resolved.path.display(),
        server_enabled,
        clients = cfg.clients.len(),
        api_addr = %cfg.api_addr,
        "culvert: starting"
    );

    // Shared state for the API endpoints.
    let prom = Arc::new(telemetry::init_prometheus()?);
    let registry = Arc::new(Registry::new());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut tasks = JoinSet::new();

    // Config-declared tunnels.
    if let Some(sc) = &cfg.server {
        registry
            .start_server(ServerOptions {
                bind_addr: sc.bind_addr.clone(),
                bind_tunnels: sc.bind_tunnels.clone(),
                control_port: sc.control_port,
                min_port: sc.min_port,
                max_port: sc.max_port,
                secret: sc.secret.clone(),
            })
            .context("config: [server]")?;
    }

    for (i, cc) in cfg.clients.iter().enumerate() {
        registry
            .start_client(ClientOptions {
                to: cc.to.clone(),
                control_port: cc.control_port,
                local_host: cc.local_host.clone(),
                local_port: cc.local_port,
                port: cc.port,
                secret: cc.secret.clone(),
                dial_timeout: cc.dial_timeout,
            })
            .with_context(|| format!("config: [[clients]][{i}]"))?;
    }

    // API server.
    if api_enabled {
        let api_addr = net::normalize_bind_addr(&cfg.api_addr);
        let addr: std::net::SocketAddr = api_addr
            .parse()
            .with_context(|| format!("invalid api_addr: {}", cfg.api_addr))?;

        let state = api::ApiState {
            registry: registry.clone(),
            prometheus: prom.clone(),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { api::serve_with_shutdown(addr, state, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
        res = tasks.join_next(), if !tasks.is_empty() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        registry.stop_all().await;
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    registry.stop_all().await;

    // Drain tasks: exit as soon as they complete; only enforce a timeout if something hangs.
    let drain = async {
        while let Some(_res) = tasks.join_next().await {
            // Tasks are expected to observe shutdown; ignore errors during teardown.
        }
    };

    // Hard cap so `docker stop` doesn't stall indefinitely.
    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
