//! TOS Pool entry point: loads configuration, wires every component
//! together, and drives them until a shutdown signal arrives.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tos_pool_accounting::{BlockUnlocker, UnlockerConfig};
use tos_pool_core::{Address, UpstreamNode};
use tos_pool_mining::ban::{BanPolicyConfig, BanRegistry};
use tos_pool_mining::dispatcher::{DispatcherConfig, JobDispatcher};
use tos_pool_mining::protocol::{ProtocolConfig, ProtocolHandler};
use tos_pool_mining::vardiff::VardiffConfig;
use tos_pool_mining::{stratum, ws_getwork, xatum};
use tos_pool_payout::{PayoutConfig, PayoutEngine};
use tos_pool_rpc::{AdminContext, RpcConfig, RpcServer};
use tos_pool_storage::{MemoryStorage, RedisStorage, Storage};
use tos_pool_upstream::{CoordinatorConfig, UpstreamCoordinator};
use tos_pool_validator::{DoubleSha256, SharedVerifier, ShareValidator};
use tos_pool_wallet::WalletClient;
use tracing::{error, info, warn};

mod config;

use config::AppConfig;

#[derive(Parser)]
#[clap(name = "tos-pool")]
#[clap(about = "PPLNS mining pool for the TOS network")]
struct Cli {
    /// Path to the pool's TOML config file.
    #[clap(short, long, value_name = "FILE", default_value = "tos-pool.toml")]
    config: PathBuf,

    /// Override the tracing filter directive (defaults to the config file's
    /// `log_directive`, falling back to `info`).
    #[clap(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = AppConfig::load(&cli.config)?;

    tos_pool_util::init_logging(cli.log.as_deref().unwrap_or(&cfg.log_directive));
    info!(config = %cli.config.display(), "starting tos-pool");

    let storage: Arc<dyn Storage> = if let Some(redis_url) = &cfg.storage.redis_url {
        Arc::new(RedisStorage::connect(redis_url, cfg.storage.hashrate_window_secs).await?)
    } else {
        warn!("no redis_url configured, running with in-memory storage (not durable across restarts)");
        Arc::new(MemoryStorage::new())
    };

    let upstream_nodes: Vec<UpstreamNode> = cfg
        .upstreams
        .iter()
        .map(|u| UpstreamNode::new(u.name.clone(), u.url.clone(), u.weight, Duration::from_millis(u.timeout_ms)))
        .collect();
    let upstream = Arc::new(UpstreamCoordinator::new(
        upstream_nodes,
        CoordinatorConfig {
            health_check_interval: Duration::from_secs(cfg.upstream_policy.health_check_interval_secs),
            max_failures: cfg.upstream_policy.max_failures,
            recovery_threshold: cfg.upstream_policy.recovery_threshold,
        },
    )?);

    // Warm up health state before anything tries to route through it.
    upstream.run_health_checks().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (dispatcher, job_rx) = JobDispatcher::new(
        upstream.clone(),
        DispatcherConfig {
            job_refresh_interval: Duration::from_secs(cfg.dispatcher.job_refresh_interval_secs),
            job_max_age: Duration::from_secs(cfg.dispatcher.job_max_age_secs),
            pool_address: cfg.pool_address.clone(),
            max_target: cfg.max_target()?,
        },
    );
    let dispatcher = Arc::new(dispatcher);

    let verifier: SharedVerifier = Arc::new(DoubleSha256);
    let validator = ShareValidator::new(verifier, cfg.validator.dup_tracker_capacity);

    let bans = Arc::new(BanRegistry::new(BanPolicyConfig {
        ban_threshold_percent: cfg.ban_policy.ban_threshold_percent,
        ban_duration_secs: cfg.ban_policy.ban_duration_secs,
        malformed_json_limit: cfg.ban_policy.malformed_json_limit,
        max_connections_per_ip: cfg.ban_policy.max_connections_per_ip,
        min_shares_for_ratio: cfg.ban_policy.min_shares_for_ratio,
    }));

    let protocol = Arc::new(ProtocolHandler::new(
        ProtocolConfig {
            extranonce1_width: cfg.protocol.extranonce1_width,
            extranonce2_size: cfg.protocol.extranonce2_size,
            initial_difficulty: cfg.protocol.initial_difficulty,
            stale_grace_secs: cfg.protocol.stale_grace_secs,
            trust_threshold: cfg.protocol.trust_threshold,
            trust_check_percent: cfg.protocol.trust_check_percent,
            dup_tracker_capacity: cfg.validator.dup_tracker_capacity,
            recent_jobs_kept: cfg.protocol.recent_jobs_kept,
            vardiff: VardiffConfig {
                target_time_secs: cfg.vardiff.target_time_secs,
                retarget_secs: cfg.vardiff.retarget_secs,
                variance: cfg.vardiff.variance,
                min_difficulty: cfg.vardiff.min_difficulty,
                max_difficulty: cfg.vardiff.max_difficulty,
            },
            max_target: cfg.max_target()?,
        },
        storage.clone(),
        bans.clone(),
        upstream.clone(),
        validator,
    ));

    let wallet = Arc::new(WalletClient::new(
        cfg.wallet.url.clone(),
        Duration::from_secs(cfg.wallet.timeout_secs),
        cfg.wallet.basic_auth(),
    )?);

    let payout_engine = Arc::new(PayoutEngine::new(
        storage.clone(),
        wallet,
        PayoutConfig {
            threshold: cfg.payout.threshold,
            withdrawal_fee_fixed: cfg.payout.withdrawal_fee_fixed,
            withdrawal_fee_rate: cfg.payout.withdrawal_fee_rate,
            max_addresses_per_tx: cfg.payout.max_addresses_per_tx,
            lock_ttl_secs: cfg.payout.lock_ttl_secs,
            wallet_max_attempts: cfg.payout.wallet_max_attempts,
            reconcile_grace_secs: cfg.payout.reconcile_grace_secs,
        },
    ));

    let unlocker = Arc::new(BlockUnlocker::new(
        storage.clone(),
        upstream.clone(),
        UnlockerConfig {
            immature_depth: cfg.unlocker.immature_depth,
            mature_depth: cfg.unlocker.mature_depth,
            reorg_check_window: cfg.unlocker.reorg_check_window,
            pool_fee_percent: cfg.unlocker.pool_fee_percent,
            fee_address: Address::parse(&cfg.unlocker.fee_address)?,
        },
    ));

    info!("reconciling any payments left pending from a previous run");
    match payout_engine.reconcile_on_startup(tos_pool_util::now_secs()).await {
        Ok(summary) => info!(?summary, "startup reconciliation complete"),
        Err(e) => error!(error = %e, "startup payout reconciliation failed"),
    }

    let mut tasks = tokio::task::JoinSet::new();

    {
        let dispatcher = dispatcher.clone();
        let shutdown_rx = shutdown_rx.clone();
        tasks.spawn(async move { dispatcher.run(shutdown_rx).await });
    }

    if cfg.stratum.enabled {
        let handler = protocol.clone();
        let job_rx = job_rx.clone();
        let shutdown_rx = shutdown_rx.clone();
        let stratum_cfg = stratum::StratumConfig {
            bind_addr: cfg.stratum.bind_addr,
            max_line_bytes: cfg.stratum.max_line_bytes,
            idle_timeout_secs: cfg.session.idle_timeout_secs,
            initial_grace_secs: cfg.session.initial_grace_secs,
            housekeeping_interval: Duration::from_secs(cfg.session.housekeeping_interval_secs),
        };
        tasks.spawn(async move {
            if let Err(e) = stratum::run(handler, stratum_cfg, job_rx, shutdown_rx).await {
                error!(error = %e, "stratum server exited");
            }
        });
    }

    if cfg.ws_getwork.enabled {
        let handler = protocol.clone();
        let job_rx = job_rx.clone();
        let shutdown_rx = shutdown_rx.clone();
        let ws_cfg = ws_getwork::WsGetworkConfig {
            bind_addr: cfg.ws_getwork.bind_addr,
            idle_timeout_secs: cfg.session.idle_timeout_secs,
            initial_grace_secs: cfg.session.initial_grace_secs,
            housekeeping_interval: Duration::from_secs(cfg.session.housekeeping_interval_secs),
        };
        tasks.spawn(async move {
            if let Err(e) = ws_getwork::run(handler, ws_cfg, job_rx, shutdown_rx).await {
                error!(error = %e, "ws-getwork server exited");
            }
        });
    }

    if cfg.xatum.enabled {
        let handler = protocol.clone();
        let job_rx = job_rx.clone();
        let shutdown_rx = shutdown_rx.clone();
        let xatum_cfg = xatum::XatumConfig {
            bind_addr: cfg.xatum.bind_addr,
            cert_path: cfg.xatum.cert_path.clone(),
            key_path: cfg.xatum.key_path.clone(),
            max_line_bytes: cfg.stratum.max_line_bytes,
            idle_timeout_secs: cfg.session.idle_timeout_secs,
            initial_grace_secs: cfg.session.initial_grace_secs,
            housekeeping_interval: Duration::from_secs(cfg.session.housekeeping_interval_secs),
        };
        tasks.spawn(async move {
            if let Err(e) = xatum::run(handler, xatum_cfg, job_rx, shutdown_rx).await {
                error!(error = %e, "xatum server exited");
            }
        });
    }

    {
        let upstream = upstream.clone();
        let interval = Duration::from_secs(cfg.upstream_policy.health_check_interval_secs);
        let mut shutdown_rx = shutdown_rx.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => upstream.run_health_checks().await,
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    {
        let unlocker = unlocker.clone();
        let interval = Duration::from_secs(cfg.unlocker.interval_secs);
        let mut shutdown_rx = shutdown_rx.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match unlocker.run_once().await {
                            Ok(summary) => info!(?summary, "block unlocker cycle complete"),
                            Err(e) => warn!(error = %e, "block unlocker cycle failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    {
        let payout_engine = payout_engine.clone();
        let interval = Duration::from_secs(cfg.payout.interval_secs);
        let mut shutdown_rx = shutdown_rx.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match payout_engine.run_once(tos_pool_util::now_secs()).await {
                            Ok(Some(summary)) => info!(?summary, "payout cycle complete"),
                            Ok(None) => debug_skip_payout(),
                            Err(e) => warn!(error = %e, "payout cycle failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    if cfg.admin.enabled {
        let admin_ctx = AdminContext {
            storage: storage.clone(),
            upstream: upstream.clone(),
            payout: payout_engine.clone(),
            admin_token: cfg.admin.token.clone(),
        };
        let rpc_server = RpcServer::new(
            RpcConfig {
                bind_addr: cfg.admin.bind_addr,
                cors_domains: cfg.admin.cors_domains.clone(),
            },
            admin_ctx,
        );
        tasks.spawn(async move {
            if let Err(e) = rpc_server.start().await {
                error!(error = %e, "admin http server exited");
            }
        });
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping subsystems");
    let _ = shutdown_tx.send(true);

    // Give in-flight connections a moment to notice the shutdown watch
    // before the process exits; the loops above all select on it.
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        while tasks.join_next().await.is_some() {}
    })
    .await;

    info!("tos-pool shut down cleanly");
    Ok(())
}

fn debug_skip_payout() {
    tracing::debug!("payout lock held elsewhere, skipped this cycle");
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("failed to register ctrl-c handler");
        info!("received ctrl-c");
    }
}
