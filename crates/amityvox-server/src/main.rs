mod cli;
mod config;

use amityvox_api::AppState;
use amityvox_core::events::EventBus;
use amityvox_federation::backfill::wire_recovery_backfill;
use amityvox_federation::{FederationConfig, FederationService, VoiceSettings};
use amityvox_models::instance::{FederationMode, PeerControlAction};
use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command, PeerCommand};
use config::Config;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,amityvox=debug,sqlx=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn federation_config(config: &Config) -> Result<FederationConfig> {
    let mut fed = FederationConfig::new(config.instance.domain.clone());
    fed.federation_mode = FederationMode::parse(&config.instance.federation_mode)
        .with_context(|| {
            format!(
                "invalid federation_mode '{}' (expected open|closed|allowlist)",
                config.instance.federation_mode
            )
        })?;
    fed.enforce_source_ip = config.instance.enforce_source_ip;
    fed.shorthand = config.instance.shorthand.clone();
    fed.voice = VoiceSettings {
        enabled: config.voice.enabled,
        public_url: config.voice.public_url.clone(),
        api_key: config.voice.api_key.clone(),
        api_secret: config.voice.api_secret.clone(),
        mode: config.voice.mode.clone(),
    };
    Ok(fed)
}

async fn bootstrap_service(config: &Config) -> Result<(AppState, Arc<FederationService>)> {
    let pool = amityvox_db::create_pool(&config.database.url, config.database.max_connections)
        .await
        .context("connecting to database")?;
    amityvox_db::run_migrations(&pool)
        .await
        .context("running migrations")?;

    let bus = EventBus::default();
    let signing_key = config.load_signing_key()?;
    let service = FederationService::bootstrap(
        pool.clone(),
        bus.clone(),
        federation_config(config)?,
        signing_key,
    )
    .await
    .context("bootstrapping federation service")?;
    service.refresh_federation_mode().await?;

    let state = AppState {
        db: pool,
        bus,
        federation: Arc::clone(&service),
        permission_cache: amityvox_core::build_permission_cache(),
    };
    Ok((state, service))
}

async fn serve(config: Config) -> Result<()> {
    let (state, service) = bootstrap_service(&config).await?;
    let shutdown = Arc::new(Notify::new());

    // Peer recovery drives backfill.
    wire_recovery_backfill(&service);

    let router_task = tokio::spawn(amityvox_federation::router::run_router(Arc::clone(&service)));
    let retry_task = tokio::spawn(amityvox_federation::run_retry_consumer(
        Arc::clone(&service),
        Arc::clone(&shutdown),
    ));
    let flush_task = tokio::spawn(amityvox_federation::run_counter_flusher(
        Arc::clone(&service),
        Arc::clone(&shutdown),
    ));

    let app = amityvox_api::build_router(state);
    let addr: SocketAddr = config
        .server
        .bind_address
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.server.bind_address))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, domain = %config.instance.domain, "amityvox listening");

    let shutdown_signal = Arc::clone(&shutdown);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        shutdown_signal.notify_waiters();
    })
    .await
    .context("http server")?;

    // The flusher drains pending counters on the shutdown notification.
    shutdown.notify_waiters();
    let _ = flush_task.await;
    retry_task.abort();
    router_task.abort();
    Ok(())
}

async fn run_peer_command(config: Config, command: PeerCommand) -> Result<()> {
    let (_state, service) = bootstrap_service(&config).await?;
    match command {
        PeerCommand::Add { domain } => {
            let response = service.send_handshake(&domain).await?;
            println!(
                "peered with {} ({}) protocol {} capabilities [{}] state {}",
                domain,
                response.instance_id,
                response.protocol_version,
                response.capabilities.join(", "),
                response.peer_state,
            );
        }
        PeerCommand::List => {
            let peers = amityvox_db::peers::list_peers(service.db(), service.local_id()).await?;
            if peers.is_empty() {
                println!("no peers");
            }
            for peer in peers {
                let status = amityvox_db::peers::get_peer_status(service.db(), &peer.peer_id)
                    .await?
                    .map(|s| {
                        format!(
                            "{} sent={} received={} errors={}",
                            s.status, s.events_sent, s.events_received, s.errors_24h
                        )
                    })
                    .unwrap_or_else(|| "unknown".to_string());
                println!("{} [{}] {}", peer.peer_id, peer.status, status);
            }
        }
        PeerCommand::Remove { peer_id } => {
            if amityvox_db::peers::delete_peer(service.db(), service.local_id(), &peer_id).await? {
                println!("removed {peer_id}");
            } else {
                println!("no such peer {peer_id}");
            }
        }
        PeerCommand::Block { peer_id } => {
            service
                .set_peer_control(&peer_id, Some(PeerControlAction::Block))
                .await?;
            println!("blocked {peer_id}");
        }
        PeerCommand::Allow { peer_id } => {
            service
                .set_peer_control(&peer_id, Some(PeerControlAction::Allow))
                .await?;
            println!("allowed {peer_id}");
        }
        PeerCommand::Mute { peer_id } => {
            service
                .set_peer_control(&peer_id, Some(PeerControlAction::Mute))
                .await?;
            println!("muted {peer_id}");
        }
        PeerCommand::Clear { peer_id } => {
            service.set_peer_control(&peer_id, None).await?;
            println!("cleared override for {peer_id}");
        }
        PeerCommand::DeadLetters => {
            let letters = amityvox_db::delivery::list_dead_letters(service.db(), 50).await?;
            if letters.is_empty() {
                println!("no dead letters");
            }
            for letter in letters {
                println!(
                    "{} -> {} attempts={} at {}: {}",
                    letter.id,
                    letter.target_domain,
                    letter.attempts,
                    letter.created_at,
                    letter.error_message
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Command::InitConfig => {
            Config::write_template(&cli.config)?;
            println!("wrote {}", cli.config);
            Ok(())
        }
        Command::GenerateKeys => {
            let config = Config::load(&cli.config)?;
            let (key, public_pem) = amityvox_federation::signing::generate_keypair()
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            config.write_signing_key(&key)?;
            println!(
                "wrote {}\npublic key:\n{public_pem}",
                config.instance.signing_key_path
            );
            Ok(())
        }
        Command::Serve => serve(Config::load(&cli.config)?).await,
        Command::Peer { command } => run_peer_command(Config::load(&cli.config)?, command).await,
    }
}
