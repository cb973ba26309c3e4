use actix_web::{web, App, HttpServer};
use redis_pool::RedisPool;
use session_router::{
    auth::SecurityService,
    config, error, logging, routes,
    services::directory::SessionDirectory,
    services::fanout::{FanoutBus, FanoutListener},
    services::lifecycle::ConnectionStateManager,
    services::session_manager::SessionManager,
    state::AppState,
    websocket::ConnectionRegistry,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), error::AppError> {
    logging::init_tracing();
    let cfg = config::Config::from_env()?;

    let pool = Arc::new(
        RedisPool::connect(&cfg.redis_url, cfg.redis_pool_size)
            .await
            .map_err(|e| error::AppError::StartServer(format!("redis: {e}")))?,
    );

    let registry = ConnectionRegistry::new();
    let directory = SessionDirectory::new(pool.clone(), cfg.topic_history_limit);
    directory.seed_default_topics().await?;

    let lifecycle = Arc::new(ConnectionStateManager::new(
        pool.clone(),
        &cfg.state_key_prefix,
        cfg.stale_threshold,
    ));
    let sweeper = lifecycle.spawn_sweeper(cfg.sweep_interval);

    // Pub/sub needs its own client; the pool's multiplexed connections
    // cannot subscribe.
    let pubsub_client = redis::Client::open(cfg.redis_url.as_str())
        .map_err(|e| error::AppError::StartServer(format!("redis pubsub: {e}")))?;
    let listener = FanoutListener::spawn(pubsub_client, registry.clone(), directory.clone());

    let security = Arc::new(SecurityService::new(&cfg.jwt_secret));
    let manager = SessionManager::new(
        registry,
        directory,
        FanoutBus::new(pool),
        lifecycle,
        cfg.auth_timeout,
        cfg.single_session_per_user,
    );

    let state = AppState::new(cfg.clone(), security, manager.clone());

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(%bind_addr, "starting session-router");

    let server = HttpServer::new(move || {
        let cors = actix_cors::Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(cors)
            .app_data(web::Data::new(state.clone()))
            .service(routes::wsroute::ws_handler)
            .service(routes::admin::health)
            .service(routes::admin::metrics)
            .service(routes::admin::stats)
            .service(routes::admin::topics)
    })
    .bind(&bind_addr)
    .map_err(|e| error::AppError::StartServer(format!("bind: {e}")))?
    .run();

    tokio::select! {
        res = server => {
            res.map_err(|e| error::AppError::StartServer(format!("server: {e}")))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    manager.shutdown();
    sweeper.stop();
    listener.stop();
    Ok(())
}
