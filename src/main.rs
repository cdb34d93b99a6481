use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use clap::Parser;

use dify_relay::config::Config;
use dify_relay::server::{config_routes, log_requests, recover_panics};
use dify_relay::util::{cors_config_from_env, init_tracing, AppState};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::parse();

    let state = AppState::from_config(&config).context("building dify client")?;
    tracing::info!(
        upstream = %state.client.chat_url(),
        default_user = %config.default_user,
        request_timeout_ms = config.request_timeout.as_millis() as u64,
        max_body_bytes = config.max_body_bytes,
        proxy = !config.dify_proxy_url.trim().is_empty(),
        server_key_configured = !config.dify_api_key.is_empty(),
        "dify-relay starting on {}",
        config.listen_addr
    );

    let data = web::Data::new(state);
    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .wrap(middleware::from_fn(log_requests))
            .wrap(cors_config_from_env())
            .wrap(middleware::from_fn(recover_panics))
            .configure(config_routes)
    })
    .bind(&config.listen_addr)
    .with_context(|| format!("binding {}", config.listen_addr))?
    .shutdown_timeout(30)
    .run()
    .await
    .context("http server")?;

    Ok(())
}
