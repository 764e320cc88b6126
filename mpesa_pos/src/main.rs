mod config;
mod handlers;
mod payments;
mod state;
#[cfg(test)]
mod test_support;

use actix_web::{App, HttpServer, middleware::Logger, web};
use dotenv::dotenv;
use pretty_env_logger::env_logger::{Builder, Env};

use crate::config::AppConfig;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();

    if cli::run_cli().await {
        return Ok(());
    }

    let logger_env = Env::default().default_filter_or("debug");
    let mut logger_builder = Builder::from_env(logger_env);
    logger_builder.init();

    let config = AppConfig::from_env().map_err(|e| {
        log::error!("Application initialization failed: {:#}", e);
        std::io::Error::other(e.to_string())
    })?;

    let state = config.create_app_state().await.map_err(|e| {
        log::error!("Application initialization failed: {:#}", e);
        std::io::Error::other(e.to_string())
    })?;

    log::info!("App state initialized successfully");

    if let Some(products_yaml) = &config.products_yaml {
        let loaded = state
            .initialize_products_from_file(products_yaml)
            .await
            .map_err(|e| {
                log::error!("Catalog initialization failed: {:#}", e);
                std::io::Error::other(e.to_string())
            })?;
        log::info!("Loaded {} product(s) from {}", loaded, products_yaml);
    }

    let data = web::Data::new(state);
    let shutdown_state = data.clone();

    // Expire payments nobody confirmed in time
    {
        let sweeper_state = data.clone();
        let interval = config.sweep_interval_seconds;
        tokio::spawn(async move {
            payments::start_expiry_sweeper(sweeper_state, interval).await;
        });
    }

    log::info!(
        "Listening on {}:{}",
        config.server_host,
        config.server_port
    );

    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .wrap(Logger::new("%a %t %r %s  %{Referer}i %Dms"))
            .configure(handlers::configure)
    })
    .bind((config.server_host.as_str(), config.server_port))?
    .run()
    .await?;

    shutdown_state.db.close().await;
    log::info!("Server stopped");
    Ok(())
}
