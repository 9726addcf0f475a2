//! courier - scheduled MQTT dispatch
//!
//! `serve` は HTTP trigger を立てて、リクエストごとに 1 回 dispatch します。
//! `run` は 1 回だけ dispatch して終了します（cron などから呼ぶ用）。

mod settings;
mod trigger;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use courier_core::app::Dispatcher;
use courier_core::impls::{MqttConnector, SqliteConnector};
use courier_core::ports::SystemClock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::settings::{Cli, Command};

type LiveDispatcher = Dispatcher<SqliteConnector, MqttConnector, SystemClock>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env があれば読む（なくてもよい）
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let settings = &cli.settings;
    tracing::info!(
        store = %settings.store_url,
        broker = %settings.mqtt_broker,
        client_id = %settings.mqtt_client_id,
        policy = %settings.delivery_policy,
        "courier configured"
    );

    let dispatcher: LiveDispatcher = Dispatcher::new(
        SqliteConnector::new(settings.store_config()),
        MqttConnector::new(settings.broker_config()),
        SystemClock,
        settings.dispatch_options(),
    );

    match cli.command {
        Command::Serve { listen } => serve(Arc::new(dispatcher), listen).await,
        Command::Run => {
            let report = dispatcher
                .run()
                .await
                .context("dispatch failed")?;
            println!("{report}");
            Ok(())
        }
    }
}

async fn serve(dispatcher: Arc<LiveDispatcher>, listen: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = trigger::router(dispatcher);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    tracing::info!("trigger listening on {}", listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("trigger stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
    }
}
