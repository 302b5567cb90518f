#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod bridge;
mod cli;
mod config;
mod db;
mod matrix;
mod messages;
mod parsers;
mod utils;
mod web;

use bridge::presence::run_presence_loop;
use bridge::{BridgeCore, TransactionProcessor};
use cli::{Cli, Commands, generate_registration};
use config::Config;
use matrix::{MatrixClient, ReqwestTransport};
use web::WebServer;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::GenerateRegistration {
            output,
            id,
            url,
            sender_localpart,
            domain,
        }) => {
            let yaml = generate_registration(id, url, sender_localpart, domain);
            std::fs::write(output, yaml)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("registration written to {}", output.display());
            return Ok(());
        }
        Some(Commands::ValidateConfig) => {
            Config::load_from_file(&cli.config, cli.registration.as_deref())?;
            println!("configuration is valid");
            return Ok(());
        }
        None => {}
    }

    let config = Arc::new(Config::load_from_file(
        &cli.config,
        cli.registration.as_deref(),
    )?);
    utils::logging::init_tracing(&config.logging);
    info!(bot = %config.bot_user_id(), "matrix imposter bot starting up");

    let db_manager = db::DatabaseManager::new(&config.database).await?;
    db_manager.migrate().await?;

    let shutdown = CancellationToken::new();
    let transport = Arc::new(ReqwestTransport::new(&config, shutdown.clone())?);
    let client = MatrixClient::new(transport, config.bot_user_id());
    let core = Arc::new(BridgeCore::new(
        client.clone(),
        &db_manager,
        config.bot.clone(),
    ));

    tokio::select! {
        result = core.startup_sync(&config.registration.sender_localpart) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C during startup");
            shutdown.cancel();
            return Ok(());
        }
    }

    let processor = Arc::new(TransactionProcessor::new(core, db_manager.clone()));
    let web_server = WebServer::new(
        config.clone(),
        processor,
        db_manager.clone(),
        shutdown.clone(),
    );

    let web_handle = tokio::spawn(async move {
        if let Err(e) = web_server.start().await {
            error!("web server error: {}", e);
        }
    });
    let presence_handle = tokio::spawn(run_presence_loop(
        client,
        config.bot.clone(),
        shutdown.clone(),
    ));

    tokio::pin!(web_handle);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, beginning shutdown");
        },
        _ = shutdown.cancelled() => {
            info!("fatal error reported, beginning shutdown");
        },
        _ = &mut web_handle => {
            info!("web server task exited, beginning shutdown");
        },
    }

    shutdown.cancel();
    if let Err(e) = presence_handle.await {
        error!("presence task failed: {}", e);
    }
    web_handle.abort();

    info!("matrix imposter bot shut down");
    Ok(())
}
