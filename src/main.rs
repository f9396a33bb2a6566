mod api;
mod cli;
mod config;
mod controller;
mod daemon;
mod error;
mod models;
mod panel;
mod progress;
mod reconcile;
mod rewrite;
mod schedule;
mod transport;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::info;

use crate::api::BackendClient;
use crate::cli::{Cli, Commands, FollowUp};
use crate::config::{load_config, validate_config};
use crate::controller::{Controller, GenerateOptions};
use crate::error::ControllerError;
use crate::models::HistoryRecord;
use crate::panel::{generate_with_progress, render_history, render_outcome, render_preview};
use crate::reconcile::{HistoryStore, Reconciler, RefreshTrigger};
use crate::schedule::{publish_saved_record, schedule_record};
use crate::transport::HttpTransport;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| format!("loading config from {}", cli.config.display()))?;

    // Logs go to stderr; stdout carries command output.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.pubdesk.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if cli.config.exists() {
        info!(config_path = %cli.config.display(), "config loaded");
    } else {
        info!(config_path = %cli.config.display(), "config file not found, using defaults");
    }

    validate_config(&config).context("config validation failed")?;
    info!("config validated successfully");

    if let Some(Commands::Validate) = cli.command {
        println!("Configuration is valid.");
        return Ok(());
    }

    let transport = HttpTransport::new(&config).context("building HTTP client")?;
    let client = BackendClient::new(Arc::new(transport));
    info!(base_url = %config.backend.base_url, "backend client ready");

    match cli.command {
        Some(Commands::Validate) => {}
        Some(Commands::Config) => {
            let backend = client.config().await.context("fetching backend config")?;
            for (key, value) in backend.display_entries() {
                println!("{key} = {value}");
            }
        }
        Some(Commands::Models { provider }) => {
            let list = client.models(provider).await.context("listing models")?;
            for model in &list.models {
                let marker = if list.current_model.as_deref() == Some(model.as_str()) { "*" } else { " " };
                println!("{marker} {model}");
            }
        }
        Some(Commands::Check { service }) => {
            client.test_connection(service).await.context("connection test failed")?;
            println!("Connection OK.");
        }
        Some(Commands::Generate {
            title,
            words,
            images,
            ai_model,
            image_model,
            template,
            then,
        }) => {
            let mut options = GenerateOptions::from_config(title, &config.generation);
            if let Some(words) = words {
                options.word_count = words;
            }
            if let Some(images) = images {
                options.image_count = images;
            }
            if let Some(model) = ai_model {
                options.ai_model = model;
            }
            if let Some(model) = image_model {
                options.image_model = model;
            }
            if let Some(path) = template.as_deref().or(config.generation.format_template.as_deref()) {
                options.format_template = read_template(path)?;
            }

            let mut controller = Controller::new(client, &config, RefreshTrigger::new());
            generate_with_progress(&mut controller, options)
                .await
                .map_err(user_facing)?;
            if let Some(article) = controller.article() {
                println!("{}", render_preview(article));
            }
            follow_up(&mut controller, then).await?;
        }
        Some(Commands::History { published }) => {
            let store = fetch_history(&client).await?;
            print!("{}", render_history(&store.current(), published));
        }
        Some(Commands::Load { record_id, then }) => {
            let record = find_record(&client, &record_id).await?;
            let mut controller = Controller::new(client, &config, RefreshTrigger::new());
            controller.load_from_history(&record).await.map_err(user_facing)?;
            if let Some(article) = controller.article() {
                println!("{}", render_preview(article));
            }
            follow_up(&mut controller, then).await?;
        }
        Some(Commands::PublishDraft { record_id, mass_send }) => {
            let record = find_record(&client, &record_id).await?;
            let mut controller = Controller::new(client, &config, RefreshTrigger::new());
            let outcome = publish_saved_record(&mut controller, &record, mass_send)
                .await
                .map_err(user_facing)?;
            println!("{}", render_outcome(&outcome));
        }
        Some(Commands::Schedule {
            record_id,
            at,
            mass_send,
        }) => {
            let record = find_record(&client, &record_id).await?;
            let tz = config.timezone();
            let mut controller = Controller::new(client, &config, RefreshTrigger::new());
            let scheduled = schedule_record(&mut controller, &record, &at, mass_send, tz, Utc::now())
                .await
                .map_err(user_facing)?;
            println!(
                "Scheduled '{}' for {} ({tz}), draft {}{}.",
                record.title,
                scheduled.publish_time,
                scheduled.media_id,
                if scheduled.enable_mass_send { ", with broadcast" } else { "" }
            );
        }
        Some(Commands::Watch) => {
            daemon::run(config, client).await?;
        }
        Some(Commands::Panel) | None => {
            panel::run(config, client).await?;
        }
    }

    Ok(())
}

fn user_facing(err: ControllerError) -> anyhow::Error {
    let message = err.user_message();
    anyhow::Error::new(err).context(message)
}

fn read_template(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading format template {}", path.display()))
}

async fn fetch_history(client: &BackendClient) -> Result<Arc<HistoryStore>> {
    let reconciler = Reconciler::new(client.clone(), Arc::new(HistoryStore::new()));
    reconciler.refresh().await.context("fetching history")?;
    Ok(reconciler.store().clone())
}

async fn find_record(client: &BackendClient, record_id: &str) -> Result<HistoryRecord> {
    let store = fetch_history(client).await?;
    store
        .current()
        .find(record_id)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("no generation history record with id '{record_id}'"))
}

/// Save and publish after the article is in the preview, as requested on the command line.
async fn follow_up(controller: &mut Controller, then: FollowUp) -> Result<()> {
    if !then.save() {
        return Ok(());
    }
    let handle = controller.save_draft().await.map_err(user_facing)?;
    println!("Draft saved (media_id {handle}).");

    if then.publish() {
        let outcome = controller.publish(then.mass_send).await.map_err(user_facing)?;
        println!("{}", render_outcome(&outcome));
    }
    Ok(())
}
