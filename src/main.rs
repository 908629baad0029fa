// src/main.rs
use anyhow::{bail, Context};
use log::{error, info};
use tokio::signal;
use tokio::sync::watch;
use vigil::bus::BusConsumer;
use vigil::config::Config;
use vigil::engine::ThresholdEngine;
use vigil::notification::{DelivererRegistry, NotificationEngine};
use vigil::persister::Persister;
use vigil::store::StoreClient;
use vigil::strategy;

const USAGE: &str = "Usage: vigil <config.yaml> [api|engine|persister|notifier|all]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("vigil=info"))
        .init();

    info!("vigil v{} starting", vigil::VERSION);

    let mut args = std::env::args().skip(1);
    let config_path = match args.next() {
        Some(path) => path,
        None => bail!(USAGE),
    };
    let service = args.next().unwrap_or_else(|| "all".to_string());

    let config = Config::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();
    let mut engine = None;

    match service.as_str() {
        "api" => handles.push(spawn_api(&config, shutdown_rx.clone())),
        "engine" => engine = Some(ThresholdEngine::start(&config)?),
        "persister" => {
            handles.push(spawn_persister(&config, &config.topics.metrics, true, shutdown_rx.clone())?);
            handles.push(spawn_persister(&config, &config.topics.alarms, false, shutdown_rx.clone())?);
        }
        "notifier" => handles.push(spawn_notifier(&config, shutdown_rx.clone())?),
        "all" => {
            handles.push(spawn_api(&config, shutdown_rx.clone()));
            engine = Some(ThresholdEngine::start(&config)?);
            handles.push(spawn_persister(&config, &config.topics.metrics, true, shutdown_rx.clone())?);
            handles.push(spawn_persister(&config, &config.topics.alarms, false, shutdown_rx.clone())?);
            handles.push(spawn_notifier(&config, shutdown_rx.clone())?);
        }
        other => bail!("unknown service '{}'\n{}", other, USAGE),
    }

    signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("received shutdown signal");

    let _ = shutdown_tx.send(true);
    if let Some(engine) = engine {
        engine.stop().await;
    }
    for handle in handles {
        let _ = handle.await;
    }

    info!("all services stopped");
    Ok(())
}

fn spawn_api(config: &Config, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    let config = config.clone();
    tokio::spawn(async move {
        if let Err(e) = vigil::api::run(&config, shutdown).await {
            error!("api service failed: {}", e);
            std::process::exit(1);
        }
    })
}

fn spawn_persister(
    config: &Config,
    topic: &str,
    fix_metrics: bool,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let strategy = strategy::create(&config.index)?;
    let store = StoreClient::new(&config.store, &config.index.prefix, topic, strategy)?;
    let bus = BusConsumer::new(&config.bus, topic)?;
    let persister = Persister::new(bus, store, fix_metrics);
    Ok(tokio::spawn(persister.run(shutdown)))
}

fn spawn_notifier(
    config: &Config,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let strategy = strategy::create(&config.index)?;
    let store = StoreClient::new(
        &config.store,
        &config.index.prefix,
        &config.topics.notification_methods_doc_type,
        strategy,
    )?;
    let bus = BusConsumer::new(&config.bus, &config.topics.alarms)?;
    let registry = DelivererRegistry::standard(&config.smtp)?;
    let engine = NotificationEngine::new(bus, store, registry);
    Ok(tokio::spawn(engine.run(shutdown)))
}
