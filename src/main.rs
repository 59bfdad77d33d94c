use actix_cors::Cors;
use actix_server::ServerHandle;
use actix_web::{App, HttpServer};
use anyhow::{Context, Result};
use clap::Parser;
use env_logger::{Builder, Env, Target};
use esp_ota_server::{
    api::Api,
    config::{AppConfig, Args},
    services::{
        devices::{DeviceRegistry, JsonFileStore},
        firmware::FirmwareStore,
        ota::OtaService,
        transfer::format_size,
    },
};
use log::{debug, error, info, warn};
use std::{io::Write, sync::Arc};
use tokio::signal::unix::{SignalKind, signal};

type OtaApi = Api<JsonFileStore>;

#[actix_web::main]
async fn main() {
    if let Err(e) = run().await {
        error!("application error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    initialize();

    let config = AppConfig::load(Args::parse()).context("failed to load configuration")?;
    let ota = Arc::new(create_service(&config));

    log_banner(&config, &ota).await;

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let (server_handle, server_task) = run_server(&config, Arc::clone(&ota))?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => debug!("ctrl-c received"),
        _ = sigterm.recv() => debug!("SIGTERM received"),
        result = server_task => {
            match result {
                Ok(Ok(())) => debug!("server stopped normally"),
                Ok(Err(e)) => error!("server stopped with error: {e}"),
                Err(e) => error!("server task panicked: {e}"),
            }
        },
    }

    info!("shutting down");
    server_handle.stop(true).await;

    if let Err(e) = ota.registry().persist() {
        error!("failed to persist devices on shutdown: {e:#}");
    }
    info!("shutdown complete");

    Ok(())
}

fn initialize() {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!("module version: {}", env!("CARGO_PKG_VERSION"));
}

fn create_service(config: &AppConfig) -> OtaService<JsonFileStore> {
    let registry = DeviceRegistry::new(JsonFileStore::new(&config.paths.devices_file));
    registry.load();

    let firmware = FirmwareStore::new(
        &config.firmware.dir,
        config.firmware.path.clone(),
        &config.firmware.version,
    );

    OtaService::new(registry, firmware, config.ota.clone())
}

async fn log_banner(config: &AppConfig, ota: &OtaService<JsonFileStore>) {
    info!("ESP32 OTA server");
    info!("public url: {}", config.ota.public_url);
    info!("declared version: {}", ota.firmware().version());

    match ota.firmware().active() {
        Some(artifact) => match ota.firmware_summary(&artifact).await {
            Ok(summary) => info!(
                "firmware: {} ({}) md5: {}",
                summary.name, summary.size, summary.md5
            ),
            Err(e) => warn!("firmware: {} ({}), {e}", artifact.name, format_size(artifact.size)),
        },
        None => warn!(
            "no firmware found in {}, upload one via the dashboard",
            ota.firmware().dir().display()
        ),
    }

    if config.ota.secret.is_some() {
        info!("token verification enabled");
    }
    info!(
        "devices: {} known, stored in {}",
        ota.registry().len(),
        config.paths.devices_file.display()
    );
    info!("dashboard: {}/dashboard", config.ota.public_url);
}

fn run_server(
    config: &AppConfig,
    ota: Arc<OtaService<JsonFileStore>>,
) -> Result<(
    ServerHandle,
    tokio::task::JoinHandle<Result<(), std::io::Error>>,
)> {
    let api = OtaApi::new(
        ota,
        config.paths.web_dir.clone(),
        config.server.upload_limit_bytes,
    );

    let server = HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allow_any_header()
                    .allowed_methods(vec!["GET", "POST"])
                    .max_age(3600),
            )
            .configure(|cfg| api.configure(cfg))
    })
    .bind((config.server.bind, config.server.port))
    .context("failed to bind server")?
    .disable_signals()
    .run();

    info!(
        "listening on {}:{}",
        config.server.bind, config.server.port
    );

    Ok((server.handle(), tokio::spawn(server)))
}
