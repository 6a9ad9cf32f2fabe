use log::{error, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use std::{fs, process};

use actix_web::{App, HttpServer, web};

use rmgr::{
    AppConfig, AppState, BackendMode, LineBackend, RelayController, SysfsBackend, selector,
};

#[cfg(feature = "hardware-gpio")]
use rmgr::LibgpiodBackend;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1).peekable();
    let check_only = args.next_if(|arg| arg == "--check").is_some();
    let config_path: PathBuf = args
        .next()
        .or_else(|| std::env::var("RMGR_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string())
        .into();

    if check_only {
        process::exit(check_config(&config_path));
    }

    let config = AppConfig::load_from_file(&config_path)
        .unwrap_or_else(|e| panic!("Failed to load config {}: {e}", config_path.display()));

    let mode = selector::select(config.gpio.backend);
    if let Err(e) = config.relays.ensure_addressable(mode) {
        panic!("Config does not match the {mode} backend: {e}");
    }

    match mode {
        #[cfg(feature = "hardware-gpio")]
        BackendMode::LineDescriptor => serve(LibgpiodBackend::new(), config, config_path).await,
        #[cfg(not(feature = "hardware-gpio"))]
        BackendMode::LineDescriptor => {
            panic!("line-descriptor backend selected but this build lacks hardware-gpio")
        }
        BackendMode::Path => {
            let backend = SysfsBackend::new(config.gpio.sysfs_root.clone());
            serve(backend, config, config_path).await
        }
    }
}

/// Validates a config file, printing one line per relay. Returns the exit code.
fn check_config(path: &Path) -> i32 {
    match AppConfig::load_from_file(path) {
        Ok(config) => {
            for relay in config.relays.sorted() {
                match serde_json::to_string(relay) {
                    Ok(line) => println!("{line}"),
                    Err(e) => eprintln!("relay {}: {e}", relay.id),
                }
            }
            0
        }
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}

async fn serve<B: LineBackend + 'static>(
    backend: B,
    config: AppConfig,
    config_path: PathBuf,
) -> std::io::Result<()> {
    let controller = Arc::new(RelayController::start(
        Arc::new(backend),
        config.relays,
        config.gpio.reload_policy,
    ));
    info!("Using {} backend", controller.mode());

    let app_state = AppState::new(Arc::clone(&controller), config_path);

    let http_cfg = config.http.clone();
    let server = HttpServer::new(move || {
        let scope_path = http_cfg.path.clone();
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .service(app_state.api_scope(&scope_path))
    })
    .client_request_timeout(Duration::from_secs(config.http.timeout));

    let bind_addrs: String;
    let http_cfg = config.http.clone();
    let server = match (&http_cfg.unix_socket, &http_cfg.host) {
        (Some(socket_path), Some(host)) => {
            if Path::new(socket_path).exists() {
                fs::remove_file(socket_path)?;
            }
            bind_addrs = format!("{} and {}", socket_path, host);

            server.bind_uds(socket_path)?.bind_auto_h2c(host)?
        }
        (Some(socket_path), None) => {
            if Path::new(socket_path).exists() {
                fs::remove_file(socket_path)?;
            }
            bind_addrs = socket_path.clone();

            server.bind_uds(socket_path)?
        }
        (None, Some(host)) => {
            bind_addrs = host.clone();

            server.bind_auto_h2c(host)?
        }
        (None, None) => {
            panic!("Config error: either 'unix_socket' or 'host' must be specified")
        }
    };

    info!("Starting server on {}...", bind_addrs);

    let result = server.run().await;
    if let Err(e) = &result {
        error!("Server stopped: {e}");
    }
    info!("Releasing GPIO lines");
    controller.shutdown();
    result
}
