use log::{error, info};
use std::io;
use std::path::Path;
use std::sync::Arc;

use actix_web::{App, HttpServer, web};

use hwmux::{AppConfig, AppError, AppState, Dispatcher, HttpConfig, SystemBackend};

enum Listener<'a> {
    Unix(&'a str),
    Tcp(&'a str),
}

fn listeners(http: &HttpConfig) -> Vec<Listener<'_>> {
    let unix = http.unix_socket.as_deref().map(Listener::Unix);
    let tcp = http.host.as_deref().map(Listener::Tcp);
    unix.into_iter().chain(tcp).collect()
}

fn startup_error(what: &str, e: AppError) -> io::Error {
    error!("{what}: {e}");
    io::Error::other(format!("{what}: {e}"))
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("HWMUX_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = Arc::new(
        AppConfig::load_from_file(&config_path)
            .map_err(|e| startup_error(&format!("Failed to load {config_path}"), e))?,
    );

    let dispatcher = Arc::new(
        Dispatcher::new(config.clone(), Arc::new(SystemBackend))
            .map_err(|e| startup_error("Failed to start dispatcher", e))?,
    );
    let app_state = AppState {
        dispatcher: dispatcher.clone(),
    };

    let scope_path = config.http.path.clone();
    let mut server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .service(app_state.api_scope(&scope_path))
    });

    let mut bound = Vec::new();
    for listener in listeners(&config.http) {
        server = match listener {
            Listener::Unix(socket_path) => {
                // A stale socket from a previous run blocks the bind.
                if Path::new(socket_path).exists() {
                    std::fs::remove_file(socket_path)?;
                }
                bound.push(socket_path);
                server.bind_uds(socket_path)?
            }
            Listener::Tcp(host) => {
                bound.push(host);
                server.bind_auto_h2c(host)?
            }
        };
    }

    info!("Starting server on {}...", bound.join(" and "));

    let result = server.run().await;
    dispatcher.shutdown();
    result
}
