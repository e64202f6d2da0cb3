//! Board server command — `crewboard serve`.

use anyhow::Result;
use console::style;
use std::path::PathBuf;

use crewboard::board::server::{ServerConfig, start_server};
use crewboard::config::CrewboardConfig;

/// CLI overrides on top of the file and environment settings.
#[derive(Debug, Default)]
pub struct ServeArgs {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub dev: bool,
    pub open: bool,
}

/// Merge CLI overrides into the resolved server settings.
pub fn server_config(config: &CrewboardConfig, args: &ServeArgs) -> ServerConfig {
    let mut server = ServerConfig::from(config);
    if let Some(host) = &args.host {
        server.host = host.clone();
    }
    if let Some(port) = args.port {
        server.port = port;
    }
    if let Some(path) = &args.db_path {
        server.db_path = if path.is_absolute() {
            path.clone()
        } else {
            config.project_dir.join(path)
        };
    }
    server.dev_mode |= args.dev;
    server
}

pub async fn cmd_serve(config: &CrewboardConfig, args: ServeArgs) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    let server = server_config(config, &args);
    let open_browser = args.open && !server.dev_mode;

    start_server(server, move |addr| {
        let url = format!("http://{}", addr);
        println!("crewboard running at {}", style(&url).cyan().bold());
        if open_browser && let Err(e) = open::that(&url) {
            tracing::warn!(error = %e, "Failed to open browser");
        }
    })
    .await
}
