//! jsext
//!
//! Script evaluation server. Listens on a TCP port, prints the bound port
//! on stdout and evaluates line-delimited JSON requests against one
//! persistent JavaScript context.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use jsext::backend::JsContext;
use jsext::config::{ServerConfig, SessionEndPolicy};
use jsext::server::Server;

#[derive(Parser, Debug)]
#[command(name = "jsext")]
#[command(about = "Line-delimited JSON script evaluation server")]
struct Args {
    /// Port to listen on (0 or omitted picks an ephemeral port)
    port: Option<u16>,

    /// Address to listen on
    #[arg(long)]
    host: Option<IpAddr>,

    /// JSON config file (overrides JSEXT_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// What to do when a client disconnects
    #[arg(long, value_enum)]
    on_session_end: Option<SessionEndPolicy>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(policy) = self.on_session_end {
            config.on_session_end = policy;
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // stderr only; stdout carries the port announcement
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);

    let context = JsContext::new(&config.engine).context("Failed to create script context")?;

    let server = match Server::bind(config.clone(), context).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Listener failed to start");
            return Ok(ExitCode::SUCCESS);
        }
    };

    let addr = server.local_addr()?;
    info!(%addr, policy = ?config.on_session_end, "Listening");
    println!("{}", addr.port());

    let local = tokio::task::LocalSet::new();
    let end = local.run_until(server.run()).await;
    Ok(ExitCode::from(end.exit_code()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_port_and_flags_override_config() {
        let args = Args::parse_from([
            "jsext",
            "4040",
            "--host",
            "0.0.0.0",
            "--on-session-end",
            "continue",
        ]);
        let mut config = ServerConfig::default();
        args.apply(&mut config);
        assert_eq!(config.port, 4040);
        assert_eq!(config.host.to_string(), "0.0.0.0");
        assert_eq!(config.on_session_end, SessionEndPolicy::Continue);
    }

    #[test]
    fn no_arguments_keep_config() {
        let args = Args::parse_from(["jsext"]);
        let mut config = ServerConfig::from_json(r#"{"port": 9000}"#).unwrap();
        args.apply(&mut config);
        assert_eq!(config.port, 9000);
        assert_eq!(config.on_session_end, SessionEndPolicy::Exit);
    }
}
