//! Linkshare Server Binary
//!
//! Usage: linkshare-server [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -g, --generate       Generate a default server configuration
//!   -h, --help           Print help information

use std::env;
use std::sync::Arc;

use linkshare::auth::{CommandAuthenticator, RetryingAuthenticator};
use linkshare::server::{ServerConfig, ServerConfigFile, TunnelServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Respects RUST_LOG (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-g" | "--generate" => {
            generate_config()?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_server(&args[2]).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"Linkshare Server - owner side of a shared network session

USAGE:
    linkshare-server [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file (TOML)
    -g, --generate          Print a default configuration
    -h, --help              Print help information

EXAMPLES:
    Generate a configuration, then set login_command:
        linkshare-server --generate > server.toml

    Run the server:
        linkshare-server --config server.toml
"#
    );
}

fn generate_config() -> anyhow::Result<()> {
    let mut config = ServerConfig::default();
    config.login_command = Some("/usr/local/bin/portal-login".to_string());
    config.logout_command = Some("/usr/local/bin/portal-logout".to_string());

    let config_file = ServerConfigFile::from_config(&config);

    println!("# Linkshare Server Configuration");
    println!("# Generated: {}", chrono::Utc::now());
    println!("#");
    println!("# login_command must exit 0 once this host holds the session and may");
    println!("# print the assigned IP address on its own line.");
    println!();
    println!("{}", toml::to_string_pretty(&config_file)?);

    Ok(())
}

async fn run_server(config_path: &str) -> anyhow::Result<()> {
    let config_content = std::fs::read_to_string(config_path)?;
    let config_file: ServerConfigFile = toml::from_str(&config_content)?;
    let config = config_file.to_config().map_err(|e: String| anyhow::anyhow!(e))?;

    let login = config
        .login_command
        .clone()
        .ok_or_else(|| anyhow::anyhow!("login_command is required"))?;
    let authenticator = RetryingAuthenticator::new(
        CommandAuthenticator::new(login, config.logout_command.clone()),
        config.auth_retry,
    );

    tracing::info!("Starting Linkshare server on {}", config.bind_addr());
    tracing::info!(
        "Heartbeat every {:?}, eviction after {:?}",
        config.heartbeat_interval,
        config.liveness_timeout()
    );

    let server = Arc::new(TunnelServer::new(config, Arc::new(authenticator)));

    let runner = Arc::clone(&server);
    let mut serve = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        result = &mut serve => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            server.stop().await;
            serve.await??;
        }
    }

    tracing::info!("\n{}", server.metrics().format_report());
    Ok(())
}
