//! Linkshare Client Binary
//!
//! Usage: linkshare-client [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -g, --generate       Generate a default client configuration
//!   -h, --help           Print help information

use std::env;
use std::net::IpAddr;

use linkshare::auth::{Authenticator, CommandAuthenticator};
use linkshare::client::{ClientConfig, TunnelClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
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
            let config = ClientConfig::new("192.168.1.10");
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_client(&args[2]).await?;
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
        r#"Linkshare Client - borrow the owner's network session

USAGE:
    linkshare-client [OPTIONS]

OPTIONS:
    -c, --config <FILE>  Path to configuration file
    -g, --generate       Print a default configuration
    -h, --help           Print help information

CONFIGURATION FILE FORMAT (JSON):
    {{
        "server_addr": "192.168.1.10",
        "server_port": 8888,
        "proxy_port": 1080,
        "login_command": "/usr/local/bin/portal-login"
    }}

EXAMPLES:
    Run the client, then point applications at socks5://127.0.0.1:1080:
        linkshare-client --config client.json
"#
    );
}

async fn run_client(config_path: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    // Logging this host in takes the session away from the owner
    let hello_ip = match &config.login_command {
        Some(login) => {
            let outcome = CommandAuthenticator::new(login.clone(), None).authenticate().await;
            if !outcome.success {
                anyhow::bail!("login failed: {}", outcome.message);
            }
            tracing::info!("Logged in: {}", outcome.message);
            outcome.ip.and_then(|ip| ip.parse::<IpAddr>().ok())
        }
        None => None,
    };

    tracing::info!("Connecting to {}", config.server_endpoint());
    let client = TunnelClient::connect(config, hello_ip).await?;
    tracing::info!("Proxy ready on socks5://{}", client.local_addr()?);

    let cancel = client.cancel_token();
    let mut run = tokio::spawn(client.run());

    tokio::select! {
        result = &mut run => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            cancel.cancel();
            run.await??;
        }
    }

    Ok(())
}

fn load_config(path: &str) -> anyhow::Result<ClientConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: ClientConfig = serde_json::from_str(&content)?;
    config.validate().map_err(|e| anyhow::anyhow!(e))?;
    Ok(config)
}
