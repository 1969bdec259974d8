// gameserver - L2 Interlude Game Server (authentication gate)
//
// Registers with the login server over the control channel and admits
// clients whose session keys the login server validates. The world
// simulation attaches behind the gate.

mod client_gate;
mod game_codes;
mod login_client;
mod packets;

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Duration;

use l2_shared::HEX_ID_SIZE;
use l2_shared::config::get_config;
use l2_shared::log::initialize_logging;
use l2_shared::network::BufferPool;

use client_gate::GateContext;
use login_client::{LinkConfig, LoginServerLink};
use packets::RegistrationRequest;

/// Default client gate port
const DEFAULT_GATE_PORT: i32 = 7777;

/// Default login server control port
const DEFAULT_LOGIN_PORT: i32 = 9014;

/// Default config file name
const DEFAULT_CONFIG: &str = "gameserver.conf";

/// CLI arguments
#[derive(Parser, Debug)]
#[command(name = "gameserver")]
#[command(about = "L2 Interlude Game Server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    {
        let mut config = get_config().lock();
        if !config.set_source(&args.config, "Game_") {
            eprintln!("Could not find configuration file {}.", args.config);
            return Err(anyhow::anyhow!("Configuration file not found"));
        }
    }

    // Initialize logging
    let log_dir = {
        let config = get_config().lock();
        let dir = config.get_string_default("LogsDir", "");
        if dir.is_empty() { None } else { Some(dir) }
    };
    initialize_logging(log_dir.as_deref(), "gameserver", "info");

    tracing::info!("L2 Interlude Game Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Using configuration file: {}", args.config);
    tracing::info!("<Ctrl-C> to stop.");

    // Registration parameters
    let (bind_ip, gate_port, login_host, login_port, registration, read_timeout) = {
        let config = get_config().lock();
        let gate_port = config.get_int_default("Port", DEFAULT_GATE_PORT);

        let hex_str = config.get_string("HexID");
        let hex_id = data_encoding::HEXLOWER_PERMISSIVE
            .decode(hex_str.as_bytes())
            .map_err(|_| anyhow::anyhow!("HexID is not valid hex"))?;
        if hex_id.len() != HEX_ID_SIZE {
            return Err(anyhow::anyhow!(
                "HexID must be {} bytes ({} hex characters)",
                HEX_ID_SIZE,
                HEX_ID_SIZE * 2
            ));
        }

        (
            config.get_string_default("BindAddress", "0.0.0.0"),
            gate_port,
            config.get_string_default("LoginHost", "127.0.0.1"),
            config.get_int_default("LoginPort", DEFAULT_LOGIN_PORT) as u16,
            RegistrationRequest {
                desired_id: config.get_int_default("ServerId", 1) as u8,
                accept_alternate: config.get_bool_default("AcceptAlternateId", false),
                port: gate_port as u16,
                max_players: config.get_int_default("MaximumOnlineUsers", 5000),
                hex_id,
                external_host: config.get_string_default("ExternalHost", "127.0.0.1"),
                internal_host: config.get_string_default("InternalHost", "127.0.0.1"),
            },
            config.get_int_default("ClientReadTimeout", 5) as u64,
        )
    };

    // Shutdown signal fan-out
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    {
        let shutdown_tx = shutdown_tx.clone();
        ctrlc::set_handler(move || {
            tracing::info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
        })?;
    }

    // Control channel to the login server
    let link = LoginServerLink::spawn(
        LinkConfig {
            login_host,
            login_port,
            registration,
        },
        shutdown_rx.clone(),
    );

    let ctx = Arc::new(GateContext {
        link,
        read_pool: BufferPool::for_reads(),
        send_pool: BufferPool::for_sends(),
        read_timeout: Duration::from_secs(read_timeout),
    });

    let listener = TcpListener::bind(format!("{bind_ip}:{gate_port}")).await?;
    tracing::info!("Listening for clients on {}:{}", bind_ip, gate_port);

    // Main accept loop
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let ctx = ctx.clone();
                        let shutdown = shutdown_rx.clone();
                        tokio::spawn(async move {
                            client_gate::handle_client(stream, addr, ctx, shutdown).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept connection: {}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                let _ = shutdown_tx.send(true);
                break;
            }
        }
    }

    tracing::info!("Halting process...");
    Ok(())
}
