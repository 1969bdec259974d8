// loginserver - L2 Interlude Authentication Server
//
// This is the authentication server that handles:
// - Client login over the framed Blowfish/RSA protocol
// - Server list distribution
// - Game server registration on the control channel
// - Session key issue, validation and consumption

mod client_session;
mod gameserver_table;
mod gs_session;
mod login_codes;
mod packets;
mod session_manager;

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Duration;

use l2_shared::accounts::AccountRepository;
use l2_shared::config::get_config;
use l2_shared::crypt::KeyPools;
use l2_shared::database::Database;
use l2_shared::log::initialize_logging;
use l2_shared::network::BufferPool;
use l2_shared::MINUTE;

use client_session::LoginContext;
use gameserver_table::GameServerTable;
use session_manager::SessionManager;

/// Default client listener port
const DEFAULT_CLIENT_PORT: i32 = 2106;

/// Default game server control listener port
const DEFAULT_GS_PORT: i32 = 9014;

/// Default config file name
const DEFAULT_CONFIG: &str = "loginserver.conf";

/// CLI arguments
#[derive(Parser, Debug)]
#[command(name = "loginserver")]
#[command(about = "L2 Interlude Authentication Server")]
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
        if !config.set_source(&args.config, "Login_") {
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
    initialize_logging(log_dir.as_deref(), "loginserver", "info");

    tracing::info!("L2 Interlude Login Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Using configuration file: {}", args.config);
    tracing::info!("<Ctrl-C> to stop.");

    // Initialize database
    let mut login_db = Database::new("Login");
    let db_string = {
        let config = get_config().lock();
        config.get_string("LoginDatabaseInfo")
    };

    if db_string.is_empty() {
        tracing::error!("Database not specified in configuration");
        return Err(anyhow::anyhow!("Database not specified"));
    }

    if let Err(e) = login_db.initialize(&db_string).await {
        tracing::error!("Cannot connect to database: {}", e);
        return Err(anyhow::anyhow!("Database connection failed"));
    }
    let db = Arc::new(login_db);

    // Pre-generate the RSA pools; this dominates startup time
    let keys = KeyPools::generate()?;

    // Provisioned game server slots
    let servers = GameServerTable::new();
    let (defs, auto_create, show_licence, read_timeout) = {
        let config = get_config().lock();
        (
            config.game_servers(),
            config.get_bool_default("AutoCreateAccounts", false),
            config.get_bool_default("ShowLicence", true),
            config.get_int_default("ClientReadTimeout", 5) as u64,
        )
    };
    if defs.is_empty() {
        tracing::error!("No game servers provisioned.");
        return Err(anyhow::anyhow!("No game servers configured"));
    }
    servers.load_provisioned(&defs);

    let ctx = Arc::new(LoginContext {
        sessions: SessionManager::new(),
        servers,
        keys,
        accounts: AccountRepository::new(db.clone(), auto_create),
        read_pool: BufferPool::for_reads(),
        send_pool: BufferPool::for_sends(),
        show_licence,
        read_timeout: Duration::from_secs(read_timeout),
    });

    // Listeners
    let (bind_ip, client_port, gs_ip, gs_port) = {
        let config = get_config().lock();
        (
            config.get_string_default("BindAddress", "0.0.0.0"),
            config.get_int_default("Port", DEFAULT_CLIENT_PORT),
            config.get_string_default("GsListenHost", "127.0.0.1"),
            config.get_int_default("GsListenPort", DEFAULT_GS_PORT),
        )
    };

    let client_listener = TcpListener::bind(format!("{bind_ip}:{client_port}")).await?;
    tracing::info!("Listening for clients on {}:{}", bind_ip, client_port);

    let gs_listener = TcpListener::bind(format!("{gs_ip}:{gs_port}")).await?;
    tracing::info!("Listening for game servers on {}:{}", gs_ip, gs_port);

    // Shutdown signal fan-out
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    {
        let shutdown_tx = shutdown_tx.clone();
        ctrlc::set_handler(move || {
            tracing::info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
        })?;
    }

    // Database ping interval
    let ping_interval = {
        let config = get_config().lock();
        config.get_int_default("MaxPingTime", 30) as u64
    };
    let ping_interval_secs = ping_interval * MINUTE as u64;

    // Spawn database ping task
    let db_ping = db.clone();
    let mut stop_ping = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(ping_interval_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    tracing::debug!("Ping database to keep connection alive");
                    if let Err(e) = db_ping.ping().await {
                        tracing::error!("Database ping failed: {}", e);
                    }
                }
                _ = stop_ping.changed() => break,
            }
        }
    });

    // Main accept loop
    loop {
        tokio::select! {
            result = client_listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let ctx = ctx.clone();
                        let shutdown = shutdown_rx.clone();
                        tokio::spawn(async move {
                            client_session::handle_client(stream, addr, ctx, shutdown).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept client connection: {}", e);
                    }
                }
            }
            result = gs_listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let ctx = ctx.clone();
                        let shutdown = shutdown_rx.clone();
                        tokio::spawn(async move {
                            gs_session::handle_gameserver(stream, addr, ctx, shutdown).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept game server connection: {}", e);
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
