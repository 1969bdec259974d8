// LoginServerLink - the game server's side of the control channel
//
// A single task owns the connection to the login server: it performs the
// InitLS / BlowFishKey / GameServerAuth handshake, then relays player
// session validations and bookkeeping. The gate talks to it through a
// cloneable handle; every failure path on the link is a refusal.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Duration, sleep, timeout};

use rand::RngCore;

use l2_shared::PROTOCOL_REVISION;
use l2_shared::crypt::L2Blowfish;
use l2_shared::crypt::frame::{self, FrameError, HEADER_SIZE};
use l2_shared::crypt::keypool::rsa_encrypt_raw;
use l2_shared::network::{READ_BUFFER_SIZE, SEND_BUFFER_SIZE};
use l2_shared::session::SessionKey;
use l2_shared::util::ByteBuffer;

use crate::game_codes::LoginOpcode;
use crate::packets::*;

/// Length of the control-channel Blowfish key.
const CONTROL_KEY_LEN: usize = 40;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const AUTH_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Connector configuration assembled from the config file.
pub struct LinkConfig {
    pub login_host: String,
    pub login_port: u16,
    pub registration: RegistrationRequest,
}

enum LinkCommand {
    AuthPlayer {
        account: String,
        key: SessionKey,
        reply: oneshot::Sender<bool>,
    },
    PlayerInGame {
        account: String,
    },
    PlayerLogout {
        account: String,
    },
}

/// Handle the gate uses to reach the control channel.
#[derive(Clone)]
pub struct LoginServerLink {
    tx: mpsc::Sender<LinkCommand>,
}

impl LoginServerLink {
    /// Spawn the connector task; it keeps reconnecting until shutdown.
    pub fn spawn(cfg: LinkConfig, shutdown: watch::Receiver<bool>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run_link(cfg, rx, shutdown));
        LoginServerLink { tx }
    }

    /// Relay a session validation to the login server. Link down,
    /// reconnect in progress, or a late reply all count as a refusal.
    pub async fn auth_player(&self, account: &str, key: SessionKey) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = LinkCommand::AuthPlayer {
            account: account.to_string(),
            key,
            reply: reply_tx,
        };
        if self.tx.send(cmd).await.is_err() {
            return false;
        }
        matches!(timeout(AUTH_REPLY_TIMEOUT, reply_rx).await, Ok(Ok(true)))
    }

    pub async fn player_in_game(&self, account: &str) {
        let _ = self
            .tx
            .send(LinkCommand::PlayerInGame {
                account: account.to_string(),
            })
            .await;
    }

    pub async fn player_logout(&self, account: &str) {
        let _ = self
            .tx
            .send(LinkCommand::PlayerLogout {
                account: account.to_string(),
            })
            .await;
    }
}

async fn send<W: AsyncWrite + Unpin>(
    writer: &mut W,
    cipher: &L2Blowfish,
    send_buf: &mut [u8],
    pkt: &ByteBuffer,
) -> Result<(), FrameError> {
    let n = pkt.size();
    send_buf[HEADER_SIZE..HEADER_SIZE + n].copy_from_slice(pkt.contents());
    frame::write_frame(writer, cipher, send_buf, n).await
}

async fn run_link(
    cfg: LinkConfig,
    mut rx: mpsc::Receiver<LinkCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        match connect_and_serve(&cfg, &mut rx, &mut shutdown).await {
            Ok(()) => return,
            Err(e) => tracing::warn!("Login server link lost: {:#}", e),
        }
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = sleep(RECONNECT_DELAY) => {}
        }
    }
}

async fn connect_and_serve(
    cfg: &LinkConfig,
    rx: &mut mpsc::Receiver<LinkCommand>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", cfg.login_host, cfg.login_port);
    let mut stream = TcpStream::connect(&addr).await?;
    tracing::info!("Connected to login server at {}", addr);

    let mut read_buf = vec![0u8; READ_BUFFER_SIZE];
    let mut send_buf = vec![0u8; SEND_BUFFER_SIZE];
    let default_cipher = L2Blowfish::default_gs();

    // InitLS arrives under the well-known key
    let n = timeout(
        HANDSHAKE_TIMEOUT,
        frame::read_frame(&mut stream, &default_cipher, &mut read_buf),
    )
    .await??;
    let payload = &read_buf[..n];
    if payload.first() != Some(&(LoginOpcode::InitLs as u8)) {
        anyhow::bail!("expected InitLS");
    }
    let Some(init) = InitLs::from_payload(&payload[1..]) else {
        anyhow::bail!("malformed InitLS");
    };
    if init.revision != PROTOCOL_REVISION {
        tracing::warn!("Login server control revision 0x{:04x}", init.revision);
    }

    // wrap a fresh channel key against the advertised modulus
    let mut key = [0u8; CONTROL_KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    let mut block = vec![0u8; init.modulus.len()];
    block[init.modulus.len() - CONTROL_KEY_LEN..].copy_from_slice(&key);
    let wrapped = rsa_encrypt_raw(&init.modulus, &block);

    send(&mut stream, &default_cipher, &mut send_buf, &build_blowfish_key(&wrapped)).await?;
    let cipher = L2Blowfish::new(&key)?;

    send(
        &mut stream,
        &cipher,
        &mut send_buf,
        &build_game_server_auth(&cfg.registration),
    )
    .await?;

    let n = timeout(
        HANDSHAKE_TIMEOUT,
        frame::read_frame(&mut stream, &cipher, &mut read_buf),
    )
    .await??;
    let payload = &read_buf[..n];
    match payload.first().copied().and_then(LoginOpcode::from_u8) {
        Some(LoginOpcode::AuthResponse) => {
            let Some(resp) = AuthResponse::from_payload(&payload[1..]) else {
                anyhow::bail!("malformed AuthResponse");
            };
            tracing::info!("Registered on login server as '{}' (id {})", resp.name, resp.id);
        }
        Some(LoginOpcode::LoginServerFail) => {
            let reason = LoginServerFail::from_payload(&payload[1..])
                .map(|f| f.reason)
                .unwrap_or(0);
            anyhow::bail!("login server rejected registration (reason 0x{:02x})", reason);
        }
        _ => anyhow::bail!("unexpected handshake reply"),
    }

    // advertise our listing state right away
    send(
        &mut stream,
        &cipher,
        &mut send_buf,
        &build_server_status(&[
            (STATUS_ATTR_STATUS, STATUS_GOOD),
            (STATUS_ATTR_MAX_PLAYERS, cfg.registration.max_players),
            (STATUS_ATTR_AGE_LIMIT, 0),
            (STATUS_ATTR_BRACKETS, 0),
            (STATUS_ATTR_PVP, 1),
        ]),
    )
    .await?;

    serve(stream, cipher, rx, shutdown, read_buf, send_buf).await
}

/// Established-channel loop: the reader half completes pending auth
/// waiters, the writer half drains gate commands.
async fn serve(
    stream: TcpStream,
    cipher: L2Blowfish,
    rx: &mut mpsc::Receiver<LinkCommand>,
    shutdown: &mut watch::Receiver<bool>,
    mut read_buf: Vec<u8>,
    mut send_buf: Vec<u8>,
) -> anyhow::Result<()> {
    let (mut read_half, mut write_half) = stream.into_split();
    let waiters: Arc<Mutex<HashMap<String, oneshot::Sender<bool>>>> =
        Arc::new(Mutex::new(HashMap::new()));

    let reader_cipher = cipher.clone();
    let reader_waiters = waiters.clone();
    let mut reader = tokio::spawn(async move {
        loop {
            let n = match frame::read_frame(&mut read_half, &reader_cipher, &mut read_buf).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!("Control channel read ended: {}", e);
                    break;
                }
            };
            let payload = &read_buf[..n];
            match payload.first().copied().and_then(LoginOpcode::from_u8) {
                Some(LoginOpcode::PlayerAuthResponse) => {
                    if let Some(resp) = PlayerAuthResponse::from_payload(&payload[1..]) {
                        tracing::debug!("Player auth verdict for '{}': {}", resp.account, resp.ok);
                        let pending = reader_waiters.lock().remove(&resp.account.to_lowercase());
                        if let Some(tx) = pending {
                            let _ = tx.send(resp.ok);
                        }
                    }
                }
                other => {
                    tracing::debug!("Ignoring control opcode {:?}", other);
                }
            }
        }
    });

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                reader.abort();
                return Ok(());
            }
            _ = &mut reader => {
                anyhow::bail!("control channel closed by login server");
            }
            cmd = rx.recv() => {
                let Some(cmd) = cmd else {
                    reader.abort();
                    return Ok(());
                };
                match cmd {
                    LinkCommand::AuthPlayer { account, key, reply } => {
                        waiters.lock().insert(account.to_lowercase(), reply);
                        send(
                            &mut write_half,
                            &cipher,
                            &mut send_buf,
                            &build_player_auth_request(&account, &key),
                        )
                        .await?;
                    }
                    LinkCommand::PlayerInGame { account } => {
                        send(
                            &mut write_half,
                            &cipher,
                            &mut send_buf,
                            &build_player_in_game(std::slice::from_ref(&account)),
                        )
                        .await?;
                    }
                    LinkCommand::PlayerLogout { account } => {
                        send(
                            &mut write_half,
                            &cipher,
                            &mut send_buf,
                            &build_player_logout(&account),
                        )
                        .await?;
                    }
                }
            }
        }
    }
}
