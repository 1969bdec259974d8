// GsSession - per-connection state machine on the game-server listener
//
// Control channel handshake:
// 1. InitLS out under the well-known default key (revision + 512-bit modulus)
// 2. BlowFishKey in: RSA-unwrap the 40-byte per-connection key, switch cipher
// 3. GameServerAuth in: claim a provisioned slot by hexID
// 4. Authed: player session relay and server bookkeeping until disconnect

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;

use l2_shared::crypt::L2Blowfish;
use l2_shared::crypt::frame::{self, HEADER_SIZE};

use crate::client_session::{LoginContext, read_next, send_packet};
use crate::gameserver_table::Registration;
use crate::login_codes::*;
use crate::packets::*;

/// Length of the control-channel Blowfish key inside the RSA block.
const CONTROL_KEY_LEN: usize = 40;

/// Session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlState {
    AwaitBlowfish,
    BfEstablished,
    Authed,
}

/// Handle a single game server control connection
pub async fn handle_gameserver(
    mut stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<LoginContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("Game server connecting from {}", addr);

    let mut read_buf = ctx.read_pool.take();
    let mut send_buf = ctx.send_pool.take();
    let mut bound_id: Option<u8> = None;

    if let Err(e) = run_control(
        &mut stream,
        addr,
        &ctx,
        &mut shutdown,
        &mut read_buf,
        &mut send_buf,
        &mut bound_id,
    )
    .await
    {
        tracing::debug!("Control connection from {} closed: {:#}", addr, e);
    }

    if let Some(id) = bound_id {
        tracing::info!("Game server {} disconnected, releasing slot", id);
        ctx.servers.unregister(id);
    }

    ctx.read_pool.put(read_buf);
    ctx.send_pool.put(send_buf);
}

#[allow(clippy::too_many_arguments)]
async fn run_control(
    stream: &mut TcpStream,
    addr: SocketAddr,
    ctx: &LoginContext,
    shutdown: &mut watch::Receiver<bool>,
    read_buf: &mut [u8],
    send_buf: &mut [u8],
    bound_id: &mut Option<u8>,
) -> anyhow::Result<()> {
    let keypair = ctx.keys.random_gs();
    let mut cipher = L2Blowfish::default_gs();

    let init = build_init_ls(keypair.modulus());
    send_buf[HEADER_SIZE..HEADER_SIZE + init.size()].copy_from_slice(init.contents());
    frame::write_frame(stream, &cipher, send_buf, init.size()).await?;

    let mut state = ControlState::AwaitBlowfish;
    let mut in_game: HashSet<String> = HashSet::new();

    loop {
        // handshake frames run against the gate deadline, the established
        // channel only breaks on shutdown or disconnect
        let deadline = match state {
            ControlState::Authed => None,
            _ => Some(ctx.read_timeout),
        };
        let Some(n) = read_next(stream, &cipher, read_buf, deadline, shutdown).await? else {
            return Ok(());
        };
        let payload = &read_buf[..n];
        if payload.is_empty() {
            anyhow::bail!("empty payload");
        }
        let opcode = GsOpcode::from_u8(payload[0]);
        let body = &payload[1..];

        match (state, opcode) {
            (ControlState::AwaitBlowfish, Some(GsOpcode::BlowFishKey)) => {
                let Some(pkt) = BlowFishKey::from_payload(body) else {
                    anyhow::bail!("malformed BlowFishKey");
                };
                let plain = keypair.decrypt_block(&pkt.wrapped);
                if plain.len() < CONTROL_KEY_LEN {
                    anyhow::bail!("unwrapped control key too short");
                }
                let key = &plain[plain.len() - CONTROL_KEY_LEN..];
                cipher = L2Blowfish::new(key)?;
                state = ControlState::BfEstablished;
            }

            (ControlState::BfEstablished, Some(GsOpcode::GameServerAuth)) => {
                let Some(auth) = GameServerAuth::from_payload(body) else {
                    anyhow::bail!("malformed GameServerAuth");
                };
                let reg = Registration {
                    external_host: auth.external_host.clone(),
                    internal_host: auth.internal_host.clone(),
                    port: auth.port,
                    max_players: auth.max_players,
                };
                match ctx.servers.try_acquire(auth.desired_id, &auth.hex_id, auth.accept_alternate, &reg)
                {
                    Ok(id) => {
                        let name = ctx
                            .servers
                            .get_by_id(id)
                            .map(|info| info.name)
                            .unwrap_or_default();
                        tracing::info!("Game server '{}' (id {}) registered from {}", name, id, addr);
                        *bound_id = Some(id);
                        send_packet(stream, &cipher, send_buf, &build_auth_response(id, &name))
                            .await?;
                        state = ControlState::Authed;
                    }
                    Err(reason) => {
                        tracing::info!(
                            "Game server registration for id {} from {} rejected: {:?}",
                            auth.desired_id,
                            addr,
                            reason
                        );
                        send_packet(stream, &cipher, send_buf, &build_login_server_fail(reason))
                            .await?;
                        return Ok(());
                    }
                }
            }

            (ControlState::Authed, Some(GsOpcode::PlayerAuthRequest)) => {
                let Some(req) = PlayerAuthRequest::from_payload(body) else {
                    anyhow::bail!("malformed PlayerAuthRequest");
                };
                let account = req.account.to_lowercase();
                // compare-and-delete: the first game server to validate a
                // session wins, everyone else is refused
                let ok = ctx.sessions.validate(&account, &req.key, true);
                tracing::debug!("Player auth for '{}': {}", account, ok);
                send_packet(
                    stream,
                    &cipher,
                    send_buf,
                    &build_player_auth_response(&req.account, ok),
                )
                .await?;
            }

            (ControlState::Authed, Some(GsOpcode::PlayerInGame)) => {
                let Some(pkt) = PlayerInGame::from_payload(body) else {
                    anyhow::bail!("malformed PlayerInGame");
                };
                if let Some(id) = *bound_id {
                    let mut added = 0;
                    for account in pkt.accounts {
                        if in_game.insert(account.to_lowercase()) {
                            added += 1;
                        }
                    }
                    ctx.servers.add_players(id, added);
                }
            }

            (ControlState::Authed, Some(GsOpcode::PlayerLogout)) => {
                let Some(pkt) = PlayerLogout::from_payload(body) else {
                    anyhow::bail!("malformed PlayerLogout");
                };
                if let Some(id) = *bound_id {
                    if in_game.remove(&pkt.account.to_lowercase()) {
                        ctx.servers.add_players(id, -1);
                    }
                }
            }

            (ControlState::Authed, Some(GsOpcode::ServerStatus)) => {
                let Some(pkt) = ServerStatus::from_payload(body) else {
                    anyhow::bail!("malformed ServerStatus");
                };
                if let Some(id) = *bound_id {
                    ctx.servers.apply_status(id, &pkt.attributes);
                }
            }

            _ => {
                tracing::debug!(
                    "Unauthorized control opcode {:02x} in state {:?} from {}",
                    payload[0],
                    state,
                    addr
                );
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::Duration;

    use l2_shared::accounts::AccountRepository;
    use l2_shared::config::GameServerDef;
    use l2_shared::crypt::keypool::{GS_MODULUS_SIZE, KeyPools, rsa_encrypt_raw};
    use l2_shared::database::Database;
    use l2_shared::network::BufferPool;
    use l2_shared::session::SessionKey;
    use l2_shared::util::ByteBuffer;

    use crate::gameserver_table::GameServerTable;
    use crate::session_manager::SessionManager;

    const TEST_HEX: [u8; l2_shared::HEX_ID_SIZE] = [0xA5; l2_shared::HEX_ID_SIZE];

    fn test_context() -> Arc<LoginContext> {
        let servers = GameServerTable::new();
        servers.load_provisioned(&[GameServerDef {
            id: 1,
            name: "Bartz".to_string(),
            host: "127.0.0.1".to_string(),
            port: 7777,
            hex_id: TEST_HEX.to_vec(),
        }]);
        Arc::new(LoginContext {
            sessions: SessionManager::new(),
            servers,
            keys: KeyPools::generate_sized(0, 1).unwrap(),
            accounts: AccountRepository::new(Arc::new(Database::new("Login")), false),
            read_pool: BufferPool::for_reads(),
            send_pool: BufferPool::for_sends(),
            show_licence: true,
            read_timeout: Duration::from_secs(5),
        })
    }

    async fn spawn_listener(ctx: Arc<LoginContext>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // keep the sender alive for the test duration
        std::mem::forget(shutdown_tx);
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            handle_gameserver(stream, peer, ctx, shutdown_rx).await;
        });
        addr
    }

    async fn send_test_frame(stream: &mut TcpStream, cipher: &L2Blowfish, pkt: &ByteBuffer) {
        let mut buf = vec![0u8; 4096];
        buf[HEADER_SIZE..HEADER_SIZE + pkt.size()].copy_from_slice(pkt.contents());
        frame::write_frame(stream, cipher, &mut buf, pkt.size()).await.unwrap();
    }

    fn auth_request(account: &str, sk: &SessionKey) -> ByteBuffer {
        let mut pkt = ByteBuffer::new();
        pkt.write_u8(GsOpcode::PlayerAuthRequest as u8);
        pkt.write_utf16(account);
        pkt.write_i32(sk.play_ok1);
        pkt.write_i32(sk.play_ok2);
        pkt.write_i32(sk.login_ok1);
        pkt.write_i32(sk.login_ok2);
        pkt
    }

    /// Drive the handshake from the game server side: unwrap InitLS, wrap
    /// a fresh channel key, send GameServerAuth. The reply is left for
    /// the caller to read.
    async fn register(stream: &mut TcpStream, hex_id: &[u8]) -> L2Blowfish {
        let default = L2Blowfish::default_gs();
        let mut buf = vec![0u8; 4096];

        let n = frame::read_frame(stream, &default, &mut buf).await.unwrap();
        assert_eq!(buf[0], 0x00, "InitLS opcode");
        let key_size = u32::from_le_bytes(buf[5..9].try_into().unwrap()) as usize;
        assert_eq!(key_size, GS_MODULUS_SIZE);
        assert!(n >= 9 + key_size);
        let modulus = buf[9..9 + key_size].to_vec();

        let bf_key = [0x42u8; CONTROL_KEY_LEN];
        let mut block = vec![0u8; GS_MODULUS_SIZE];
        block[GS_MODULUS_SIZE - CONTROL_KEY_LEN..].copy_from_slice(&bf_key);
        let wrapped = rsa_encrypt_raw(&modulus, &block);

        let mut pkt = ByteBuffer::new();
        pkt.write_u8(GsOpcode::BlowFishKey as u8);
        pkt.write_u32(wrapped.len() as u32);
        pkt.append(&wrapped);
        send_test_frame(stream, &default, &pkt).await;

        let cipher = L2Blowfish::new(&bf_key).unwrap();

        let mut pkt = ByteBuffer::new();
        pkt.write_u8(GsOpcode::GameServerAuth as u8);
        pkt.write_u8(1);
        pkt.write_u8(0);
        pkt.write_u16(7777);
        pkt.write_i32(5000);
        pkt.write_u32(hex_id.len() as u32);
        pkt.append(hex_id);
        pkt.write_utf16("203.0.113.5");
        pkt.write_utf16("10.0.0.5");
        send_test_frame(stream, &cipher, &pkt).await;

        cipher
    }

    #[tokio::test]
    async fn test_registration_and_session_handoff() {
        let ctx = test_context();
        let sk = SessionKey {
            login_ok1: 10,
            login_ok2: 20,
            play_ok1: 30,
            play_ok2: 40,
        };
        ctx.sessions.store("testuser", sk);

        let addr = spawn_listener(ctx.clone()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let cipher = register(&mut stream, &TEST_HEX).await;

        let mut buf = vec![0u8; 4096];
        frame::read_frame(&mut stream, &cipher, &mut buf).await.unwrap();
        assert_eq!(buf[0], 0x02, "AuthResponse");
        assert_eq!(buf[1], 1, "bound to slot 1");
        assert!(ctx.servers.get_by_id(1).unwrap().authed);

        // session handoff: validate-and-consume
        send_test_frame(&mut stream, &cipher, &auth_request("testuser", &sk)).await;
        frame::read_frame(&mut stream, &cipher, &mut buf).await.unwrap();
        assert_eq!(buf[0], 0x03, "PlayerAuthResponse");
        // payload: opcode, UTF-16 "testuser" (18 bytes), verdict
        assert_eq!(buf[19], 0x01, "first validation succeeds");
        assert_eq!(ctx.sessions.count(), 0);

        // replaying the consumed key is refused
        send_test_frame(&mut stream, &cipher, &auth_request("testuser", &sk)).await;
        frame::read_frame(&mut stream, &cipher, &mut buf).await.unwrap();
        assert_eq!(buf[19], 0x00, "consumed key is refused");
    }

    #[tokio::test]
    async fn test_wrong_hexid_rejected() {
        let ctx = test_context();
        let addr = spawn_listener(ctx.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let wrong_hex = [0xFFu8; l2_shared::HEX_ID_SIZE];
        let cipher = register(&mut stream, &wrong_hex).await;

        let mut buf = vec![0u8; 4096];
        frame::read_frame(&mut stream, &cipher, &mut buf).await.unwrap();
        assert_eq!(buf[0], 0x01, "LoginServerFail");
        assert_eq!(buf[1], 0x03, "wrong hexID reason");
        assert!(!ctx.servers.get_by_id(1).unwrap().authed);
    }
}
