// ClientSession - per-connection state machine on the client listener
//
// Handles the full Interlude login flow:
// 1. Init (scrambled RSA modulus + per-session Blowfish key, XOR overlay)
// 2. AuthGameGuard -> GGAuth
// 3. RequestAuthLogin (RSA credential block) -> LoginOk / ServerList
// 4. RequestServerList -> ServerList
// 5. RequestServerLogin -> PlayOk, session key completed and stored

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{Duration, timeout};

use l2_shared::accounts::AccountRepository;
use l2_shared::crypt::frame::{self, FrameError, HEADER_SIZE};
use l2_shared::crypt::keypool::KeyPools;
use l2_shared::crypt::password::{hash_password, verify_password};
use l2_shared::crypt::L2Blowfish;
use l2_shared::network::BufferPool;
use l2_shared::session::SessionKey;
use l2_shared::util::ByteBuffer;

use crate::gameserver_table::GameServerTable;
use crate::login_codes::*;
use crate::packets::*;
use crate::session_manager::SessionManager;

/// Encrypted Init body size: 170 bytes of content, zero padding, the XOR
/// accumulator at offset 184.
const INIT_BLOCK_LEN: usize = 192;

/// Shared login server state handed to every connection task.
pub struct LoginContext {
    pub sessions: SessionManager,
    pub servers: GameServerTable,
    pub keys: KeyPools,
    pub accounts: AccountRepository,
    pub read_pool: BufferPool,
    pub send_pool: BufferPool,
    pub show_licence: bool,
    pub read_timeout: Duration,
}

/// Session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    AwaitGameGuard,
    AuthedGameGuard,
    AuthedLogin,
    Closed,
}

/// Copy a built payload into the send buffer and push it through the
/// frame codec.
pub(crate) async fn send_packet(
    stream: &mut TcpStream,
    cipher: &L2Blowfish,
    send_buf: &mut [u8],
    pkt: &ByteBuffer,
) -> Result<(), FrameError> {
    let n = pkt.size();
    send_buf[HEADER_SIZE..HEADER_SIZE + n].copy_from_slice(pkt.contents());
    frame::write_frame(stream, cipher, send_buf, n).await
}

/// Read the next frame, or `None` on shutdown / clean disconnect.
/// A deadline applies per frame in the gate phases; established control
/// channels pass `None` and only break on shutdown or socket close.
pub(crate) async fn read_next(
    stream: &mut TcpStream,
    cipher: &L2Blowfish,
    read_buf: &mut [u8],
    deadline: Option<Duration>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<Option<usize>> {
    let deadline = deadline.unwrap_or(Duration::from_secs(60 * 60 * 24));
    tokio::select! {
        _ = shutdown.changed() => Ok(None),
        result = timeout(deadline, frame::read_frame(stream, cipher, read_buf)) => {
            match result {
                Err(_) => anyhow::bail!("read deadline expired"),
                Ok(Ok(n)) => Ok(Some(n)),
                Ok(Err(FrameError::ShortRead(e)))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    Ok(None)
                }
                Ok(Err(e)) => Err(e.into()),
            }
        }
    }
}

/// Handle a single client connection
pub async fn handle_client(
    mut stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<LoginContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!("New login connection from {}", addr);

    let mut read_buf = ctx.read_pool.take();
    let mut send_buf = ctx.send_pool.take();

    if let Err(e) = run_session(&mut stream, addr, &ctx, &mut shutdown, &mut read_buf, &mut send_buf).await
    {
        tracing::debug!("Login session from {} closed: {:#}", addr, e);
    }

    ctx.read_pool.put(read_buf);
    ctx.send_pool.put(send_buf);
}

async fn run_session(
    stream: &mut TcpStream,
    addr: SocketAddr,
    ctx: &LoginContext,
    shutdown: &mut watch::Receiver<bool>,
    read_buf: &mut [u8],
    send_buf: &mut [u8],
) -> anyhow::Result<()> {
    let keypair = ctx.keys.random_client();
    let session_id: u32 = rand::random();
    let bf_key: [u8; 16] = rand::random();
    let xor_seed: u32 = rand::random();

    // Init goes out under the static key with the XOR overlay; everything
    // after uses the per-session key we just advertised.
    let init = build_init(session_id, keypair.scrambled_modulus(), &bf_key);
    send_buf[HEADER_SIZE..HEADER_SIZE + init.size()].copy_from_slice(init.contents());
    frame::write_xor_frame(
        stream,
        &L2Blowfish::static_client(),
        send_buf,
        init.size(),
        INIT_BLOCK_LEN,
        xor_seed,
    )
    .await?;

    let cipher = L2Blowfish::new(&bf_key)?;
    let mut state = SessionState::AwaitGameGuard;
    let mut account = String::new();
    let mut last_server: u8 = 1;

    loop {
        let Some(n) = read_next(stream, &cipher, read_buf, Some(ctx.read_timeout), shutdown).await? else {
            return Ok(());
        };
        let payload = &read_buf[..n];
        if payload.is_empty() {
            anyhow::bail!("empty payload");
        }
        let opcode = ClientOpcode::from_u8(payload[0]);
        let body = &payload[1..];

        match (state, opcode) {
            (SessionState::AwaitGameGuard, Some(ClientOpcode::AuthGameGuard)) => {
                let Some(gg) = AuthGameGuard::from_payload(body) else {
                    anyhow::bail!("malformed AuthGameGuard");
                };
                if gg.session_id != session_id {
                    anyhow::bail!("AuthGameGuard sessionID mismatch");
                }
                send_packet(stream, &cipher, send_buf, &build_gg_auth(session_id)).await?;
                state = SessionState::AuthedGameGuard;
            }

            (SessionState::AuthedGameGuard, Some(ClientOpcode::RequestAuthLogin)) => {
                handle_auth_login(
                    stream, addr, ctx, keypair, &cipher, send_buf, body,
                    &mut state, &mut account, &mut last_server,
                )
                .await?;
            }

            (SessionState::AuthedLogin, Some(ClientOpcode::RequestServerList)) => {
                let Some(req) = RequestServerList::from_payload(body) else {
                    anyhow::bail!("malformed RequestServerList");
                };
                let presented = SessionKey {
                    login_ok1: req.login_ok1,
                    login_ok2: req.login_ok2,
                    ..Default::default()
                };
                if !ctx.sessions.validate(&account, &presented, false) {
                    send_packet(
                        stream,
                        &cipher,
                        send_buf,
                        &build_login_fail(LoginFailReason::AccessFailed),
                    )
                    .await?;
                    state = SessionState::Closed;
                } else {
                    let servers = ctx.servers.snapshot();
                    send_packet(
                        stream,
                        &cipher,
                        send_buf,
                        &build_server_list(&servers, last_server, addr.ip()),
                    )
                    .await?;
                }
            }

            (SessionState::AuthedLogin, Some(ClientOpcode::RequestServerLogin)) => {
                handle_server_login(stream, ctx, &cipher, send_buf, body, &mut state, &account)
                    .await?;
            }

            _ => {
                tracing::debug!(
                    "Unauthorized opcode {:02x} in state {:?} from {}",
                    payload[0],
                    state,
                    addr
                );
                return Ok(());
            }
        }

        if state == SessionState::Closed {
            return Ok(());
        }
    }
}

/// Handle RequestAuthLogin: unwrap the credential block, check the
/// account, issue the LoginOk half of the session key.
#[allow(clippy::too_many_arguments)]
async fn handle_auth_login(
    stream: &mut TcpStream,
    addr: SocketAddr,
    ctx: &LoginContext,
    keypair: &l2_shared::crypt::ScrambledKeyPair,
    cipher: &L2Blowfish,
    send_buf: &mut [u8],
    body: &[u8],
    state: &mut SessionState,
    account: &mut String,
    last_server: &mut u8,
) -> anyhow::Result<()> {
    *state = SessionState::Closed;

    let Some(req) = RequestAuthLogin::from_payload(body) else {
        anyhow::bail!("malformed RequestAuthLogin");
    };

    let plain = keypair.decrypt_block(&req.block);
    let Some((login, password)) = parse_credentials(&plain) else {
        send_packet(
            stream,
            cipher,
            send_buf,
            &build_login_fail(LoginFailReason::UserOrPassWrong),
        )
        .await?;
        return Ok(());
    };

    let ip = addr.ip().to_string();
    let hashed = hash_password(&password);

    let row = match ctx.accounts.get_or_create(&login, &hashed, &ip).await {
        Ok(row) => row,
        Err(e) => {
            tracing::error!("Account lookup for '{}' failed: {:#}", login, e);
            send_packet(
                stream,
                cipher,
                send_buf,
                &build_login_fail(LoginFailReason::ServerMaintenance),
            )
            .await?;
            return Ok(());
        }
    };

    let Some(row) = row else {
        tracing::info!("Unknown account '{}' from {}", login, addr);
        send_packet(
            stream,
            cipher,
            send_buf,
            &build_login_fail(LoginFailReason::UserOrPassWrong),
        )
        .await?;
        return Ok(());
    };

    if row.is_banned() {
        tracing::info!("Banned account '{}' tried to login from {}", login, addr);
        send_packet(
            stream,
            cipher,
            send_buf,
            &build_account_kicked(AccountKickedReason::PermanentlyBanned),
        )
        .await?;
        return Ok(());
    }

    if !verify_password(&password, &row.password_hash) {
        tracing::info!("Account '{}' tried to login with wrong password", login);
        send_packet(
            stream,
            cipher,
            send_buf,
            &build_login_fail(LoginFailReason::UserOrPassWrong),
        )
        .await?;
        return Ok(());
    }

    let _ = ctx.accounts.update_last_login(&login, &ip).await;

    let sk = SessionKey::new_login_pair();
    if ctx.sessions.store(&login, sk) {
        tracing::debug!("Account '{}' superseded an earlier session", login);
    }

    tracing::info!("User '{}' successfully authenticated", login);
    *last_server = row.last_server;
    *account = row.login;

    if ctx.show_licence {
        send_packet(stream, cipher, send_buf, &build_login_ok(&sk)).await?;
    } else {
        let servers = ctx.servers.snapshot();
        send_packet(
            stream,
            cipher,
            send_buf,
            &build_server_list(&servers, *last_server, addr.ip()),
        )
        .await?;
    }
    *state = SessionState::AuthedLogin;
    Ok(())
}

/// Handle RequestServerLogin: complete the session key with the PlayOk
/// pair and authorize the selected server.
async fn handle_server_login(
    stream: &mut TcpStream,
    ctx: &LoginContext,
    cipher: &L2Blowfish,
    send_buf: &mut [u8],
    body: &[u8],
    state: &mut SessionState,
    account: &str,
) -> anyhow::Result<()> {
    let Some(req) = RequestServerLogin::from_payload(body) else {
        anyhow::bail!("malformed RequestServerLogin");
    };

    let presented = SessionKey {
        login_ok1: req.login_ok1,
        login_ok2: req.login_ok2,
        ..Default::default()
    };
    if !ctx.sessions.validate(account, &presented, false) {
        send_packet(
            stream,
            cipher,
            send_buf,
            &build_login_fail(LoginFailReason::AccessFailed),
        )
        .await?;
        *state = SessionState::Closed;
        return Ok(());
    }

    let server_up = ctx
        .servers
        .get_by_id(req.server_id)
        .map(|info| info.is_up())
        .unwrap_or(false);
    if !server_up {
        send_packet(
            stream,
            cipher,
            send_buf,
            &build_play_fail(PlayFailReason::ServerOverloaded),
        )
        .await?;
        *state = SessionState::Closed;
        return Ok(());
    }

    let Some(stored) = ctx.sessions.get(account) else {
        send_packet(
            stream,
            cipher,
            send_buf,
            &build_login_fail(LoginFailReason::AccessFailed),
        )
        .await?;
        *state = SessionState::Closed;
        return Ok(());
    };

    let full = stored.with_play_pair();
    ctx.sessions.store(account, full);
    let _ = ctx.accounts.update_last_server(account, req.server_id).await;

    tracing::debug!("Account '{}' authorized for server {}", account, req.server_id);
    send_packet(stream, cipher, send_buf, &build_play_ok(&full)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    use l2_shared::config::GameServerDef;
    use l2_shared::crypt::keypool::{KeyPools, rsa_encrypt_raw};
    use l2_shared::crypt::scramble::{MODULUS_SIZE, unscramble_modulus};
    use l2_shared::crypt::xor::dec_xor_pass;
    use l2_shared::database::Database;

    use crate::gameserver_table::{GameServerTable, Registration};
    use crate::session_manager::SessionManager;

    const TEST_HEX: [u8; l2_shared::HEX_ID_SIZE] = [0xA5; l2_shared::HEX_ID_SIZE];

    /// Build a context backed by a throwaway SQLite file with a known
    /// account, and one live game server slot.
    async fn test_context(show_licence: bool) -> Arc<LoginContext> {
        let path = std::env::temp_dir().join(format!(
            "l2-logintest-{}-{:08x}.db",
            std::process::id(),
            rand::random::<u32>()
        ));
        let mut db = Database::new("Login");
        db.initialize(&format!("sqlite://{}?mode=rwc", path.display()))
            .await
            .unwrap();
        db.execute(
            "CREATE TABLE accounts (login TEXT PRIMARY KEY, password TEXT, \
             accessLevel INTEGER, lastServer INTEGER, lastIP TEXT, lastactive INTEGER)",
        )
        .await
        .unwrap();
        db.execute(&format!(
            "INSERT INTO accounts VALUES ('testuser', '{}', 0, 1, '', 0)",
            hash_password("testpass")
        ))
        .await
        .unwrap();
        db.execute(&format!(
            "INSERT INTO accounts VALUES ('banneduser', '{}', -1, 1, '', 0)",
            hash_password("testpass")
        ))
        .await
        .unwrap();
        let db = Arc::new(db);

        let servers = GameServerTable::new();
        servers.load_provisioned(&[GameServerDef {
            id: 1,
            name: "Bartz".to_string(),
            host: "127.0.0.1".to_string(),
            port: 7777,
            hex_id: TEST_HEX.to_vec(),
        }]);
        // slot 1 is live, as if a game server had registered
        servers
            .try_acquire(
                1,
                &TEST_HEX,
                false,
                &Registration {
                    external_host: "127.0.0.1".to_string(),
                    internal_host: "127.0.0.1".to_string(),
                    port: 7777,
                    max_players: 5000,
                },
            )
            .unwrap();

        Arc::new(LoginContext {
            sessions: SessionManager::new(),
            servers,
            keys: KeyPools::generate_sized(1, 0).unwrap(),
            accounts: AccountRepository::new(db, false),
            read_pool: BufferPool::for_reads(),
            send_pool: BufferPool::for_sends(),
            show_licence,
            read_timeout: Duration::from_secs(5),
        })
    }

    async fn spawn_listener(ctx: Arc<LoginContext>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        std::mem::forget(shutdown_tx);
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            handle_client(stream, peer, ctx, shutdown_rx).await;
        });
        addr
    }

    /// What the client does with the Init frame: Blowfish-decrypt under
    /// the static key, unwind the XOR pass, pull out the fields.
    async fn read_init(stream: &mut TcpStream) -> (u32, [u8; MODULUS_SIZE], [u8; 16]) {
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await.unwrap();
        let total = u16::from_le_bytes(header) as usize;
        assert_eq!(total, 194, "Init frame is 2 + 192 bytes");

        let mut body = vec![0u8; total - 2];
        stream.read_exact(&mut body).await.unwrap();
        L2Blowfish::static_client().decrypt_in_place(&mut body);
        let body_len = body.len();
        dec_xor_pass(&mut body, body_len);

        assert_eq!(body[0], 0x00, "Init opcode");
        let session_id = u32::from_le_bytes(body[1..5].try_into().unwrap());
        assert_eq!(
            u32::from_le_bytes(body[5..9].try_into().unwrap()),
            0x0000_C621,
            "protocol revision"
        );
        let scrambled: [u8; MODULUS_SIZE] = body[9..137].try_into().unwrap();
        let bf_key: [u8; 16] = body[153..169].try_into().unwrap();
        (session_id, scrambled, bf_key)
    }

    async fn send_test_frame(stream: &mut TcpStream, cipher: &L2Blowfish, pkt: &ByteBuffer) {
        let mut buf = vec![0u8; 4096];
        buf[HEADER_SIZE..HEADER_SIZE + pkt.size()].copy_from_slice(pkt.contents());
        frame::write_frame(stream, cipher, &mut buf, pkt.size()).await.unwrap();
    }

    fn credential_block(login: &str, password: &str) -> [u8; MODULUS_SIZE] {
        let mut block = [0u8; MODULUS_SIZE];
        block[0x5E..0x5E + login.len()].copy_from_slice(login.as_bytes());
        block[0x6C..0x6C + password.len()].copy_from_slice(password.as_bytes());
        block
    }

    /// Drive the client side up to the credential reply: Init decode,
    /// GameGuard echo, RSA-wrapped AuthLogin.
    async fn login(
        stream: &mut TcpStream,
        login: &str,
        password: &str,
        buf: &mut [u8],
    ) -> (L2Blowfish, usize) {
        let (session_id, scrambled, bf_key) = read_init(stream).await;
        let cipher = L2Blowfish::new(&bf_key).unwrap();

        let mut pkt = ByteBuffer::new();
        pkt.write_u8(0x07);
        pkt.write_u32(session_id);
        send_test_frame(stream, &cipher, &pkt).await;

        let n = frame::read_frame(stream, &cipher, buf).await.unwrap();
        assert_eq!(buf[0], 0x0B, "GGAuth");
        assert_eq!(&buf[1..5], &session_id.to_le_bytes());
        assert!(n >= 5);

        let modulus = unscramble_modulus(&scrambled);
        let cryptogram = rsa_encrypt_raw(&modulus, &credential_block(login, password));
        let mut pkt = ByteBuffer::new();
        pkt.write_u8(0x00);
        pkt.append(&cryptogram);
        send_test_frame(stream, &cipher, &pkt).await;

        let n = frame::read_frame(stream, &cipher, buf).await.unwrap();
        (cipher, n)
    }

    #[tokio::test]
    async fn test_full_login_flow() {
        let ctx = test_context(true).await;
        let addr = spawn_listener(ctx.clone()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = vec![0u8; 4096];

        let (cipher, _) = login(&mut stream, "testuser", "testpass", &mut buf).await;
        assert_eq!(buf[0], 0x03, "LoginOk");
        let l1 = i32::from_le_bytes(buf[1..5].try_into().unwrap());
        let l2 = i32::from_le_bytes(buf[5..9].try_into().unwrap());

        // server list against the LoginOk pair
        let mut pkt = ByteBuffer::new();
        pkt.write_u8(0x05);
        pkt.write_i32(l1);
        pkt.write_i32(l2);
        send_test_frame(&mut stream, &cipher, &pkt).await;

        frame::read_frame(&mut stream, &cipher, &mut buf).await.unwrap();
        assert_eq!(buf[0], 0x04, "ServerList");
        assert_eq!(buf[1], 1, "one listed server");
        // loose validation left the session in place
        assert_eq!(ctx.sessions.count(), 1);

        // select server 1
        let mut pkt = ByteBuffer::new();
        pkt.write_u8(0x02);
        pkt.write_i32(l1);
        pkt.write_i32(l2);
        pkt.write_u8(1);
        send_test_frame(&mut stream, &cipher, &pkt).await;

        frame::read_frame(&mut stream, &cipher, &mut buf).await.unwrap();
        assert_eq!(buf[0], 0x07, "PlayOk");
        let p1 = i32::from_le_bytes(buf[1..5].try_into().unwrap());
        let p2 = i32::from_le_bytes(buf[5..9].try_into().unwrap());

        // the stored session now carries the full four-tuple
        let stored = ctx.sessions.get("testuser").unwrap();
        assert_eq!(stored.login_ok1, l1);
        assert_eq!(stored.login_ok2, l2);
        assert_eq!(stored.play_ok1, p1);
        assert_eq!(stored.play_ok2, p2);
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let ctx = test_context(true).await;
        let addr = spawn_listener(ctx.clone()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = vec![0u8; 4096];

        let (_, _) = login(&mut stream, "testuser", "wrongpass", &mut buf).await;
        assert_eq!(buf[0], 0x01, "LoginFail");
        assert_eq!(buf[1], 0x02, "user or password wrong");
        assert_eq!(ctx.sessions.count(), 0, "no session was created");
    }

    #[tokio::test]
    async fn test_banned_account_kicked() {
        let ctx = test_context(true).await;
        let addr = spawn_listener(ctx.clone()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = vec![0u8; 4096];

        let (_, _) = login(&mut stream, "banneduser", "testpass", &mut buf).await;
        assert_eq!(buf[0], 0x02, "AccountKicked");
        assert_eq!(buf[1], 0x20, "permanently banned reason");
        assert_eq!(ctx.sessions.count(), 0);
    }

    #[tokio::test]
    async fn test_show_licence_off_sends_server_list() {
        let ctx = test_context(false).await;
        let addr = spawn_listener(ctx.clone()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = vec![0u8; 4096];

        let (_, _) = login(&mut stream, "testuser", "testpass", &mut buf).await;
        assert_eq!(buf[0], 0x04, "ServerList in place of LoginOk");
        assert_eq!(ctx.sessions.count(), 1);
    }
}
