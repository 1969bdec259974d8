// Packets - wire structures for the login server's two listeners
//
// Parsers take the decrypted payload with the opcode byte stripped;
// builders produce the plaintext payload (opcode included) for the frame
// codec to pad, checksum and encrypt.

use l2_shared::crypt::scramble::MODULUS_SIZE;
use l2_shared::session::SessionKey;
use l2_shared::util::ByteBuffer;
use l2_shared::{GG_HANDSHAKE, HEX_ID_SIZE, INIT_PROTOCOL_REVISION, PROTOCOL_REVISION};

use crate::gameserver_table::{GameServerInfo, ServerStatusAttr};
use crate::login_codes::*;

/// Maximum login length inside the credential block.
pub const CREDENTIAL_LOGIN_MAX: usize = 14;

/// Maximum password length inside the credential block.
pub const CREDENTIAL_PASSWORD_MAX: usize = 16;

const CREDENTIAL_LOGIN_OFFSET: usize = 0x5E;
const CREDENTIAL_PASSWORD_OFFSET: usize = 0x6C;

// ---- client -> login server ----

/// AuthGameGuard: the client echoes the Init sessionID.
#[derive(Debug)]
pub struct AuthGameGuard {
    pub session_id: u32,
}

impl AuthGameGuard {
    pub fn from_payload(data: &[u8]) -> Option<Self> {
        let mut buf = ByteBuffer::from_bytes(data);
        Some(AuthGameGuard {
            session_id: buf.read_u32().ok()?,
        })
    }
}

/// RequestAuthLogin: one 128-byte unpadded RSA cryptogram.
#[derive(Debug)]
pub struct RequestAuthLogin {
    pub block: [u8; MODULUS_SIZE],
}

impl RequestAuthLogin {
    pub fn from_payload(data: &[u8]) -> Option<Self> {
        if data.len() < MODULUS_SIZE {
            return None;
        }
        let mut block = [0u8; MODULUS_SIZE];
        block.copy_from_slice(&data[..MODULUS_SIZE]);
        Some(RequestAuthLogin { block })
    }
}

/// RequestServerList: the LoginOk half of the session key.
#[derive(Debug)]
pub struct RequestServerList {
    pub login_ok1: i32,
    pub login_ok2: i32,
}

impl RequestServerList {
    pub fn from_payload(data: &[u8]) -> Option<Self> {
        let mut buf = ByteBuffer::from_bytes(data);
        Some(RequestServerList {
            login_ok1: buf.read_i32().ok()?,
            login_ok2: buf.read_i32().ok()?,
        })
    }
}

/// RequestServerLogin: LoginOk half plus the selected server id.
#[derive(Debug)]
pub struct RequestServerLogin {
    pub login_ok1: i32,
    pub login_ok2: i32,
    pub server_id: u8,
}

impl RequestServerLogin {
    pub fn from_payload(data: &[u8]) -> Option<Self> {
        let mut buf = ByteBuffer::from_bytes(data);
        Some(RequestServerLogin {
            login_ok1: buf.read_i32().ok()?,
            login_ok2: buf.read_i32().ok()?,
            server_id: buf.read_u8().ok()?,
        })
    }
}

/// Extract the login and password from a decrypted credential block.
/// The login is lowercased on read; everything outside the two known
/// field windows is ignored.
pub fn parse_credentials(plain: &[u8]) -> Option<(String, String)> {
    if plain.len() < MODULUS_SIZE {
        return None;
    }
    let login = read_field(plain, CREDENTIAL_LOGIN_OFFSET, CREDENTIAL_LOGIN_MAX)?;
    let password = read_field(plain, CREDENTIAL_PASSWORD_OFFSET, CREDENTIAL_PASSWORD_MAX)?;
    if login.is_empty() {
        return None;
    }
    Some((login.to_lowercase(), password))
}

fn read_field(plain: &[u8], offset: usize, max_len: usize) -> Option<String> {
    let window = &plain[offset..offset + max_len];
    let end = window.iter().position(|&b| b == 0).unwrap_or(max_len);
    std::str::from_utf8(&window[..end]).ok().map(str::to_string)
}

// ---- login server -> client ----

/// Build the Init payload: sessionID, revision, scrambled modulus,
/// GameGuard constants, per-session Blowfish key, null terminator.
pub fn build_init(session_id: u32, scrambled_modulus: &[u8; MODULUS_SIZE], bf_key: &[u8; 16]) -> ByteBuffer {
    let mut pkt = ByteBuffer::with_capacity(170);
    pkt.write_u8(ServerOpcode::Init as u8);
    pkt.write_u32(session_id);
    pkt.write_u32(INIT_PROTOCOL_REVISION);
    pkt.append(scrambled_modulus);
    for gg in GG_HANDSHAKE {
        pkt.write_u32(gg);
    }
    pkt.append(bf_key);
    pkt.write_u8(0x00);
    pkt
}

pub fn build_gg_auth(session_id: u32) -> ByteBuffer {
    let mut pkt = ByteBuffer::new();
    pkt.write_u8(ServerOpcode::GgAuth as u8);
    pkt.write_u32(session_id);
    for _ in 0..4 {
        pkt.write_u32(0);
    }
    pkt
}

pub fn build_login_ok(sk: &SessionKey) -> ByteBuffer {
    let mut pkt = ByteBuffer::new();
    pkt.write_u8(ServerOpcode::LoginOk as u8);
    pkt.write_i32(sk.login_ok1);
    pkt.write_i32(sk.login_ok2);
    pkt.write_u32(0x00);
    pkt.write_u32(0x00);
    pkt.write_u32(0x0000_03EA);
    pkt.write_u32(0x00);
    pkt.write_u32(0x00);
    pkt.write_u32(0x00);
    pkt.append(&[0u8; 16]);
    pkt
}

pub fn build_server_list(
    servers: &[GameServerInfo],
    last_server: u8,
    peer: std::net::IpAddr,
) -> ByteBuffer {
    let mut pkt = ByteBuffer::new();
    pkt.write_u8(ServerOpcode::ServerList as u8);
    pkt.write_u8(servers.len() as u8);
    pkt.write_u8(last_server);
    for info in servers {
        pkt.write_u8(info.id);
        for octet in info.ip_octets(peer) {
            pkt.write_u8(octet);
        }
        pkt.write_u32(info.port as u32);
        pkt.write_u8(info.age_limit);
        pkt.write_u8(info.pvp_enabled as u8);
        pkt.write_u16(info.current_players as u16);
        pkt.write_u16(info.max_players as u16);
        pkt.write_u8(info.is_up() as u8);
        pkt.write_u32(0x01);
        pkt.write_u8(info.brackets as u8);
    }
    pkt
}

pub fn build_play_ok(sk: &SessionKey) -> ByteBuffer {
    let mut pkt = ByteBuffer::new();
    pkt.write_u8(ServerOpcode::PlayOk as u8);
    pkt.write_i32(sk.play_ok1);
    pkt.write_i32(sk.play_ok2);
    pkt
}

pub fn build_login_fail(reason: LoginFailReason) -> ByteBuffer {
    let mut pkt = ByteBuffer::new();
    pkt.write_u8(ServerOpcode::LoginFail as u8);
    pkt.write_u8(reason as u8);
    pkt
}

pub fn build_account_kicked(reason: AccountKickedReason) -> ByteBuffer {
    let mut pkt = ByteBuffer::new();
    pkt.write_u8(ServerOpcode::AccountKicked as u8);
    pkt.write_u8(reason as u8);
    pkt
}

pub fn build_play_fail(reason: PlayFailReason) -> ByteBuffer {
    let mut pkt = ByteBuffer::new();
    pkt.write_u8(ServerOpcode::PlayFail as u8);
    pkt.write_u8(reason as u8);
    pkt
}

// ---- game server -> login server (control channel) ----

/// BlowFishKey: the RSA-wrapped 40-byte control key.
#[derive(Debug)]
pub struct BlowFishKey {
    pub wrapped: Vec<u8>,
}

impl BlowFishKey {
    pub fn from_payload(data: &[u8]) -> Option<Self> {
        let mut buf = ByteBuffer::from_bytes(data);
        let size = buf.read_u32().ok()? as usize;
        if size == 0 || size > 128 {
            return None;
        }
        Some(BlowFishKey {
            wrapped: buf.read_bytes(size).ok()?,
        })
    }
}

/// GameServerAuth: registration request from a game server.
#[derive(Debug)]
pub struct GameServerAuth {
    pub desired_id: u8,
    pub accept_alternate: bool,
    pub port: u16,
    pub max_players: i32,
    pub hex_id: Vec<u8>,
    pub external_host: String,
    pub internal_host: String,
}

impl GameServerAuth {
    pub fn from_payload(data: &[u8]) -> Option<Self> {
        let mut buf = ByteBuffer::from_bytes(data);
        let desired_id = buf.read_u8().ok()?;
        let accept_alternate = buf.read_u8().ok()? != 0;
        let port = buf.read_u16().ok()?;
        let max_players = buf.read_i32().ok()?;
        let hex_id_size = buf.read_u32().ok()? as usize;
        if hex_id_size != HEX_ID_SIZE {
            return None;
        }
        let hex_id = buf.read_bytes(hex_id_size).ok()?;
        let external_host = buf.read_utf16().ok()?;
        let internal_host = buf.read_utf16().ok()?;
        Some(GameServerAuth {
            desired_id,
            accept_alternate,
            port,
            max_players,
            hex_id,
            external_host,
            internal_host,
        })
    }
}

/// PlayerAuthRequest: validate-and-consume a session key for an account.
#[derive(Debug)]
pub struct PlayerAuthRequest {
    pub account: String,
    pub key: SessionKey,
}

impl PlayerAuthRequest {
    pub fn from_payload(data: &[u8]) -> Option<Self> {
        let mut buf = ByteBuffer::from_bytes(data);
        let account = buf.read_utf16().ok()?;
        let play_ok1 = buf.read_i32().ok()?;
        let play_ok2 = buf.read_i32().ok()?;
        let login_ok1 = buf.read_i32().ok()?;
        let login_ok2 = buf.read_i32().ok()?;
        Some(PlayerAuthRequest {
            account,
            key: SessionKey {
                login_ok1,
                login_ok2,
                play_ok1,
                play_ok2,
            },
        })
    }
}

/// PlayerInGame: accounts now hosted by the game server.
#[derive(Debug)]
pub struct PlayerInGame {
    pub accounts: Vec<String>,
}

impl PlayerInGame {
    pub fn from_payload(data: &[u8]) -> Option<Self> {
        let mut buf = ByteBuffer::from_bytes(data);
        let count = buf.read_u16().ok()?;
        let mut accounts = Vec::with_capacity(count as usize);
        for _ in 0..count {
            accounts.push(buf.read_utf16().ok()?);
        }
        Some(PlayerInGame { accounts })
    }
}

/// PlayerLogout: one account left the game server.
#[derive(Debug)]
pub struct PlayerLogout {
    pub account: String,
}

impl PlayerLogout {
    pub fn from_payload(data: &[u8]) -> Option<Self> {
        let mut buf = ByteBuffer::from_bytes(data);
        Some(PlayerLogout {
            account: buf.read_utf16().ok()?,
        })
    }
}

/// ServerStatus: attribute updates for a registered server.
#[derive(Debug)]
pub struct ServerStatus {
    pub attributes: Vec<(ServerStatusAttr, i32)>,
}

impl ServerStatus {
    pub fn from_payload(data: &[u8]) -> Option<Self> {
        let mut buf = ByteBuffer::from_bytes(data);
        let count = buf.read_u32().ok()?;
        if count > 16 {
            return None;
        }
        let mut attributes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let kind = ServerStatusAttr::from_i32(buf.read_i32().ok()?)?;
            let value = buf.read_i32().ok()?;
            attributes.push((kind, value));
        }
        Some(ServerStatus { attributes })
    }
}

// ---- login server -> game server (control channel) ----

/// Build InitLS: revision plus the raw 512-bit modulus.
pub fn build_init_ls(modulus: &[u8]) -> ByteBuffer {
    let mut pkt = ByteBuffer::new();
    pkt.write_u8(LsOpcode::InitLs as u8);
    pkt.write_u32(PROTOCOL_REVISION);
    pkt.write_u32(modulus.len() as u32);
    pkt.append(modulus);
    pkt
}

pub fn build_auth_response(id: u8, name: &str) -> ByteBuffer {
    let mut pkt = ByteBuffer::new();
    pkt.write_u8(LsOpcode::AuthResponse as u8);
    pkt.write_u8(id);
    pkt.write_utf16(name);
    pkt
}

pub fn build_login_server_fail(reason: RegisterFailReason) -> ByteBuffer {
    let mut pkt = ByteBuffer::new();
    pkt.write_u8(LsOpcode::LoginServerFail as u8);
    pkt.write_u8(reason as u8);
    pkt
}

pub fn build_player_auth_response(account: &str, ok: bool) -> ByteBuffer {
    let mut pkt = ByteBuffer::new();
    pkt.write_u8(LsOpcode::PlayerAuthResponse as u8);
    pkt.write_utf16(account);
    pkt.write_u8(ok as u8);
    pkt
}
