// Packets - wire structures for the game server
//
// The gate side parses what the Interlude client sends after the
// plaintext Key frame; the control side mirrors the login server's
// channel layouts exactly.

use l2_shared::session::SessionKey;
use l2_shared::util::ByteBuffer;

use crate::game_codes::*;

// ---- game server -> client (gate) ----

/// Build the Key frame payload: opcode, protocol marker, the
/// per-connection Blowfish key. Sent unencrypted.
pub fn build_key_packet(bf_key: &[u8; 16]) -> ByteBuffer {
    let mut pkt = ByteBuffer::with_capacity(18);
    pkt.write_u8(GateServerOpcode::Key as u8);
    pkt.write_u8(0x01);
    pkt.append(bf_key);
    pkt
}

// ---- client -> game server (gate) ----

/// ProtocolVersion: the client's revision, checked against 0x0106.
#[derive(Debug)]
pub struct ProtocolVersion {
    pub revision: u32,
}

impl ProtocolVersion {
    pub fn from_payload(data: &[u8]) -> Option<Self> {
        let mut buf = ByteBuffer::from_bytes(data);
        Some(ProtocolVersion {
            revision: buf.read_u32().ok()?,
        })
    }
}

/// AuthLogin: account name plus the four-int session key issued by the
/// login server.
#[derive(Debug)]
pub struct AuthLogin {
    pub account: String,
    pub key: SessionKey,
}

impl AuthLogin {
    pub fn from_payload(data: &[u8]) -> Option<Self> {
        let mut buf = ByteBuffer::from_bytes(data);
        let account = buf.read_utf16().ok()?;
        let play_ok1 = buf.read_i32().ok()?;
        let play_ok2 = buf.read_i32().ok()?;
        let login_ok1 = buf.read_i32().ok()?;
        let login_ok2 = buf.read_i32().ok()?;
        if account.is_empty() {
            return None;
        }
        Some(AuthLogin {
            account: account.to_lowercase(),
            key: SessionKey {
                login_ok1,
                login_ok2,
                play_ok1,
                play_ok2,
            },
        })
    }
}

// ---- login server -> game server (control channel) ----

/// InitLS: control revision plus the 512-bit RSA modulus to wrap the
/// channel key with.
#[derive(Debug)]
pub struct InitLs {
    pub revision: u32,
    pub modulus: Vec<u8>,
}

impl InitLs {
    pub fn from_payload(data: &[u8]) -> Option<Self> {
        let mut buf = ByteBuffer::from_bytes(data);
        let revision = buf.read_u32().ok()?;
        let key_size = buf.read_u32().ok()? as usize;
        if key_size == 0 || key_size > 128 {
            return None;
        }
        Some(InitLs {
            revision,
            modulus: buf.read_bytes(key_size).ok()?,
        })
    }
}

/// AuthResponse: the slot the login server bound us to.
#[derive(Debug)]
pub struct AuthResponse {
    pub id: u8,
    pub name: String,
}

impl AuthResponse {
    pub fn from_payload(data: &[u8]) -> Option<Self> {
        let mut buf = ByteBuffer::from_bytes(data);
        Some(AuthResponse {
            id: buf.read_u8().ok()?,
            name: buf.read_utf16().ok()?,
        })
    }
}

/// LoginServerFail: registration rejection reason byte.
#[derive(Debug)]
pub struct LoginServerFail {
    pub reason: u8,
}

impl LoginServerFail {
    pub fn from_payload(data: &[u8]) -> Option<Self> {
        let mut buf = ByteBuffer::from_bytes(data);
        Some(LoginServerFail {
            reason: buf.read_u8().ok()?,
        })
    }
}

/// PlayerAuthResponse: verdict for a relayed session validation.
#[derive(Debug)]
pub struct PlayerAuthResponse {
    pub account: String,
    pub ok: bool,
}

impl PlayerAuthResponse {
    pub fn from_payload(data: &[u8]) -> Option<Self> {
        let mut buf = ByteBuffer::from_bytes(data);
        Some(PlayerAuthResponse {
            account: buf.read_utf16().ok()?,
            ok: buf.read_u8().ok()? != 0,
        })
    }
}

// ---- game server -> login server (control channel) ----

/// Build BlowFishKey: the RSA-wrapped 40-byte channel key.
pub fn build_blowfish_key(wrapped: &[u8]) -> ByteBuffer {
    let mut pkt = ByteBuffer::new();
    pkt.write_u8(ControlOpcode::BlowFishKey as u8);
    pkt.write_u32(wrapped.len() as u32);
    pkt.append(wrapped);
    pkt
}

/// Registration parameters sent in GameServerAuth.
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    pub desired_id: u8,
    pub accept_alternate: bool,
    pub port: u16,
    pub max_players: i32,
    pub hex_id: Vec<u8>,
    pub external_host: String,
    pub internal_host: String,
}

pub fn build_game_server_auth(req: &RegistrationRequest) -> ByteBuffer {
    let mut pkt = ByteBuffer::new();
    pkt.write_u8(ControlOpcode::GameServerAuth as u8);
    pkt.write_u8(req.desired_id);
    pkt.write_u8(req.accept_alternate as u8);
    pkt.write_u16(req.port);
    pkt.write_i32(req.max_players);
    pkt.write_u32(req.hex_id.len() as u32);
    pkt.append(&req.hex_id);
    pkt.write_utf16(&req.external_host);
    pkt.write_utf16(&req.internal_host);
    pkt
}

pub fn build_player_auth_request(account: &str, key: &SessionKey) -> ByteBuffer {
    let mut pkt = ByteBuffer::new();
    pkt.write_u8(ControlOpcode::PlayerAuthRequest as u8);
    pkt.write_utf16(account);
    pkt.write_i32(key.play_ok1);
    pkt.write_i32(key.play_ok2);
    pkt.write_i32(key.login_ok1);
    pkt.write_i32(key.login_ok2);
    pkt
}

pub fn build_player_in_game(accounts: &[String]) -> ByteBuffer {
    let mut pkt = ByteBuffer::new();
    pkt.write_u8(ControlOpcode::PlayerInGame as u8);
    pkt.write_u16(accounts.len() as u16);
    for account in accounts {
        pkt.write_utf16(account);
    }
    pkt
}

pub fn build_player_logout(account: &str) -> ByteBuffer {
    let mut pkt = ByteBuffer::new();
    pkt.write_u8(ControlOpcode::PlayerLogout as u8);
    pkt.write_utf16(account);
    pkt
}

/// ServerStatus attribute keys, matching the login server's table.
pub const STATUS_ATTR_STATUS: i32 = 0x01;
pub const STATUS_ATTR_BRACKETS: i32 = 0x02;
pub const STATUS_ATTR_MAX_PLAYERS: i32 = 0x03;
pub const STATUS_ATTR_AGE_LIMIT: i32 = 0x04;
pub const STATUS_ATTR_PVP: i32 = 0x05;

/// Listing status values carried by [`STATUS_ATTR_STATUS`].
pub const STATUS_GOOD: i32 = 1;

pub fn build_server_status(attributes: &[(i32, i32)]) -> ByteBuffer {
    let mut pkt = ByteBuffer::new();
    pkt.write_u8(ControlOpcode::ServerStatus as u8);
    pkt.write_u32(attributes.len() as u32);
    for &(attr, value) in attributes {
        pkt.write_i32(attr);
        pkt.write_i32(value);
    }
    pkt
}
