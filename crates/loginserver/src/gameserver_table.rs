// GameServerTable - registered game servers and registration gating
//
// Slots are provisioned from the configuration file; a control
// connection claims a slot by presenting the matching hexID. A slot is
// bound to at most one live connection at a time.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

use l2_shared::config::GameServerDef;

use crate::login_codes::RegisterFailReason;

/// Listing status a game server reports for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerStatusKind {
    #[default]
    Auto,
    Good,
    Normal,
    Full,
    Down,
}

impl ServerStatusKind {
    pub fn from_i32(val: i32) -> Option<Self> {
        match val {
            0 => Some(ServerStatusKind::Auto),
            1 => Some(ServerStatusKind::Good),
            2 => Some(ServerStatusKind::Normal),
            3 => Some(ServerStatusKind::Full),
            4 => Some(ServerStatusKind::Down),
            _ => None,
        }
    }
}

/// Attribute keys carried by the ServerStatus control packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ServerStatusAttr {
    Status = 0x01,
    Brackets = 0x02,
    MaxPlayers = 0x03,
    AgeLimit = 0x04,
    PvpEnabled = 0x05,
}

impl ServerStatusAttr {
    pub fn from_i32(val: i32) -> Option<Self> {
        match val {
            0x01 => Some(ServerStatusAttr::Status),
            0x02 => Some(ServerStatusAttr::Brackets),
            0x03 => Some(ServerStatusAttr::MaxPlayers),
            0x04 => Some(ServerStatusAttr::AgeLimit),
            0x05 => Some(ServerStatusAttr::PvpEnabled),
            _ => None,
        }
    }
}

/// A provisioned (and possibly live) game server slot.
#[derive(Debug, Clone)]
pub struct GameServerInfo {
    pub id: u8,
    pub name: String,
    pub hex_id: Vec<u8>,
    pub authed: bool,
    pub host: String,
    pub internal_host: String,
    pub port: u16,
    pub max_players: i32,
    pub current_players: i32,
    pub age_limit: u8,
    pub pvp_enabled: bool,
    pub brackets: bool,
    pub status: ServerStatusKind,
}

impl GameServerInfo {
    fn from_def(def: &GameServerDef) -> Self {
        GameServerInfo {
            id: def.id,
            name: def.name.clone(),
            hex_id: def.hex_id.clone(),
            authed: false,
            host: def.host.clone(),
            internal_host: String::new(),
            port: def.port,
            max_players: 0,
            current_players: 0,
            age_limit: 0,
            pvp_enabled: true,
            brackets: false,
            status: ServerStatusKind::Down,
        }
    }

    /// Listed as selectable only while its control connection is live and
    /// it has not reported itself down.
    pub fn is_up(&self) -> bool {
        self.authed && self.status != ServerStatusKind::Down
    }

    /// The address advertised to a client in ServerList: clients on the
    /// server's own network get the internal host when one was registered.
    pub fn ip_octets(&self, peer: IpAddr) -> [u8; 4] {
        let host = if peer_is_local(peer) && !self.internal_host.is_empty() {
            &self.internal_host
        } else {
            &self.host
        };
        host.parse::<Ipv4Addr>()
            .unwrap_or(Ipv4Addr::LOCALHOST)
            .octets()
    }
}

fn peer_is_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Runtime attributes presented at registration time.
#[derive(Debug, Clone)]
pub struct Registration {
    pub external_host: String,
    pub internal_host: String,
    pub port: u16,
    pub max_players: i32,
}

#[derive(Default)]
pub struct GameServerTable {
    servers: RwLock<BTreeMap<u8, GameServerInfo>>,
}

impl GameServerTable {
    pub fn new() -> Self {
        GameServerTable {
            servers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Install the provisioned slots from configuration.
    pub fn load_provisioned(&self, defs: &[GameServerDef]) {
        let mut servers = self.servers.write();
        for def in defs {
            tracing::info!("Provisioned game server slot id {} ('{}')", def.id, def.name);
            servers.insert(def.id, GameServerInfo::from_def(def));
        }
    }

    pub fn get_by_id(&self, id: u8) -> Option<GameServerInfo> {
        self.servers.read().get(&id).cloned()
    }

    /// Install or replace a slot record.
    pub fn register(&self, info: GameServerInfo) {
        self.servers.write().insert(info.id, info);
    }

    /// Release a slot binding; the provisioned record stays.
    pub fn unregister(&self, id: u8) {
        let mut servers = self.servers.write();
        if let Some(info) = servers.get_mut(&id) {
            info.authed = false;
            info.status = ServerStatusKind::Down;
            info.current_players = 0;
        }
    }

    /// Claim a slot for a connecting game server.
    ///
    /// Rejections: unknown slot or hexID mismatch -> WrongHexId; slot
    /// already bound to a live connection -> AlreadyLoggedIn (unless
    /// `accept_alternate` finds a free slot provisioned with the same
    /// hexID). On success the slot is marked authed and the registration
    /// attributes recorded, all under one write lock.
    pub fn try_acquire(
        &self,
        desired_id: u8,
        hex_id: &[u8],
        accept_alternate: bool,
        reg: &Registration,
    ) -> Result<u8, RegisterFailReason> {
        let mut servers = self.servers.write();

        let (hex_matches, authed) = match servers.get(&desired_id) {
            None => return Err(RegisterFailReason::WrongHexId),
            Some(info) => (info.hex_id == hex_id, info.authed),
        };
        if !hex_matches {
            return Err(RegisterFailReason::WrongHexId);
        }

        let target = if !authed {
            desired_id
        } else if accept_alternate {
            let alternate = servers
                .iter()
                .find(|(_, s)| !s.authed && s.hex_id == hex_id)
                .map(|(id, _)| *id);
            match alternate {
                Some(id) => id,
                None => return Err(RegisterFailReason::AlreadyLoggedIn),
            }
        } else {
            return Err(RegisterFailReason::AlreadyLoggedIn);
        };

        match servers.get_mut(&target) {
            Some(info) => {
                info.authed = true;
                info.status = ServerStatusKind::Auto;
                if !reg.external_host.is_empty() {
                    info.host = reg.external_host.clone();
                }
                info.internal_host = reg.internal_host.clone();
                info.port = reg.port;
                info.max_players = reg.max_players;
                Ok(target)
            }
            None => Err(RegisterFailReason::WrongHexId),
        }
    }

    /// Apply a ServerStatus attribute batch from the owning connection.
    pub fn apply_status(&self, id: u8, attributes: &[(ServerStatusAttr, i32)]) {
        let mut servers = self.servers.write();
        let Some(info) = servers.get_mut(&id) else {
            return;
        };
        for &(attr, value) in attributes {
            match attr {
                ServerStatusAttr::Status => {
                    if let Some(kind) = ServerStatusKind::from_i32(value) {
                        info.status = kind;
                    }
                }
                ServerStatusAttr::Brackets => info.brackets = value != 0,
                ServerStatusAttr::MaxPlayers => info.max_players = value,
                ServerStatusAttr::AgeLimit => info.age_limit = value as u8,
                ServerStatusAttr::PvpEnabled => info.pvp_enabled = value != 0,
            }
        }
    }

    /// Adjust the hosted-player count reported through the control channel.
    pub fn add_players(&self, id: u8, delta: i32) {
        let mut servers = self.servers.write();
        if let Some(info) = servers.get_mut(&id) {
            info.current_players = (info.current_players + delta).max(0);
        }
    }

    /// Ordered snapshot for building the ServerList packet.
    pub fn snapshot(&self) -> Vec<GameServerInfo> {
        self.servers.read().values().cloned().collect()
    }
}
