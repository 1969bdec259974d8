// ClientGate - admission gate on the game server listener
//
// The gate sends the per-connection Blowfish key in a plaintext Key
// frame, checks the client's protocol revision, and validates the
// presented session key through the login server control channel. A
// validated client belongs to the world simulation; the gate only
// tracks connection lifetime for logout bookkeeping.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{Duration, timeout};

use rand::RngCore;

use l2_shared::PROTOCOL_REVISION;
use l2_shared::crypt::L2Blowfish;
use l2_shared::crypt::frame::{self, FrameError, HEADER_SIZE};
use l2_shared::network::BufferPool;

use crate::game_codes::GateOpcode;
use crate::login_client::LoginServerLink;
use crate::packets::*;

/// Shared gate state handed to every connection task.
pub struct GateContext {
    pub link: LoginServerLink,
    pub read_pool: BufferPool,
    pub send_pool: BufferPool,
    pub read_timeout: Duration,
}

/// Read the next frame, or `None` on shutdown / clean disconnect.
async fn read_next(
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

/// Handle a single client connection through the admission gate
pub async fn handle_client(
    mut stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<GateContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!("New game connection from {}", addr);

    let mut read_buf = ctx.read_pool.take();
    let mut send_buf = ctx.send_pool.take();

    if let Err(e) =
        run_gate(&mut stream, addr, &ctx, &mut shutdown, &mut read_buf, &mut send_buf).await
    {
        tracing::debug!("Game session from {} closed: {:#}", addr, e);
    }

    ctx.read_pool.put(read_buf);
    ctx.send_pool.put(send_buf);
}

async fn run_gate(
    stream: &mut TcpStream,
    addr: SocketAddr,
    ctx: &GateContext,
    shutdown: &mut watch::Receiver<bool>,
    read_buf: &mut [u8],
    send_buf: &mut [u8],
) -> anyhow::Result<()> {
    // the Key frame goes out unencrypted; everything after runs under the
    // key it carries
    let mut bf_key = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bf_key);

    let key_pkt = build_key_packet(&bf_key);
    send_buf[HEADER_SIZE..HEADER_SIZE + key_pkt.size()].copy_from_slice(key_pkt.contents());
    frame::write_plain_frame(stream, send_buf, key_pkt.size()).await?;

    let cipher = L2Blowfish::new(&bf_key)?;

    // ProtocolVersion
    let Some(n) = read_next(stream, &cipher, read_buf, Some(ctx.read_timeout), shutdown).await?
    else {
        return Ok(());
    };
    let payload = &read_buf[..n];
    if payload.first().copied().and_then(GateOpcode::from_u8) != Some(GateOpcode::ProtocolVersion) {
        anyhow::bail!("expected ProtocolVersion");
    }
    let Some(proto) = ProtocolVersion::from_payload(&payload[1..]) else {
        anyhow::bail!("malformed ProtocolVersion");
    };
    if proto.revision != PROTOCOL_REVISION {
        tracing::debug!(
            "Client {} sent unsupported revision 0x{:04x}",
            addr,
            proto.revision
        );
        return Ok(());
    }

    // AuthLogin
    let Some(n) = read_next(stream, &cipher, read_buf, Some(ctx.read_timeout), shutdown).await?
    else {
        return Ok(());
    };
    let payload = &read_buf[..n];
    if payload.first().copied().and_then(GateOpcode::from_u8) != Some(GateOpcode::AuthLogin) {
        anyhow::bail!("expected AuthLogin");
    }
    let Some(auth) = AuthLogin::from_payload(&payload[1..]) else {
        anyhow::bail!("malformed AuthLogin");
    };

    // The login server consumes the session key here; a second admission
    // attempt with the same key is refused everywhere.
    if !ctx.link.auth_player(&auth.account, auth.key).await {
        tracing::info!("Session validation failed for '{}' from {}", auth.account, addr);
        return Ok(());
    }

    tracing::info!("Account '{}' admitted to the world from {}", auth.account, addr);
    ctx.link.player_in_game(&auth.account).await;

    // World traffic belongs to the simulation layer; the gate holds the
    // connection and only watches for disconnect.
    let result = loop {
        match read_next(stream, &cipher, read_buf, None, shutdown).await {
            Ok(None) => break Ok(()),
            Ok(Some(_)) => continue,
            Err(e) => break Err(e),
        }
    };

    ctx.link.player_logout(&auth.account).await;
    result
}
