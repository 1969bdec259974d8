// Blowfish block transform used by the frame codec
//
// The client implements Blowfish over 32-bit little-endian words, unlike
// the textbook big-endian form, so the cipher is instantiated as
// Blowfish<LE>. Buffers are processed in place, 8 bytes at a time.

use anyhow::Result;
use blowfish::Blowfish;
use blowfish::cipher::{Block, BlockDecrypt, BlockEncrypt, KeyInit};
use byteorder::LE;

/// Blowfish block size in bytes.
pub const BLOCK_SIZE: usize = 8;

/// Static key every Interlude client ships with; encrypts the Init frame.
pub const STATIC_CLIENT_KEY: [u8; 16] = [
    0x6B, 0x60, 0xCB, 0x5B, 0x82, 0xCE, 0x90, 0xB1,
    0xCC, 0x2B, 0x6C, 0x55, 0x6C, 0x6C, 0x6C, 0x6C,
];

/// Well-known key for the first frames on the game<->login control channel,
/// until the per-connection 40-byte key is exchanged.
pub const DEFAULT_GS_KEY: [u8; 16] = [
    0x5F, 0x3B, 0x76, 0x2E, 0x5D, 0x30, 0x35, 0x2D,
    0x33, 0x31, 0x21, 0x7C, 0x2B, 0x2D, 0x25, 0x78,
];

/// A channel-scoped Blowfish cipher operating in place on 8-byte blocks.
#[derive(Clone)]
pub struct L2Blowfish {
    cipher: Blowfish<LE>,
}

impl L2Blowfish {
    /// Create a cipher from a raw key (16 bytes for the client channels,
    /// 40 bytes on the established control channel).
    pub fn new(key: &[u8]) -> Result<Self> {
        let cipher = Blowfish::<LE>::new_from_slice(key)
            .map_err(|_| anyhow::anyhow!("invalid Blowfish key length: {}", key.len()))?;
        Ok(L2Blowfish { cipher })
    }

    /// Cipher keyed with [`STATIC_CLIENT_KEY`].
    pub fn static_client() -> Self {
        Self::new(&STATIC_CLIENT_KEY).unwrap()
    }

    /// Cipher keyed with [`DEFAULT_GS_KEY`].
    pub fn default_gs() -> Self {
        Self::new(&DEFAULT_GS_KEY).unwrap()
    }

    /// Encrypt a whole buffer in place. Length must be a multiple of 8.
    pub fn encrypt_in_place(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len() % BLOCK_SIZE, 0);
        for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
            let block = Block::<Blowfish<LE>>::from_mut_slice(chunk);
            self.cipher.encrypt_block(block);
        }
    }

    /// Decrypt a whole buffer in place. Length must be a multiple of 8.
    pub fn decrypt_in_place(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len() % BLOCK_SIZE, 0);
        for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
            let block = Block::<Blowfish<LE>>::from_mut_slice(chunk);
            self.cipher.decrypt_block(block);
        }
    }
}
