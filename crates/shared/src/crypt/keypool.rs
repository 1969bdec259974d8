// RSA key pools
//
// Both listeners vend a keypair per accepted connection from a pool that
// is generated once at startup and read-only afterwards. The client pool
// caches the scrambled form of each modulus since that is what the Init
// packet carries; the control pool sends its 64-byte modulus as-is.
//
// The credential block and the control-channel key exchange both use
// unpadded (textbook) RSA, so the raw modpow is done on the key parts
// rather than through a padding scheme.

use anyhow::Result;
use rand::Rng;
use rand::rngs::OsRng;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey};

use super::scramble::{MODULUS_SIZE, scramble_modulus};

/// Keypairs generated per pool at startup.
pub const POOL_SIZE: usize = 10;

/// Client-profile key length in bits.
pub const CLIENT_KEY_BITS: usize = 1024;

/// Control-profile key length in bits.
pub const GS_KEY_BITS: usize = 512;

/// Modulus size of the control-profile keys in bytes.
pub const GS_MODULUS_SIZE: usize = 64;

/// RSA public exponent used by both profiles.
pub const PUBLIC_EXPONENT: u32 = 65537;

fn left_pad(bytes: &[u8], len: usize) -> Vec<u8> {
    debug_assert!(bytes.len() <= len);
    let mut out = vec![0u8; len];
    out[len - bytes.len()..].copy_from_slice(bytes);
    out
}

/// Unpadded RSA decryption: `block^d mod n`, left-padded to the modulus size.
pub fn rsa_decrypt_raw(key: &RsaPrivateKey, block: &[u8]) -> Vec<u8> {
    let c = BigUint::from_bytes_be(block);
    let m = c.modpow(key.d(), key.n());
    left_pad(&m.to_bytes_be(), key.size())
}

/// Unpadded RSA encryption against a raw modulus with exponent 65537.
/// This is the operation the peers perform; the servers use it in tests
/// and the game server uses it to wrap the control-channel Blowfish key.
pub fn rsa_encrypt_raw(modulus: &[u8], block: &[u8]) -> Vec<u8> {
    let n = BigUint::from_bytes_be(modulus);
    let e = BigUint::from(PUBLIC_EXPONENT);
    let c = BigUint::from_bytes_be(block).modpow(&e, &n);
    left_pad(&c.to_bytes_be(), modulus.len())
}

/// A 1024-bit keypair whose public modulus is cached in scrambled form.
pub struct ScrambledKeyPair {
    key: RsaPrivateKey,
    scrambled_modulus: [u8; MODULUS_SIZE],
}

impl ScrambledKeyPair {
    fn generate() -> Result<Self> {
        let key = RsaPrivateKey::new(&mut OsRng, CLIENT_KEY_BITS)?;
        let modulus: [u8; MODULUS_SIZE] = left_pad(&key.n().to_bytes_be(), MODULUS_SIZE)
            .try_into()
            .unwrap();
        Ok(ScrambledKeyPair {
            scrambled_modulus: scramble_modulus(&modulus),
            key,
        })
    }

    /// The modulus as sent to clients inside the Init packet.
    pub fn scrambled_modulus(&self) -> &[u8; MODULUS_SIZE] {
        &self.scrambled_modulus
    }

    /// Decrypt a 128-byte credential block from a client.
    pub fn decrypt_block(&self, block: &[u8]) -> Vec<u8> {
        rsa_decrypt_raw(&self.key, block)
    }
}

/// A 512-bit keypair for the game<->login control channel.
pub struct GsKeyPair {
    key: RsaPrivateKey,
    modulus: [u8; GS_MODULUS_SIZE],
}

impl GsKeyPair {
    fn generate() -> Result<Self> {
        let key = RsaPrivateKey::new(&mut OsRng, GS_KEY_BITS)?;
        let modulus: [u8; GS_MODULUS_SIZE] = left_pad(&key.n().to_bytes_be(), GS_MODULUS_SIZE)
            .try_into()
            .unwrap();
        Ok(GsKeyPair { key, modulus })
    }

    /// The raw modulus carried in InitLS.
    pub fn modulus(&self) -> &[u8; GS_MODULUS_SIZE] {
        &self.modulus
    }

    /// Decrypt the 64-byte wrapped Blowfish key from a game server.
    pub fn decrypt_block(&self, block: &[u8]) -> Vec<u8> {
        rsa_decrypt_raw(&self.key, block)
    }
}

/// Both startup key pools. Immutable after generation; vending needs no
/// synchronization.
pub struct KeyPools {
    client: Vec<ScrambledKeyPair>,
    gs: Vec<GsKeyPair>,
}

impl KeyPools {
    /// Generate both pools at [`POOL_SIZE`]. Run once at startup; key
    /// generation is the slowest part of boot.
    pub fn generate() -> Result<Self> {
        Self::generate_sized(POOL_SIZE, POOL_SIZE)
    }

    /// Generate pools of explicit sizes.
    pub fn generate_sized(client_n: usize, gs_n: usize) -> Result<Self> {
        tracing::info!("Caching {} client RSA keypairs ({} bit)", client_n, CLIENT_KEY_BITS);
        let client = (0..client_n)
            .map(|_| ScrambledKeyPair::generate())
            .collect::<Result<Vec<_>>>()?;

        tracing::info!("Caching {} control RSA keypairs ({} bit)", gs_n, GS_KEY_BITS);
        let gs = (0..gs_n)
            .map(|_| GsKeyPair::generate())
            .collect::<Result<Vec<_>>>()?;

        Ok(KeyPools { client, gs })
    }

    /// Pick a client keypair uniformly at random for a new connection.
    pub fn random_client(&self) -> &ScrambledKeyPair {
        &self.client[rand::thread_rng().gen_range(0..self.client.len())]
    }

    /// Pick a control keypair uniformly at random for a new connection.
    pub fn random_gs(&self) -> &GsKeyPair {
        &self.gs[rand::thread_rng().gen_range(0..self.gs.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::scramble::unscramble_modulus;

    #[test]
    fn test_gs_key_wrap_round_trip() {
        let pair = GsKeyPair::generate().unwrap();

        // what a registering game server does: left-pad its fresh 40-byte
        // Blowfish key into a 64-byte block and encrypt against the modulus
        let bf_key: Vec<u8> = (0u8..40).map(|i| i.wrapping_mul(13).wrapping_add(1)).collect();
        let mut block = vec![0u8; GS_MODULUS_SIZE];
        block[GS_MODULUS_SIZE - 40..].copy_from_slice(&bf_key);

        let wrapped = rsa_encrypt_raw(pair.modulus(), &block);
        assert_eq!(wrapped.len(), GS_MODULUS_SIZE);

        let unwrapped = pair.decrypt_block(&wrapped);
        assert_eq!(&unwrapped[GS_MODULUS_SIZE - 40..], &bf_key[..]);
    }

    #[test]
    fn test_client_block_round_trip_through_scramble() {
        let pair = ScrambledKeyPair::generate().unwrap();

        // the client unscrambles the advertised modulus before encrypting
        let modulus = unscramble_modulus(pair.scrambled_modulus());

        let mut block = vec![0u8; MODULUS_SIZE];
        block[0x5E..0x5E + 8].copy_from_slice(b"testuser");
        block[0x6C..0x6C + 8].copy_from_slice(b"testpass");

        let cryptogram = rsa_encrypt_raw(&modulus, &block);
        let plain = pair.decrypt_block(&cryptogram);
        assert_eq!(plain, block);
    }
}
