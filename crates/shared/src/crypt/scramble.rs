// RSA modulus scrambling
//
// The 128-byte public modulus in the Init packet is sent in a reversibly
// permuted form; the client applies the inverse before encrypting the
// credential block.

/// Byte count of the client-profile modulus this transform covers.
pub const MODULUS_SIZE: usize = 128;

/// Scramble a 1024-bit modulus for transmission in the Init packet.
pub fn scramble_modulus(modulus: &[u8; MODULUS_SIZE]) -> [u8; MODULUS_SIZE] {
    let mut m = *modulus;
    // swap bytes 0x00..0x04 with 0x4D..0x51
    for i in 0..4 {
        m.swap(i, 0x4D + i);
    }
    // xor first 0x40 bytes with last 0x40 bytes
    for i in 0..0x40 {
        m[i] ^= m[0x40 + i];
    }
    // xor bytes 0x0D..0x11 with bytes 0x34..0x38
    for i in 0..4 {
        m[0x0D + i] ^= m[0x34 + i];
    }
    // xor last 0x40 bytes with first 0x40 bytes
    for i in 0..0x40 {
        m[0x40 + i] ^= m[i];
    }
    m
}

/// Recover the true modulus from its scrambled form (what the client does).
pub fn unscramble_modulus(scrambled: &[u8; MODULUS_SIZE]) -> [u8; MODULUS_SIZE] {
    let mut m = *scrambled;
    for i in 0..0x40 {
        m[0x40 + i] ^= m[i];
    }
    for i in 0..4 {
        m[0x0D + i] ^= m[0x34 + i];
    }
    for i in 0..0x40 {
        m[i] ^= m[0x40 + i];
    }
    for i in 0..4 {
        m.swap(i, 0x4D + i);
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scramble_round_trip_identity() {
        let mut modulus = [0u8; MODULUS_SIZE];
        for (i, b) in modulus.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(31).wrapping_add(7);
        }
        let scrambled = scramble_modulus(&modulus);
        assert_ne!(scrambled, modulus);
        assert_eq!(unscramble_modulus(&scrambled), modulus);
    }

    #[test]
    fn test_scramble_is_deterministic() {
        let modulus = [0x5Au8; MODULUS_SIZE];
        assert_eq!(scramble_modulus(&modulus), scramble_modulus(&modulus));
    }
}
