// Crypt module - the Interlude wire protocol crypto stack
//
// Three channels, three Blowfish key regimes:
// - client <-> login: static key for the Init frame, then the per-session
//   key carried inside Init
// - game <-> login control: well-known default key until the RSA-wrapped
//   40-byte key is exchanged
// - client <-> game: per-connection key sent plaintext in the Key frame
//
// Each channel owns its own cipher instance; keys are installed by a
// specific state transition and never shared across channels.

pub mod blowfish;
pub mod frame;
pub mod keypool;
pub mod password;
pub mod scramble;
pub mod xor;

pub use blowfish::{DEFAULT_GS_KEY, L2Blowfish, STATIC_CLIENT_KEY};
pub use frame::{FrameError, read_frame, write_frame, write_plain_frame, write_xor_frame};
pub use keypool::{GsKeyPair, KeyPools, ScrambledKeyPair, rsa_decrypt_raw, rsa_encrypt_raw};
pub use scramble::{scramble_modulus, unscramble_modulus};
pub use xor::{dec_xor_pass, enc_xor_pass};
