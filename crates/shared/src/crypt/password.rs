// Password hashing
//
// Stored form is base64(SHA-1(utf8(password))), compared as strings.

use data_encoding::BASE64;
use digest::Digest;

/// Hash a plaintext password into its stored form.
pub fn hash_password(password: &str) -> String {
    let digest = sha1::Sha1::digest(password.as_bytes());
    BASE64.encode(&digest)
}

/// Compare a plaintext password against a stored hash.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    hash_password(password) == stored_hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        // SHA1("testpass") = 206c80413b9a96c1312cc346b7d2517b84463edd
        let hash = hash_password("testpass");
        assert_eq!(hash, "IGyAQTualsExLMNGt9JRe4RGPt0=");
        assert_eq!(hash.len(), 28);
    }

    #[test]
    fn test_verify() {
        let stored = hash_password("testpass");
        assert!(verify_password("testpass", &stored));
        assert!(!verify_password("testPass", &stored));
        assert!(!verify_password("", &stored));
    }
}
