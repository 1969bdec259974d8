// SessionManager - issue, look up, and consume session keys
//
// One mutex over the account -> key map. Strict validation is a
// compare-and-delete: the first successful validation removes the entry
// in the same critical section, so racing game servers observe exactly
// one success per issued key.

use parking_lot::Mutex;
use std::collections::HashMap;

use l2_shared::session::SessionKey;

#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, SessionKey>>,
}

impl SessionManager {
    pub fn new() -> Self {
        SessionManager {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Install a session for an account (lowercase). Returns true when a
    /// prior session was displaced; the old client is superseded.
    pub fn store(&self, account: &str, sk: SessionKey) -> bool {
        self.sessions
            .lock()
            .insert(account.to_string(), sk)
            .is_some()
    }

    pub fn get(&self, account: &str) -> Option<SessionKey> {
        self.sessions.lock().get(account).copied()
    }

    /// Validate a presented key. `strict` compares all four values and
    /// consumes the entry on success; loose validation compares only the
    /// LoginOk pair and never consumes.
    pub fn validate(&self, account: &str, presented: &SessionKey, strict: bool) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(stored) = sessions.get(account) else {
            return false;
        };
        if strict {
            if stored.matches(presented) {
                sessions.remove(account);
                true
            } else {
                false
            }
        } else {
            stored.matches_login(presented)
        }
    }

    pub fn remove(&self, account: &str) {
        self.sessions.lock().remove(account);
    }

    /// Live session count, for diagnostics.
    pub fn count(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Barrier;

    fn full_key() -> SessionKey {
        SessionKey {
            login_ok1: 10,
            login_ok2: 20,
            play_ok1: 30,
            play_ok2: 40,
        }
    }

    #[test]
    fn test_store_validate_consumes() {
        let mgr = SessionManager::new();
        let sk = full_key();
        assert!(!mgr.store("testuser", sk));
        assert_eq!(mgr.count(), 1);

        assert!(mgr.validate("testuser", &sk, true));
        assert_eq!(mgr.count(), 0);
        // consumed: a second identical validation fails
        assert!(!mgr.validate("testuser", &sk, true));
    }

    #[test]
    fn test_loose_validation_does_not_consume() {
        let mgr = SessionManager::new();
        let sk = full_key();
        mgr.store("testuser", sk);

        let mut loose = sk;
        loose.play_ok1 ^= 0x55;
        assert!(mgr.validate("testuser", &loose, false));
        assert_eq!(mgr.count(), 1);
        // the same mismatch under strict validation fails and keeps the entry
        assert!(!mgr.validate("testuser", &loose, true));
        assert_eq!(mgr.count(), 1);
    }

    #[test]
    fn test_store_displaces_previous() {
        let mgr = SessionManager::new();
        let first = full_key();
        mgr.store("testuser", first);
        let second = SessionKey {
            login_ok1: 11,
            ..first
        };
        assert!(mgr.store("testuser", second));
        assert!(!mgr.validate("testuser", &first, true));
        assert!(mgr.validate("testuser", &second, true));
    }

    #[test]
    fn test_unknown_account() {
        let mgr = SessionManager::new();
        assert!(!mgr.validate("ghost", &full_key(), true));
        assert!(!mgr.validate("ghost", &full_key(), false));
    }

    #[test]
    fn test_concurrent_validate_single_winner() {
        let mgr = Arc::new(SessionManager::new());
        let sk = full_key();
        mgr.store("testuser", sk);

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let mgr = mgr.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    mgr.validate("testuser", &sk, true)
                })
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(successes, 1);
        assert_eq!(mgr.count(), 0);
    }
}
