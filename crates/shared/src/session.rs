// SessionKey - the four-int capability authorizing game server admission
//
// Issued in two halves: the LoginOk pair on a successful credential
// check, the PlayOk pair when the client selects a server. The game
// server presents all four to the login server, which validates and
// consumes them atomically.

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionKey {
    pub login_ok1: i32,
    pub login_ok2: i32,
    pub play_ok1: i32,
    pub play_ok2: i32,
}

impl SessionKey {
    /// Issue the LoginOk half; the PlayOk half stays zero until server
    /// selection.
    pub fn new_login_pair() -> Self {
        let mut rng = rand::thread_rng();
        SessionKey {
            login_ok1: rng.r#gen(),
            login_ok2: rng.r#gen(),
            play_ok1: 0,
            play_ok2: 0,
        }
    }

    /// Complete the key with a fresh PlayOk pair.
    pub fn with_play_pair(self) -> Self {
        let mut rng = rand::thread_rng();
        SessionKey {
            play_ok1: rng.r#gen(),
            play_ok2: rng.r#gen(),
            ..self
        }
    }

    /// Loose equality: only the LoginOk pair, used before PlayOk exists.
    pub fn matches_login(&self, other: &SessionKey) -> bool {
        self.login_ok1 == other.login_ok1 && self.login_ok2 == other.login_ok2
    }

    /// Strict equality over all four values.
    pub fn matches(&self, other: &SessionKey) -> bool {
        self.matches_login(other)
            && self.play_ok1 == other.play_ok1
            && self.play_ok2 == other.play_ok2
    }
}
