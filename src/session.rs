use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bevy::log::{debug, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

struct SessionState {
    game_params: BTreeMap<String, String>,
    rng: ChaCha8Rng,
    ended: bool,
}

/// State shared by every script handle loaded for one match. Dropping the last clone ends its
/// lifetime; nothing here outlives the session that created it.
#[derive(Clone)]
pub struct Session {
    seed: u64,
    inner: Arc<Mutex<SessionState>>,
}

impl Session {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            inner: Arc::new(Mutex::new(SessionState {
                game_params: BTreeMap::new(),
                rng: ChaCha8Rng::seed_from_u64(seed),
                ended: false,
            })),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn game_param(&self, key: &str) -> Option<String> {
        self.lock().game_params.get(key).cloned()
    }

    pub fn game_params(&self) -> BTreeMap<String, String> {
        self.lock().game_params.clone()
    }

    pub(crate) fn set_game_param(&self, key: String, value: String) {
        let mut state = self.lock();
        if state.ended {
            warn!("[Lockstep session] Ignoring game param '{key}' written after session end");
            return;
        }
        state.game_params.insert(key, value);
    }

    /// Clears the parameter table and ends the session. Only the first call has an effect.
    pub fn clear_game_params(&self) -> bool {
        let mut state = self.lock();
        if state.ended {
            debug!("[Lockstep session] Game params already cleared");
            return false;
        }
        state.game_params.clear();
        state.ended = true;
        true
    }

    pub fn is_ended(&self) -> bool {
        self.lock().ended
    }

    pub fn shares_state_with(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn random_float(&self) -> f64 {
        self.lock().rng.gen::<f64>()
    }

    /// Uniform integer in `[low, high]`; callers guarantee `low <= high`.
    pub(crate) fn random_range(&self, low: i64, high: i64) -> i64 {
        self.lock().rng.gen_range(low..=high)
    }

    pub(crate) fn reseed(&self, seed: u64) {
        self.lock().rng = ChaCha8Rng::seed_from_u64(seed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_gives_same_stream() {
        let a = Session::new(99);
        let b = Session::new(99);
        let seq_a: Vec<i64> = (0..32).map(|_| a.random_range(1, 1000)).collect();
        let seq_b: Vec<i64> = (0..32).map(|_| b.random_range(1, 1000)).collect();
        assert_eq!(seq_a, seq_b);
        assert_eq!(a.random_float().to_bits(), b.random_float().to_bits());
    }

    #[test]
    fn reseed_restarts_stream() {
        let session = Session::new(5);
        let first: Vec<i64> = (0..8).map(|_| session.random_range(0, 100)).collect();
        session.reseed(5);
        let again: Vec<i64> = (0..8).map(|_| session.random_range(0, 100)).collect();
        assert_eq!(first, again);
    }

    #[test]
    fn clear_happens_once() {
        let session = Session::new(1);
        session.set_game_param("mode".into(), "koth".into());
        assert!(session.clear_game_params());
        assert!(session.game_params().is_empty());
        assert!(!session.clear_game_params());

        session.set_game_param("late".into(), "write".into());
        assert_eq!(session.game_param("late"), None);
        assert!(session.is_ended());
    }

    #[test]
    fn clones_share_the_table() {
        let session = Session::new(1);
        let other = session.clone();
        session.set_game_param("b".into(), "2".into());
        session.set_game_param("a".into(), "1".into());
        let keys: Vec<String> = other.game_params().into_keys().collect();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert!(other.shares_state_with(&session));
    }
}
