//! Server-nonce tracking for DPoP
//!
//! The network hands out short-lived nonces in `DPoP-Nonce` response
//! headers and expects them echoed in subsequent proofs. This cache
//! keeps the last nonce seen per (user, host). It is process-local and
//! best-effort: losing it only costs one extra round trip.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct NonceCache {
    inner: Mutex<HashMap<(String, String), String>>,
}

impl NonceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &str, host: &str) -> Option<String> {
        let map = self.inner.lock().expect("nonce cache lock poisoned");
        map.get(&(user_id.to_string(), host.to_string())).cloned()
    }

    pub fn store(&self, user_id: &str, host: &str, nonce: &str) {
        let mut map = self.inner.lock().expect("nonce cache lock poisoned");
        map.insert(
            (user_id.to_string(), host.to_string()),
            nonce.to_string(),
        );
    }
}
