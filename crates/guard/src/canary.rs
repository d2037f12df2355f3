//! Session-bound canary tokens for leak detection.
//!
//! Tokens are injected into upstream prompts wrapped in zero-width
//! characters; any issued token appearing in later text is a leak.

use std::collections::HashMap;
use std::sync::RwLock;

pub const CANARY_PREFIX: &str = "vura_canary_";

const WRAP: char = '\u{200B}';

/// Read-mostly store of issued tokens keyed by token text.
pub struct CanaryStore {
    tokens: RwLock<HashMap<String, String>>,
}

impl Default for CanaryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CanaryStore {
    pub fn new() -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Issue a fresh token bound to a session.
    pub fn issue(&self, session: &str) -> String {
        let raw: [u8; 16] = rand::random();
        let token = format!("{CANARY_PREFIX}{}", hex::encode(raw));
        self.tokens
            .write()
            .unwrap()
            .insert(token.clone(), session.to_string());
        token
    }

    /// Append the token to a prompt, wrapped in zero-width characters so it
    /// stays invisible in rendered text while remaining in the context.
    pub fn inject(prompt: &str, token: &str) -> String {
        format!("{prompt}\n{WRAP}{token}{WRAP}")
    }

    /// Scan text for any issued token. Returns (token, session) on a hit.
    pub fn check(&self, text: &str) -> Option<(String, String)> {
        if !text.contains(CANARY_PREFIX) {
            return None;
        }
        let tokens = self.tokens.read().unwrap();
        tokens
            .iter()
            .find(|(token, _)| text.contains(token.as_str()))
            .map(|(token, session)| (token.clone(), session.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_shape() {
        let store = CanaryStore::new();
        let token = store.issue("s1");
        assert!(token.starts_with(CANARY_PREFIX));
        assert_eq!(token.len(), CANARY_PREFIX.len() + 32);

        let other = store.issue("s1");
        assert_ne!(token, other);
    }

    #[test]
    fn test_inject_wraps_invisibly() {
        let store = CanaryStore::new();
        let token = store.issue("s1");
        let injected = CanaryStore::inject("You are a helpful assistant.", &token);

        assert!(injected.starts_with("You are a helpful assistant."));
        assert!(injected.contains(&format!("{WRAP}{token}{WRAP}")));
    }

    #[test]
    fn test_check_finds_leaks() {
        let store = CanaryStore::new();
        let token = store.issue("s3");

        assert!(store.check("all clear").is_none());
        let (found, session) = store
            .check(&format!("output contains {token} somewhere"))
            .unwrap();
        assert_eq!(found, token);
        assert_eq!(session, "s3");
    }
}
