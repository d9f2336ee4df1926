//! Multi-session property arbitration.
//!
//! Several sessions may ask for different values of the same adaptor
//! property (poll interval, range, ...). The arbitrator keeps every
//! outstanding request keyed by `(property, adaptor, session)` and reduces
//! them to one effective value: the numeric maximum, or the adaptor's
//! declared default when no request is outstanding.

use std::collections::{BTreeMap, HashMap};

use sensord_core::SessionId;

type PropertyKey = (String, String);

/// Per-`(property, adaptor)` request table with max-wins reduction.
#[derive(Default)]
pub struct PropertyArbitrator {
    requests: HashMap<PropertyKey, BTreeMap<SessionId, i32>>,
    defaults: HashMap<PropertyKey, i32>,
}

impl PropertyArbitrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the fallback value used when no session has a request
    /// outstanding for the pair. Unknown pairs fall back to 0.
    pub fn set_default(&mut self, property: &str, adaptor: &str, value: i32) {
        self.defaults
            .insert((property.to_string(), adaptor.to_string()), value);
    }

    /// Inserts or replaces the session's request and returns the new winning
    /// value for the pair.
    pub fn set_request(
        &mut self,
        session: SessionId,
        property: &str,
        adaptor: &str,
        value: i32,
    ) -> i32 {
        let key = (property.to_string(), adaptor.to_string());
        self.requests.entry(key).or_default().insert(session, value);
        self.winning_value(property, adaptor)
    }

    /// The numeric maximum across current requests, or the default.
    pub fn winning_value(&self, property: &str, adaptor: &str) -> i32 {
        let key = (property.to_string(), adaptor.to_string());
        self.requests
            .get(&key)
            .and_then(|by_session| by_session.values().max().copied())
            .unwrap_or_else(|| self.defaults.get(&key).copied().unwrap_or(0))
    }

    /// Drops every request made by `session` and returns the pairs whose
    /// winning value changed, each exactly once. Calling this again for the
    /// same session is a no-op.
    pub fn clear_requests(&mut self, session: SessionId) -> Vec<(String, String)> {
        let affected: Vec<PropertyKey> = self
            .requests
            .iter()
            .filter(|(_, by_session)| by_session.contains_key(&session))
            .map(|(key, _)| key.clone())
            .collect();

        let mut changed = Vec::new();
        for key in affected {
            let before = self.winning_value(&key.0, &key.1);
            if let Some(by_session) = self.requests.get_mut(&key) {
                by_session.remove(&session);
                if by_session.is_empty() {
                    self.requests.remove(&key);
                }
            }
            if self.winning_value(&key.0, &key.1) != before {
                changed.push(key);
            }
        }
        changed
    }
}
