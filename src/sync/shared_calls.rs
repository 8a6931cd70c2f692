//! Shared Calls
//!
//! Collapses concurrent calls for the same key into one execution. The first
//! caller (the leader) runs the work; everyone arriving while it is in flight
//! waits and receives a clone of the leader's result.
//!
//! Results travel as serialized `Bytes` so callers can decode them into their
//! own typed value.

use std::collections::HashMap;
use std::future::Future;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{Error, Result};

type CallResult = Option<Result<Bytes>>;

/// Barrier keyed by string
#[derive(Debug, Default)]
pub struct SharedCalls {
    calls: Mutex<HashMap<String, watch::Receiver<CallResult>>>,
}

enum Role {
    Leader(watch::Sender<CallResult>),
    Follower(watch::Receiver<CallResult>),
}

/// Removes the in-flight record when the leader finishes or is cancelled
struct InFlight<'a> {
    calls: &'a Mutex<HashMap<String, watch::Receiver<CallResult>>>,
    key: &'a str,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.calls.lock().remove(self.key);
    }
}

impl SharedCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` unless a call for `key` is already in flight
    ///
    /// Returns the result and whether it was produced by another caller.
    pub async fn call<F, Fut>(&self, key: &str, f: F) -> (Result<Bytes>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        let role = {
            let mut calls = self.calls.lock();
            match calls.get(key) {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    calls.insert(key.to_string(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Leader(tx) => {
                let _in_flight = InFlight {
                    calls: &self.calls,
                    key,
                };
                let result = f().await;
                tx.send_replace(Some(result.clone()));
                (result, false)
            }
            Role::Follower(mut rx) => {
                debug!(key, "Waiting on in-flight call");
                let result = match rx.wait_for(Option::is_some).await {
                    Ok(shared) => shared
                        .clone()
                        .unwrap_or_else(|| Err(Error::SharedCallAbandoned(key.to_string()))),
                    Err(_) => Err(Error::SharedCallAbandoned(key.to_string())),
                };
                (result, true)
            }
        }
    }

    /// Number of keys with a call in flight
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }
}

// =============================================================================
// Tests
// =============================================================================
