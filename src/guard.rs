//! Admission checks applied before a message reaches the lease store.
//!
//! Two checks, both keyed on the client identifier:
//!
//! - a sliding-window rate limit on DISCOVER and REQUEST;
//! - with `known_clients_only`, a DISCOVER from a client outside
//!   `known_clients` (or the static bindings) is ignored.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::lease::ClientId;
use crate::options::MessageType;

const RATE_LIMIT_CLEANUP_THRESHOLD: usize = 1000;

pub struct RateGuard {
    window: Duration,
    max_requests: usize,
    known_clients: Option<HashSet<ClientId>>,
    requests: Mutex<HashMap<ClientId, Vec<Instant>>>,
}

impl RateGuard {
    pub fn new(
        window: Duration,
        max_requests: usize,
        known_clients: Option<HashSet<ClientId>>,
    ) -> Self {
        Self {
            window,
            max_requests,
            known_clients,
            requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let known_clients = if config.known_clients_only {
            let mut known = HashSet::new();
            for client in &config.known_clients {
                known.insert(ClientId::from_mac_or_hex(client)?);
            }
            for binding in &config.static_bindings {
                known.insert(binding.client_id()?);
            }
            Some(known)
        } else {
            None
        };

        Ok(Self::new(
            Duration::from_secs(config.rate_limit.window_seconds),
            config.rate_limit.max_requests,
            known_clients,
        ))
    }

    /// Decides whether a message of `message_type` from `client_id` is served.
    ///
    /// # Errors
    ///
    /// - [`Error::NotAllowed`] for a DISCOVER from an unknown client
    /// - [`Error::RateLimited`] when the client is over its budget
    pub async fn check(&self, client_id: &ClientId, message_type: MessageType) -> Result<()> {
        if message_type == MessageType::Discover
            && let Some(known) = &self.known_clients
            && !known.contains(client_id)
        {
            return Err(Error::NotAllowed);
        }

        if matches!(message_type, MessageType::Discover | MessageType::Request)
            && self.is_rate_limited(client_id).await
        {
            return Err(Error::RateLimited);
        }

        Ok(())
    }

    async fn is_rate_limited(&self, client_id: &ClientId) -> bool {
        let mut limiter = self.requests.lock().await;
        let now = Instant::now();
        let window = self.window;

        if limiter.len() > RATE_LIMIT_CLEANUP_THRESHOLD {
            limiter.retain(|_, timestamps| {
                timestamps.retain(|t| now.duration_since(*t) < window);
                !timestamps.is_empty()
            });
        }

        let timestamps = limiter.entry(client_id.clone()).or_default();
        timestamps.retain(|t| now.duration_since(*t) < window);

        if timestamps.len() >= self.max_requests {
            return true;
        }

        timestamps.push(now);
        false
    }

    /// Clients with requests inside the current window.
    pub async fn tracked_clients(&self) -> usize {
        self.requests.lock().await.len()
    }
}
