//! Pages that route their requests through the cache manager.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use url::Url;

/// An open page.
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Cache version controlling this client, if any.
    pub controller: Option<String>,
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a window for `url`, uncontrolled until the next claim.
    pub fn open_window(&mut self, url: Url) -> Client {
        let client = Client {
            id: next_client_id(),
            url,
            controller: None,
        };
        self.clients.insert(client.id.clone(), client.clone());
        client
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Make `version` the controller of every client. Returns how many changed.
    pub fn claim(&mut self, version: &str) -> usize {
        let mut changed = 0;
        for client in self.clients.values_mut() {
            if client.controller.as_deref() != Some(version) {
                client.controller = Some(version.to_string());
                changed += 1;
            }
        }
        changed
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}
