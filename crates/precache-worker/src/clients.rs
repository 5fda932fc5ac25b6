//! Clients API: the pages a worker can see, focus, open and claim.

use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use url::Url;

use crate::error::{PrecacheError, PrecacheResult};
use crate::WorkerId;

/// Unique identifier for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
    All,
}

/// A client (page or worker in scope).
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub url: Url,
    pub client_type: ClientType,
    pub focused: bool,
    /// Worker currently controlling this client.
    pub controller: Option<WorkerId>,
}

impl Client {
    /// A window client with no controller.
    pub fn window(url: Url) -> Self {
        Self {
            id: ClientId::new(),
            url,
            client_type: ClientType::Window,
            focused: false,
            controller: None,
        }
    }
}

/// Options for [`Clients::match_all`].
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

/// Clients visible to a registration scope.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<ClientId, Client>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn add(&mut self, client: Client) -> ClientId {
        let id = client.id;
        self.clients.insert(id, client);
        id
    }

    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        self.clients.remove(&id)
    }

    /// Clients matching `options`. Uncontrolled clients are only included on request.
    pub fn match_all(&self, options: &ClientMatchOptions) -> Vec<&Client> {
        self.clients
            .values()
            .filter(|c| options.include_uncontrolled || c.controller.is_some())
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .collect()
    }

    /// Focus a window client; every other client loses focus.
    pub fn focus(&mut self, id: ClientId) -> PrecacheResult<&Client> {
        match self.clients.get(&id) {
            None => return Err(PrecacheError::state(format!("no client {:?}", id))),
            Some(c) if c.client_type != ClientType::Window => {
                return Err(PrecacheError::state("Can only focus window clients"));
            }
            Some(_) => {}
        }

        for client in self.clients.values_mut() {
            client.focused = client.id == id;
        }
        self.clients
            .get(&id)
            .ok_or_else(|| PrecacheError::state(format!("no client {:?}", id)))
    }

    /// Open and focus a new window client.
    pub fn open_window(&mut self, url: Url, controller: Option<WorkerId>) -> ClientId {
        for client in self.clients.values_mut() {
            client.focused = false;
        }
        let mut client = Client::window(url);
        client.focused = true;
        client.controller = controller;
        debug!(id = ?client.id, url = %client.url, "Opened window client");
        self.add(client)
    }

    /// Make `worker` the controller of every client; returns how many changed hands.
    pub fn claim(&mut self, worker: WorkerId) -> usize {
        let mut claimed = 0;
        for client in self.clients.values_mut() {
            if client.controller != Some(worker) {
                client.controller = Some(worker);
                claimed += 1;
            }
        }
        claimed
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
