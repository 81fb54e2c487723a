//! Static client roster: identity lookup and per-client permissions.
//!
//! The registry is a pure read-only lookup, built once at startup from
//! configuration and never mutated afterwards — there is no dynamic
//! credential revocation.

use crate::config::ClientConfig;

#[derive(Clone, Debug)]
pub struct Perms {
    pub upstream_addrs: Vec<String>,
    pub limit: u32,
}

#[derive(Clone, Debug)]
pub struct Client {
    pub id: String,
    pub perms: Perms,
}

pub struct AuthRegistry {
    clients: Vec<Client>,
}

impl AuthRegistry {
    pub fn new(clients: Vec<ClientConfig>) -> Self {
        let clients = clients
            .into_iter()
            .map(|c| Client {
                id: c.id,
                perms: Perms {
                    upstream_addrs: c.perms.upstream_addrs,
                    limit: c.perms.limit,
                },
            })
            .collect();
        Self { clients }
    }

    /// True iff `id` appears in the configured client roster.
    pub fn authn(&self, id: &str) -> bool {
        self.clients.iter().any(|c| c.id == id)
    }

    /// Read-only snapshot used to build the balancer's per-client runtime state.
    pub fn all_clients_perms(&self) -> &[Client] {
        &self.clients
    }
}
