//! Least-loaded upstream selection with per-client permission filtering and
//! concurrency caps.
//!
//! Supersedes the historical atomic-wrap-around round-robin balancer: with
//! least-loaded selection, round-robin only ever emerges as a special case
//! when every upstream is equally loaded. The per-upstream ordering is kept
//! under one short-held mutex; each client's concurrency cap is a plain
//! atomic, since it is only ever a scalar bound check.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::auth::Client;
use crate::error::ProxyError;

#[derive(Debug)]
enum AllowedSet {
    Unrestricted,
    /// Strict-empty per the chosen Open Question resolution: a client with a
    /// configured restriction list that resolves to no matching upstreams is
    /// restricted to nothing, not unrestricted.
    Restricted(Vec<usize>),
}

impl AllowedSet {
    fn contains(&self, idx: usize) -> bool {
        match self {
            AllowedSet::Unrestricted => true,
            AllowedSet::Restricted(indices) => indices.contains(&idx),
        }
    }

    fn is_unrestricted(&self) -> bool {
        matches!(self, AllowedSet::Unrestricted)
    }
}

#[derive(Debug)]
struct ClientState {
    allowed: AllowedSet,
    limit: u32,
    conn_cntr: AtomicU32,
}

#[derive(Debug)]
struct OrderingState {
    /// `cntr[u]` = active connection count of upstream `u`.
    cntr: Vec<u32>,
    /// Permutation of upstream indices, non-decreasing by `cntr`.
    order: Vec<usize>,
    /// `order_idx[u]` = position of upstream `u` within `order`.
    order_idx: Vec<usize>,
}

impl OrderingState {
    fn new(n: usize) -> Self {
        Self {
            cntr: vec![0; n],
            order: (0..n).collect(),
            order_idx: (0..n).collect(),
        }
    }

    /// Increments `cntr[u]` and bubbles it up (toward higher positions) past
    /// anything no heavier than it, including ties — so among equally-loaded
    /// upstreams the one bumped longest ago stays frontmost, giving ties a
    /// round-robin rotation instead of leaving the last-bumped one in front.
    fn bump(&mut self, u: usize) {
        self.cntr[u] += 1;
        let mut pos = self.order_idx[u];
        while pos + 1 < self.order.len() && self.cntr[self.order[pos]] >= self.cntr[self.order[pos + 1]] {
            self.order.swap(pos, pos + 1);
            self.order_idx[self.order[pos]] = pos;
            self.order_idx[self.order[pos + 1]] = pos + 1;
            pos += 1;
        }
    }

    /// Decrements `cntr[u]` and bubbles it down (toward lower positions),
    /// past ties as well, so a release is the exact inverse of the `bump`
    /// that paired with it.
    fn unbump(&mut self, u: usize) {
        self.cntr[u] -= 1;
        let mut pos = self.order_idx[u];
        while pos > 0 && self.cntr[self.order[pos]] <= self.cntr[self.order[pos - 1]] {
            self.order.swap(pos, pos - 1);
            self.order_idx[self.order[pos]] = pos;
            self.order_idx[self.order[pos - 1]] = pos - 1;
            pos -= 1;
        }
    }
}

#[derive(Debug)]
pub struct Balancer {
    upstream_addrs: Vec<String>,
    clients: HashMap<String, ClientState>,
    ordering: Mutex<OrderingState>,
}

impl Balancer {
    pub fn new(upstream_addrs: Vec<String>, clients: &[Client]) -> Result<Arc<Self>, ProxyError> {
        if upstream_addrs.is_empty() {
            return Err(ProxyError::ConfigInvalid(
                "balancer requires at least one configured upstream".into(),
            ));
        }

        let mut client_states = HashMap::with_capacity(clients.len());
        for client in clients {
            let allowed = if client.perms.upstream_addrs.is_empty() {
                AllowedSet::Unrestricted
            } else {
                let indices: Vec<usize> = client
                    .perms
                    .upstream_addrs
                    .iter()
                    .filter_map(|addr| upstream_addrs.iter().position(|u| u == addr))
                    .collect();
                AllowedSet::Restricted(indices)
            };
            client_states.insert(
                client.id.clone(),
                ClientState {
                    allowed,
                    limit: client.perms.limit,
                    conn_cntr: AtomicU32::new(0),
                },
            );
        }

        let ordering = Mutex::new(OrderingState::new(upstream_addrs.len()));

        Ok(Arc::new(Self {
            upstream_addrs,
            clients: client_states,
            ordering,
        }))
    }

    pub fn acquire(self: &Arc<Self>, client_id: &str) -> Result<UpstreamHandle, ProxyError> {
        let state = self
            .clients
            .get(client_id)
            .ok_or_else(|| ProxyError::ClientNotConfigured(client_id.to_string()))?;

        let limited = state.limit > 0;
        if limited {
            let prev = state.conn_cntr.fetch_add(1, Ordering::SeqCst);
            if prev + 1 > state.limit {
                state.conn_cntr.fetch_sub(1, Ordering::SeqCst);
                return Err(ProxyError::ClientExceedsLimit(client_id.to_string()));
            }
        }

        let selected = {
            let mut ordering = self.ordering.lock().unwrap();
            let found = if state.allowed.is_unrestricted() {
                Some(ordering.order[0])
            } else {
                ordering.order.iter().copied().find(|&u| state.allowed.contains(u))
            };
            match found {
                Some(u) => {
                    ordering.bump(u);
                    u
                }
                None => {
                    if limited {
                        state.conn_cntr.fetch_sub(1, Ordering::SeqCst);
                    }
                    return Err(ProxyError::CannotGetUpstream(client_id.to_string()));
                }
            }
        };

        Ok(UpstreamHandle {
            balancer: Arc::clone(self),
            client_id: client_id.to_string(),
            upstream_idx: selected,
            addr: self.upstream_addrs[selected].clone(),
            limited,
        })
    }

    fn release(&self, client_id: &str, upstream_idx: usize, limited: bool) {
        {
            let mut ordering = self.ordering.lock().unwrap();
            ordering.unbump(upstream_idx);
        }
        if limited {
            if let Some(state) = self.clients.get(client_id) {
                state.conn_cntr.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    #[cfg(test)]
    fn cntr(&self, upstream_idx: usize) -> u32 {
        self.ordering.lock().unwrap().cntr[upstream_idx]
    }

    #[cfg(test)]
    fn order(&self) -> Vec<usize> {
        self.ordering.lock().unwrap().order.clone()
    }

    #[cfg(test)]
    fn conn_cntr(&self, client_id: &str) -> u32 {
        self.clients[client_id].conn_cntr.load(Ordering::SeqCst)
    }
}

/// An acquired slot on a selected upstream. Releases exactly once, on drop —
/// there is no separate explicit release call to forget, which is what makes
/// "release exactly once per acquire" hold on every exit path including
/// panics.
#[derive(Debug)]
pub struct UpstreamHandle {
    balancer: Arc<Balancer>,
    client_id: String,
    upstream_idx: usize,
    addr: String,
    limited: bool,
}

impl UpstreamHandle {
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Drop for UpstreamHandle {
    fn drop(&mut self) {
        self.balancer.release(&self.client_id, self.upstream_idx, self.limited);
    }
}
