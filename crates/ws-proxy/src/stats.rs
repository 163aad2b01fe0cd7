use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Process-wide connection counters, shared by every session.
#[derive(Debug, Default)]
pub struct ProxyStats {
    clients_opened: AtomicU64,
    clients_active: AtomicI64,
    clients_closed: AtomicU64,
    socket_errors: AtomicU64,
    client_resumes: AtomicU64,
    upstream_restarts: AtomicU64,
    relocations: AtomicU64,
    sessions_closed: AtomicU64,
    reconnects_rejected: AtomicU64,
}

/// Point-in-time copy of [`ProxyStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub clients_opened: u64,
    pub clients_active: i64,
    pub clients_closed: u64,
    pub socket_errors: u64,
    pub client_resumes: u64,
    pub upstream_restarts: u64,
    pub relocations: u64,
    pub sessions_closed: u64,
    pub reconnects_rejected: u64,
}

impl ProxyStats {
    pub fn client_opened(&self) {
        self.clients_opened.fetch_add(1, Ordering::Relaxed);
        self.clients_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_closed(&self) {
        self.clients_closed.fetch_add(1, Ordering::Relaxed);
        self.clients_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn client_resumed(&self) {
        self.client_resumes.fetch_add(1, Ordering::Relaxed);
        self.client_opened();
    }

    pub fn socket_error(&self) {
        self.socket_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upstream_restarted(&self) {
        self.upstream_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn relocated(&self) {
        self.relocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_rejected(&self) {
        self.reconnects_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            clients_opened: self.clients_opened.load(Ordering::Relaxed),
            clients_active: self.clients_active.load(Ordering::Relaxed),
            clients_closed: self.clients_closed.load(Ordering::Relaxed),
            socket_errors: self.socket_errors.load(Ordering::Relaxed),
            client_resumes: self.client_resumes.load(Ordering::Relaxed),
            upstream_restarts: self.upstream_restarts.load(Ordering::Relaxed),
            relocations: self.relocations.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            reconnects_rejected: self.reconnects_rejected.load(Ordering::Relaxed),
        }
    }
}
