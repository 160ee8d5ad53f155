//! Registry of supervised sessions keyed by credential.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::credential::Credential;
use super::session::{Readiness, Session, SessionContext};

/// Owns every session. Uses `DashMap` so lookups from request handlers and
/// the dispatcher never contend on a global lock; creation goes through the
/// entry API so a credential never gets two live sessions.
pub struct SessionRegistry {
    sessions: DashMap<Credential, Arc<Session>>,
    ctx: SessionContext,
}

impl SessionRegistry {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            sessions: DashMap::new(),
            ctx,
        }
    }

    /// Return the session for `credential`, creating and starting it if there
    /// is none. A failed session is replaced, so submitting the credential
    /// again retries the connection.
    pub fn get_or_create(&self, credential: &Credential) -> Arc<Session> {
        let (session, created) = match self.sessions.entry(credential.clone()) {
            Entry::Occupied(mut entry) if entry.get().readiness() == Readiness::Failed => {
                let session = Session::new(credential.clone());
                entry.insert(Arc::clone(&session));
                (session, true)
            }
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let session = Session::new(credential.clone());
                entry.insert(Arc::clone(&session));
                (session, true)
            }
        };

        // Started outside the shard lock.
        if created {
            tracing::info!(credential = %credential, "starting session");
            session.start(self.ctx.clone());
        }
        session
    }

    pub fn get(&self, credential: &Credential) -> Option<Arc<Session>> {
        self.sessions.get(credential).map(|s| Arc::clone(s.value()))
    }

    /// Snapshot of every registered session.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|s| Arc::clone(s.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Stop every session.
    pub async fn shutdown(&self) {
        for session in self.sessions() {
            session.shutdown().await;
        }
    }
}
