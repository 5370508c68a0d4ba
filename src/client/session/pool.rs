use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

use uuid::Uuid;

use crate::bson::{doc, spec::BinarySubtype, Binary, Document};

/// How close to its expiry a session may be and still be reused.
const EXPIRY_BUFFER: Duration = Duration::from_secs(60);

/// A server-side logical session. Driver-generated id, server-tracked lifetime.
#[derive(Debug)]
pub(crate) struct ServerSession {
    /// The id document to attach to commands as `lsid`.
    pub(crate) id: Document,

    /// The transaction number last used with this session. Monotonic across all the
    /// client sessions this server session backs over its lifetime.
    pub(crate) txn_number: i64,

    /// When the session was last attached to a command.
    pub(crate) last_use: Instant,

    /// A session used on a connection that then saw a network error may be in an unknown
    /// state on the server. It is discarded instead of pooled.
    pub(crate) dirty: bool,
}

impl ServerSession {
    pub(crate) fn new() -> Self {
        let uuid = Uuid::new_v4();
        Self {
            id: doc! {
                "id": Binary {
                    subtype: BinarySubtype::Uuid,
                    bytes: uuid.as_bytes().to_vec(),
                },
            },
            txn_number: 0,
            last_use: Instant::now(),
            dirty: false,
        }
    }

    /// Whether the session will expire on the server within the buffer period, given the
    /// deployment's logical session timeout.
    fn is_about_to_expire(&self, logical_session_timeout: Option<Duration>) -> bool {
        match logical_session_timeout {
            Some(timeout) if timeout > EXPIRY_BUFFER => {
                self.last_use.elapsed() >= timeout - EXPIRY_BUFFER
            }
            // A timeout within the buffer means every session is already too close.
            Some(_) => true,
            // Without a known timeout, sessions are assumed fresh.
            None => false,
        }
    }
}

/// A LIFO pool of server sessions. Most-recently-returned sessions go out first so that
/// the tail of the pool ages past the server's timeout and gets pruned, instead of every
/// session being kept half-alive.
#[derive(Debug, Default)]
pub(crate) struct ServerSessionPool {
    pool: Mutex<VecDeque<ServerSession>>,
}

impl ServerSessionPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Checks out a pooled session, skipping and discarding any that are about to expire.
    /// Creates a fresh one when the pool is empty.
    pub(crate) fn check_out(&self, logical_session_timeout: Option<Duration>) -> ServerSession {
        if let Ok(mut pool) = self.pool.lock() {
            while let Some(session) = pool.pop_front() {
                if !session.is_about_to_expire(logical_session_timeout) {
                    return session;
                }
            }
        }
        ServerSession::new()
    }

    /// Returns a session to the pool. Dirty and nearly-expired sessions are dropped, and
    /// sessions at the back of the pool that have aged out are pruned.
    pub(crate) fn check_in(
        &self,
        session: ServerSession,
        logical_session_timeout: Option<Duration>,
    ) {
        let mut pool = match self.pool.lock() {
            Ok(pool) => pool,
            Err(_) => return,
        };
        while let Some(last) = pool.back() {
            if last.is_about_to_expire(logical_session_timeout) {
                pool.pop_back();
            } else {
                break;
            }
        }
        if !session.dirty && !session.is_about_to_expire(logical_session_timeout) {
            pool.push_front(session);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pool.lock().map(|pool| pool.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const TIMEOUT: Option<Duration> = Some(Duration::from_secs(30 * 60));

    #[test]
    fn sessions_are_reused_lifo() {
        let pool = ServerSessionPool::new();
        let first = pool.check_out(TIMEOUT);
        let second = pool.check_out(TIMEOUT);
        let first_id = first.id.clone();
        let second_id = second.id.clone();
        assert_ne!(first_id, second_id);

        pool.check_in(first, TIMEOUT);
        pool.check_in(second, TIMEOUT);

        assert_eq!(pool.check_out(TIMEOUT).id, second_id);
        assert_eq!(pool.check_out(TIMEOUT).id, first_id);
    }

    #[test]
    fn dirty_sessions_are_discarded() {
        let pool = ServerSessionPool::new();
        let mut session = pool.check_out(TIMEOUT);
        session.dirty = true;
        pool.check_in(session, TIMEOUT);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn expired_sessions_are_pruned() {
        let pool = ServerSessionPool::new();
        let mut old = ServerSession::new();
        // Older than the 30 minute timeout minus the one minute buffer.
        old.last_use = Instant::now() - Duration::from_secs(30 * 60);
        pool.check_in(old, TIMEOUT);
        assert_eq!(pool.len(), 0);

        let fresh = ServerSession::new();
        let fresh_id = fresh.id.clone();
        pool.check_in(fresh, TIMEOUT);
        let mut stale = ServerSession::new();
        stale.last_use = Instant::now() - Duration::from_secs(29 * 60 + 30);
        pool.check_in(stale, TIMEOUT);

        // The stale session was dropped at check-in, leaving the fresh one up front.
        assert_eq!(pool.check_out(TIMEOUT).id, fresh_id);
    }

    #[test]
    fn no_timeout_means_no_expiry() {
        let pool = ServerSessionPool::new();
        let mut session = ServerSession::new();
        session.last_use = Instant::now() - Duration::from_secs(3600);
        pool.check_in(session, None);
        assert_eq!(pool.len(), 1);
    }
}
