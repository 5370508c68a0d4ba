//! Client sessions and transactions.

pub(crate) mod pool;

use std::{sync::Arc, time::Duration};

use self::pool::{ServerSession, ServerSessionPool};
use crate::{
    bson::{doc, Document},
    cmap::conn::command::Command,
    error::{Error, Result, UNKNOWN_TRANSACTION_COMMIT_RESULT},
    sdam::Topology,
    selection_criteria::{ReadPreference, SelectionCriteria},
};

/// The state of a session's transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum TransactionState {
    /// No transaction has been started on this session.
    None,

    /// A transaction has been started but no operation has run in it yet.
    Starting,

    /// A transaction is running.
    InProgress,

    /// The transaction was committed with at least one operation in it. Committing again
    /// re-sends commitTransaction.
    Committed,

    /// The transaction was committed before any operation ran in it, so nothing was sent
    /// to the server.
    CommittedEmpty,

    /// The transaction was aborted.
    Aborted,
}

impl TransactionState {
    /// The transition taken by startTransaction.
    fn start(self) -> Result<TransactionState> {
        match self {
            TransactionState::None
            | TransactionState::Committed
            | TransactionState::CommittedEmpty
            | TransactionState::Aborted => Ok(TransactionState::Starting),
            TransactionState::Starting | TransactionState::InProgress => Err(
                Error::transaction("transaction already in progress"),
            ),
        }
    }

    /// The transition taken by commitTransaction. The boolean is whether a
    /// commitTransaction command must be sent.
    fn commit(self) -> Result<(TransactionState, bool)> {
        match self {
            TransactionState::None => Err(Error::transaction("no transaction started")),
            TransactionState::Starting | TransactionState::CommittedEmpty => {
                Ok((TransactionState::CommittedEmpty, false))
            }
            TransactionState::InProgress | TransactionState::Committed => {
                Ok((TransactionState::Committed, true))
            }
            TransactionState::Aborted => Err(Error::transaction(
                "cannot call commitTransaction after calling abortTransaction",
            )),
        }
    }

    /// The transition taken by abortTransaction. The boolean is whether an
    /// abortTransaction command must be sent.
    fn abort(self) -> Result<(TransactionState, bool)> {
        match self {
            TransactionState::None => Err(Error::transaction("no transaction started")),
            TransactionState::Starting => Ok((TransactionState::Aborted, false)),
            TransactionState::InProgress => Ok((TransactionState::Aborted, true)),
            TransactionState::Committed | TransactionState::CommittedEmpty => Err(
                Error::transaction("cannot call abortTransaction after calling commitTransaction"),
            ),
            TransactionState::Aborted => Err(Error::transaction(
                "cannot call abortTransaction twice",
            )),
        }
    }
}

/// A session for ordering operations and running transactions. Holds a pooled server
/// session for its lifetime; the server session returns to the pool when this is dropped.
///
/// A session may only be used with one operation at a time.
#[derive(Debug)]
pub struct ClientSession {
    topology: Topology,
    session_pool: Arc<ServerSessionPool>,
    server_session: ServerSession,
    logical_session_timeout: Option<Duration>,
    transaction_state: TransactionState,
}

impl ClientSession {
    pub(crate) fn new(
        topology: Topology,
        session_pool: Arc<ServerSessionPool>,
        logical_session_timeout: Option<Duration>,
    ) -> Self {
        let server_session = session_pool.check_out(logical_session_timeout);
        Self {
            topology,
            session_pool,
            server_session,
            logical_session_timeout,
            transaction_state: TransactionState::None,
        }
    }

    /// The session id attached to commands as `lsid`.
    pub fn id(&self) -> &Document {
        &self.server_session.id
    }

    /// The state of this session's transaction.
    pub fn transaction_state(&self) -> TransactionState {
        self.transaction_state
    }

    /// The transaction number for the next retryable write. Incremented once per write,
    /// not per attempt: a retry re-sends the same number so the server can deduplicate.
    pub(crate) fn next_txn_number(&mut self) -> i64 {
        self.server_session.txn_number += 1;
        self.server_session.txn_number
    }

    pub(crate) fn current_txn_number(&self) -> i64 {
        self.server_session.txn_number
    }

    /// Marks the backing server session as possibly left in an unknown state on the
    /// server; it will be discarded rather than pooled.
    pub(crate) fn mark_dirty(&mut self) {
        self.server_session.dirty = true;
    }

    pub(crate) fn is_in_transaction(&self) -> bool {
        matches!(
            self.transaction_state,
            TransactionState::Starting | TransactionState::InProgress
        )
    }

    /// Attaches this session's fields to an outgoing command and advances the transaction
    /// state: the first operation inside a transaction carries `startTransaction`.
    pub(crate) fn apply_to_command(&mut self, command: &mut Command) {
        let lsid = self.id().clone();
        command.set_session_id(lsid);
        self.server_session.last_use = std::time::Instant::now();

        match self.transaction_state {
            TransactionState::Starting => {
                command.set_txn_number(self.current_txn_number());
                command.set_start_transaction();
                command.set_autocommit();
                self.transaction_state = TransactionState::InProgress;
            }
            TransactionState::InProgress => {
                command.set_txn_number(self.current_txn_number());
                command.set_autocommit();
            }
            _ => {}
        }
    }

    /// Starts a transaction on this session. Operations run with this session will be part
    /// of it until commit or abort.
    pub fn start_transaction(&mut self) -> Result<()> {
        self.transaction_state = self.transaction_state.start()?;
        self.next_txn_number();
        Ok(())
    }

    /// Commits the session's transaction. Transient failures are retried once; errors
    /// after that carry the UnknownTransactionCommitResult label, since the server may or
    /// may not have applied the commit.
    pub async fn commit_transaction(&mut self) -> Result<()> {
        let (next_state, send) = self.transaction_state.commit()?;
        if send {
            let result = self.run_transaction_command("commitTransaction").await;
            if let Err(error) = result {
                if error.is_commit_retryable() {
                    if let Err(retry_error) =
                        self.run_transaction_command("commitTransaction").await
                    {
                        self.transaction_state = next_state;
                        return Err(retry_error.with_label(UNKNOWN_TRANSACTION_COMMIT_RESULT));
                    }
                } else {
                    self.transaction_state = next_state;
                    return Err(error);
                }
            }
        }
        self.transaction_state = next_state;
        Ok(())
    }

    /// Aborts the session's transaction. Errors from the abortTransaction command itself
    /// are swallowed: the server will clean the transaction up on its own.
    pub async fn abort_transaction(&mut self) -> Result<()> {
        let (next_state, send) = self.transaction_state.abort()?;
        if send {
            if let Err(error) = self.run_transaction_command("abortTransaction").await {
                if error.is_network_error() {
                    self.mark_dirty();
                }
            }
        }
        self.transaction_state = next_state;
        Ok(())
    }

    async fn run_transaction_command(&mut self, name: &str) -> Result<()> {
        let mut command = Command::new(name, "admin", doc! { name: 1 });
        command.set_session_id(self.id().clone());
        command.set_txn_number(self.current_txn_number());
        command.set_autocommit();

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let server = self.topology.select_server(&criteria).await?;
        let response = server.run_command(command).await;

        match response {
            Ok(response) => response.command_error(),
            Err(error) => {
                if error.is_network_error() {
                    self.mark_dirty();
                }
                Err(error)
            }
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        let session = std::mem::replace(&mut self.server_session, ServerSession::new());
        self.session_pool
            .check_in(session, self.logical_session_timeout);
    }
}

#[cfg(test)]
mod test {
    use super::TransactionState::*;
    use super::*;

    #[test]
    fn start_transitions() {
        for state in [None, Committed, CommittedEmpty, Aborted] {
            assert_eq!(state.start().unwrap(), Starting);
        }
        assert!(Starting.start().is_err());
        assert!(InProgress.start().is_err());
    }

    #[test]
    fn commit_transitions() {
        assert!(None.commit().is_err());
        assert_eq!(Starting.commit().unwrap(), (CommittedEmpty, false));
        assert_eq!(InProgress.commit().unwrap(), (Committed, true));
        // Committing again re-sends the command.
        assert_eq!(Committed.commit().unwrap(), (Committed, true));
        assert_eq!(CommittedEmpty.commit().unwrap(), (CommittedEmpty, false));
        assert!(Aborted.commit().is_err());
    }

    #[test]
    fn abort_transitions() {
        assert!(None.abort().is_err());
        assert_eq!(Starting.abort().unwrap(), (Aborted, false));
        assert_eq!(InProgress.abort().unwrap(), (Aborted, true));
        assert!(Committed.abort().is_err());
        assert!(CommittedEmpty.abort().is_err());
        assert!(Aborted.abort().is_err());
    }
}
