//! Transactions on a blocking connection.
//!
//! The connection's transacting flag is set by [`begin`](MySqlConnection::begin)
//! and cleared by [`commit`](MySqlConnection::commit) or
//! [`rollback`](MySqlConnection::rollback). [`transaction`](MySqlConnection::transaction)
//! wraps a closure: it commits when the closure succeeds and rolls back when
//! the closure or the commit fails, returning the original error.
//!
//! [`EventConnection`] offers the same operations, resolving [`Deferred`]
//! handles instead of returning.

use sqlwire_core::{Error, Result, TransactionError, TransactionErrorKind};
use tracing::{debug, warn};

use crate::connection::MySqlConnection;
use crate::event::{Deferred, EventConnection, EventTransport, deferred};
use crate::transport::Transport;

pub const START_TRANSACTION: &str = "START TRANSACTION";
pub const COMMIT: &str = "COMMIT";
pub const ROLLBACK: &str = "ROLLBACK";

pub(crate) fn already_started() -> Error {
    Error::Transaction(TransactionError {
        kind: TransactionErrorKind::AlreadyStarted,
        message: "a transaction is already in progress".to_string(),
    })
}

pub(crate) fn not_started() -> Error {
    Error::Transaction(TransactionError {
        kind: TransactionErrorKind::NotStarted,
        message: "no transaction in progress".to_string(),
    })
}

impl<T: Transport> MySqlConnection<T> {
    /// Issue `START TRANSACTION` and mark the connection transacting.
    pub fn begin(&self) -> Result<()> {
        if self.is_transacting() {
            return Err(already_started());
        }
        self.execute(START_TRANSACTION)?;
        self.set_transacting(true);
        debug!(connection_id = self.connection_id(), "transaction started");
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        self.finish_transaction(COMMIT)
    }

    pub fn rollback(&self) -> Result<()> {
        self.finish_transaction(ROLLBACK)
    }

    /// Run `body` inside a transaction.
    ///
    /// `body` receives this same connection. On success the transaction is
    /// committed; if `body` or the commit fails, `ROLLBACK` is issued and the
    /// first error is returned. The connection is never left transacting.
    pub fn transaction<R>(&self, body: impl FnOnce(&Self) -> Result<R>) -> Result<R> {
        self.begin()?;
        let outcome = body(self).and_then(|value| self.commit().map(|()| value));
        match outcome {
            Ok(value) => Ok(value),
            Err(err) => {
                if self.is_transacting() {
                    if let Err(rollback_err) = self.rollback() {
                        warn!(error = %rollback_err, "rollback failed");
                    }
                }
                self.set_transacting(false);
                Err(err)
            }
        }
    }

    fn finish_transaction(&self, sql: &'static str) -> Result<()> {
        if !self.is_transacting() {
            return Err(not_started());
        }
        let result = self.execute(sql).map(|_| ());
        // A failed COMMIT still leaves the transaction open for ROLLBACK
        if result.is_ok() || sql == ROLLBACK {
            self.set_transacting(false);
        }
        debug!(connection_id = self.connection_id(), sql, ok = result.is_ok(), "transaction finished");
        result
    }
}

impl<T: EventTransport> EventConnection<T> {
    /// Queue `START TRANSACTION`. The connection counts as transacting from
    /// this call on, so it is not reported free while the statement waits.
    pub fn begin(&self) -> Deferred<Result<()>> {
        if self.is_transacting() {
            return Deferred::ready(Err(already_started()));
        }
        self.set_transacting(true);
        let weak = self.downgrade();
        self.query(START_TRANSACTION).map(move |result| {
            if result.is_err() {
                if let Some(conn) = Self::upgrade(&weak) {
                    conn.set_transacting(false);
                }
            }
            result.map(|_| ())
        })
    }

    pub fn commit(&self) -> Deferred<Result<()>> {
        self.finish_transaction(COMMIT)
    }

    pub fn rollback(&self) -> Deferred<Result<()>> {
        self.finish_transaction(ROLLBACK)
    }

    /// Run `body` inside a transaction.
    ///
    /// Once `body`'s handle resolves `Ok` the transaction is committed. If
    /// `body` or the commit fails, `ROLLBACK` is queued and the returned
    /// handle resolves with the first error after the rollback finishes.
    pub fn transaction(
        &self,
        body: impl FnOnce(&Self) -> Deferred<Result<()>> + 'static,
    ) -> Deferred<Result<()>> {
        let (resolver, outcome) = deferred();
        let weak = self.downgrade();
        self.begin().then(move |started| {
            if let Err(e) = started {
                return resolver.resolve(Err(e));
            }
            let Some(conn) = Self::upgrade(&weak) else {
                return resolver.resolve(Err(Error::already_closed()));
            };
            body(&conn).then(move |result| {
                let committed = match (result, Self::upgrade(&weak)) {
                    (Ok(()), Some(conn)) => conn.commit(),
                    (Ok(()), None) => Deferred::ready(Err(Error::already_closed())),
                    (Err(e), _) => Deferred::ready(Err(e)),
                };
                committed.then(move |result| {
                    let err = match result {
                        Ok(()) => return resolver.resolve(Ok(())),
                        Err(err) => err,
                    };
                    match Self::upgrade(&weak) {
                        Some(conn) => conn.rollback().then(move |rolled_back| {
                            if let Err(rollback_err) = rolled_back {
                                warn!(error = %rollback_err, "rollback failed");
                            }
                            resolver.resolve(Err(err));
                        }),
                        None => resolver.resolve(Err(err)),
                    }
                });
            });
        });
        outcome
    }

    fn finish_transaction(&self, sql: &'static str) -> Deferred<Result<()>> {
        if !self.is_transacting() {
            return Deferred::ready(Err(not_started()));
        }
        let weak = self.downgrade();
        self.query(sql).map(move |result| {
            // Runs before the connection is released, so freed hooks see the flag
            if result.is_ok() || sql == ROLLBACK {
                if let Some(conn) = Self::upgrade(&weak) {
                    conn.set_transacting(false);
                }
            }
            debug!(sql, ok = result.is_ok(), "transaction finished");
            result.map(|_| ())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MySqlConfig;
    use crate::connection::tests::{Scripted, err_payload, login_bytes, ok_payload};
    use crate::protocol::{Command, frame_payload};

    fn connect(transport: &Scripted) -> MySqlConnection<Scripted> {
        transport.push(login_bytes());
        let conn = MySqlConnection::with_transport(transport.clone(), MySqlConfig::new()).unwrap();
        transport.take_written();
        conn
    }

    fn ok(transport: &Scripted) {
        transport.push(frame_payload(&ok_payload(1, 0, 3), 1));
    }

    /// COM_QUERY statements written, in order.
    fn statements(written: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        let mut rest = written;
        while rest.len() >= 4 {
            let len = usize::from(rest[0]) | usize::from(rest[1]) << 8 | usize::from(rest[2]) << 16;
            let payload = &rest[4..4 + len];
            if payload.first() == Some(&(Command::Query as u8)) {
                out.push(String::from_utf8_lossy(&payload[1..]).into_owned());
            }
            rest = &rest[4 + len..];
        }
        out
    }

    #[test]
    fn test_commit_on_success() {
        let transport = Scripted::default();
        let conn = connect(&transport);
        ok(&transport);
        ok(&transport);
        ok(&transport);

        let affected = conn
            .transaction(|conn| Ok(conn.execute("INSERT INTO t VALUES (1)")?.affected_rows))
            .unwrap();
        assert_eq!(affected, 1);
        assert!(!conn.is_transacting());
        assert_eq!(
            statements(&transport.take_written()),
            vec![START_TRANSACTION, "INSERT INTO t VALUES (1)", COMMIT]
        );
    }

    #[test]
    fn test_rollback_on_server_error() {
        let transport = Scripted::default();
        let conn = connect(&transport);
        ok(&transport);
        ok(&transport);
        transport.push(frame_payload(
            &err_payload(1062, "23000", "Duplicate entry '1' for key 'PRIMARY'"),
            1,
        ));
        ok(&transport);

        let err = conn
            .transaction(|conn| {
                conn.execute("INSERT INTO t VALUES (1)")?;
                assert!(conn.is_transacting());
                conn.execute("INSERT INTO t VALUES (1)")?;
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err.error_code(), Some(1062));
        assert!(!conn.is_transacting());
        assert_eq!(
            statements(&transport.take_written()),
            vec![
                START_TRANSACTION,
                "INSERT INTO t VALUES (1)",
                "INSERT INTO t VALUES (1)",
                ROLLBACK
            ]
        );
    }

    #[test]
    fn test_rollback_when_commit_fails() {
        let transport = Scripted::default();
        let conn = connect(&transport);
        ok(&transport);
        transport.push(frame_payload(&err_payload(1213, "40001", "Deadlock found"), 1));
        ok(&transport);

        let err = conn.transaction(|_| Ok(())).unwrap_err();
        assert!(err.is_retryable());
        assert!(!conn.is_transacting());
        assert_eq!(
            statements(&transport.take_written()),
            vec![START_TRANSACTION, COMMIT, ROLLBACK]
        );
    }

    #[test]
    fn test_begin_then_command_on_same_connection() {
        let transport = Scripted::default();
        let conn = connect(&transport);
        ok(&transport);
        conn.begin().unwrap();
        assert!(conn.is_transacting());
        assert!(transport.take_written().ends_with(b"START TRANSACTION"));

        ok(&transport);
        conn.execute("DELETE FROM t").unwrap();
        assert!(transport.take_written().ends_with(b"DELETE FROM t"));
        assert!(conn.is_transacting());
    }

    #[test]
    fn test_flag_errors() {
        let transport = Scripted::default();
        let conn = connect(&transport);
        assert!(matches!(
            conn.commit(),
            Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::NotStarted,
                ..
            }))
        ));

        ok(&transport);
        conn.begin().unwrap();
        assert!(matches!(
            conn.begin(),
            Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::AlreadyStarted,
                ..
            }))
        ));
        ok(&transport);
        conn.rollback().unwrap();
        assert!(!conn.is_transacting());
    }

    mod event {
        use super::*;
        use crate::event::connection::tests::connected;
        use crate::event::LoopbackPeer;
        use std::cell::{Cell, RefCell};
        use std::rc::Rc;

        fn reply_ok(peer: &LoopbackPeer) {
            peer.deliver(&frame_payload(&ok_payload(1, 0, 3), 1));
        }

        #[test]
        fn test_event_transaction_commits() {
            let (conn, peer) = connected();
            let mut done = conn.transaction(|conn| {
                conn.query("INSERT INTO t VALUES (1)").map(|r| r.map(|_| ()))
            });
            assert!(conn.is_transacting());
            for _ in 0..3 {
                reply_ok(&peer);
            }
            assert!(done.try_take().unwrap().is_ok());
            assert!(!conn.is_transacting());
            assert_eq!(
                statements(&peer.take_written()),
                vec![START_TRANSACTION, "INSERT INTO t VALUES (1)", COMMIT]
            );
        }

        #[test]
        fn test_event_transaction_rolls_back() {
            let (conn, peer) = connected();
            let freed = Rc::new(Cell::new(0));
            let f = Rc::clone(&freed);
            conn.on_freed(move || f.set(f.get() + 1));

            let mut done = conn.transaction(|conn| {
                conn.query("INSERT INTO t VALUES (1)").map(|r| r.map(|_| ()))
            });
            reply_ok(&peer);
            peer.deliver(&frame_payload(&err_payload(1062, "23000", "Duplicate entry"), 1));
            assert_eq!(freed.get(), 0);
            reply_ok(&peer);

            let err = done.try_take().unwrap().unwrap_err();
            assert_eq!(err.error_code(), Some(1062));
            assert!(!conn.is_transacting());
            assert_eq!(freed.get(), 1);
            assert_eq!(
                statements(&peer.take_written()),
                vec![START_TRANSACTION, "INSERT INTO t VALUES (1)", ROLLBACK]
            );
        }

        #[test]
        fn test_event_flag_errors() {
            let (conn, peer) = connected();
            let mut commit = conn.commit();
            assert!(matches!(
                commit.try_take(),
                Some(Err(Error::Transaction(TransactionError {
                    kind: TransactionErrorKind::NotStarted,
                    ..
                })))
            ));
            let _begun = conn.begin();
            let mut again = conn.begin();
            assert!(matches!(
                again.try_take(),
                Some(Err(Error::Transaction(TransactionError {
                    kind: TransactionErrorKind::AlreadyStarted,
                    ..
                })))
            ));
            reply_ok(&peer);
            let seen: Rc<RefCell<Option<Result<()>>>> = Rc::default();
            let s = Rc::clone(&seen);
            conn.rollback().then(move |r| *s.borrow_mut() = Some(r));
            reply_ok(&peer);
            assert!(matches!(*seen.borrow(), Some(Ok(()))));
            assert!(!conn.is_transacting());
        }
    }
}
