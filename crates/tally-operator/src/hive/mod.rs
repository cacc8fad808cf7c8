//! Hive DDL client
//!
//! A single lazily-opened HiveServer2 session behind a mutex. Connection
//! acquisition backs off 15 s at a time up to the 3-minute startup ceiling
//! and aborts on the shutdown signal. A query that hits EOF or a broken
//! pipe closes the session and retries on a fresh one, up to 3 attempts
//! total; any other error propagates without touching the session.

pub mod thrift;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use tally_common::config::{CONN_BACKOFF, MAX_CONN_WAIT_TIME};
use tally_common::{Clock, Error, Result};

/// One live Hive session.
#[async_trait]
pub trait HiveConnection: Send {
    async fn execute(&mut self, query: &str) -> Result<()>;

    /// Best-effort close; errors are swallowed.
    async fn close(&mut self);
}

/// Opens new Hive sessions.
#[async_trait]
pub trait HiveConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn HiveConnection>>;
}

/// The narrow query surface the reconcilers and collectors depend on.
#[async_trait]
pub trait HiveQueryer: Send + Sync {
    async fn query(&self, query: &str) -> Result<()>;
}

const MAX_QUERY_ATTEMPTS: u32 = 3;

pub struct HiveClient {
    connector: Box<dyn HiveConnector>,
    session: Mutex<Option<Box<dyn HiveConnection>>>,
    log_queries: bool,
    clock: Arc<dyn Clock>,
    stop: watch::Receiver<bool>,
}

impl HiveClient {
    pub fn new(
        connector: Box<dyn HiveConnector>,
        log_queries: bool,
        clock: Arc<dyn Clock>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            connector,
            session: Mutex::new(None),
            log_queries,
            clock,
            stop,
        }
    }

    /// Open the session eagerly so startup fails fast when Hive never
    /// becomes reachable.
    pub async fn warm_up(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_none() {
            *session = Some(self.connect_with_backoff().await?);
        }
        Ok(())
    }

    pub async fn close(&self) {
        let mut session = self.session.lock().await;
        if let Some(mut conn) = session.take() {
            conn.close().await;
        }
    }

    async fn connect_with_backoff(&self) -> Result<Box<dyn HiveConnection>> {
        let start = self.clock.now();
        let mut stop = self.stop.clone();
        debug!("getting hive connection");
        loop {
            if *stop.borrow() {
                return Err(Error::Shutdown);
            }
            match self.connector.connect().await {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    let waited = self
                        .clock
                        .now()
                        .signed_duration_since(start)
                        .to_std()
                        .unwrap_or_default();
                    if waited > MAX_CONN_WAIT_TIME {
                        debug!(error = %err, "attempts timed out, failed to get hive connection");
                        return Err(err);
                    }
                    debug!(error = %err, "error connecting to hive, backing off");
                    tokio::select! {
                        _ = self.clock.sleep(CONN_BACKOFF) => {}
                        _ = stop.changed() => return Err(Error::Shutdown),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl HiveQueryer for HiveClient {
    async fn query(&self, query: &str) -> Result<()> {
        // Callers serialize on the session mutex: one outstanding query
        // per client instance.
        let mut session = self.session.lock().await;
        if self.log_queries {
            info!(query, "executing hive query");
        }
        for _ in 0..MAX_QUERY_ATTEMPTS {
            if session.is_none() {
                *session = Some(self.connect_with_backoff().await?);
            }
            let conn = match session.as_mut() {
                Some(conn) => conn,
                None => continue,
            };
            match conn.execute(query).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_connection_reset() => {
                    debug!(error = %err, "hive connection dropped, reconnecting and retrying");
                    if let Some(mut dead) = session.take() {
                        dead.close().await;
                    }
                }
                // The session is fine; the query itself failed.
                Err(err) => return Err(err),
            }
        }
        if let Some(mut dead) = session.take() {
            dead.close().await;
        }
        Err(Error::Transient(
            "unable to re-establish hive connection after repeated resets".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::io;
    use tally_common::clock::FakeClock;

    /// Connection that fails its first `fail_first` executes with a broken
    /// pipe, then succeeds, recording every statement it ran.
    struct ScriptedConnection {
        state: Arc<SyncMutex<ScriptState>>,
    }

    #[derive(Default)]
    struct ScriptState {
        fail_next: u32,
        connects: u32,
        executed: Vec<String>,
        closed: u32,
    }

    struct ScriptedConnector {
        state: Arc<SyncMutex<ScriptState>>,
        refuse: bool,
    }

    #[async_trait]
    impl HiveConnector for ScriptedConnector {
        async fn connect(&self) -> Result<Box<dyn HiveConnection>> {
            if self.refuse {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "refused",
                )));
            }
            self.state.lock().connects += 1;
            Ok(Box::new(ScriptedConnection {
                state: Arc::clone(&self.state),
            }))
        }
    }

    #[async_trait]
    impl HiveConnection for ScriptedConnection {
        async fn execute(&mut self, query: &str) -> Result<()> {
            let mut state = self.state.lock();
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "pipe closed",
                )));
            }
            state.executed.push(query.to_string());
            Ok(())
        }

        async fn close(&mut self) {
            self.state.lock().closed += 1;
        }
    }

    fn client_with(
        state: Arc<SyncMutex<ScriptState>>,
        refuse: bool,
    ) -> (HiveClient, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
        let client = HiveClient::new(
            Box::new(ScriptedConnector { state, refuse }),
            false,
            clock,
            rx,
        );
        (client, tx)
    }

    #[tokio::test]
    async fn broken_pipe_reconnects_once_and_succeeds() {
        let state = Arc::new(SyncMutex::new(ScriptState {
            fail_next: 1,
            ..Default::default()
        }));
        let (client, _stop_tx) = client_with(Arc::clone(&state), false);

        client.query("CREATE TABLE t (x double)").await.unwrap();

        let state = state.lock();
        assert_eq!(state.connects, 2, "exactly one reconnect");
        assert_eq!(state.executed, vec!["CREATE TABLE t (x double)"]);
        assert_eq!(state.closed, 1);
    }

    #[tokio::test]
    async fn repeated_resets_exhaust_the_retry_budget() {
        let state = Arc::new(SyncMutex::new(ScriptState {
            fail_next: 10,
            ..Default::default()
        }));
        let (client, _stop_tx) = client_with(Arc::clone(&state), false);

        let err = client.query("CREATE TABLE t (x double)").await.unwrap_err();
        assert!(matches!(err, Error::Transient(_)));
        assert_eq!(state.lock().connects, MAX_QUERY_ATTEMPTS);
    }

    #[tokio::test]
    async fn query_errors_keep_the_session_open() {
        struct RejectingConnection;
        #[async_trait]
        impl HiveConnection for RejectingConnection {
            async fn execute(&mut self, _query: &str) -> Result<()> {
                Err(Error::QueryFailed("table exists with different schema".into()))
            }
            async fn close(&mut self) {}
        }
        struct RejectingConnector;
        #[async_trait]
        impl HiveConnector for RejectingConnector {
            async fn connect(&self) -> Result<Box<dyn HiveConnection>> {
                Ok(Box::new(RejectingConnection))
            }
        }

        let (_tx, rx) = watch::channel(false);
        let client = HiveClient::new(
            Box::new(RejectingConnector),
            false,
            Arc::new(FakeClock::new(chrono::Utc::now())),
            rx,
        );
        let err = client.query("bad ddl").await.unwrap_err();
        assert!(matches!(err, Error::QueryFailed(_)));
        // Session survives for the next query.
        assert!(client.session.lock().await.is_some());
    }

    #[tokio::test]
    async fn startup_wait_hits_the_ceiling() {
        // The fake clock advances 15 s per backoff sleep, so the 3-minute
        // ceiling is crossed after a bounded number of refused attempts.
        let state = Arc::new(SyncMutex::new(ScriptState::default()));
        let (client, _stop_tx) = client_with(state, true);

        let err = client.warm_up().await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn shutdown_aborts_connection_backoff() {
        let state = Arc::new(SyncMutex::new(ScriptState::default()));
        let (tx, rx) = watch::channel(false);
        let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
        let client = HiveClient::new(
            Box::new(ScriptedConnector {
                state,
                refuse: true,
            }),
            false,
            clock,
            rx,
        );
        tx.send(true).unwrap();
        let err = client.warm_up().await.unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }
}
