//! Long-running task that keeps one authenticated session to the collection
//! service and drains the route cache through it.
//!
//! Exactly one call is outstanding at any time. Any fault while logging in or
//! submitting closes the connection and starts over with a backoff delay; only
//! shutdown ends the task.

mod error;

pub use error::ConnectorError;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use strum_macros::Display;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{Config, Credential};
use crate::protocol::{Call, CallPayload, Message, ResponsePayload, Session};
use crate::routecache::{RouteCache, RouteCacheError};
use crate::shutdown::{self, Shutdown, ShutdownTrigger};
use crate::status::StatusReporter;
use crate::transport::{Backoff, Transport};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectorState {
    Idle,
    Connecting,
    Authenticating,
    Ready,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    pub addr: String,
    pub min_reconnect_time: Duration,
    pub max_reconnect_time: Duration,
}

impl From<&Config> for ConnectorSettings {
    fn from(config: &Config) -> Self {
        Self {
            addr: config.server_addr(),
            min_reconnect_time: config.min_reconnect_time,
            max_reconnect_time: config.max_reconnect_time,
        }
    }
}

pub struct ConnectorHandle {
    trigger: ShutdownTrigger,
    state: watch::Receiver<ConnectorState>,
    join: JoinHandle<()>,
}

impl ConnectorHandle {
    pub fn state(&self) -> watch::Receiver<ConnectorState> {
        self.state.clone()
    }

    /// Requests shutdown and waits for the task to finish.
    pub async fn stop(self) {
        info!("Stopping connector");
        self.trigger.trigger();
        if let Err(e) = self.join.await {
            warn!("Connector task ended abnormally: {}", e);
        }
    }
}

pub struct Connector {
    cache: Arc<RouteCache>,
    settings: ConnectorSettings,
    credential: Credential,
    status: StatusReporter,
    shutdown: Shutdown,
    state: watch::Sender<ConnectorState>,
    last_call_id: u64,
}

impl Connector {
    /// Starts the connector on the current tokio runtime.
    pub fn spawn(
        cache: Arc<RouteCache>,
        settings: ConnectorSettings,
        credential: Credential,
        status: StatusReporter,
    ) -> ConnectorHandle {
        let (trigger, shutdown) = shutdown::channel();
        let (state, state_rx) = watch::channel(ConnectorState::Idle);
        let connector = Connector {
            cache,
            settings,
            credential,
            status,
            shutdown,
            state,
            last_call_id: 0,
        };
        let join = tokio::spawn(connector.run());
        ConnectorHandle {
            trigger,
            state: state_rx,
            join,
        }
    }

    fn set_state(&self, state: ConnectorState) {
        debug!("Connector state: {}", state);
        self.state.send_replace(state);
    }

    async fn run(mut self) {
        info!("Connector started for {}", self.settings.addr);
        if let Err(e) = self.refresh_stats().await {
            warn!("Unable to read pending statistics: {}", e);
        }

        let transport = Transport::new(
            self.settings.addr.clone(),
            self.status.clone(),
            self.shutdown.clone(),
        );
        let mut session = Session::new(transport);
        let mut backoff = Backoff::new(
            self.settings.min_reconnect_time,
            self.settings.max_reconnect_time,
        );
        let mut delay = None;

        while !self.shutdown.is_triggered() {
            if let Some(delay) = delay.take() {
                info!("Reconnecting in {:?}", delay);
                if self.pause(delay).await.is_err() {
                    break;
                }
            }

            match self.serve(&mut session, &mut backoff).await {
                Err(ConnectorError::Cancelled) => break,
                Err(e) => {
                    warn!("{} in connector", e);
                    session.close();
                    self.status.set_phase(e.to_string());
                    self.set_state(ConnectorState::Connecting);
                    delay = Some(backoff.failure());
                }
                Ok(never) => match never {},
            }
        }

        session.close();
        self.set_state(ConnectorState::Cancelled);
        info!("Connector exiting");
    }

    /// One connection lifetime: connect, log in, then submit until a fault.
    async fn serve(
        &mut self,
        session: &mut Session,
        backoff: &mut Backoff,
    ) -> Result<Infallible, ConnectorError> {
        self.set_state(ConnectorState::Connecting);
        session
            .connect()
            .await
            .map_err(|e| self.cancelled_or(e.into()))?;

        self.set_state(ConnectorState::Authenticating);
        self.login(session).await?;
        backoff.reset();
        self.status.set_phase("Logged in");

        self.set_state(ConnectorState::Ready);
        loop {
            if self.shutdown.is_triggered() {
                return Err(ConnectorError::Cancelled);
            }
            self.send_tracks(session).await?;
        }
    }

    async fn login(&mut self, session: &mut Session) -> Result<(), ConnectorError> {
        let api_key = loop {
            if let Some(key) = self.credential.get() {
                break key;
            }
            debug!("Waiting for an API key");
            self.pause(POLL_INTERVAL).await?;
        };

        info!("Connector logging in");
        self.call(session, CallPayload::Login { api_key }).await?;
        Ok(())
    }

    /// Submits the oldest pending batch, or idles when there is none.
    async fn send_tracks(&mut self, session: &mut Session) -> Result<(), ConnectorError> {
        let batch = self
            .with_cache(|cache| cache.retrieve_oldest_pending_batch())
            .await?;

        let Some(batch) = batch else {
            self.refresh_stats().await?;
            return self.pause(POLL_INTERVAL).await;
        };

        debug!(
            "Sending {} points for track {}",
            batch.points.len(),
            batch.track
        );
        self.call(session, CallPayload::Submit(batch.to_submit()))
            .await?;

        let marked = self
            .with_cache(move |cache| cache.mark_sent(&batch))
            .await?;
        info!("Tracks sent, {} points acknowledged", marked);
        self.refresh_stats().await?;
        Ok(())
    }

    /// Sends one call and waits for its response. The response must carry the
    /// same id and the payload kind matching the call.
    async fn call(
        &mut self,
        session: &mut Session,
        payload: CallPayload,
    ) -> Result<ResponsePayload, ConnectorError> {
        self.last_call_id += 1;
        let id = self.last_call_id;
        let expected = payload.expected_response();

        session
            .send(&Message::Call(Call { id, payload }))
            .await
            .map_err(|e| self.cancelled_or(e.into()))?;
        let message = session
            .receive_one()
            .await
            .map_err(|e| self.cancelled_or(e.into()))?;

        let response = match message {
            Message::Response(response) => response,
            Message::Call(call) => return Err(ConnectorError::UnexpectedCall { id: call.id }),
        };
        if response.id != id {
            return Err(ConnectorError::CallIdMismatch {
                expected: id,
                got: response.id,
            });
        }

        match response.payload {
            ResponsePayload::Error { message } => Err(ConnectorError::Remote(message)),
            payload if payload.kind() == expected => Ok(payload),
            payload => Err(ConnectorError::WrongResponse {
                expected,
                got: payload.kind(),
            }),
        }
    }

    async fn refresh_stats(&self) -> Result<(), ConnectorError> {
        let stats = self.with_cache(|cache| cache.pending_stats()).await?;
        if self.status.set_stats(stats) {
            debug!(
                "Pending: {} datapoints in {} tracks",
                stats.unsent_datapoints, stats.unsent_tracks
            );
        }
        Ok(())
    }

    /// Runs a route cache operation off the async runtime.
    async fn with_cache<T, F>(&self, op: F) -> Result<T, ConnectorError>
    where
        F: FnOnce(&RouteCache) -> Result<T, RouteCacheError> + Send + 'static,
        T: Send + 'static,
    {
        let cache = Arc::clone(&self.cache);
        let result = tokio::task::spawn_blocking(move || op(&cache))
            .await
            .map_err(|e| ConnectorError::Task(e.to_string()))?;
        Ok(result?)
    }

    /// Sleeps unless shutdown is requested first.
    async fn pause(&self, duration: Duration) -> Result<(), ConnectorError> {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = shutdown.triggered() => Err(ConnectorError::Cancelled),
        }
    }

    fn cancelled_or(&self, err: ConnectorError) -> ConnectorError {
        if self.shutdown.is_triggered() {
            ConnectorError::Cancelled
        } else {
            err
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::error::CodecError;
    use crate::protocol::messages::Response;
    use crate::protocol::{codec, Submit};
    use crate::routecache::types::Position;
    use crate::routecache::Observation;
    use chrono::{TimeZone, Utc};
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Instant;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use uuid::Uuid;

    const WAIT: Duration = Duration::from_secs(10);

    struct Fixture {
        _dir: TempDir,
        cache: Arc<RouteCache>,
        listener: TcpListener,
        settings: ConnectorSettings,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let migrations = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
        let db = dir.path().join("cache.sqlite3");
        let cache = Arc::new(RouteCache::init(&db, &migrations).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let settings = ConnectorSettings {
            addr: listener.local_addr().unwrap().to_string(),
            min_reconnect_time: Duration::from_millis(20),
            max_reconnect_time: Duration::from_millis(100),
        };
        Fixture {
            _dir: dir,
            cache,
            listener,
            settings,
        }
    }

    fn insert_track(cache: &RouteCache, track: Uuid, offsets: &[i64]) {
        for (i, offset) in offsets.iter().enumerate() {
            let millis = 1_700_000_000_000 + offset;
            cache
                .insert(&Observation {
                    target_id: track,
                    timestamp: Utc.timestamp_millis_opt(millis).unwrap(),
                    position: Position {
                        latitude: 60.0 + i as f64 / 100.0,
                        longitude: 25.0 + i as f64 / 100.0,
                    },
                    relative: None,
                    speed_over_ground: None,
                    course_over_ground_true: None,
                    name: None,
                    status: None,
                })
                .unwrap();
        }
    }

    async fn accept(listener: &TcpListener) -> TcpStream {
        timeout(WAIT, listener.accept()).await.unwrap().unwrap().0
    }

    /// Reads one record; `None` when the client closed the connection.
    async fn read_message(sock: &mut TcpStream, buf: &mut Vec<u8>) -> Option<Message> {
        loop {
            match codec::decode(buf) {
                Ok((message, used)) => {
                    buf.drain(..used);
                    return Some(message);
                }
                Err(CodecError::Truncated) => {}
                Err(e) => panic!("client sent garbage: {e}"),
            }
            let mut chunk = [0u8; 1024];
            let n = timeout(WAIT, sock.read(&mut chunk)).await.unwrap().ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn reply(sock: &mut TcpStream, id: u64, payload: ResponsePayload) {
        let message = Message::Response(Response { id, payload });
        let bytes = codec::encode(&message).unwrap();
        sock.write_all(&bytes).await.unwrap();
    }

    fn expect_call(message: Option<Message>) -> Call {
        match message {
            Some(Message::Call(call)) => call,
            other => panic!("expected a call, got {other:?}"),
        }
    }

    async fn login(sock: &mut TcpStream, buf: &mut Vec<u8>, key: &str) -> u64 {
        let call = expect_call(read_message(sock, buf).await);
        assert_eq!(
            call.payload,
            CallPayload::Login {
                api_key: key.into()
            }
        );
        reply(sock, call.id, ResponsePayload::Login).await;
        call.id
    }

    async fn wait_for_state(handle: &ConnectorHandle, wanted: ConnectorState) {
        let mut rx = handle.state();
        timeout(WAIT, rx.wait_for(|s| *s == wanted))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn submits_batch_and_marks_it_sent() {
        let f = fixture().await;
        let track = Uuid::new_v4();
        insert_track(&f.cache, track, &[0, 1000, 2000]);

        let status = StatusReporter::new(None);
        let handle = Connector::spawn(
            f.cache.clone(),
            f.settings.clone(),
            Credential::new(Some("key".into())),
            status.clone(),
        );

        let mut sock = accept(&f.listener).await;
        let mut buf = Vec::new();
        let login_id = login(&mut sock, &mut buf, "key").await;

        let call = expect_call(read_message(&mut sock, &mut buf).await);
        assert!(call.id > login_id);
        let CallPayload::Submit(Submit { uuid, start, route }) = call.payload else {
            panic!("expected submit");
        };
        assert_eq!(uuid, track.to_string());
        assert_eq!(start, 1_700_000_000_000);
        let offsets: Vec<i64> = route.iter().map(|p| p.timestamp).collect();
        assert_eq!(offsets, vec![0, 1000, 2000]);
        reply(&mut sock, call.id, ResponsePayload::Submit).await;

        timeout(WAIT, async {
            while f.cache.pending_stats().unwrap().unsent_datapoints > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        wait_for_state(&handle, ConnectorState::Ready).await;

        let drained = "0 unsent tracks totalling 0 unsent datapoints";
        timeout(WAIT, async {
            while !status.current().contains(drained) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        handle.stop().await;
    }

    #[tokio::test]
    async fn wrong_call_id_drops_session_without_marking() {
        let f = fixture().await;
        let track = Uuid::new_v4();
        insert_track(&f.cache, track, &[0, 100]);

        let handle = Connector::spawn(
            f.cache.clone(),
            f.settings.clone(),
            Credential::new(Some("key".into())),
            StatusReporter::new(None),
        );

        let mut sock = accept(&f.listener).await;
        let mut buf = Vec::new();
        login(&mut sock, &mut buf, "key").await;
        let call = expect_call(read_message(&mut sock, &mut buf).await);
        reply(&mut sock, call.id + 100, ResponsePayload::Submit).await;

        // The client hangs up and comes back on a fresh connection.
        assert!(read_message(&mut sock, &mut buf).await.is_none());
        let mut sock = accept(&f.listener).await;
        let mut buf = Vec::new();
        let relogin_id = login(&mut sock, &mut buf, "key").await;
        assert!(relogin_id > call.id);

        assert_eq!(f.cache.pending_stats().unwrap().unsent_datapoints, 2);

        // The same batch is offered again on the new session.
        let retry = expect_call(read_message(&mut sock, &mut buf).await);
        assert!(matches!(retry.payload, CallPayload::Submit(_)));
        assert_eq!(f.cache.pending_stats().unwrap().unsent_datapoints, 2);

        handle.stop().await;
    }

    #[tokio::test]
    async fn remote_error_is_reported_and_retried() {
        let f = fixture().await;
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink_seen = seen.clone();
        let status = StatusReporter::new(Some(Arc::new(move |s: &str| {
            sink_seen.lock().unwrap().push(s.to_string());
        })));

        let handle = Connector::spawn(
            f.cache.clone(),
            f.settings.clone(),
            Credential::new(Some("bad".into())),
            status,
        );

        let mut sock = accept(&f.listener).await;
        let mut buf = Vec::new();
        let call = expect_call(read_message(&mut sock, &mut buf).await);
        reply(
            &mut sock,
            call.id,
            ResponsePayload::Error {
                message: "invalid api key".into(),
            },
        )
        .await;

        assert!(read_message(&mut sock, &mut buf).await.is_none());
        let _sock = accept(&f.listener).await;
        assert!(seen
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.contains("server error: invalid api key")));

        handle.stop().await;
    }

    #[tokio::test]
    async fn wrong_response_kind_is_fatal() {
        let f = fixture().await;
        let handle = Connector::spawn(
            f.cache.clone(),
            f.settings.clone(),
            Credential::new(Some("key".into())),
            StatusReporter::new(None),
        );

        let mut sock = accept(&f.listener).await;
        let mut buf = Vec::new();
        let call = expect_call(read_message(&mut sock, &mut buf).await);
        reply(&mut sock, call.id, ResponsePayload::Submit).await;

        assert!(read_message(&mut sock, &mut buf).await.is_none());
        let _sock = accept(&f.listener).await;
        handle.stop().await;
    }

    #[tokio::test]
    async fn waits_for_credential_before_logging_in() {
        let f = fixture().await;
        let credential = Credential::new(None);
        let handle = Connector::spawn(
            f.cache.clone(),
            f.settings.clone(),
            credential.clone(),
            StatusReporter::new(None),
        );

        let mut sock = accept(&f.listener).await;
        wait_for_state(&handle, ConnectorState::Authenticating).await;

        let mut chunk = [0u8; 16];
        let quiet = Duration::from_millis(700);
        let idle = timeout(quiet, sock.read(&mut chunk)).await;
        assert!(idle.is_err(), "client must not send before it has a key");

        credential.set(Some("late".into()));
        let mut buf = Vec::new();
        login(&mut sock, &mut buf, "late").await;
        wait_for_state(&handle, ConnectorState::Ready).await;

        handle.stop().await;
    }

    #[tokio::test]
    async fn reconnect_delay_doubles_and_resets_after_login() {
        let f = fixture().await;
        insert_track(&f.cache, Uuid::new_v4(), &[0, 100]);
        let settings = ConnectorSettings {
            min_reconnect_time: Duration::from_millis(40),
            max_reconnect_time: Duration::from_secs(1),
            ..f.settings.clone()
        };
        let handle = Connector::spawn(
            f.cache.clone(),
            settings,
            Credential::new(Some("key".into())),
            StatusReporter::new(None),
        );

        // Hang up before the login completes: every attempt is a fault.
        let mut accepted = Vec::new();
        for _ in 0..4 {
            let sock = accept(&f.listener).await;
            accepted.push(Instant::now());
            drop(sock);
        }

        // Log in, then hang up while the submit is outstanding.
        let mut sock = accept(&f.listener).await;
        accepted.push(Instant::now());
        let mut buf = Vec::new();
        login(&mut sock, &mut buf, "key").await;
        let call = expect_call(read_message(&mut sock, &mut buf).await);
        assert!(matches!(call.payload, CallPayload::Submit(_)));
        drop(sock);

        let _sock = accept(&f.listener).await;
        accepted.push(Instant::now());

        let gaps: Vec<Duration> = accepted.windows(2).map(|w| w[1] - w[0]).collect();
        for (gap, min_ms) in gaps.iter().zip([40, 80, 160, 320, 40]) {
            assert!(*gap >= Duration::from_millis(min_ms), "gaps: {gaps:?}");
        }
        assert!(gaps[4] < Duration::from_millis(320), "gaps: {gaps:?}");
        assert_eq!(f.cache.pending_stats().unwrap().unsent_datapoints, 2);

        handle.stop().await;
    }

    #[tokio::test]
    async fn stop_interrupts_reconnect_loop() {
        let f = fixture().await;
        let addr = f.settings.addr.clone();
        drop(f.listener);

        let handle = Connector::spawn(
            f.cache.clone(),
            ConnectorSettings {
                addr,
                min_reconnect_time: Duration::from_millis(50),
                max_reconnect_time: Duration::from_secs(60),
            },
            Credential::new(Some("key".into())),
            StatusReporter::new(None),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;

        let state = handle.state();
        timeout(WAIT, handle.stop()).await.unwrap();
        assert_eq!(*state.borrow(), ConnectorState::Cancelled);
    }
}
