//! Daemon lifecycle controller.
//!
//! Owns the bring-up state machine: discover the gateway on a background
//! worker (retrying forever, never fatal), apply the persisted
//! configuration once, then service update requests and the lease-renewal
//! timer from a single control loop. Every engine invocation goes through
//! one serialization lock; a renewal tick that lands during a request's
//! reconciliation is deferred, never dropped and never run concurrently.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{oneshot, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::{ConfigStore, DesiredConfig};
use crate::error::SyncError;
use crate::gateway::{GatewayConnector, GatewayControl, GatewaySession};
use crate::ipc::{self, RequestTransport};
use crate::sync::SyncEngine;

/// Fixed backoff between gateway discovery attempts.
const DISCOVERY_BACKOFF: Duration = Duration::from_secs(5);

/// Default lease for every mapping this daemon creates. 0 would mean a
/// permanent mapping and is never produced by defaults.
pub const DEFAULT_LEASE_SECONDS: u32 = 86_400;

/// Tunable daemon parameters.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Lease duration applied to every mapping; also the renewal period.
    pub lease_seconds: u32,
    /// Sleep between failed discovery attempts during bring-up.
    pub discovery_backoff: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            lease_seconds: DEFAULT_LEASE_SECONDS,
            discovery_backoff: DISCOVERY_BACKOFF,
        }
    }
}

/// Where the daemon is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// Before anything has run.
    Uninitialized,
    /// Gateway discovery in progress; requests get a placeholder reply.
    Discovering,
    /// Discovery done, waiting for requests or the renewal timer.
    Ready,
    /// A reconciliation pass is running.
    Reconciling,
    /// Forwarding disabled by request; the process is exiting.
    Disabled,
}

/// Engine plus the last successfully-applied configuration, together
/// behind the single reconciliation lock. The engine is not reentrant;
/// renewal and request handling both go through this lock.
struct Reconciler {
    engine: SyncEngine,
    last_good: DesiredConfig,
}

/// Which reply a failed reconciliation maps to.
fn reply_for(err: &SyncError) -> &'static str {
    match err {
        SyncError::NotInitialized => ipc::REPLY_DISCOVERING,
        _ => ipc::REPLY_ERROR,
    }
}

/// The long-running daemon.
pub struct Daemon<T: RequestTransport> {
    connector: Arc<dyn GatewayConnector>,
    transport: T,
    store: ConfigStore,
    cfg: DaemonConfig,
}

enum Event {
    Renew,
    Inbound(Vec<u8>),
}

impl<T: RequestTransport> Daemon<T> {
    /// Assemble a daemon from its collaborators.
    pub fn new(
        connector: Arc<dyn GatewayConnector>,
        transport: T,
        store: ConfigStore,
        cfg: DaemonConfig,
    ) -> Self {
        Self {
            connector,
            transport,
            store,
            cfg,
        }
    }

    /// Run until a disable request terminates the daemon gracefully or the
    /// request channel fails. Returning `Ok(())` is the exit-code-0 path.
    pub async fn run(self) -> Result<()> {
        let Self {
            connector,
            mut transport,
            store,
            cfg,
        } = self;
        let mut state = DaemonState::Uninitialized;
        transition(&mut state, DaemonState::Discovering);

        // Discovery runs on a worker; its completion comes back through a
        // one-shot channel read by the main loop.
        let (done_tx, mut done_rx) = oneshot::channel();
        let worker_connector = connector.clone();
        let backoff = cfg.discovery_backoff;
        tokio::spawn(async move {
            let outcome = discover_with_retry(worker_connector, backoff).await;
            let _ = done_tx.send(outcome);
        });

        // Until discovery completes, requests get a placeholder reply and
        // are never processed against a half-initialized client.
        let (control, session) = 'discovery: loop {
            let raw = tokio::select! {
                outcome = &mut done_rx => match outcome {
                    Ok(pair) => break 'discovery pair,
                    Err(_) => bail!("discovery worker terminated without a result"),
                },
                raw = transport.recv() => raw.context("request channel closed")?,
            };
            if let Some(request) = ipc::decode_request(&raw) {
                let err = SyncError::NotInitialized;
                tracing::info!(pid = request.pid, %err, "request not processed");
                send_reply(&transport, request.pid, reply_for(&err)).await;
            }
        };

        transition(&mut state, DaemonState::Ready);
        tracing::info!(
            gateway = %session.gateway_addr,
            lan = %session.lan_addr,
            tag = %session.tag,
            "gateway session established, ownership tag fixed for process lifetime"
        );

        // A corrupt or unreadable file never takes the daemon down; it
        // starts disabled and waits for the next update request.
        let persisted = match store.load() {
            Ok(cfg) => cfg,
            Err(err) => {
                tracing::error!(%err, "persisted configuration unreadable, starting disabled");
                DesiredConfig::default()
            }
        };
        let reconciler = Mutex::new(Reconciler {
            engine: SyncEngine::new(control, session, cfg.lease_seconds),
            last_good: persisted,
        });

        // Apply the persisted desired configuration once before serving
        // requests. Failure here is logged, not fatal.
        {
            let guard = reconciler.lock().await;
            if guard.last_good.enable {
                transition(&mut state, DaemonState::Reconciling);
                match guard.engine.apply(&guard.last_good).await {
                    Ok(outcome) => tracing::info!(
                        removed = outcome.removed,
                        added = outcome.added,
                        "persisted configuration applied"
                    ),
                    Err(err) => {
                        tracing::error!(%err, "failed to apply persisted configuration")
                    }
                }
                transition(&mut state, DaemonState::Ready);
            }
        }

        let period = Duration::from_secs(u64::from(cfg.lease_seconds));
        let mut renew = interval_at(Instant::now() + period, period);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // a due renewal runs before the next queued request
            let event = tokio::select! {
                biased;
                _ = renew.tick() => Event::Renew,
                raw = transport.recv() => Event::Inbound(raw.context("request channel closed")?),
            };

            match event {
                Event::Renew => {
                    let guard = reconciler.lock().await;
                    if !guard.last_good.enable {
                        tracing::debug!("renewal tick while forwarding is disabled, nothing to renew");
                        continue;
                    }
                    transition(&mut state, DaemonState::Reconciling);
                    match guard.engine.apply(&guard.last_good).await {
                        Ok(outcome) => tracing::info!(
                            removed = outcome.removed,
                            added = outcome.added,
                            "lease renewal completed"
                        ),
                        Err(err) => tracing::error!(%err, "lease renewal failed"),
                    }
                    transition(&mut state, DaemonState::Ready);
                }
                Event::Inbound(raw) => {
                    let Some(request) = ipc::decode_request(&raw) else {
                        continue;
                    };
                    tracing::info!(
                        pid = request.pid,
                        enable = request.data.enable,
                        rules = request.data.rules.len(),
                        "update request received"
                    );

                    if request.data.enable {
                        transition(&mut state, DaemonState::Reconciling);
                        let result = {
                            let mut guard = reconciler.lock().await;
                            let result = guard.engine.apply(&request.data).await;
                            if result.is_ok() {
                                guard.last_good = request.data.clone();
                            }
                            result
                        };
                        transition(&mut state, DaemonState::Ready);
                        match result {
                            Ok(outcome) => {
                                // a fresh full lease period starts now
                                renew.reset();
                                if let Err(err) = store.save(&request.data) {
                                    tracing::error!(%err, "failed to persist configuration after apply");
                                }
                                tracing::info!(
                                    pid = request.pid,
                                    removed = outcome.removed,
                                    added = outcome.added,
                                    "update applied"
                                );
                                send_reply(&transport, request.pid, ipc::REPLY_OK).await;
                            }
                            Err(err) => {
                                tracing::error!(pid = request.pid, %err, "update failed");
                                send_reply(&transport, request.pid, reply_for(&err)).await;
                            }
                        }
                    } else {
                        transition(&mut state, DaemonState::Reconciling);
                        let result = {
                            let guard = reconciler.lock().await;
                            guard.engine.teardown().await
                        };
                        match result {
                            Ok(outcome) => {
                                tracing::info!(
                                    pid = request.pid,
                                    removed = outcome.removed,
                                    "port forwarding disabled, shutting down"
                                );
                                send_reply(&transport, request.pid, ipc::REPLY_OK).await;
                                if let Err(err) = store.save(&request.data) {
                                    tracing::error!(%err, "failed to persist disabled configuration");
                                }
                                transition(&mut state, DaemonState::Disabled);
                                transport.shutdown();
                                // dropping the reconciler releases the
                                // gateway client on this path
                                return Ok(());
                            }
                            Err(err) => {
                                tracing::error!(pid = request.pid, %err, "disable failed, staying up");
                                send_reply(&transport, request.pid, reply_for(&err)).await;
                                transition(&mut state, DaemonState::Ready);
                            }
                        }
                    }
                }
            }
        }
    }
}

fn transition(state: &mut DaemonState, next: DaemonState) {
    tracing::debug!(from = ?state, to = ?next, "daemon state transition");
    *state = next;
}

async fn send_reply<T: RequestTransport>(transport: &T, pid: i32, reply: &str) {
    if let Err(err) = transport.send(pid, reply).await {
        tracing::warn!(pid, %err, "failed to send reply");
    }
}

/// Discovery bring-up loop: failures only delay, they never escalate.
async fn discover_with_retry(
    connector: Arc<dyn GatewayConnector>,
    backoff: Duration,
) -> (Arc<dyn GatewayControl>, GatewaySession) {
    loop {
        match connector.discover().await {
            Ok(pair) => return pair,
            Err(err) => {
                tracing::warn!(%err, backoff_secs = backoff.as_secs(), "gateway discovery failed, will retry");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MappingRule, Protocol};
    use crate::error::GatewayError;
    use crate::sync::tests::{session, FakeGateway, OUR_TAG};

    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    struct FakeConnector {
        control: Arc<FakeGateway>,
        failures_left: AtomicU32,
    }

    impl FakeConnector {
        fn new(control: Arc<FakeGateway>) -> Arc<Self> {
            Arc::new(Self {
                control,
                failures_left: AtomicU32::new(0),
            })
        }

        fn failing_first(control: Arc<FakeGateway>, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                control,
                failures_left: AtomicU32::new(failures),
            })
        }
    }

    #[async_trait]
    impl GatewayConnector for FakeConnector {
        async fn discover(
            &self,
        ) -> Result<(Arc<dyn GatewayControl>, GatewaySession), GatewayError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(GatewayError::Discovery("no gateway answered".to_string()));
            }
            Ok((self.control.clone() as Arc<dyn GatewayControl>, session()))
        }
    }

    struct ChannelTransport {
        incoming: mpsc::UnboundedReceiver<Vec<u8>>,
        replies: mpsc::UnboundedSender<(i32, String)>,
    }

    #[async_trait]
    impl RequestTransport for ChannelTransport {
        async fn recv(&mut self) -> io::Result<Vec<u8>> {
            self.incoming
                .recv()
                .await
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "request channel closed"))
        }

        async fn send(&self, pid: i32, reply: &str) -> io::Result<()> {
            self.replies
                .send((pid, reply.to_string()))
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "reply channel closed"))
        }
    }

    struct Harness {
        requests: mpsc::UnboundedSender<Vec<u8>>,
        replies: mpsc::UnboundedReceiver<(i32, String)>,
        gateway: Arc<FakeGateway>,
        store: ConfigStore,
        handle: tokio::task::JoinHandle<Result<()>>,
        _dir: tempfile::TempDir,
    }

    fn start(gateway: Arc<FakeGateway>, connector: Arc<FakeConnector>, cfg: DaemonConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("cfg.json"));
        start_with_store(gateway, connector, cfg, store, dir)
    }

    fn start_with_store(
        gateway: Arc<FakeGateway>,
        connector: Arc<FakeConnector>,
        cfg: DaemonConfig,
        store: ConfigStore,
        dir: tempfile::TempDir,
    ) -> Harness {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let transport = ChannelTransport {
            incoming: req_rx,
            replies: reply_tx,
        };
        let daemon = Daemon::new(connector, transport, store.clone(), cfg);
        let handle = tokio::spawn(daemon.run());
        Harness {
            requests: req_tx,
            replies: reply_rx,
            gateway,
            store,
            handle,
            _dir: dir,
        }
    }

    /// Let the daemon task and its discovery worker run to completion of
    /// bring-up before the test sends requests (current-thread runtime).
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn enable_request(pid: i32, eport: &str, proto: &str) -> Vec<u8> {
        format!(
            r#"{{"pid": {pid}, "data": {{"enable": true, "rules": [{{"eport": "{eport}", "iport": "{eport}", "proto": "{proto}"}}]}}}}"#
        )
        .into_bytes()
    }

    fn disable_request(pid: i32) -> Vec<u8> {
        format!(r#"{{"pid": {pid}, "data": {{"enable": false, "rules": []}}}}"#).into_bytes()
    }

    #[tokio::test]
    async fn enable_then_disable_flow() {
        let gateway = FakeGateway::with_rows(vec![]);
        let mut h = start(
            gateway.clone(),
            FakeConnector::new(gateway.clone()),
            DaemonConfig::default(),
        );
        settle().await;

        h.requests.send(enable_request(7, "9999", "UDP")).unwrap();
        assert_eq!(h.replies.recv().await.unwrap(), (7, "OK".to_string()));
        assert_eq!(
            h.gateway.rows(),
            vec![("9999".to_string(), Protocol::Udp, OUR_TAG.to_string())]
        );
        let persisted = h.store.load().unwrap();
        assert!(persisted.enable);
        assert_eq!(persisted.rules[0].eport, "9999");

        h.requests.send(disable_request(8)).unwrap();
        assert_eq!(h.replies.recv().await.unwrap(), (8, "OK".to_string()));

        h.handle.await.unwrap().unwrap();
        assert!(h.gateway.rows().is_empty());
        assert!(!h.store.load().unwrap().enable);
    }

    #[tokio::test]
    async fn requests_during_discovery_get_a_placeholder() {
        let gateway = FakeGateway::with_rows(vec![]);
        let connector = FakeConnector::failing_first(gateway.clone(), 3);
        let cfg = DaemonConfig {
            discovery_backoff: Duration::from_millis(50),
            ..Default::default()
        };
        let mut h = start(gateway, connector, cfg);

        // lands while the worker is still backing off
        h.requests.send(enable_request(5, "9999", "UDP")).unwrap();
        assert_eq!(
            h.replies.recv().await.unwrap(),
            (5, "Discovering".to_string())
        );

        // once discovery completes the same request succeeds
        h.requests.send(enable_request(5, "9999", "UDP")).unwrap();
        assert_eq!(h.replies.recv().await.unwrap(), (5, "OK".to_string()));

        h.requests.send(disable_request(5)).unwrap();
        assert_eq!(h.replies.recv().await.unwrap(), (5, "OK".to_string()));
        h.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_requests_get_no_reply() {
        let gateway = FakeGateway::with_rows(vec![]);
        let mut h = start(
            gateway.clone(),
            FakeConnector::new(gateway),
            DaemonConfig::default(),
        );
        settle().await;

        h.requests.send(b"{ not json".to_vec()).unwrap();
        h.requests.send(disable_request(9)).unwrap();

        // the only reply ever sent belongs to the valid disable request
        assert_eq!(h.replies.recv().await.unwrap(), (9, "OK".to_string()));
        h.handle.await.unwrap().unwrap();
        assert!(h.replies.recv().await.is_none());
    }

    #[tokio::test]
    async fn foreign_conflict_replies_error_and_daemon_stays_up() {
        let gateway = FakeGateway::with_rows(vec![(
            "9999",
            "9999",
            Protocol::Udp,
            "aabbccddeeff",
        )]);
        let mut h = start(
            gateway.clone(),
            FakeConnector::new(gateway.clone()),
            DaemonConfig::default(),
        );
        settle().await;

        h.requests.send(enable_request(3, "9999", "UDP")).unwrap();
        assert_eq!(h.replies.recv().await.unwrap(), (3, "Error".to_string()));
        // the foreign entry is untouched
        assert_eq!(h.gateway.rows().len(), 1);
        assert_eq!(h.gateway.rows()[0].2, "aabbccddeeff");
        // nothing was persisted for the rejected request
        assert!(!h.store.load().unwrap().enable);

        h.requests.send(disable_request(3)).unwrap();
        assert_eq!(h.replies.recv().await.unwrap(), (3, "OK".to_string()));
        h.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn persisted_configuration_is_applied_on_startup() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("cfg.json"));
        store
            .save(&DesiredConfig {
                enable: true,
                rules: vec![MappingRule {
                    eport: "8888".to_string(),
                    iport: "8888".to_string(),
                    proto: Protocol::Tcp,
                }],
            })
            .unwrap();

        let gateway = FakeGateway::with_rows(vec![]);
        let mut h = start_with_store(
            gateway.clone(),
            FakeConnector::new(gateway.clone()),
            DaemonConfig::default(),
            store,
            dir,
        );
        settle().await;

        // the disable request serializes behind the startup apply
        h.requests.send(disable_request(2)).unwrap();
        assert_eq!(h.replies.recv().await.unwrap(), (2, "OK".to_string()));
        h.handle.await.unwrap().unwrap();

        // startup added 8888, teardown removed it again
        let adds = h
            .gateway
            .calls()
            .into_iter()
            .filter(|c| matches!(c, crate::sync::tests::Call::Add(e) if e == "8888"))
            .count();
        assert_eq!(adds, 1);
        assert!(h.gateway.rows().is_empty());
    }

    #[tokio::test]
    async fn corrupt_persisted_configuration_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        std::fs::write(&path, "{ this is not json").unwrap();
        let store = ConfigStore::new(path);

        let gateway = FakeGateway::with_rows(vec![]);
        let mut h = start_with_store(
            gateway.clone(),
            FakeConnector::new(gateway.clone()),
            DaemonConfig::default(),
            store,
            dir,
        );
        settle().await;

        // the daemon came up and serves requests normally
        h.requests.send(enable_request(6, "9999", "UDP")).unwrap();
        assert_eq!(h.replies.recv().await.unwrap(), (6, "OK".to_string()));
        // the bad file was replaced by the applied configuration
        assert!(h.store.load().unwrap().enable);

        h.requests.send(disable_request(6)).unwrap();
        assert_eq!(h.replies.recv().await.unwrap(), (6, "OK".to_string()));
        h.handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn due_renewal_runs_before_a_queued_request() {
        let gateway = FakeGateway::with_rows(vec![]);
        let cfg = DaemonConfig {
            lease_seconds: 60,
            ..Default::default()
        };
        let mut h = start(gateway.clone(), FakeConnector::new(gateway.clone()), cfg);
        settle().await;

        h.requests.send(enable_request(4, "1111", "UDP")).unwrap();
        assert_eq!(h.replies.recv().await.unwrap(), (4, "OK".to_string()));

        // queue a request while the daemon is parked, then make the
        // renewal tick due; the daemon wakes with both pending
        h.requests.send(enable_request(4, "2222", "UDP")).unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(h.replies.recv().await.unwrap(), (4, "OK".to_string()));
        let calls = h.gateway.calls();
        let is_add = |c: &crate::sync::tests::Call, port: &str| {
            matches!(c, crate::sync::tests::Call::Add(e) if e == port)
        };
        // the renewal was not dropped: 1111 was re-added a second time
        assert_eq!(calls.iter().filter(|c| is_add(c, "1111")).count(), 2);
        // and it completed before the queued request's pass started
        let renewal_add = calls.iter().rposition(|c| is_add(c, "1111")).unwrap();
        let request_add = calls.iter().position(|c| is_add(c, "2222")).unwrap();
        assert!(
            renewal_add < request_add,
            "deferred renewal must run before the next queued request"
        );

        h.requests.send(disable_request(4)).unwrap();
        assert_eq!(h.replies.recv().await.unwrap(), (4, "OK".to_string()));
        h.handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_reapplies_the_last_good_configuration() {
        let gateway = FakeGateway::with_rows(vec![]);
        let cfg = DaemonConfig {
            lease_seconds: 60,
            ..Default::default()
        };
        let mut h = start(gateway.clone(), FakeConnector::new(gateway.clone()), cfg);
        settle().await;

        h.requests.send(enable_request(7, "9999", "UDP")).unwrap();
        assert_eq!(h.replies.recv().await.unwrap(), (7, "OK".to_string()));

        // auto-advance carries us past the lease period
        tokio::time::sleep(Duration::from_secs(61)).await;

        let mut adds = 0;
        for _ in 0..100 {
            adds = h
                .gateway
                .calls()
                .into_iter()
                .filter(|c| matches!(c, crate::sync::tests::Call::Add(e) if e == "9999"))
                .count();
            if adds >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(adds >= 2, "renewal never re-applied the configuration");
        // still exactly one mapping, ours
        assert_eq!(
            h.gateway.rows(),
            vec![("9999".to_string(), Protocol::Udp, OUR_TAG.to_string())]
        );

        h.requests.send(disable_request(7)).unwrap();
        assert_eq!(h.replies.recv().await.unwrap(), (7, "OK".to_string()));
        h.handle.await.unwrap().unwrap();
    }

    #[test]
    fn failed_calls_map_to_the_right_reply() {
        assert_eq!(reply_for(&SyncError::NotInitialized), ipc::REPLY_DISCOVERING);
        assert_eq!(
            reply_for(&SyncError::RetryExhausted {
                index: 0,
                retries: 5
            }),
            ipc::REPLY_ERROR
        );
        assert_eq!(
            reply_for(&SyncError::PortConflict {
                eport: "1".to_string()
            }),
            ipc::REPLY_ERROR
        );
    }
}
