use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NetConfig;
use crate::connection::id_pool::IdPool;
use crate::connection::Connection;
use crate::transport::duplex::DuplexConnection;

/// The outcome of one `connect` call, delivered asynchronously through
///  [ConnectionManager::poll_connect_result].
pub type ConnectResult = anyhow::Result<Arc<DuplexConnection>>;

struct PendingAttempt {
    coordinator: Option<JoinHandle<()>>,
    candidates: Vec<JoinHandle<()>>,
}

impl PendingAttempt {
    fn abort_all(self) {
        if let Some(handle) = self.coordinator {
            handle.abort();
        }
        for handle in self.candidates {
            handle.abort();
        }
    }
}

/// A connection that was built but not yet pushed into the results queue. If
///  the coordinator is aborted in that window, the connection would leak (its
///  recv tasks keep it alive and its id stays out of the pool), so the guard
///  disposes it when dropped undelivered.
struct UndeliveredConnection(Option<Arc<DuplexConnection>>);

impl Drop for UndeliveredConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.0.take() {
            conn.dispose();
        }
    }
}

/// The single owner of connection-establishment state: the id pool, the
///  in-flight outbound attempts, and the listener for inbound connections.
///  Applications hold one instance instead of going through globals.
pub struct ConnectionManager {
    config: Arc<NetConfig>,
    id_pool: Arc<IdPool>,
    next_attempt_id: AtomicU64,
    pending: Arc<Mutex<FxHashMap<u64, PendingAttempt>>>,
    connect_results: Arc<Mutex<VecDeque<ConnectResult>>>,
    accepted: Arc<Mutex<VecDeque<Arc<DuplexConnection>>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(config: Arc<NetConfig>) -> anyhow::Result<ConnectionManager> {
        config.validate()?;
        Ok(ConnectionManager {
            id_pool: Arc::new(IdPool::new(config.max_connections)),
            config,
            next_attempt_id: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(FxHashMap::default())),
            connect_results: Arc::new(Mutex::new(VecDeque::new())),
            accepted: Arc::new(Mutex::new(VecDeque::new())),
            accept_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Arc<NetConfig> {
        &self.config
    }

    pub fn id_pool(&self) -> &Arc<IdPool> {
        &self.id_pool
    }

    /// Races TCP connects against all candidate endpoints of one server and
    ///  keeps the first that succeeds; the losing candidates are aborted. The
    ///  call returns immediately, the outcome arrives via
    ///  [Self::poll_connect_result].
    ///
    /// With exactly two candidates, the endpoint that lost the race is handed
    ///  to the winning connection as the alternate UDP endpoint. With any other
    ///  number there is no way to tell which candidate the peer meant as the
    ///  alternate, so none is used.
    pub fn connect(&self, candidates: Vec<SocketAddr>) {
        if candidates.is_empty() {
            self.connect_results.lock().unwrap()
                .push_back(Err(anyhow!("connect called without candidate endpoints")));
            return;
        }

        let attempt_id = self.next_attempt_id.fetch_add(1, Ordering::SeqCst);
        debug!("attempt #{}: connecting to {:?}", attempt_id, candidates);

        let (tx, rx) = mpsc::unbounded_channel();
        let candidate_tasks = candidates.iter()
            .enumerate()
            .map(|(index, addr)| {
                let addr = *addr;
                let tx = tx.clone();
                tokio::spawn(async move {
                    let result = TcpStream::connect(addr).await;
                    let _ = tx.send((index, result));
                })
            })
            .collect::<Vec<_>>();

        // the entry must exist before the coordinator can finish, otherwise its
        //  cleanup would race against this insert
        self.pending.lock().unwrap().insert(attempt_id, PendingAttempt {
            coordinator: None,
            candidates: candidate_tasks,
        });

        let coordinator = tokio::spawn(Self::coordinate(
            attempt_id,
            candidates,
            rx,
            self.id_pool.clone(),
            self.config.clone(),
            self.pending.clone(),
            self.connect_results.clone(),
        ));
        if let Some(attempt) = self.pending.lock().unwrap().get_mut(&attempt_id) {
            attempt.coordinator = Some(coordinator);
        }
        else {
            // cancel_connect ran in between
            coordinator.abort();
        }
    }

    async fn coordinate(
        attempt_id: u64,
        candidates: Vec<SocketAddr>,
        mut rx: mpsc::UnboundedReceiver<(usize, std::io::Result<TcpStream>)>,
        id_pool: Arc<IdPool>,
        config: Arc<NetConfig>,
        pending: Arc<Mutex<FxHashMap<u64, PendingAttempt>>>,
        results: Arc<Mutex<VecDeque<ConnectResult>>>,
    ) {
        let mut failures = 0;
        let mut outcome = None;
        let mut undelivered = UndeliveredConnection(None);

        while let Some((index, result)) = rx.recv().await {
            match result {
                Ok(stream) => {
                    info!("attempt #{}: connected to {}", attempt_id, candidates[index]);
                    for handle in pending.lock().unwrap()
                        .get_mut(&attempt_id)
                        .map(|a| std::mem::take(&mut a.candidates))
                        .unwrap_or_default()
                    {
                        handle.abort();
                    }

                    let alternate = if candidates.len() == 2 {
                        Some(candidates[1 - index])
                    } else {
                        None
                    };
                    let built =
                        DuplexConnection::from_outbound(stream, alternate, id_pool, config).await;
                    if let Ok(conn) = &built {
                        undelivered.0 = Some(conn.clone());
                    }
                    outcome = Some(built);
                    break;
                }
                Err(e) => {
                    debug!("attempt #{}: candidate {} failed: {}", attempt_id, candidates[index], e);
                    failures += 1;
                    if failures == candidates.len() {
                        outcome = Some(Err(anyhow!(
                            "all {} candidate endpoint(s) failed, last error: {}",
                            candidates.len(), e
                        )));
                        break;
                    }
                }
            }
        }

        pending.lock().unwrap().remove(&attempt_id);
        if let Some(outcome) = outcome {
            results.lock().unwrap().push_back(outcome);
        }
        // delivered: the application owns the connection from here on
        undelivered.0.take();
    }

    /// Aborts every in-flight connect attempt. Attempts that already produced
    ///  a result are unaffected.
    pub fn cancel_connect(&self) {
        let attempts = std::mem::take(&mut *self.pending.lock().unwrap());
        for (attempt_id, attempt) in attempts {
            debug!("cancelling attempt #{}", attempt_id);
            attempt.abort_all();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Picks up the next finished connect attempt, if any. Meant to be called
    ///  once per tick.
    pub fn poll_connect_result(&self) -> Option<ConnectResult> {
        self.connect_results.lock().unwrap().pop_front()
    }

    /// Accepts inbound connections on the listener until [Self::stop_accepting]
    ///  is called. Accepted connections are picked up via [Self::poll_accepted].
    pub fn spawn_accept_loop(&self, listener: TcpListener) {
        let id_pool = self.id_pool.clone();
        let config = self.config.clone();
        let accepted = self.accepted.clone();

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        match DuplexConnection::from_accepted(stream, id_pool.clone(), config.clone()).await {
                            Ok(conn) => {
                                info!("accepted connection from {}", peer);
                                accepted.lock().unwrap().push_back(conn);
                            }
                            Err(e) => warn!("rejecting connection from {}: {}", peer, e),
                        }
                    }
                    Err(e) => warn!("accept failed: {}", e),
                }
            }
        });

        if let Some(previous) = self.accept_task.lock().unwrap().replace(task) {
            previous.abort();
        }
    }

    pub fn poll_accepted(&self) -> Option<Arc<DuplexConnection>> {
        self.accepted.lock().unwrap().pop_front()
    }

    pub fn stop_accepting(&self) {
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cancel_connect();
        self.stop_accepting();
    }
}
