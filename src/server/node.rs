//! Payment node server
//!
//! Wires the ledger, election, replication and router together behind a TCP
//! listener. Each connection carries one request line.

use crate::common::{ClusterEvents, Error, NodeConfig, NoopEvents, Result};
use crate::consensus::{ClusterMembership, ClusterView, RaftNode, TcpTransport, TermStore};
use crate::ledger::{CompactionManager, FollowerAppend, Ledger, LedgerEntry, SharedLedger};
use crate::replication::{LivenessTracker, PeerClient, ReplicationCoordinator};
use crate::server::protocol::{NodeStatus, ReplicateReply, Request, OK, WAL_END};
use crate::server::router::PaymentRouter;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Longest request line accepted
const MAX_LINE: u64 = 64 * 1024;

/// Shared state used by connection handlers
struct NodeContext {
    view: Arc<ClusterView>,
    ledger: SharedLedger,
    raft: Arc<RaftNode>,
    router: PaymentRouter,
}

pub struct PaymentNode {
    config: NodeConfig,
    listener: TcpListener,
    ctx: Arc<NodeContext>,
    coordinator: Arc<ReplicationCoordinator>,
    liveness: Arc<LivenessTracker>,
    shutdown_tx: watch::Sender<bool>,
}

/// Control handle for a running node
#[derive(Clone)]
pub struct NodeHandle {
    addr: String,
    raft: Arc<RaftNode>,
    ledger: SharedLedger,
    shutdown_tx: watch::Sender<bool>,
}

impl NodeHandle {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.ledger
    }

    /// Stop accepting connections and end background tasks
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl PaymentNode {
    pub async fn bind(config: NodeConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        Self::with_listener(config, listener, Arc::new(NoopEvents))
    }

    /// Build a node around an already bound listener. When no advertised
    /// address is configured the listener's address is used.
    pub fn with_listener(
        mut config: NodeConfig,
        listener: TcpListener,
        events: Arc<dyn ClusterEvents>,
    ) -> Result<Self> {
        if config.advertise_addr.is_none() {
            config.advertise_addr = Some(listener.local_addr()?.to_string());
        }
        config.validate()?;

        let view = Arc::new(ClusterView::from_config(&config));
        let ledger = Ledger::open_shared(&config.data_dir, &config.ledger)?;

        let transport = Arc::new(TcpTransport::new(config.election.rpc_timeout()));
        let raft = Arc::new(
            RaftNode::new(view.clone(), config.election.clone(), transport)
                .with_events(events)
                .with_ledger(ledger.clone())
                .with_term_store(TermStore::new(Some(&config.data_dir)))?,
        );

        let client = PeerClient::new(config.replication.peer_timeout());
        let liveness = Arc::new(LivenessTracker::new(client.clone()));
        let coordinator = Arc::new(ReplicationCoordinator::new(
            view.clone(),
            ledger.clone(),
            client.clone(),
            liveness.clone(),
        ));
        let membership = Arc::new(ClusterMembership::new(
            view.clone(),
            raft.clone(),
            liveness.clone(),
        ));
        let router = PaymentRouter::new(
            view.addr(),
            raft.clone(),
            ledger.clone(),
            coordinator.clone(),
            membership,
            client,
        );

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            listener,
            ctx: Arc::new(NodeContext {
                view,
                ledger,
                raft,
                router,
            }),
            coordinator,
            liveness,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            addr: self.ctx.view.addr().to_string(),
            raft: self.ctx.raft.clone(),
            ledger: self.ctx.ledger.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting payment node: {}", self.config.node_id);
        tracing::info!("  Listening on: {}", self.local_addr()?);
        tracing::info!("  Advertised as: {}", self.ctx.view.addr());
        tracing::info!("  Data dir: {}", self.config.data_dir.display());
        tracing::info!("  Peers: {}", self.ctx.view.peers().len());

        let compaction = CompactionManager::new(
            self.ctx.ledger.clone(),
            self.config.ledger.id_compaction_interval_secs,
            self.shutdown_tx.subscribe(),
        )
        .start();
        let liveness = self.spawn_liveness_monitor();
        let leadership = self.spawn_leadership_watcher();

        self.ctx.raft.start();
        tracing::info!("✓ Payment node ready");

        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let ctx = self.ctx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(ctx, stream).await {
                                    tracing::debug!("Connection from {} failed: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => tracing::error!("Accept error: {}", e),
                    }
                }
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }

        tracing::info!("Shutting down node {}", self.config.node_id);
        self.ctx.raft.stop();
        liveness.abort();
        leadership.abort();
        compaction.abort();
        Ok(())
    }

    /// Probe peers periodically; a peer coming back while we lead gets a catch-up.
    fn spawn_liveness_monitor(&self) -> tokio::task::JoinHandle<()> {
        let liveness = self.liveness.clone();
        let coordinator = self.coordinator.clone();
        let raft = self.ctx.raft.clone();
        let view = self.ctx.view.clone();
        let interval = self.config.replication.probe_interval();
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let changes = liveness.probe_all(&view.peer_addrs()).await;
                        for change in changes {
                            if change.came_alive() && raft.is_leader() {
                                coordinator.spawn_catch_up(change.addr);
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Catch every peer up whenever this node wins an election
    fn spawn_leadership_watcher(&self) -> tokio::task::JoinHandle<()> {
        let coordinator = self.coordinator.clone();
        let view = self.ctx.view.clone();
        let mut leadership = self.ctx.raft.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut led_term = None;
            loop {
                tokio::select! {
                    changed = leadership.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = leadership.borrow_and_update().clone();
                        if current.is_leader() && led_term != Some(current.term) {
                            led_term = Some(current.term);
                            tracing::info!("Leader for term {}, catching up peers", current.term);
                            for peer in view.peer_addrs() {
                                coordinator.spawn_catch_up(peer);
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

async fn handle_connection(ctx: Arc<NodeContext>, stream: TcpStream) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader).take(MAX_LINE);
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(());
    }

    let response = match line.parse::<Request>() {
        Ok(request) => dispatch(&ctx, request).await?,
        Err(e) => {
            tracing::debug!("Refusing request {:?}", line.trim_end());
            e.reply().to_string()
        }
    };

    writer.write_all(response.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

async fn dispatch(ctx: &NodeContext, request: Request) -> Result<String> {
    let response = match request {
        Request::Pay { amount, payment_id } => ctx
            .router
            .handle_pay(&amount, &payment_id)
            .await
            .reply()
            .to_string(),
        Request::ReplSeq(entry) => apply_replicated(ctx, &entry).to_string(),
        Request::Repl {
            payment_id,
            payload,
        } => {
            if !ctx.raft.is_active() {
                ReplicateReply::Rejected.to_string()
            } else {
                let appended = lock_ledger(&ctx.ledger).append_as_leader(&payment_id, &payload);
                match appended {
                    Ok(_) => ReplicateReply::Ack.to_string(),
                    Err(e) => {
                        tracing::warn!("REPL of {} failed: {}", payment_id, e);
                        ReplicateReply::Rejected.to_string()
                    }
                }
            }
        }
        Request::WalGet { from } => {
            let entries = lock_ledger(&ctx.ledger).entries_from(from);
            let mut out = String::new();
            for entry in entries {
                out.push_str(&entry.to_string());
                out.push('\n');
            }
            out.push_str(WAL_END);
            out
        }
        Request::Vote { candidate, term } => {
            ctx.raft.handle_vote_request(&candidate, term).to_string()
        }
        Request::Heartbeat(heartbeat) => ctx.raft.handle_heartbeat(&heartbeat).to_string(),
        Request::Status => serde_json::to_string(&node_status(ctx))?,
        Request::Stop => {
            ctx.raft.stop();
            OK.to_string()
        }
        Request::Start => {
            ctx.raft.start();
            OK.to_string()
        }
    };
    Ok(response)
}

fn apply_replicated(ctx: &NodeContext, entry: &LedgerEntry) -> ReplicateReply {
    if !ctx.raft.is_active() {
        return ReplicateReply::Inactive;
    }

    let result =
        lock_ledger(&ctx.ledger).append_as_follower(entry.sequence, &entry.payment_id, &entry.payload);
    match result {
        Ok(FollowerAppend::Behind { len }) => ReplicateReply::Behind { len },
        Ok(_) => ReplicateReply::Ack,
        Err(Error::SequenceConflict { sequence, .. }) => ReplicateReply::Conflict { sequence },
        Err(e) => {
            tracing::error!("Could not apply sequence {}: {}", entry.sequence, e);
            ReplicateReply::Rejected
        }
    }
}

fn node_status(ctx: &NodeContext) -> NodeStatus {
    let leadership = ctx.raft.leadership();
    let ledger = lock_ledger(&ctx.ledger);
    NodeStatus {
        node_id: ctx.view.node_id().to_string(),
        addr: ctx.view.addr().to_string(),
        role: leadership.role,
        term: leadership.term,
        leader: leadership.leader_id,
        active: leadership.active,
        ledger_len: ledger.len(),
        commit_index: ledger.commit_index(),
        wal_len: ledger.wal_len(),
        at: Utc::now(),
    }
}

fn lock_ledger(ledger: &SharedLedger) -> std::sync::MutexGuard<'_, Ledger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}
