use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{ConnectionConfig, GossipConfig};
use crate::error::MembershipError;
use crate::list::MembershipList;
use crate::listener::{ListenerRegistry, MembershipListener, SubscriptionId};
use crate::snapshot::MembershipSnapshot;
use crate::statistics::ClusterStatistics;
use crate::transport::{Socket, Transport};
use crate::{Identity, MemberStateChange};

/// Everything guarded by the membership lock.
///
/// Every change to the list and the delivery of the resulting events
/// happens while holding this lock, so listeners observe changes in
/// the order they were applied.
pub(crate) struct MembershipState {
    pub(crate) list: MembershipList,
    pub(crate) listeners: ListenerRegistry<dyn MembershipListener>,
}

/// State shared between the gossip jobs and every handle to the node.
pub(crate) struct Shared {
    pub(crate) self_id: Identity,
    pub(crate) config: GossipConfig,
    pub(crate) connection: ConnectionConfig,
    pub(crate) statistics: ClusterStatistics,
    state: Mutex<MembershipState>,
    members_tx: watch::Sender<Vec<Identity>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Shared {
    /// Runs the given closure against the current view of the group.
    pub(crate) async fn with_view<F, R>(&self, inspect: F) -> R
    where
        F: FnOnce(&MembershipList) -> R,
    {
        let state = self.state.lock().await;
        inspect(&state.list)
    }

    /// Registers a listener and inspects the view in the same critical section.
    pub(crate) async fn subscribe_with<L, F, R>(
        &self,
        listener: L,
        inspect: F,
    ) -> (SubscriptionId, R)
    where
        L: MembershipListener,
        F: FnOnce(&MembershipList) -> R,
    {
        let mut state = self.state.lock().await;
        let output = inspect(&state.list);
        let id = state.listeners.subscribe(Arc::new(listener));
        (id, output)
    }

    pub(crate) async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state.lock().await.listeners.unsubscribe(id)
    }

    pub(crate) fn members_watcher(&self) -> watch::Receiver<Vec<Identity>> {
        self.members_tx.subscribe()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Waits until the node has been told to stop.
    pub(crate) async fn stopped(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        wait_for_shutdown(&mut rx).await
    }

    /// Runs a single round of the failure detector and gossips the
    /// resulting view to a random alive member.
    ///
    /// The whole round happens under the membership lock so no merge can
    /// interleave between the update and the send.
    async fn gossip_round(&self, socket: &dyn Socket) {
        let mut state = self.state.lock().await;

        let changes = state.list.update();
        self.statistics.num_gossip_rounds.fetch_add(1, Ordering::Relaxed);
        self.publish(&state, &changes);

        let peer = state.list.random_alive_member(&mut rand::thread_rng());
        if let Some(peer) = peer {
            let snapshot = state.list.non_fail_snapshot();
            self.send_snapshot(socket, peer.addr(), &snapshot).await;
        }
    }

    /// Sends the current view straight to the introducer.
    async fn negotiate_with_introducer(&self, socket: &dyn Socket) {
        let snapshot = {
            let state = self.state.lock().await;
            state.list.non_fail_snapshot()
        };

        self.send_snapshot(socket, self.connection.introducer_addr, &snapshot)
            .await;
    }

    async fn merge(&self, snapshot: &MembershipSnapshot) {
        let mut state = self.state.lock().await;

        let changes = state.list.merge(snapshot);
        self.statistics
            .num_merged_snapshots
            .fetch_add(1, Ordering::Relaxed);
        self.publish(&state, &changes);
    }

    /// Logs the changes and delivers them to every listener.
    ///
    /// Must be called with the membership lock held.
    fn publish(&self, state: &MembershipState, changes: &[MemberStateChange]) {
        self.statistics.record_view(&state.list);

        if changes.is_empty() {
            return;
        }

        for change in changes {
            info!(self_id = %self.self_id, change = %change, "Membership has changed.");
        }
        debug!(self_id = %self.self_id, members = %state.list, "Current membership list.");

        for listener in state.listeners.iter() {
            listener.on_membership_change(&state.list, changes);
        }

        self.members_tx.send_replace(state.list.alive_members());
    }

    async fn send_snapshot(
        &self,
        socket: &dyn Socket,
        target: SocketAddr,
        snapshot: &MembershipSnapshot,
    ) {
        let payload = match snapshot.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(self_id = %self.self_id, error = %e, "Failed to encode membership snapshot.");
                return;
            },
        };

        if payload.len() > self.config.max_datagram_size {
            warn!(
                self_id = %self.self_id,
                num_members = snapshot.len(),
                size = payload.len(),
                max_size = self.config.max_datagram_size,
                "Membership snapshot is too large to gossip, skipping.",
            );
            return;
        }

        trace!(self_id = %self.self_id, target = %target, size = payload.len(), "Gossip send");
        if let Err(e) = socket.send(target, &payload).await {
            debug!(self_id = %self.self_id, target = %target, error = ?e, "Failed to send gossip.");
        }
    }

    /// Sends the leave announcement to a set of random alive members.
    async fn broadcast_leave(&self, socket: &dyn Socket) -> Result<(), MembershipError> {
        let (message, peers) = {
            let state = self.state.lock().await;
            let message = state
                .list
                .voluntary_leave_message(self.config.leave_heartbeat_margin);
            let peers = state
                .list
                .alive_members_excluding_self()
                .choose_multiple(&mut rand::thread_rng(), self.config.leave_fanout)
                .copied()
                .collect::<Vec<_>>();
            (message, peers)
        };

        let payload = message.encode()?;
        for peer in peers {
            match socket.send(peer.addr(), &payload).await {
                Ok(()) => {
                    debug!(self_id = %self.self_id, target = %peer, "Sent leave announcement.");
                },
                Err(e) if matches!(e.kind(), ErrorKind::NotConnected | ErrorKind::BrokenPipe) => {
                    return Err(e.into());
                },
                Err(e) => {
                    warn!(self_id = %self.self_id, target = %peer, error = ?e, "Failed to send leave announcement.");
                },
            }
        }

        Ok(())
    }
}

/// The running gossip protocol of a single node.
///
/// The engine runs three jobs: the gossip sender, the introducer
/// negotiator (on every node except the introducer) and the receiver.
pub(crate) struct GossipEngine {
    shared: Arc<Shared>,
    socket: Arc<dyn Socket>,
    sender: JoinHandle<()>,
    negotiator: Option<JoinHandle<()>>,
    receiver: JoinHandle<Result<(), MembershipError>>,
}

impl GossipEngine {
    pub(crate) async fn start(
        connection: ConnectionConfig,
        config: GossipConfig,
        transport: &dyn Transport,
        statistics: ClusterStatistics,
    ) -> Result<Self, MembershipError> {
        let self_id = Identity::joining_now(connection.public_addr);

        info!(
            self_id = %self_id,
            listen_addr = %connection.listen_addr,
            introducer_addr = %connection.introducer_addr,
            is_introducer = connection.is_introducer(),
            "Joining group."
        );

        let socket = transport.open(connection.listen_addr).await?;

        let list = MembershipList::new(self_id, config.fail_timeout, config.cleanup_timeout);
        statistics.record_view(&list);

        let (members_tx, _) = watch::channel(list.alive_members());
        let (shutdown_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            self_id,
            config,
            connection,
            statistics,
            state: Mutex::new(MembershipState {
                list,
                listeners: ListenerRegistry::default(),
            }),
            members_tx,
            shutdown_tx,
        });

        let sender = tokio::spawn(run_gossip_rounds(shared.clone(), socket.clone()));
        let negotiator = if shared.connection.is_introducer() {
            None
        } else {
            Some(tokio::spawn(run_introducer_negotiation(
                shared.clone(),
                socket.clone(),
            )))
        };
        let receiver = tokio::spawn(run_receiver(shared.clone(), socket.clone()));

        Ok(Self {
            shared,
            socket,
            sender,
            negotiator,
            receiver,
        })
    }

    #[inline]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Stops every job and announces the node is leaving the group.
    ///
    /// If the receiver stopped the node because of an unreadable snapshot,
    /// that error is returned once everything has stopped.
    pub(crate) async fn shutdown(self) -> Result<(), MembershipError> {
        info!(self_id = %self.shared.self_id, "Shutting down the node.");
        self.shared.shutdown_tx.send_replace(true);

        if let Err(e) = self.sender.await {
            error!(self_id = %self.shared.self_id, error = ?e, "Gossip sender panicked.");
        }
        if let Some(negotiator) = self.negotiator {
            if let Err(e) = negotiator.await {
                error!(self_id = %self.shared.self_id, error = ?e, "Introducer negotiator panicked.");
            }
        }
        let receiver_result = match self.receiver.await {
            Ok(result) => result,
            Err(e) => {
                error!(self_id = %self.shared.self_id, error = ?e, "Gossip receiver panicked.");
                Ok(())
            },
        };

        let leave_result = self.shared.broadcast_leave(self.socket.as_ref()).await;

        receiver_result?;
        leave_result
    }
}

async fn run_gossip_rounds(shared: Arc<Shared>, socket: Arc<dyn Socket>) {
    let mut shutdown = shared.shutdown_tx.subscribe();
    let mut interval = tokio::time::interval(shared.config.gossip_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {},
            _ = wait_for_shutdown(&mut shutdown) => break,
        }

        shared.gossip_round(socket.as_ref()).await;
    }

    debug!(self_id = %shared.self_id, "Gossip sender has stopped.");
}

async fn run_introducer_negotiation(shared: Arc<Shared>, socket: Arc<dyn Socket>) {
    let mut shutdown = shared.shutdown_tx.subscribe();
    let mut interval =
        tokio::time::interval(shared.config.introducer_negotiate_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {},
            _ = wait_for_shutdown(&mut shutdown) => break,
        }

        shared.negotiate_with_introducer(socket.as_ref()).await;
    }

    debug!(self_id = %shared.self_id, "Introducer negotiator has stopped.");
}

async fn run_receiver(
    shared: Arc<Shared>,
    socket: Arc<dyn Socket>,
) -> Result<(), MembershipError> {
    let mut shutdown = shared.shutdown_tx.subscribe();

    loop {
        let received = tokio::select! {
            received = socket.recv() => received,
            _ = wait_for_shutdown(&mut shutdown) => break,
        };

        let (from, payload) = match received {
            Ok(datagram) => datagram,
            Err(e) if is_transient(e.kind()) => {
                trace!(self_id = %shared.self_id, error = ?e, "Ignoring transient receive error.");
                continue;
            },
            Err(e) => {
                debug!(self_id = %shared.self_id, error = ?e, "Gossip socket has closed.");
                break;
            },
        };

        if payload.len() > shared.config.max_datagram_size {
            warn!(
                self_id = %shared.self_id,
                from = %from,
                size = payload.len(),
                "Ignoring oversized datagram.",
            );
            continue;
        }

        let snapshot = match MembershipSnapshot::decode(&payload) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(
                    self_id = %shared.self_id,
                    from = %from,
                    error = %e,
                    "Received a membership snapshot which could not be read. Stopping node.",
                );
                shared.shutdown_tx.send_replace(true);
                return Err(e.into());
            },
        };

        trace!(self_id = %shared.self_id, from = %from, num_members = snapshot.len(), "Gossip recv");
        shared.merge(&snapshot).await;
    }

    debug!(self_id = %shared.self_id, "Gossip receiver has stopped.");
    Ok(())
}

fn is_transient(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::Interrupted
    )
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }

        if rx.changed().await.is_err() {
            return;
        }
    }
}
