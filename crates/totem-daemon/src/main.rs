//! The `totemd` daemon: wires the eight crates together into one event
//! loop. Startup resolves config, crypto keys, and the transport backend;
//! the loop itself is a single `tokio::select!` over three sources —
//! incoming client IPC requests, incoming wire datagrams, and timer
//! expiry — with the SRP/PG/CPG/sync pipeline run inline between them.

mod config;
mod ipc;
mod timer;
mod transport;
mod wire;

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use clap::Parser;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::mpsc;

use totem_cpg::{ClientId, CpgEvent, CpgMessage, CpgService};
use totem_crypto::{CipherKind, HashKind, SessionKeys};
use totem_pg::{PackedFrame, PackedMessageBuilder, PgMessage, Reassembler};
use totem_srp::{
    MembJoin, MembMergeDetect, RecoveryState, RecoveryTransition, SrpInstance, SrpState, TimerKind, Token,
};
use totem_sync::{reconcile, Downlist, SyncBarrier, SyncProgress, SyncService};
use totem_transport::{Multicast, MulticastConfig, Transport, UnicastFanout};
use totem_types::{ApiError, Msn, NodeId, RingId};

use config::DaemonConfig;
use ipc::{ClientOp, ClientReply, ClientRequest, IpcHandle, IpcServer};
use timer::{TimerArena, TimerDurations};
use transport::AnyTransport;
use wire::{McastBody, SrpDatagram, SrpPayload, BROADCAST};

/// The only service id `totem-pg` carries in this daemon.
const CPG_SERVICE: u8 = 0;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the daemon's `toml` config file. Defaults to
    /// `$TOTEM_DATA_DIR/totem.toml` (or `~/.totem/totem.toml`).
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let config = DaemonConfig::load(args.config.as_ref())?;

    let self_id = NodeId::new(config.node.id);
    let cipher = config.crypto.cipher_kind()?;
    let hash = config.crypto.hash_kind()?;
    let private_key = load_or_generate_key(&config.crypto.key_file)?;
    let session_keys = totem_crypto::derive_session_keys(&private_key, cipher, hash)?;

    let address_book = config.transport.address_book()?;
    let mut known_nodes: Vec<NodeId> = address_book.keys().copied().collect();
    if !known_nodes.contains(&self_id) {
        known_nodes.push(self_id);
    }
    known_nodes.sort();

    let transport = Arc::new(bind_transport(&config, self_id, &address_book).await?);

    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let recv_transport = transport.clone();
    tokio::spawn(async move {
        loop {
            match recv_transport.recv().await {
                Ok(bytes) => {
                    if inbound_tx.send(bytes).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "transport recv failed"),
            }
        }
    });

    let srp = SrpInstance::new(self_id, config.protocol.window, config.protocol.crypto_reject_threshold);
    let timers = TimerArena::new(TimerDurations::from(&config.timers));
    let budget = totem_pg::frame_budget(cipher, hash);
    let packer = PackedMessageBuilder::new(budget);
    let reassembler = Reassembler::new();
    let cpg = Rc::new(RefCell::new(CpgService::new(self_id)));

    let mut sync = SyncBarrier::new();
    sync.register(Box::new(CpgSyncAdapter(cpg.clone())));

    let (requests_tx, mut requests_rx) = mpsc::channel::<ClientRequest>(128);
    let ipc_server = IpcServer::new(config.ipc_socket_path(), requests_tx);
    let ipc_handle = ipc_server.handle();
    tokio::spawn(async move {
        if let Err(e) = ipc_server.run().await {
            tracing::error!(error = %e, "ipc server exited");
        }
    });

    let mut daemon = Daemon {
        self_id,
        srp,
        timers,
        packer,
        reassembler,
        cpg,
        sync,
        transport,
        cipher,
        hash,
        session_keys,
        address_book,
        known_nodes,
        failed_nodes: Vec::new(),
        prev_members: vec![self_id],
        pending_downlists: Vec::new(),
        ipc_handle,
    };

    daemon.timers.arm(TimerKind::Downcheck);
    daemon.broadcast_memb_join().await;

    loop {
        let next_deadline = daemon.timers.next_deadline();
        tokio::select! {
            Some(request) = requests_rx.recv() => {
                daemon.handle_client_request(request).await;
            }
            Some(bytes) = inbound_rx.recv() => {
                daemon.handle_wire_datagram(bytes).await;
            }
            () = sleep_until_opt(next_deadline) => {
                daemon.handle_timer_tick().await;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("ctrl-c received, shutting down");
                if !daemon.sync.is_idle() {
                    daemon.sync.abort();
                }
                break;
            }
        }
        daemon.drain_cpg_outbound();
        daemon.drain_cpg_events().await;
    }

    Ok(())
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

async fn bind_transport(
    config: &DaemonConfig,
    self_id: NodeId,
    address_book: &HashMap<NodeId, SocketAddr>,
) -> anyhow::Result<AnyTransport> {
    let bind_addr: IpAddr = config.transport.bind_addr.parse()?;

    if let Some(mcast) = &config.transport.mcast_addr {
        let mcast_addr: std::net::Ipv4Addr = mcast.parse()?;
        let iface_addr = match bind_addr {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => anyhow::bail!("multicast transport requires an IPv4 bind address"),
        };
        let initial_target = address_book
            .get(&self_id)
            .copied()
            .unwrap_or_else(|| SocketAddr::new(bind_addr, config.transport.port));
        let mcast_config = MulticastConfig { iface_addr, mcast_addr, port: config.transport.port };
        let multicast = Multicast::bind(mcast_config, initial_target).await?;
        Ok(AnyTransport::Multicast(multicast))
    } else {
        let peers: Vec<SocketAddr> =
            config.transport.fanout_peers.iter().map(|p| p.parse()).collect::<Result<_, _>>()?;
        let bind = SocketAddr::new(bind_addr, config.transport.port);
        let fanout = UnicastFanout::bind(bind, peers).await?;
        Ok(AnyTransport::Fanout(fanout))
    }
}

fn load_or_generate_key(key_file: &str) -> anyhow::Result<Vec<u8>> {
    if key_file.is_empty() {
        tracing::warn!("no crypto.key_file configured, generating an ephemeral key (development only)");
        let mut key = vec![0u8; 128];
        OsRng.fill_bytes(&mut key);
        return Ok(key);
    }
    std::fs::read(key_file).map_err(|e| anyhow::anyhow!("reading key file {key_file:?}: {e}"))
}

/// Forwards `totem_sync::SyncService` calls to a shared `CpgService`, since
/// the barrier also needs direct, non-boxed access to the same service for
/// ordinary client dispatch and `on_deliver`.
struct CpgSyncAdapter(Rc<RefCell<CpgService>>);

impl SyncService for CpgSyncAdapter {
    fn sync_init(&mut self, trans_list: &[NodeId], member_list: &[NodeId], ring_id: RingId) {
        self.0.borrow_mut().sync_init(trans_list, member_list, ring_id);
    }

    fn sync_process(&mut self) -> SyncProgress {
        self.0.borrow_mut().sync_process()
    }

    fn sync_abort(&mut self) {
        self.0.borrow_mut().sync_abort();
    }

    fn sync_activate(&mut self) {
        self.0.borrow_mut().sync_activate();
    }

    fn confchg(&mut self, joined: &[NodeId], left: &[NodeId]) {
        self.0.borrow_mut().confchg(joined, left);
    }
}

/// One node's complete runtime state: the protocol instance, the packing/
/// reassembly/sync machinery sitting above it, the CPG service consuming
/// it, and the transport/crypto/IPC handles needed to drive all of it.
struct Daemon {
    self_id: NodeId,
    srp: SrpInstance,
    timers: TimerArena,
    packer: PackedMessageBuilder,
    reassembler: Reassembler,
    cpg: Rc<RefCell<CpgService>>,
    sync: SyncBarrier,
    transport: Arc<AnyTransport>,
    cipher: CipherKind,
    hash: HashKind,
    session_keys: SessionKeys,
    address_book: HashMap<NodeId, SocketAddr>,
    known_nodes: Vec<NodeId>,
    failed_nodes: Vec<NodeId>,
    prev_members: Vec<NodeId>,
    pending_downlists: Vec<Downlist>,
    ipc_handle: IpcHandle,
}

impl Daemon {
    // ---- outbound framing --------------------------------------------------

    async fn broadcast_memb_join(&mut self) {
        let join = MembJoin {
            sender: self.self_id,
            proc_list: self.known_nodes.clone(),
            failed_list: self.failed_nodes.clone(),
            ring_seq: self.srp.ring.seq,
        };
        let datagram = SrpDatagram::new(self.self_id, BROADCAST, SrpPayload::Join(join));
        self.send_mcast_datagram(datagram).await;
        self.timers.arm(TimerKind::JoinBroadcast);
    }

    async fn send_mcast_datagram(&mut self, datagram: SrpDatagram) {
        let Ok(bytes) = datagram.to_bytes() else {
            tracing::error!("failed to encode outgoing datagram");
            return;
        };
        match totem_crypto::frame::encrypt_and_sign(
            &self.session_keys.cipher_key,
            &self.session_keys.hash_key,
            self.cipher,
            self.hash,
            &bytes,
            &mut OsRng,
        ) {
            Ok(frame) => {
                if let Err(e) = self.transport.mcast_flush_send(&frame).await {
                    tracing::warn!(error = %e, "mcast send failed");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to encrypt outgoing datagram"),
        }
    }

    async fn send_token_datagram(&mut self, datagram: SrpDatagram) {
        let Ok(bytes) = datagram.to_bytes() else {
            tracing::error!("failed to encode outgoing token datagram");
            return;
        };
        match totem_crypto::frame::encrypt_and_sign(
            &self.session_keys.cipher_key,
            &self.session_keys.hash_key,
            self.cipher,
            self.hash,
            &bytes,
            &mut OsRng,
        ) {
            Ok(frame) => {
                if let Err(e) = self.transport.token_send(&frame).await {
                    tracing::warn!(error = %e, "token send failed");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to encrypt outgoing token datagram"),
        }
    }

    // ---- inbound wire datagrams --------------------------------------------

    async fn handle_wire_datagram(&mut self, frame: Vec<u8>) {
        let plaintext = match totem_crypto::frame::authenticate_and_decrypt(
            &self.session_keys.cipher_key,
            &self.session_keys.hash_key,
            &frame,
        ) {
            Ok(p) => {
                self.srp.on_crypto_accept();
                p
            }
            Err(_) => {
                if self.srp.on_crypto_reject() {
                    self.broadcast_memb_join().await;
                }
                return;
            }
        };

        let datagram = match SrpDatagram::from_bytes(&plaintext) {
            Ok(d) => d,
            Err(e) => {
                tracing::debug!(error = %e, "dropping malformed datagram");
                return;
            }
        };
        if datagram.dst != BROADCAST && datagram.dst != self.self_id {
            return;
        }

        match datagram.payload {
            SrpPayload::Token(token) => self.handle_token(token).await,
            SrpPayload::Mcast(body) => self.handle_mcast(body),
            SrpPayload::MergeDetect(detect) => self.handle_merge_detect(detect).await,
            SrpPayload::Join(join) => self.handle_memb_join(join).await,
            SrpPayload::CommitToken(wire) => self.process_commit_token(wire).await,
            SrpPayload::TokenHoldCancel(_) => {
                // No special-cased early release: the successor simply
                // waits out the ordinary token-hold timer.
            }
        }
    }

    async fn handle_token(&mut self, token: Token) {
        let outcome = match self.srp.on_token_received(token) {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(error = %e, "token rejected");
                return;
            }
        };

        let ring = self.srp.ring;
        for (msn, originator, payload) in outcome.delivered {
            self.deliver_packed_payload(ring, originator, msn, &payload);
            self.srp.mark_dispatched(msn);
        }
        let aru = self.srp.local_aru();
        self.srp.prune_dispatched(aru);

        for (msn, originator, payload) in outcome.rebroadcasts.into_iter().chain(outcome.originated) {
            let body = McastBody { ring, msn, originator, payload };
            let datagram = SrpDatagram::new(self.self_id, BROADCAST, SrpPayload::Mcast(body));
            self.send_mcast_datagram(datagram).await;
        }

        self.timers.apply_all(outcome.timer_actions);
        self.timers.arm(TimerKind::TokenLoss);

        if let Some(next_token) = outcome.forward_token {
            if let Some(successor) = self.srp.membership.successor_of(self.self_id) {
                let datagram = SrpDatagram::new(self.self_id, successor, SrpPayload::Token(next_token));
                self.send_token_datagram(datagram).await;
            }
        }
    }

    fn handle_mcast(&mut self, body: McastBody) {
        if body.ring != self.srp.ring {
            return;
        }
        self.srp.accept_received(body.msn, body.originator, body.payload);
    }

    async fn handle_merge_detect(&mut self, detect: MembMergeDetect) {
        if self.srp.on_merge_detect(detect) {
            self.broadcast_memb_join().await;
        }
    }

    async fn handle_memb_join(&mut self, join: MembJoin) {
        if let Some(commit) = self.srp.on_memb_join(join) {
            self.timers.arm(TimerKind::CommitTimeout);
            if commit.ring.rep == self.self_id {
                self.process_commit_token(commit.to_wire()).await;
            }
        }
    }

    async fn process_commit_token(&mut self, wire: totem_srp::MembCommitToken) {
        match self.srp.on_memb_commit_token(wire) {
            Ok(RecoveryTransition::Forward(next_wire)) => {
                if let Some(successor) = self.srp.membership.successor_of(self.self_id) {
                    let datagram = SrpDatagram::new(self.self_id, successor, SrpPayload::CommitToken(next_wire));
                    self.send_token_datagram(datagram).await;
                }
            }
            Ok(RecoveryTransition::Begin(recovery)) => self.begin_recovery(recovery).await,
            Err(e) => tracing::debug!(error = %e, "commit token rejected"),
        }
    }

    /// There is no wire message for per-peer replay acknowledgment in this
    /// implementation (see `DESIGN.md`); every pending peer is marked
    /// caught up immediately, and ordinary token `rtr` retransmission is
    /// what actually gets a lagging peer the messages it missed once
    /// OPERATIONAL traffic resumes.
    async fn begin_recovery(&mut self, recovery: RecoveryState) {
        let peers: Vec<NodeId> = recovery.pending_ranges().map(|r| r.peer).collect();
        for peer in peers {
            self.srp.on_recovery_delivered(peer);
        }
        self.run_sync_round().await;
    }

    async fn run_sync_round(&mut self) {
        let member_list: Vec<NodeId> = self.srp.membership.members().collect();
        let trans_list: Vec<NodeId> = self.prev_members.clone();
        let left: Vec<NodeId> = trans_list.iter().copied().filter(|n| !member_list.contains(n)).collect();

        self.pending_downlists.clear();
        self.sync.begin(&trans_list, &member_list, self.srp.ring);

        let own_downlist = Downlist { sender: self.self_id, old_members_count: trans_list.len() as u32, left };
        self.pending_downlists.push(own_downlist.clone());
        self.queue_cpg_message(CpgMessage::Downlist(own_downlist));

        loop {
            match self.sync.step() {
                SyncProgress::Done => break,
                SyncProgress::TryAgain => tokio::task::yield_now().await,
            }
        }

        if let Ok(winner) = reconcile(&self.pending_downlists) {
            self.sync.dispatch_confchg(&[], &winner.left);
        }

        self.reassembler.set_current_ring(self.srp.ring);
        self.srp.on_recovery_complete();
        self.timers.arm(TimerKind::TokenLoss);
        self.timers.arm(TimerKind::MergeDetect);
        self.prev_members = member_list;

        if let Some(successor) = self.srp.membership.successor_of(self.self_id) {
            self.transport.update_membership(self.self_id, successor, &self.address_book).await;

            if self.srp.membership.representative() == Some(self.self_id) {
                let token = Token::initial(self.srp.ring, self.self_id);
                let datagram = SrpDatagram::new(self.self_id, successor, SrpPayload::Token(token));
                self.send_token_datagram(datagram).await;
            }
        }
    }

    // ---- packed-message delivery --------------------------------------------

    fn deliver_packed_payload(&mut self, ring: RingId, originator: NodeId, msn: Msn, payload: &[u8]) {
        let frame = match PackedFrame::from_bytes(payload) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed packed frame");
                return;
            }
        };
        match frame {
            PackedFrame::Batch(messages) => {
                for msg in messages {
                    self.dispatch_service_message(msg);
                }
            }
            fragment => match self.reassembler.feed(ring, originator, msn, fragment) {
                Ok(Some((_key, message))) => self.dispatch_service_message(message),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "fragment reassembly failed"),
            },
        }
    }

    fn dispatch_service_message(&mut self, msg: PgMessage) {
        if msg.service != CPG_SERVICE {
            tracing::debug!(service = msg.service, "dropping message for unknown service");
            return;
        }
        let decoded: CpgMessage = match ciborium::from_reader(msg.body.as_slice()) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "failed to decode cpg message");
                return;
            }
        };
        match &decoded {
            CpgMessage::Downlist(dl) => self.pending_downlists.push(dl.clone()),
            CpgMessage::DownlistOld(dl) => self.pending_downlists.push(dl.clone().into()),
            _ => {}
        }
        self.cpg.borrow_mut().on_deliver(decoded);
    }

    fn queue_cpg_message(&mut self, msg: CpgMessage) {
        let mut body = Vec::new();
        if ciborium::into_writer(&msg, &mut body).is_err() {
            tracing::error!("failed to encode cpg message");
            return;
        }
        match self.packer.push(CPG_SERVICE, body) {
            Ok(frames) => {
                for frame in frames {
                    self.srp.queue_send(frame.to_bytes());
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to pack cpg message"),
        }
    }

    fn drain_cpg_outbound(&mut self) {
        let messages = self.cpg.borrow_mut().drain_outbound();
        for msg in messages {
            self.queue_cpg_message(msg);
        }
    }

    async fn drain_cpg_events(&mut self) {
        let events = self.cpg.borrow_mut().drain_events();
        for event in events {
            match event {
                CpgEvent::TotemMembership { to, group } => {
                    self.ipc_handle.push_totem_membership(to, &group).await;
                }
                CpgEvent::Confchg { to, group, joined, left } => {
                    for client in to {
                        self.ipc_handle.push_confchg(client, &group, &joined, &left).await;
                    }
                }
                CpgEvent::Deliver { to, group, source, payload } => {
                    for client in to {
                        self.ipc_handle.push_deliver(client, &group, source, &payload).await;
                    }
                }
            }
        }
    }

    // ---- client IPC ---------------------------------------------------------

    async fn handle_client_request(&mut self, request: ClientRequest) {
        let ClientRequest { client, op, reply } = request;
        let result = match op {
            ClientOp::Join { pid, group, want_totem_membership } => {
                self.cpg.borrow_mut().join(client, pid, group, want_totem_membership).map(|()| ClientReply::Ack)
            }
            ClientOp::Leave => self.cpg.borrow_mut().leave(client).map(|()| ClientReply::Ack),
            ClientOp::Mcast { payload } => self.cpg.borrow_mut().mcast(client, payload).map(|()| ClientReply::Ack),
            ClientOp::MembershipGet { group } => {
                let records = self.cpg.borrow().membership_get(&group).to_vec();
                Ok(ClientReply::Membership(records))
            }
            ClientOp::LocalGet => {
                let local = self.cpg.borrow().local_get(client).map(|(g, s)| (g.clone(), s));
                Ok(ClientReply::Local(local))
            }
            ClientOp::Disconnect => {
                self.cpg.borrow_mut().finalize(client);
                Ok(ClientReply::Ack)
            }
        };

        let reply_msg = result.unwrap_or_else(|e| ClientReply::Error(cpg_error_to_api(e)));
        let _ = reply.send(reply_msg);
    }

    // ---- timers ---------------------------------------------------------

    async fn handle_timer_tick(&mut self) {
        let now = tokio::time::Instant::now();
        let expired = self.timers.take_expired(now);
        for kind in expired {
            self.handle_timer_kind(kind).await;
        }
    }

    async fn handle_timer_kind(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::TokenLoss => {
                let actions = self.srp.on_token_lost();
                self.timers.apply_all(actions);
                self.broadcast_memb_join().await;
            }
            TimerKind::JoinBroadcast => {
                if self.srp.state == SrpState::Gather {
                    self.broadcast_memb_join().await;
                }
            }
            TimerKind::MergeDetect => {
                if self.srp.state == SrpState::Operational {
                    let detect = MembMergeDetect { sender: self.self_id, ring: self.srp.ring };
                    let datagram = SrpDatagram::new(self.self_id, BROADCAST, SrpPayload::MergeDetect(detect));
                    self.send_mcast_datagram(datagram).await;
                    self.timers.arm(TimerKind::MergeDetect);
                }
            }
            TimerKind::CommitTimeout => {
                if self.srp.state == SrpState::Commit {
                    tracing::warn!("commit token timed out, falling back to gather");
                    let actions = self.srp.on_token_lost();
                    self.timers.apply_all(actions);
                    self.broadcast_memb_join().await;
                }
            }
            TimerKind::Downcheck => {
                match self.transport.iface_check().await {
                    Ok(true) => tracing::info!("interface rebind detected"),
                    Ok(false) => {}
                    Err(e) => tracing::warn!(error = %e, "interface check failed"),
                }
                self.timers.arm(TimerKind::Downcheck);
            }
        }
    }
}

fn cpg_error_to_api(err: totem_cpg::CpgError) -> ApiError {
    match err {
        totem_cpg::CpgError::NotJoined => ApiError::NotExist,
        totem_cpg::CpgError::JoinInProgress => ApiError::Exist,
        totem_cpg::CpgError::NotLeaving => ApiError::NotExist,
        totem_cpg::CpgError::TryAgain => ApiError::TryAgain,
        totem_cpg::CpgError::InvalidGroup(e) => e,
    }
}
