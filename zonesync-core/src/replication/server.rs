//! Server role: authenticates peers and serves journal entries
//!
//! ```text
//! Connected ──ident(chap)──► IdentReceived ──chap_response──► Identified
//!     │                                                            │
//!     └───────────────ident(pap)───────────────────────────────────┤
//!                                                          pull_request
//!                                                                  ▼
//!                          WaitSent ◄── tail reached ── PullReqReceived
//!                              │                               │
//!                   journal advanced                     entries / no position
//!                              └──────────► ActionsSent ◄──────┘
//! ```
//!
//! A connection parked in `WaitSent` is an active waiter: the driver watches
//! the journal tail and pushes the next batch as soon as a commit lands.

use crate::journal::PullResult;
use crate::replication::auth;
use crate::replication::config::PeerConfig;
use crate::replication::peer::{ConnectionHandle, ConnectionRole, Peer};
use crate::replication::transport::{self, BoxedStream, Incoming};
use crate::replication::ReplicationService;
use crate::Result;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use zonesync_protocol::{ActionsStatus, AuthSchema, Message};

/// Server-role protocol states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Waiting for `ident`
    Connected,
    /// CHAP challenge sent
    IdentReceived,
    /// Peer authenticated
    Identified,
    /// Journal query in flight
    PullReqReceived,
    /// Told the peer to wait; a push is due when the journal advances
    WaitSent,
    /// Answered with `actions`
    ActionsSent,
}

impl ServerState {
    fn is_identified(self) -> bool {
        !matches!(self, Self::Connected | Self::IdentReceived)
    }
}

/// Work the driver must carry out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEffect {
    /// Send a message to the client
    Send(Message),
    /// Query the journal after this position, then call [`ServerMachine::pull_result`]
    Pull(u64),
    /// Persist the position a peer acknowledged
    Ack {
        /// Acknowledging peer
        peer: String,
        /// Acknowledged cursor
        position: u64,
    },
}

/// Server-role transition logic for one connection
#[derive(Debug, Clone)]
pub struct ServerMachine {
    state: ServerState,
    peers: Arc<HashMap<String, PeerConfig>>,
    claimed: Option<String>,
    challenge: Option<String>,
    peer: Option<String>,
    requested: u64,
    pushing: bool,
}

impl ServerMachine {
    /// Machine accepting the peers in `peers`, keyed by name
    pub fn new(peers: Arc<HashMap<String, PeerConfig>>) -> Self {
        Self {
            state: ServerState::Connected,
            peers,
            claimed: None,
            challenge: None,
            peer: None,
            requested: 0,
            pushing: false,
        }
    }

    /// Current state
    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Authenticated peer name
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    /// Whether the connection is an active waiter
    pub fn is_waiting(&self) -> bool {
        self.state == ServerState::WaitSent
    }

    fn reject(&mut self, name: &str, reason: &str) -> Vec<ServerEffect> {
        tracing::warn!("Rejected identification of {}: {}", name, reason);
        self.state = ServerState::Connected;
        self.claimed = None;
        self.challenge = None;
        vec![ServerEffect::Send(Message::IdentFail {
            reason: reason.to_string(),
        })]
    }

    fn accept(&mut self, name: String) -> Vec<ServerEffect> {
        tracing::info!("Peer {} identified", name);
        self.state = ServerState::Identified;
        self.peer = Some(name);
        self.claimed = None;
        self.challenge = None;
        vec![ServerEffect::Send(Message::IdentSuccess)]
    }

    fn on_ident(&mut self, name: String, schema: AuthSchema, key: Option<String>) -> Vec<ServerEffect> {
        let Some(peer) = self.peers.get(&name) else {
            return self.reject(&name, "unknown peer");
        };
        if peer.auth_schema != schema {
            return self.reject(&name, "auth schema mismatch");
        }

        match schema {
            AuthSchema::Pap => {
                let valid = key
                    .as_deref()
                    .is_some_and(|key| auth::verify_pap(&peer.shared_key, key));
                if valid {
                    self.accept(name)
                } else {
                    self.reject(&name, "invalid key")
                }
            }
            AuthSchema::Chap => {
                let challenge = auth::new_challenge();
                self.state = ServerState::IdentReceived;
                self.claimed = Some(name);
                self.challenge = Some(challenge.clone());
                vec![ServerEffect::Send(Message::Challenge { challenge })]
            }
        }
    }

    fn on_chap_response(&mut self, response: &str) -> Vec<ServerEffect> {
        let (Some(name), Some(challenge)) = (self.claimed.clone(), self.challenge.clone()) else {
            return self.reject("unknown", "no challenge outstanding");
        };
        let valid = self
            .peers
            .get(&name)
            .is_some_and(|peer| auth::verify_chap(&peer.shared_key, &challenge, response));
        if valid {
            self.accept(name)
        } else {
            self.reject(&name, "invalid response")
        }
    }

    /// React to a client message; out-of-state messages are ignored
    pub fn handle(&mut self, msg: Message) -> Vec<ServerEffect> {
        match (self.state, msg) {
            (ServerState::Connected, Message::Ident {
                name,
                auth_schema,
                key,
            }) => self.on_ident(name, auth_schema, key),
            (ServerState::IdentReceived, Message::ChapResponse { response }) => {
                self.on_chap_response(&response)
            }
            (
                ServerState::Identified | ServerState::WaitSent | ServerState::ActionsSent,
                Message::PullRequest { position },
            ) => {
                self.state = ServerState::PullReqReceived;
                self.requested = position;
                self.pushing = false;
                vec![ServerEffect::Pull(position)]
            }
            (state, Message::Position { value }) if state.is_identified() => match &self.peer {
                Some(peer) => vec![ServerEffect::Ack {
                    peer: peer.clone(),
                    position: value,
                }],
                None => Vec::new(),
            },
            (state, msg) => {
                tracing::warn!("Ignoring {} in server state {:?}", msg.command(), state);
                Vec::new()
            }
        }
    }

    /// Answer the outstanding pull with the journal's verdict
    pub fn pull_result(&mut self, result: PullResult) -> Vec<ServerEffect> {
        let pushing = std::mem::take(&mut self.pushing);
        match result {
            PullResult::Wait => {
                self.state = ServerState::WaitSent;
                if pushing {
                    // The client is still parked from the first `wait`
                    Vec::new()
                } else {
                    vec![ServerEffect::Send(Message::Wait)]
                }
            }
            PullResult::NoPosition => {
                self.state = ServerState::ActionsSent;
                vec![ServerEffect::Send(Message::Actions {
                    status: ActionsStatus::NoPosition,
                    data: Vec::new(),
                })]
            }
            PullResult::Entries(entries) => {
                self.state = ServerState::ActionsSent;
                vec![ServerEffect::Send(Message::Actions {
                    status: ActionsStatus::Ok,
                    data: entries.into_iter().map(Into::into).collect(),
                })]
            }
        }
    }

    /// The local journal moved; waiters get pushed the next batch
    pub fn journal_advanced(&mut self) -> Vec<ServerEffect> {
        if self.state != ServerState::WaitSent {
            return Vec::new();
        }
        self.state = ServerState::PullReqReceived;
        self.pushing = true;
        vec![ServerEffect::Pull(self.requested)]
    }
}

/// Serve one accepted connection until it closes, idles out or shutdown is signalled
pub(crate) async fn run(
    service: &ReplicationService,
    stream: BoxedStream,
    remote: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let config = service.config();
    let idle = config.wait_timeout + config.read_timeout;
    let mut conn = transport::framed(stream);
    let conn_id = service.next_connection_id();
    let mut tail_rx = service.sessions().subscribe_tail();
    let mut machine = ServerMachine::new(service.known_peers());
    let mut queue: VecDeque<ServerEffect> = VecDeque::new();
    let mut attached: Option<Arc<Peer>> = None;

    let result: Result<()> = async {
        loop {
            while let Some(effect) = queue.pop_front() {
                match effect {
                    ServerEffect::Send(msg) => transport::send(&mut conn, msg).await?,
                    ServerEffect::Pull(after) => {
                        // Commits landing after this point must wake us
                        tail_rx.borrow_and_update();
                        let result = service.pull(after).await?;
                        queue.extend(machine.pull_result(result));
                    }
                    ServerEffect::Ack { peer, position } => {
                        service.record_ack(&peer, position).await?;
                    }
                }
            }

            if attached.is_none() {
                if let Some(peer) = machine.peer().and_then(|name| service.peer(name)) {
                    peer.attach(ConnectionHandle::new(conn_id, ConnectionRole::Server));
                    attached = Some(peer);
                }
            }
            service.set_waiting(conn_id, machine.peer(), machine.is_waiting());

            let waiting = machine.is_waiting();
            tokio::select! {
                incoming = transport::recv(&mut conn, idle) => match incoming? {
                    Incoming::Message(msg) => {
                        tracing::debug!("<- {} from {}", msg.command(), remote);
                        queue.extend(machine.handle(msg));
                    }
                    Incoming::Invalid(e) => {
                        tracing::warn!("Ignoring invalid message from {}: {}", remote, e);
                    }
                    Incoming::Closed => return Ok(()),
                    Incoming::TimedOut => {
                        tracing::info!("Closing idle connection from {}", remote);
                        return Ok(());
                    }
                },
                changed = tail_rx.changed(), if waiting => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    queue.extend(machine.journal_advanced());
                }
                _ = super::stopped(&mut shutdown) => return Ok(()),
            }
        }
    }
    .await;

    service.set_waiting(conn_id, None, false);
    if let Some(peer) = attached {
        peer.detach(conn_id);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalEntry;

    fn peers() -> Arc<HashMap<String, PeerConfig>> {
        let mut peers = HashMap::new();
        peers.insert(
            "ns2".to_string(),
            PeerConfig::new("ns2", "127.0.0.1", 15353, "K"),
        );
        peers.insert(
            "ns3".to_string(),
            PeerConfig::new("ns3", "127.0.0.1", 15353, "P").with_auth_schema(AuthSchema::Pap),
        );
        Arc::new(peers)
    }

    fn ident(name: &str, auth_schema: AuthSchema, key: Option<&str>) -> Message {
        Message::Ident {
            name: name.to_string(),
            auth_schema,
            key: key.map(str::to_string),
        }
    }

    fn challenge_of(effects: &[ServerEffect]) -> String {
        match effects {
            [ServerEffect::Send(Message::Challenge { challenge })] => challenge.clone(),
            other => panic!("expected a challenge, got {:?}", other),
        }
    }

    fn identified() -> ServerMachine {
        let mut m = ServerMachine::new(peers());
        m.handle(ident("ns3", AuthSchema::Pap, Some("P")));
        assert_eq!(m.state(), ServerState::Identified);
        m
    }

    fn entry(position: u64) -> JournalEntry {
        JournalEntry {
            position,
            origin: "ns1".into(),
            origin_position: position,
            action: "{}".into(),
        }
    }

    #[test]
    fn test_chap_accepts_correct_response() {
        let mut m = ServerMachine::new(peers());
        let c = challenge_of(&m.handle(ident("ns2", AuthSchema::Chap, None)));
        assert_eq!(m.state(), ServerState::IdentReceived);

        let response = auth::chap_response("K", &c).unwrap();
        let effects = m.handle(Message::ChapResponse { response });
        assert_eq!(effects, vec![ServerEffect::Send(Message::IdentSuccess)]);
        assert_eq!(m.peer(), Some("ns2"));
    }

    #[test]
    fn test_chap_rejects_wrong_response_and_allows_retry() {
        let mut m = ServerMachine::new(peers());
        let c = challenge_of(&m.handle(ident("ns2", AuthSchema::Chap, None)));

        let response = auth::chap_response("wrong", &c).unwrap();
        let effects = m.handle(Message::ChapResponse { response });
        assert!(matches!(
            effects.as_slice(),
            [ServerEffect::Send(Message::IdentFail { .. })]
        ));
        assert_eq!(m.state(), ServerState::Connected);
        assert_eq!(m.peer(), None);

        // Unauthenticated connections cannot pull
        assert!(m.handle(Message::PullRequest { position: 0 }).is_empty());

        let c = challenge_of(&m.handle(ident("ns2", AuthSchema::Chap, None)));
        let response = auth::chap_response("K", &c).unwrap();
        m.handle(Message::ChapResponse { response });
        assert_eq!(m.state(), ServerState::Identified);
    }

    #[test]
    fn test_pap_and_unknown_peers() {
        let mut m = ServerMachine::new(peers());
        let effects = m.handle(ident("ns3", AuthSchema::Pap, Some("nope")));
        assert!(matches!(
            effects.as_slice(),
            [ServerEffect::Send(Message::IdentFail { .. })]
        ));

        let effects = m.handle(ident("ghost", AuthSchema::Pap, Some("P")));
        assert_eq!(
            effects,
            vec![ServerEffect::Send(Message::IdentFail {
                reason: "unknown peer".into()
            })]
        );

        // Schema must match the peer's configuration
        let effects = m.handle(ident("ns2", AuthSchema::Pap, Some("K")));
        assert!(matches!(
            effects.as_slice(),
            [ServerEffect::Send(Message::IdentFail { .. })]
        ));

        m.handle(ident("ns3", AuthSchema::Pap, Some("P")));
        assert_eq!(m.peer(), Some("ns3"));
    }

    #[test]
    fn test_pull_answers() {
        let mut m = identified();
        assert_eq!(
            m.handle(Message::PullRequest { position: 2 }),
            vec![ServerEffect::Pull(2)]
        );
        assert_eq!(m.state(), ServerState::PullReqReceived);

        let effects = m.pull_result(PullResult::Entries(vec![entry(3), entry(4), entry(5)]));
        match effects.as_slice() {
            [ServerEffect::Send(Message::Actions { status, data })] => {
                assert_eq!(*status, ActionsStatus::Ok);
                let positions: Vec<u64> = data.iter().map(|e| e.position).collect();
                assert_eq!(positions, vec![3, 4, 5]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(m.state(), ServerState::ActionsSent);

        m.handle(Message::PullRequest { position: 10 });
        assert_eq!(
            m.pull_result(PullResult::NoPosition),
            vec![ServerEffect::Send(Message::Actions {
                status: ActionsStatus::NoPosition,
                data: vec![],
            })]
        );
    }

    #[test]
    fn test_wait_then_push_once() {
        let mut m = identified();
        m.handle(Message::PullRequest { position: 5 });
        assert_eq!(
            m.pull_result(PullResult::Wait),
            vec![ServerEffect::Send(Message::Wait)]
        );
        assert!(m.is_waiting());

        // A spurious wake-up re-queries without a second `wait`
        assert_eq!(m.journal_advanced(), vec![ServerEffect::Pull(5)]);
        assert!(m.pull_result(PullResult::Wait).is_empty());
        assert!(m.is_waiting());

        assert_eq!(m.journal_advanced(), vec![ServerEffect::Pull(5)]);
        let effects = m.pull_result(PullResult::Entries(vec![entry(6)]));
        assert!(matches!(
            effects.as_slice(),
            [ServerEffect::Send(Message::Actions { data, .. })] if data.len() == 1 && data[0].position == 6
        ));
        assert!(!m.is_waiting());
        assert!(m.journal_advanced().is_empty());
    }

    #[test]
    fn test_position_acknowledged_only_when_identified() {
        let mut m = ServerMachine::new(peers());
        assert!(m.handle(Message::Position { value: 3 }).is_empty());

        let mut m = identified();
        assert_eq!(
            m.handle(Message::Position { value: 3 }),
            vec![ServerEffect::Ack {
                peer: "ns3".into(),
                position: 3
            }]
        );
    }
}
