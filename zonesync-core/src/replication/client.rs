//! Client role: pulls journal entries from a peer
//!
//! ```text
//! Connected ──ident──► IdentSent ──ident_success──► Identified
//!                          │  ▲                         │ pull_request
//!                challenge └──┘ chap_response           ▼
//!                                                  PullReqSent
//!                                      actions ◄──────┘    └──── wait ───► Wait
//!                                         │                                  │
//!                       apply, position, pull_request      actions / watchdog
//! ```
//!
//! [`ClientMachine`] holds only the transition logic; [`run`] drives it over
//! a connection, applying batches through the session manager.

use crate::replication::auth;
use crate::replication::config::PeerConfig;
use crate::replication::peer::{ConnectionHandle, ConnectionRole, Peer};
use crate::replication::transport::{self, Incoming};
use crate::replication::ReplicationService;
use crate::{Error, Result};
use std::collections::VecDeque;
use tokio::sync::watch;
use zonesync_protocol::{ActionsStatus, AuthSchema, Message, WireEntry};

/// Client-role protocol states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Connection open, nothing sent
    Connected,
    /// `ident` sent, waiting for the verdict
    IdentSent,
    /// Authenticated, no request outstanding
    Identified,
    /// `pull_request` outstanding
    PullReqSent,
    /// Server said `wait`; parked until it pushes or the watchdog fires
    Wait,
}

/// Work the driver must carry out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEffect {
    /// Send a message to the server
    Send(Message),
    /// Apply a batch, then report the new cursor with [`ClientMachine::batch_applied`]
    Apply(Vec<WireEntry>),
    /// The server rejected our credentials
    AuthFailed(String),
    /// The server no longer holds history after our cursor
    NoPosition,
}

/// Client-role transition logic
#[derive(Debug, Clone)]
pub struct ClientMachine {
    state: ClientState,
    node_name: String,
    auth_schema: AuthSchema,
    shared_key: String,
    cursor: u64,
}

impl ClientMachine {
    /// Client for node `node_name` pulling from `peer`, starting after `cursor`
    pub fn new(node_name: &str, peer: &PeerConfig, cursor: u64) -> Self {
        Self {
            state: ClientState::Connected,
            node_name: node_name.to_string(),
            auth_schema: peer.auth_schema,
            shared_key: peer.shared_key.clone(),
            cursor,
        }
    }

    /// Current state
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Last applied remote position
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Introduce ourselves
    pub fn start(&mut self) -> Vec<ClientEffect> {
        if self.state != ClientState::Connected {
            return Vec::new();
        }
        self.state = ClientState::IdentSent;
        let key = match self.auth_schema {
            AuthSchema::Pap => Some(self.shared_key.clone()),
            AuthSchema::Chap => None,
        };
        vec![ClientEffect::Send(Message::Ident {
            name: self.node_name.clone(),
            auth_schema: self.auth_schema,
            key,
        })]
    }

    fn pull(&mut self) -> ClientEffect {
        self.state = ClientState::PullReqSent;
        ClientEffect::Send(Message::PullRequest {
            position: self.cursor,
        })
    }

    /// React to a server message; out-of-state messages are ignored
    pub fn handle(&mut self, msg: Message) -> Result<Vec<ClientEffect>> {
        let effects = match (self.state, msg) {
            (ClientState::IdentSent, Message::Challenge { challenge })
                if self.auth_schema == AuthSchema::Chap =>
            {
                let response = auth::chap_response(&self.shared_key, &challenge)?;
                vec![ClientEffect::Send(Message::ChapResponse { response })]
            }
            (ClientState::IdentSent, Message::IdentSuccess) => {
                self.state = ClientState::Identified;
                vec![self.pull()]
            }
            (ClientState::IdentSent, Message::IdentFail { reason }) => {
                self.state = ClientState::Connected;
                vec![ClientEffect::AuthFailed(reason)]
            }
            (ClientState::PullReqSent | ClientState::Wait, Message::Actions { status, data }) => {
                self.state = ClientState::Identified;
                match status {
                    ActionsStatus::NoPosition => vec![ClientEffect::NoPosition],
                    ActionsStatus::Ok if data.is_empty() => {
                        self.state = ClientState::Wait;
                        Vec::new()
                    }
                    ActionsStatus::Ok => vec![ClientEffect::Apply(data)],
                }
            }
            (ClientState::PullReqSent, Message::Wait) => {
                self.state = ClientState::Wait;
                Vec::new()
            }
            (state, msg) => {
                tracing::warn!("Ignoring {} in client state {:?}", msg.command(), state);
                Vec::new()
            }
        };
        Ok(effects)
    }

    /// A batch is durable locally; acknowledge it and keep draining
    pub fn batch_applied(&mut self, cursor: u64) -> Vec<ClientEffect> {
        if self.state != ClientState::Identified {
            return Vec::new();
        }
        self.cursor = self.cursor.max(cursor);
        vec![
            ClientEffect::Send(Message::Position { value: self.cursor }),
            self.pull(),
        ]
    }

    /// Wait watchdog fired: ask again
    pub fn wait_expired(&mut self) -> Vec<ClientEffect> {
        if self.state != ClientState::Wait {
            return Vec::new();
        }
        vec![self.pull()]
    }
}

/// Pull from `peer` until the connection drops, fails or shutdown is signalled
pub(crate) async fn run(
    service: &ReplicationService,
    peer: &Peer,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let config = service.config();
    let stream = service
        .transport()
        .connect(peer.config(), config.connect_timeout)
        .await?;
    let mut conn = transport::framed(stream);
    let cursor = service.cursor(peer.name()).await?;

    let conn_id = service.next_connection_id();
    peer.attach(ConnectionHandle::new(conn_id, ConnectionRole::Client));
    tracing::info!("Connected to peer {} at {}", peer.name(), peer.config().address());

    let mut machine = ClientMachine::new(&config.node_name, peer.config(), cursor);
    let mut queue: VecDeque<ClientEffect> = machine.start().into();

    let result: Result<()> = async {
        loop {
            while let Some(effect) = queue.pop_front() {
                match effect {
                    ClientEffect::Send(msg) => transport::send(&mut conn, msg).await?,
                    ClientEffect::Apply(entries) => {
                        let outcome = service
                            .sessions()
                            .apply_remote_batch(peer.name(), entries)
                            .await?;
                        queue.extend(machine.batch_applied(outcome.cursor));
                    }
                    ClientEffect::AuthFailed(reason) => {
                        return Err(Error::auth(format!(
                            "peer {} rejected identification: {}",
                            peer.name(),
                            reason
                        )));
                    }
                    ClientEffect::NoPosition => return Err(Error::NoPosition(machine.cursor())),
                }
            }

            let limit = match machine.state() {
                ClientState::Wait => config.wait_timeout,
                _ => config.read_timeout,
            };

            let incoming = tokio::select! {
                incoming = transport::recv(&mut conn, limit) => incoming?,
                _ = super::stopped(&mut shutdown) => return Ok(()),
            };

            match incoming {
                Incoming::Message(msg) => {
                    tracing::debug!("<- {} from {}", msg.command(), peer.name());
                    queue.extend(machine.handle(msg)?);
                }
                Incoming::Invalid(e) => {
                    tracing::warn!("Ignoring invalid message from {}: {}", peer.name(), e);
                }
                Incoming::Closed => {
                    tracing::info!("Peer {} closed the connection", peer.name());
                    return Ok(());
                }
                Incoming::TimedOut if machine.state() == ClientState::Wait => {
                    tracing::debug!("Wait on {} expired, pulling again", peer.name());
                    queue.extend(machine.wait_expired());
                }
                Incoming::TimedOut => {
                    return Err(Error::protocol(format!(
                        "peer {} did not answer within {:?}",
                        peer.name(),
                        limit
                    )));
                }
            }
        }
    }
    .await;

    peer.detach(conn_id);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(schema: AuthSchema, cursor: u64) -> ClientMachine {
        let peer = PeerConfig::new("ns2", "127.0.0.1", 15353, "k").with_auth_schema(schema);
        ClientMachine::new("ns1", &peer, cursor)
    }

    fn entry(position: u64) -> WireEntry {
        WireEntry {
            position,
            origin: "ns2".into(),
            origin_position: position,
            action: "{}".into(),
        }
    }

    #[test]
    fn test_pap_handshake_then_pull() {
        let mut m = machine(AuthSchema::Pap, 5);
        let effects = m.start();
        assert_eq!(
            effects,
            vec![ClientEffect::Send(Message::Ident {
                name: "ns1".into(),
                auth_schema: AuthSchema::Pap,
                key: Some("k".into()),
            })]
        );
        assert_eq!(m.state(), ClientState::IdentSent);

        let effects = m.handle(Message::IdentSuccess).unwrap();
        assert_eq!(
            effects,
            vec![ClientEffect::Send(Message::PullRequest { position: 5 })]
        );
        assert_eq!(m.state(), ClientState::PullReqSent);
    }

    #[test]
    fn test_chap_answers_challenge() {
        let mut m = machine(AuthSchema::Chap, 0);
        m.start();
        let effects = m
            .handle(Message::Challenge {
                challenge: "abc".into(),
            })
            .unwrap();
        let expected = auth::chap_response("k", "abc").unwrap();
        assert_eq!(
            effects,
            vec![ClientEffect::Send(Message::ChapResponse { response: expected })]
        );
        assert_eq!(m.state(), ClientState::IdentSent);
    }

    #[test]
    fn test_ident_fail_reported() {
        let mut m = machine(AuthSchema::Chap, 0);
        m.start();
        let effects = m
            .handle(Message::IdentFail {
                reason: "bad key".into(),
            })
            .unwrap();
        assert_eq!(effects, vec![ClientEffect::AuthFailed("bad key".into())]);
        assert_eq!(m.state(), ClientState::Connected);
    }

    #[test]
    fn test_drain_loop_acknowledges_and_pulls_again() {
        let mut m = machine(AuthSchema::Pap, 2);
        m.start();
        m.handle(Message::IdentSuccess).unwrap();

        let effects = m
            .handle(Message::Actions {
                status: ActionsStatus::Ok,
                data: vec![entry(3), entry(4)],
            })
            .unwrap();
        assert_eq!(effects, vec![ClientEffect::Apply(vec![entry(3), entry(4)])]);
        assert_eq!(m.state(), ClientState::Identified);

        let effects = m.batch_applied(4);
        assert_eq!(
            effects,
            vec![
                ClientEffect::Send(Message::Position { value: 4 }),
                ClientEffect::Send(Message::PullRequest { position: 4 }),
            ]
        );
        assert_eq!(m.cursor(), 4);
    }

    #[test]
    fn test_wait_then_push_or_watchdog() {
        let mut m = machine(AuthSchema::Pap, 5);
        m.start();
        m.handle(Message::IdentSuccess).unwrap();
        assert!(m.handle(Message::Wait).unwrap().is_empty());
        assert_eq!(m.state(), ClientState::Wait);

        assert_eq!(
            m.wait_expired(),
            vec![ClientEffect::Send(Message::PullRequest { position: 5 })]
        );
        m.handle(Message::Wait).unwrap();

        let effects = m
            .handle(Message::Actions {
                status: ActionsStatus::Ok,
                data: vec![entry(6)],
            })
            .unwrap();
        assert_eq!(effects, vec![ClientEffect::Apply(vec![entry(6)])]);
    }

    #[test]
    fn test_no_position_and_out_of_state_messages() {
        let mut m = machine(AuthSchema::Pap, 10);
        // Not identified yet: data is ignored
        assert!(
            m.handle(Message::Actions {
                status: ActionsStatus::Ok,
                data: vec![entry(11)],
            })
            .unwrap()
            .is_empty()
        );
        assert_eq!(m.state(), ClientState::Connected);

        m.start();
        m.handle(Message::IdentSuccess).unwrap();
        let effects = m
            .handle(Message::Actions {
                status: ActionsStatus::NoPosition,
                data: vec![],
            })
            .unwrap();
        assert_eq!(effects, vec![ClientEffect::NoPosition]);
        assert!(m.wait_expired().is_empty());
    }
}
