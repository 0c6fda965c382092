//! Typed replication messages
//!
//! | command         | direction        | fields                                 |
//! |-----------------|------------------|----------------------------------------|
//! | `ident`         | client → server  | `name`, `auth_schema`, `key` (PAP only)|
//! | `challenge`     | server → client  | `challenge`                            |
//! | `chap_response` | client → server  | `response`                             |
//! | `ident_success` | server → client  |                                        |
//! | `ident_fail`    | server → client  | `reason`                               |
//! | `pull_request`  | client → server  | `position`                             |
//! | `actions`       | server → client  | `status`, `data`                       |
//! | `wait`          | server → client  |                                        |
//! | `position`      | client → server  | `value`                                |

use crate::error::{ProtocolError, Result};
use crate::frame::Frame;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Peer authentication schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthSchema {
    /// Shared key sent in clear
    Pap,
    /// Challenge/response over the shared key
    Chap,
}

impl AuthSchema {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pap => "pap",
            Self::Chap => "chap",
        }
    }
}

impl fmt::Display for AuthSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthSchema {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pap" => Ok(Self::Pap),
            "chap" => Ok(Self::Chap),
            other => Err(ProtocolError::malformed(format!(
                "unknown auth schema '{}'",
                other
            ))),
        }
    }
}

/// Outcome carried by an `actions` message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionsStatus {
    /// Entries follow (possibly none)
    Ok,
    /// The requested position predates the retained journal history
    NoPosition,
}

impl ActionsStatus {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::NoPosition => "NO_POSITION",
        }
    }
}

impl FromStr for ActionsStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "OK" => Ok(Self::Ok),
            "NO_POSITION" => Ok(Self::NoPosition),
            other => Err(ProtocolError::malformed(format!(
                "unknown actions status '{}'",
                other
            ))),
        }
    }
}

/// One journal entry as shipped to a pulling peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEntry {
    /// Position in the sending node's journal
    pub position: u64,
    /// Node where the action was first committed
    pub origin: String,
    /// Position the action holds in its origin's journal
    pub origin_position: u64,
    /// Serialized action dump
    pub action: String,
}

/// Replication protocol messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Client introduces itself
    Ident {
        /// Configured peer name of the client node
        name: String,
        /// Authentication schema the client wants to use
        auth_schema: AuthSchema,
        /// Shared key, only sent with PAP
        key: Option<String>,
    },
    /// Server CHAP challenge
    Challenge {
        /// Hex-encoded random challenge
        challenge: String,
    },
    /// Client answer to a CHAP challenge
    ChapResponse {
        /// Hex-encoded HMAC of the challenge
        response: String,
    },
    /// Authentication accepted
    IdentSuccess,
    /// Authentication rejected
    IdentFail {
        /// Human readable reason
        reason: String,
    },
    /// Ask for journal entries after `position`
    PullRequest {
        /// Last position the client has applied
        position: u64,
    },
    /// Batch of journal entries
    Actions {
        /// Batch status
        status: ActionsStatus,
        /// Entries in ascending position order
        data: Vec<WireEntry>,
    },
    /// Nothing new; the server will push once the journal advances
    Wait,
    /// Client acknowledges its persisted cursor
    Position {
        /// Cursor value
        value: u64,
    },
}

impl Message {
    /// Wire command name
    pub fn command(&self) -> &'static str {
        match self {
            Self::Ident { .. } => "ident",
            Self::Challenge { .. } => "challenge",
            Self::ChapResponse { .. } => "chap_response",
            Self::IdentSuccess => "ident_success",
            Self::IdentFail { .. } => "ident_fail",
            Self::PullRequest { .. } => "pull_request",
            Self::Actions { .. } => "actions",
            Self::Wait => "wait",
            Self::Position { .. } => "position",
        }
    }
}

impl TryFrom<Message> for Frame {
    type Error = ProtocolError;

    fn try_from(msg: Message) -> Result<Self> {
        let frame = Frame::new(msg.command());
        let frame = match msg {
            Message::Ident {
                name,
                auth_schema,
                key,
            } => {
                let frame = frame
                    .with("name", name)
                    .with("auth_schema", auth_schema.as_str());
                match key {
                    Some(key) => frame.with("key", key),
                    None => frame,
                }
            }
            Message::Challenge { challenge } => frame.with("challenge", challenge),
            Message::ChapResponse { response } => frame.with("response", response),
            Message::IdentSuccess | Message::Wait => frame,
            Message::IdentFail { reason } => frame.with("reason", reason),
            Message::PullRequest { position } => frame.with("position", position),
            Message::Actions { status, data } => {
                let data = serde_json::to_value(data)?;
                frame.with("status", status.as_str()).with("data", data)
            }
            Message::Position { value } => frame.with("value", value),
        };
        Ok(frame)
    }
}

fn required_str(frame: &Frame, command: &str, field: &str) -> Result<String> {
    frame
        .get_str(field)
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::missing(command, field))
}

fn required_u64(frame: &Frame, command: &str, field: &str) -> Result<u64> {
    frame
        .get_u64(field)
        .ok_or_else(|| ProtocolError::missing(command, field))
}

impl TryFrom<Frame> for Message {
    type Error = ProtocolError;

    fn try_from(frame: Frame) -> Result<Self> {
        let command = frame
            .command()
            .ok_or_else(|| ProtocolError::missing("<none>", "command"))?
            .to_string();
        let cmd = command.as_str();

        let msg = match cmd {
            "ident" => Message::Ident {
                name: required_str(&frame, cmd, "name")?,
                auth_schema: required_str(&frame, cmd, "auth_schema")?.parse()?,
                key: frame.get_str("key").map(str::to_string),
            },
            "challenge" => Message::Challenge {
                challenge: required_str(&frame, cmd, "challenge")?,
            },
            "chap_response" => Message::ChapResponse {
                response: required_str(&frame, cmd, "response")?,
            },
            "ident_success" => Message::IdentSuccess,
            "ident_fail" => Message::IdentFail {
                reason: frame.get_str("reason").unwrap_or_default().to_string(),
            },
            "pull_request" => Message::PullRequest {
                position: required_u64(&frame, cmd, "position")?,
            },
            "actions" => {
                let status: ActionsStatus = required_str(&frame, cmd, "status")?.parse()?;
                let data = match frame.get("data") {
                    Some(value) => serde_json::from_value(value.clone())?,
                    None if status == ActionsStatus::NoPosition => Vec::new(),
                    None => return Err(ProtocolError::missing(cmd, "data")),
                };
                Message::Actions { status, data }
            }
            "wait" => Message::Wait,
            "position" => Message::Position {
                value: required_u64(&frame, cmd, "value")?,
            },
            _ => return Err(ProtocolError::UnknownCommand(command)),
        };

        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn through_frame(msg: Message) -> Message {
        Message::try_from(Frame::try_from(msg).unwrap()).unwrap()
    }

    #[test]
    fn test_ident_pap_carries_key() {
        let msg = Message::Ident {
            name: "ns1".into(),
            auth_schema: AuthSchema::Pap,
            key: Some("secret".into()),
        };
        let frame = Frame::try_from(msg.clone()).unwrap();
        assert_eq!(frame.get_str("key"), Some("secret"));
        assert_eq!(frame.get_str("auth_schema"), Some("pap"));
        assert_eq!(through_frame(msg.clone()), msg);
    }

    #[test]
    fn test_ident_chap_has_no_key() {
        let frame = Frame::try_from(Message::Ident {
            name: "ns1".into(),
            auth_schema: AuthSchema::Chap,
            key: None,
        })
        .unwrap();
        assert!(frame.get("key").is_none());
    }

    #[test]
    fn test_actions_with_entries() {
        let msg = Message::Actions {
            status: ActionsStatus::Ok,
            data: vec![
                WireEntry {
                    position: 3,
                    origin: "ns1".into(),
                    origin_position: 3,
                    action: r#"{"name":"create_arena","fields":{"arena":"acme"}}"#.into(),
                },
                WireEntry {
                    position: 4,
                    origin: "ns2".into(),
                    origin_position: 1,
                    action: r#"{"name":"delete_arena","fields":{"arena":"acme"}}"#.into(),
                },
            ],
        };
        assert_eq!(through_frame(msg.clone()), msg);
    }

    #[test]
    fn test_actions_data_encodes_as_array() {
        let frame = Frame::try_from(Message::Actions {
            status: ActionsStatus::NoPosition,
            data: vec![],
        })
        .unwrap();
        assert_eq!(frame.get("data"), Some(&serde_json::json!([])));
        assert_eq!(frame.get_str("status"), Some("NO_POSITION"));
    }

    #[test]
    fn test_no_position_without_data() {
        let frame = Frame::new("actions").with("status", "NO_POSITION");
        let msg = Message::try_from(frame).unwrap();
        assert_eq!(
            msg,
            Message::Actions {
                status: ActionsStatus::NoPosition,
                data: vec![]
            }
        );
    }

    #[test]
    fn test_ok_actions_require_data() {
        let frame = Frame::new("actions").with("status", "OK");
        assert!(matches!(
            Message::try_from(frame),
            Err(ProtocolError::MissingField { .. })
        ));
    }

    #[test]
    fn test_unknown_command() {
        let frame = Frame::new("reticulate_splines");
        assert!(matches!(
            Message::try_from(frame),
            Err(ProtocolError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_pull_request_requires_numeric_position() {
        let frame = Frame::new("pull_request").with("position", "twelve");
        assert!(Message::try_from(frame).is_err());
    }

    #[test]
    fn test_auth_schema_parse_is_case_insensitive() {
        assert_eq!("CHAP".parse::<AuthSchema>().unwrap(), AuthSchema::Chap);
        assert!("kerberos".parse::<AuthSchema>().is_err());
    }
}
