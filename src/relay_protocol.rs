use serde::Serialize;
use serde_json::Value;

use crate::replication::{Commit, SessionId, Transaction};
use crate::state::MazeState;

#[derive(Debug)]
pub enum ParsedClientMessage {
    Create { state: MazeState },
    Join { session_id: SessionId },
    Submit { origin: String, transaction: Transaction },
    Ping { t: f64 },
}

pub fn parse_client_message(raw: &str) -> Option<ParsedClientMessage> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let object = value.as_object()?;
    let message_type = object.get("type")?.as_str()?;

    match message_type {
        "create" => {
            let state: MazeState = serde_json::from_value(object.get("state")?.clone()).ok()?;
            Some(ParsedClientMessage::Create { state })
        }
        "join" => {
            let session_id = SessionId::parse(object.get("sessionId")?.as_str()?.trim()).ok()?;
            Some(ParsedClientMessage::Join { session_id })
        }
        "submit" => {
            let origin = object.get("origin")?.as_str()?.to_string();
            let transaction: Transaction =
                serde_json::from_value(object.get("transaction")?.clone()).ok()?;
            if transaction.is_empty() {
                return None;
            }
            Some(ParsedClientMessage::Submit {
                origin,
                transaction,
            })
        }
        "ping" => {
            let t = object.get("t")?.as_f64()?;
            if !t.is_finite() {
                return None;
            }
            Some(ParsedClientMessage::Ping { t })
        }
        _ => None,
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Created {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
    Joined {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        state: MazeState,
        sequence: u64,
    },
    Commit(Commit),
    Pong {
        t: f64,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| {
            format!(r#"{{"type":"error","message":"encode failed: {err}"}}"#)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::Mutation;

    #[test]
    fn parse_create_message() {
        let parsed = parse_client_message(
            r#"{"type":"create","state":{"rows":[[0,0,0],[0,1,0],[0,0,0]],"playerList":[]}}"#,
        )
        .expect("create message should parse");
        match parsed {
            ParsedClientMessage::Create { state } => {
                assert_eq!(state.grid.width(), 3);
                assert!(state.is_passable(1, 1));
                assert!(state.players.is_empty());
            }
            _ => panic!("expected create message"),
        }
    }

    #[test]
    fn parse_create_rejects_ragged_grid() {
        let parsed = parse_client_message(
            r#"{"type":"create","state":{"rows":[[0,0,0],[0,1]],"playerList":[]}}"#,
        );
        assert!(parsed.is_none());
    }

    #[test]
    fn parse_join_validates_session_id() {
        let parsed = parse_client_message(r#"{"type":"join","sessionId":"abcDEF1234"}"#);
        assert!(matches!(
            parsed,
            Some(ParsedClientMessage::Join { ref session_id }) if session_id.as_str() == "abcDEF1234"
        ));
        assert!(parse_client_message(r#"{"type":"join","sessionId":"nope"}"#).is_none());
        assert!(parse_client_message(r#"{"type":"join"}"#).is_none());
    }

    #[test]
    fn parse_submit_message() {
        let parsed = parse_client_message(
            r#"{"type":"submit","origin":"u1","transaction":{"mutations":[
                {"op":"remove_player","number":2},
                {"op":"set_position","number":1,"x":3,"y":1}
            ]}}"#,
        )
        .expect("submit message should parse");
        match parsed {
            ParsedClientMessage::Submit {
                origin,
                transaction,
            } => {
                assert_eq!(origin, "u1");
                assert_eq!(
                    transaction.mutations,
                    vec![
                        Mutation::RemovePlayer { number: 2 },
                        Mutation::SetPosition {
                            number: 1,
                            x: 3,
                            y: 1
                        }
                    ]
                );
            }
            _ => panic!("expected submit message"),
        }
    }

    #[test]
    fn parse_submit_rejects_empty_or_unknown_mutations() {
        assert!(parse_client_message(
            r#"{"type":"submit","origin":"u1","transaction":{"mutations":[]}}"#
        )
        .is_none());
        assert!(parse_client_message(
            r#"{"type":"submit","origin":"u1","transaction":{"mutations":[{"op":"teleport"}]}}"#
        )
        .is_none());
    }

    #[test]
    fn parse_ping_requires_finite_number() {
        let parsed = parse_client_message(r#"{"type":"ping","t":12.5}"#);
        assert!(matches!(parsed, Some(ParsedClientMessage::Ping { .. })));
        assert!(parse_client_message(r#"{"type":"ping","t":"soon"}"#).is_none());
        assert!(parse_client_message(r#"{"type":"dance"}"#).is_none());
    }

    #[test]
    fn server_messages_are_tagged() {
        let id = SessionId::parse("abcDEF1234").expect("valid id");
        let created: Value =
            serde_json::from_str(&ServerMessage::Created { session_id: id }.to_text())
                .expect("valid json");
        assert_eq!(created["type"], "created");
        assert_eq!(created["sessionId"], "abcDEF1234");

        let error: Value =
            serde_json::from_str(&ServerMessage::error("bad").to_text()).expect("valid json");
        assert_eq!(error["type"], "error");
        assert_eq!(error["message"], "bad");
    }
}
