// JSON wire protocol between browser clients and the auction server.
//
// Every frame is an object with a `type` discriminator. Room-scoped commands
// act on the room the connection last created, joined, or opened.

use cricket_core::bidding::PriceUnit;
use cricket_core::layout::{LeaderboardRow, SlotRole};
use cricket_core::room::{LogEntry, Room};
use serde::{Deserialize, Serialize};

/// Client → server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Announce a stable identity. Without a `uid` the server mints one.
    Identify {
        #[serde(default)]
        uid: Option<String>,
    },
    /// Create a room and join it as its first team (and admin).
    CreateRoom { team_name: String },
    JoinRoom { room: String, team_name: String },
    /// Watch a room, reattaching to this identity's team if it has one.
    OpenRoom { room: String },
    UpdateConfig {
        #[serde(default)]
        season: Option<String>,
        #[serde(default)]
        cf1: Option<f64>,
        #[serde(default)]
        cf2: Option<f64>,
        #[serde(default)]
        cf3: Option<f64>,
    },
    GenerateSets,
    StartAuction,
    StartBid,
    RaiseBid { increment_lakhs: u32 },
    CustomBid { amount: f64, unit: PriceUnit },
    SitOut,
    UseTimeBank,
    SkipPlayer,
    AssignSlot {
        role: SlotRole,
        index: usize,
        player_id: String,
    },
    ClearSlot { role: SlotRole, index: usize },
    FinalizeLayout,
    GetLeaderboard,
}

/// Full view of one room as seen by one connection.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    /// Display form of the room code.
    pub room: String,
    pub your_team_id: Option<String>,
    pub is_admin: bool,
    /// Server clock, so clients can render countdowns against deadlines.
    pub server_time: i64,
    pub state: Room,
    /// Most recent audit lines, oldest first.
    pub logs: Vec<LogEntry>,
}

/// Server → client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    Identified { uid: String },
    RoomSnapshot(RoomSnapshot),
    ActionRejected { kind: String, reason: String },
    Leaderboard {
        room: String,
        rows: Vec<LeaderboardRow>,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unit_and_struct_commands() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"START_BID"}"#).unwrap();
        assert_eq!(msg, ClientMessage::StartBid);

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"CUSTOM_BID","amount":2.5,"unit":"crore"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::CustomBid {
                amount: 2.5,
                unit: PriceUnit::Crore
            }
        );

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"ASSIGN_SLOT","role":"AR","index":1,"player_id":"p9"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::AssignSlot {
                role: SlotRole::Ar,
                index: 1,
                player_id: "p9".into()
            }
        );
    }

    #[test]
    fn optional_fields_may_be_omitted() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"IDENTIFY"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Identify { uid: None });

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"UPDATE_CONFIG","cf1":12}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::UpdateConfig {
                season: None,
                cf1: Some(12.0),
                cf2: None,
                cf3: None
            }
        );
    }

    #[test]
    fn unknown_type_is_an_error() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"DROP_TABLE"}"#).is_err());
    }

    #[test]
    fn rejection_serializes_with_tag() {
        let json = ServerMessage::ActionRejected {
            kind: "rejected".into(),
            reason: "time bank is empty".into(),
        }
        .to_json()
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "ACTION_REJECTED");
        assert_eq!(value["kind"], "rejected");
        assert_eq!(value["reason"], "time bank is empty");
    }

    #[test]
    fn snapshot_fields_sit_beside_the_tag() {
        use cricket_core::room::{RoomCode, RoomConfig};
        let room = Room::new(
            RoomCode::parse("qwerty").unwrap(),
            5,
            RoomConfig {
                season: "2024".into(),
                cf1: 30.0,
                cf2: 2000.0,
                cf3: 1.0,
            },
        );
        let json = ServerMessage::RoomSnapshot(RoomSnapshot {
            room: room.code.display_code(),
            your_team_id: None,
            is_admin: false,
            server_time: 42,
            state: room,
            logs: vec![],
        })
        .to_json()
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "ROOM_SNAPSHOT");
        assert_eq!(value["room"], "QWERTY");
        assert_eq!(value["state"]["code"], "qwerty");
        assert_eq!(value["server_time"], 42);
    }
}
