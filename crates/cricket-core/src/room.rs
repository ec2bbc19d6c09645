// Room aggregate: teams, players, auction pointer, and squad layouts.
//
// A Room is the unit of atomic persistence. Every operation reads one Room
// snapshot, computes a complete replacement, and commits it in one write.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{AuctionError, AuctionResult};
use crate::layout::TeamLayout;
use crate::rules::{AuctionRules, BID_UNIT_LAKHS};
use crate::scoring::Coefficients;

/// Team colours, handed out first-unused-wins. The palette size caps the
/// number of teams in a room.
pub const PALETTE: &[&str] = &[
    "#e63946", "#1d3557", "#2a9d8f", "#f4a261", "#6a4c93", "#ffb703", "#118ab2", "#8d99ae",
    "#d62828", "#06d6a0",
];

const SHORT_CODE_LEN: usize = 6;

// ---------------------------------------------------------------------------
// Room code
// ---------------------------------------------------------------------------

/// Room identifier. Six-letter codes are case-insensitive (stored lowercase,
/// shown uppercase); anything else is an opaque legacy key kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    /// Canonicalize user input. Returns `None` for blank input.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if is_short_code(trimmed) {
            Some(RoomCode(trimmed.to_ascii_lowercase()))
        } else {
            Some(RoomCode(trimmed.to_string()))
        }
    }

    /// A fresh random six-letter code.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let code: String = (0..SHORT_CODE_LEN)
            .map(|_| char::from(b'a' + rng.gen_range(0..26u8)))
            .collect();
        RoomCode(code)
    }

    /// Storage key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Form shown to players.
    pub fn display_code(&self) -> String {
        if is_short_code(&self.0) {
            self.0.to_ascii_uppercase()
        } else {
            self.0.clone()
        }
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_code())
    }
}

fn is_short_code(s: &str) -> bool {
    s.len() == SHORT_CODE_LEN && s.chars().all(|c| c.is_ascii_alphabetic())
}

// ---------------------------------------------------------------------------
// Room-level records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Lobby,
    Auction,
    Completed,
}

/// Season and scoring coefficients. Editable by the admin until the auction
/// starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomConfig {
    pub season: String,
    #[serde(rename = "CF1")]
    pub cf1: f64,
    #[serde(rename = "CF2")]
    pub cf2: f64,
    #[serde(rename = "CF3")]
    pub cf3: f64,
}

impl RoomConfig {
    pub fn coefficients(&self) -> Coefficients {
        Coefficients {
            cf1: self.cf1,
            cf2: self.cf2,
            cf3: self.cf3,
        }
    }
}

/// A player on a team's bought list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoughtPlayer {
    pub name: String,
    pub price_lakhs: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: String,
    pub color: String,
    pub purse_remaining_lakhs: u32,
    pub time_bank_seconds: u32,
    pub owner_uid: String,
    #[serde(default)]
    pub players_bought: BTreeMap<String, BoughtPlayer>,
}

impl Team {
    /// A team that cannot afford even one bid step is out for the rest of
    /// the auction.
    pub fn is_out_of_purse(&self) -> bool {
        self.purse_remaining_lakhs < BID_UNIT_LAKHS
    }

    pub fn squad_size(&self) -> usize {
        self.players_bought.len()
    }
}

/// Player lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    NotStarted,
    InAuction,
    Sold,
    Unsold,
}

impl PlayerStatus {
    pub fn is_settled(self) -> bool {
        matches!(self, PlayerStatus::Sold | PlayerStatus::Unsold)
    }

    pub fn can_become(self, next: PlayerStatus) -> bool {
        matches!(
            (self, next),
            (PlayerStatus::NotStarted, PlayerStatus::InAuction)
                | (PlayerStatus::InAuction, PlayerStatus::Sold)
                | (PlayerStatus::InAuction, PlayerStatus::Unsold)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub name: String,
    pub base_price_lakhs: u32,
    pub status: PlayerStatus,
    #[serde(default)]
    pub sold_to_team_id: Option<String>,
    #[serde(default)]
    pub sold_price_lakhs: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuctionStatus {
    NotStarted,
    Running,
    ShowingResult,
    Finished,
}

/// The live auction pointer and current-player bidding state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuctionState {
    pub sets: Vec<Vec<String>>,
    pub current_set_index: usize,
    pub current_player_index: usize,
    pub current_bid_lakhs: Option<u32>,
    pub current_bid_team_id: Option<String>,
    /// Absolute epoch-millisecond deadline for the current player.
    pub bid_deadline_ts: Option<i64>,
    pub status: AuctionStatus,
    /// Teams that opted out of the current player. Emptied on every advance.
    #[serde(default)]
    pub sat_out_teams: BTreeSet<String>,
    pub result_message: Option<String>,
    pub result_until_ts: Option<i64>,
}

impl AuctionState {
    pub fn new(sets: Vec<Vec<String>>) -> Self {
        AuctionState {
            sets,
            current_set_index: 0,
            current_player_index: 0,
            current_bid_lakhs: None,
            current_bid_team_id: None,
            bid_deadline_ts: None,
            status: AuctionStatus::NotStarted,
            sat_out_teams: BTreeSet::new(),
            result_message: None,
            result_until_ts: None,
        }
    }

    /// The player under the pointer, if the pointer is in range.
    pub fn current_player_id(&self) -> Option<&str> {
        self.sets
            .get(self.current_set_index)
            .and_then(|set| set.get(self.current_player_index))
            .map(String::as_str)
    }

    /// The pointer position after the current player: the next slot in this
    /// set, else the first slot of the next non-empty set.
    pub fn next_pointer(&self) -> Option<(usize, usize)> {
        let set_len = self
            .sets
            .get(self.current_set_index)
            .map(Vec::len)
            .unwrap_or(0);
        if self.current_player_index + 1 < set_len {
            return Some((self.current_set_index, self.current_player_index + 1));
        }
        (self.current_set_index + 1..self.sets.len())
            .find(|&s| !self.sets[s].is_empty())
            .map(|s| (s, 0))
    }

    pub fn total_players(&self) -> usize {
        self.sets.iter().map(Vec::len).sum()
    }

    pub(crate) fn clear_bidding(&mut self) {
        self.current_bid_lakhs = None;
        self.current_bid_team_id = None;
        self.bid_deadline_ts = None;
        self.sat_out_teams.clear();
    }
}

/// One audit-trail line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: i64,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub code: RoomCode,
    pub status: RoomStatus,
    pub created_at: i64,
    pub config: RoomConfig,
    pub admin_uid: Option<String>,
    #[serde(default)]
    pub teams: BTreeMap<String, Team>,
    #[serde(default)]
    pub players: BTreeMap<String, Player>,
    pub auction: Option<AuctionState>,
    #[serde(default)]
    pub team_layout: BTreeMap<String, TeamLayout>,
}

/// A fully computed replacement room and the audit lines it produced.
#[derive(Debug, Clone)]
pub struct RoomUpdate {
    pub room: Room,
    pub log: Vec<String>,
}

impl RoomUpdate {
    pub fn new(room: Room) -> Self {
        RoomUpdate {
            room,
            log: Vec::new(),
        }
    }

    pub fn with_log(room: Room, line: impl Into<String>) -> Self {
        RoomUpdate {
            room,
            log: vec![line.into()],
        }
    }
}

impl Room {
    pub fn new(code: RoomCode, created_at: i64, config: RoomConfig) -> Self {
        Room {
            code,
            status: RoomStatus::Lobby,
            created_at,
            config,
            admin_uid: None,
            teams: BTreeMap::new(),
            players: BTreeMap::new(),
            auction: None,
            team_layout: BTreeMap::new(),
        }
    }

    pub fn team(&self, team_id: &str) -> AuctionResult<&Team> {
        self.teams
            .get(team_id)
            .ok_or_else(|| AuctionError::not_found(format!("team {team_id}")))
    }

    pub fn team_mut(&mut self, team_id: &str) -> AuctionResult<&mut Team> {
        self.teams
            .get_mut(team_id)
            .ok_or_else(|| AuctionError::not_found(format!("team {team_id}")))
    }

    /// The team owned by `uid`, if any.
    pub fn team_for_uid(&self, uid: &str) -> Option<&Team> {
        self.teams.values().find(|t| t.owner_uid == uid)
    }

    pub fn is_admin(&self, uid: &str) -> bool {
        self.admin_uid.as_deref() == Some(uid)
    }

    pub fn require_admin(&self, uid: &str) -> AuctionResult<()> {
        if self.is_admin(uid) {
            Ok(())
        } else {
            Err(AuctionError::rejected("only the room admin can do that"))
        }
    }

    pub fn auction_status(&self) -> Option<AuctionStatus> {
        self.auction.as_ref().map(|a| a.status)
    }

    /// True until the auction leaves `not_started`.
    pub fn is_pre_auction(&self) -> bool {
        matches!(self.auction_status(), None | Some(AuctionStatus::NotStarted))
    }

    /// Add a team for `uid`, or return the team it already owns.
    ///
    /// The first team's owner becomes the room admin.
    pub fn join(
        &self,
        uid: &str,
        team_name: &str,
        rules: &AuctionRules,
        team_id: String,
    ) -> AuctionResult<(String, Option<RoomUpdate>)> {
        if let Some(existing) = self.team_for_uid(uid) {
            return Ok((existing.id.clone(), None));
        }
        if !self.is_pre_auction() {
            return Err(AuctionError::precondition(
                "the auction has already started; new teams cannot join",
            ));
        }

        let name = team_name.trim();
        if name.is_empty() {
            return Err(AuctionError::rejected("team name cannot be empty"));
        }
        if self
            .teams
            .values()
            .any(|t| t.name.to_lowercase() == name.to_lowercase())
        {
            return Err(AuctionError::rejected(format!(
                "team name '{name}' is already taken"
            )));
        }

        let used: BTreeSet<&str> = self.teams.values().map(|t| t.color.as_str()).collect();
        let color = PALETTE
            .iter()
            .find(|c| !used.contains(**c))
            .ok_or_else(|| AuctionError::rejected("room is full"))?;

        let mut room = self.clone();
        room.teams.insert(
            team_id.clone(),
            Team {
                id: team_id.clone(),
                name: name.to_string(),
                color: color.to_string(),
                purse_remaining_lakhs: rules.initial_purse_lakhs,
                time_bank_seconds: rules.time_bank_seconds,
                owner_uid: uid.to_string(),
                players_bought: BTreeMap::new(),
            },
        );
        if room.admin_uid.is_none() {
            room.admin_uid = Some(uid.to_string());
        }

        let line = format!("{name} joined the room");
        Ok((team_id, Some(RoomUpdate::with_log(room, line))))
    }

    /// Admin-only config edit, allowed until the auction starts.
    pub fn update_config(
        &self,
        uid: &str,
        season: Option<&str>,
        cf1: Option<f64>,
        cf2: Option<f64>,
        cf3: Option<f64>,
    ) -> AuctionResult<RoomUpdate> {
        self.require_admin(uid)?;
        if !self.is_pre_auction() {
            return Err(AuctionError::precondition(
                "config is locked once the auction starts",
            ));
        }
        for (field, value) in [("CF1", cf1), ("CF2", cf2), ("CF3", cf3)] {
            if value.is_some_and(|v| !v.is_finite()) {
                return Err(AuctionError::rejected(format!("{field} must be a number")));
            }
        }

        let mut room = self.clone();
        if let Some(season) = season.map(str::trim) {
            if season.is_empty() {
                return Err(AuctionError::rejected("season cannot be empty"));
            }
            room.config.season = season.to_string();
        }
        room.config.cf1 = cf1.unwrap_or(room.config.cf1);
        room.config.cf2 = cf2.unwrap_or(room.config.cf2);
        room.config.cf3 = cf3.unwrap_or(room.config.cf3);

        let c = &room.config;
        let line = format!(
            "Config updated: season {}, CF1={}, CF2={}, CF3={}",
            c.season, c.cf1, c.cf2, c.cf3
        );
        Ok(RoomUpdate::with_log(room, line))
    }
}
