// Post-auction squad assembly and the final leaderboard.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AuctionError, AuctionResult};
use crate::room::{AuctionStatus, Room, RoomUpdate};
use crate::scoring::{score_player, SeasonPlayer};

/// Filled slots required to finalize is capped here.
pub const SQUAD_CAP: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotRole {
    #[serde(rename = "BAT")]
    Bat,
    #[serde(rename = "AR")]
    Ar,
    #[serde(rename = "BOWL")]
    Bowl,
}

impl SlotRole {
    pub const ALL: [SlotRole; 3] = [SlotRole::Bat, SlotRole::Ar, SlotRole::Bowl];

    pub fn capacity(self) -> usize {
        match self {
            SlotRole::Bat => 6,
            SlotRole::Ar => 3,
            SlotRole::Bowl => 6,
        }
    }
}

/// The 6 + 3 + 6 grid. Each cell holds a player id or nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutSlots {
    #[serde(rename = "BAT")]
    pub bat: Vec<Option<String>>,
    #[serde(rename = "AR")]
    pub ar: Vec<Option<String>>,
    #[serde(rename = "BOWL")]
    pub bowl: Vec<Option<String>>,
}

impl Default for LayoutSlots {
    fn default() -> Self {
        LayoutSlots {
            bat: vec![None; SlotRole::Bat.capacity()],
            ar: vec![None; SlotRole::Ar.capacity()],
            bowl: vec![None; SlotRole::Bowl.capacity()],
        }
    }
}

impl LayoutSlots {
    pub fn row(&self, role: SlotRole) -> &[Option<String>] {
        match role {
            SlotRole::Bat => &self.bat,
            SlotRole::Ar => &self.ar,
            SlotRole::Bowl => &self.bowl,
        }
    }

    fn row_mut(&mut self, role: SlotRole) -> &mut Vec<Option<String>> {
        match role {
            SlotRole::Bat => &mut self.bat,
            SlotRole::Ar => &mut self.ar,
            SlotRole::Bowl => &mut self.bowl,
        }
    }

    /// Every placed player id, in BAT, AR, BOWL order.
    pub fn placed(&self) -> impl Iterator<Item = &str> {
        SlotRole::ALL
            .into_iter()
            .flat_map(move |role| self.row(role).iter())
            .filter_map(|cell| cell.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamLayout {
    #[serde(default)]
    pub finalized: bool,
    #[serde(default)]
    pub slots: LayoutSlots,
}

impl TeamLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filled_count(&self) -> usize {
        self.slots.placed().count()
    }

    pub fn contains(&self, player_id: &str) -> bool {
        self.slots.placed().any(|id| id == player_id)
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Checks shared by every layout edit: auction over, team known, not yet
/// finalized, slot in range.
fn check_editable(room: &Room, team_id: &str, role: SlotRole, index: usize) -> AuctionResult<()> {
    if room.auction_status() != Some(AuctionStatus::Finished) {
        return Err(AuctionError::precondition(
            "squads can be arranged once the auction has finished",
        ));
    }
    room.team(team_id)?;
    if room.team_layout.get(team_id).is_some_and(|l| l.finalized) {
        return Err(AuctionError::rejected("layout is already finalized"));
    }
    if index >= role.capacity() {
        return Err(AuctionError::rejected(format!(
            "{role:?} has only {} slots",
            role.capacity()
        )));
    }
    Ok(())
}

/// Place a bought player into one slot. A player may occupy at most one slot
/// across the whole grid.
pub fn assign_slot(
    room: &Room,
    team_id: &str,
    role: SlotRole,
    index: usize,
    player_id: &str,
) -> AuctionResult<RoomUpdate> {
    check_editable(room, team_id, role, index)?;
    let team = room.team(team_id)?;
    if !team.players_bought.contains_key(player_id) {
        return Err(AuctionError::rejected(format!(
            "{} did not buy that player",
            team.name
        )));
    }
    let current = room.team_layout.get(team_id).cloned().unwrap_or_default();
    if current.contains(player_id) {
        return Err(AuctionError::rejected("player is already placed in another slot"));
    }

    let mut next = room.clone();
    let layout = next.team_layout.entry(team_id.to_string()).or_default();
    layout.slots.row_mut(role)[index] = Some(player_id.to_string());
    Ok(RoomUpdate::new(next))
}

pub fn clear_slot(
    room: &Room,
    team_id: &str,
    role: SlotRole,
    index: usize,
) -> AuctionResult<RoomUpdate> {
    check_editable(room, team_id, role, index)?;
    let mut next = room.clone();
    let layout = next.team_layout.entry(team_id.to_string()).or_default();
    layout.slots.row_mut(role)[index] = None;
    Ok(RoomUpdate::new(next))
}

/// Lock the team's layout. Every bought player (up to the squad cap) must be
/// placed first.
pub fn finalize_layout(room: &Room, team_id: &str) -> AuctionResult<RoomUpdate> {
    if room.auction_status() != Some(AuctionStatus::Finished) {
        return Err(AuctionError::precondition(
            "squads can be arranged once the auction has finished",
        ));
    }
    let team = room.team(team_id)?;
    let layout = room.team_layout.get(team_id).cloned().unwrap_or_default();
    if layout.finalized {
        return Err(AuctionError::rejected("layout is already finalized"));
    }
    let required = team.squad_size().min(SQUAD_CAP);
    let filled = layout.filled_count();
    if filled < required {
        return Err(AuctionError::precondition(format!(
            "place at least {required} players before finalizing ({filled} placed)"
        )));
    }

    let mut next = room.clone();
    next.team_layout
        .entry(team_id.to_string())
        .or_default()
        .finalized = true;
    info!("{} finalized their squad in room {}", team.name, room.code);
    Ok(RoomUpdate::with_log(next, format!("{} finalized their squad", team.name)))
}

/// True once every team in the room has locked its layout.
pub fn all_finalized(room: &Room) -> bool {
    !room.teams.is_empty()
        && room
            .teams
            .keys()
            .all(|id| room.team_layout.get(id).is_some_and(|l| l.finalized))
}

// ---------------------------------------------------------------------------
// Leaderboard
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedScore {
    pub player_id: String,
    pub name: String,
    pub role: SlotRole,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardRow {
    pub team_id: String,
    pub team_name: String,
    pub color: String,
    pub total: f64,
    pub players: Vec<PlacedScore>,
}

/// Sum each team's placed players' all-rounder scores under the room's
/// current coefficients. Players missing from the season score 0.
pub fn leaderboard(room: &Room, season: &[SeasonPlayer]) -> AuctionResult<Vec<LeaderboardRow>> {
    if !all_finalized(room) {
        return Err(AuctionError::precondition(
            "the leaderboard opens once every team has finalized",
        ));
    }
    let coeffs = room.config.coefficients();
    let by_id: HashMap<&str, &SeasonPlayer> = season.iter().map(|p| (p.id.as_str(), p)).collect();

    let mut rows: Vec<LeaderboardRow> = room
        .teams
        .values()
        .map(|team| {
            let layout = room.team_layout.get(&team.id).cloned().unwrap_or_default();
            let mut players = Vec::new();
            for role in SlotRole::ALL {
                for id in layout.slots.row(role).iter().flatten() {
                    let score = by_id
                        .get(id.as_str())
                        .map(|p| score_player(p, &coeffs).all_rounder)
                        .unwrap_or(0.0);
                    let name = team
                        .players_bought
                        .get(id)
                        .map(|b| b.name.clone())
                        .unwrap_or_else(|| id.clone());
                    players.push(PlacedScore {
                        player_id: id.clone(),
                        name,
                        role,
                        score,
                    });
                }
            }
            LeaderboardRow {
                team_id: team.id.clone(),
                team_name: team.name.clone(),
                color: team.color.clone(),
                total: players.iter().map(|p| p.score).sum(),
                players,
            }
        })
        .collect();

    rows.sort_by(|a, b| {
        b.total
            .total_cmp(&a.total)
            .then_with(|| a.team_name.cmp(&b.team_name))
    });
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::test_support::*;
    use crate::room::{BoughtPlayer, RoomStatus};
    use crate::scoring::BattingStats;

    /// Finished room where team_1 bought `bought` players `b0..`.
    fn finished_room(teams: usize, bought: usize) -> Room {
        let mut room = running_room(teams, vec![vec!["p1"]]);
        {
            let team = room.teams.get_mut("team_1").unwrap();
            for i in 0..bought {
                team.players_bought.insert(
                    format!("b{i}"),
                    BoughtPlayer {
                        name: format!("Buy {i}"),
                        price_lakhs: 50,
                    },
                );
            }
        }
        let a = room.auction.as_mut().unwrap();
        a.status = AuctionStatus::Finished;
        a.clear_bidding();
        room.status = RoomStatus::Completed;
        for id in room.teams.keys().cloned().collect::<Vec<_>>() {
            room.team_layout.insert(id, TeamLayout::new());
        }
        room
    }

    fn place(room: Room, cells: &[(SlotRole, usize, &str)]) -> Room {
        cells.iter().fold(room, |room, (role, idx, id)| {
            assign_slot(&room, "team_1", *role, *idx, id).unwrap().room
        })
    }

    fn first_n_cells(n: usize) -> Vec<(SlotRole, usize)> {
        SlotRole::ALL
            .into_iter()
            .flat_map(|r| (0..r.capacity()).map(move |i| (r, i)))
            .take(n)
            .collect()
    }

    #[test]
    fn grid_shape() {
        let layout = TeamLayout::new();
        assert_eq!(layout.slots.bat.len(), 6);
        assert_eq!(layout.slots.ar.len(), 3);
        assert_eq!(layout.slots.bowl.len(), 6);
        assert_eq!(layout.filled_count(), 0);
    }

    #[test]
    fn layout_edits_wait_for_auction_end() {
        let mut room = running_room(1, vec![vec!["p1"]]);
        room.teams.get_mut("team_1").unwrap().players_bought.insert(
            "p1".into(),
            BoughtPlayer {
                name: "P1".into(),
                price_lakhs: 200,
            },
        );
        assert!(matches!(
            assign_slot(&room, "team_1", SlotRole::Bat, 0, "p1"),
            Err(AuctionError::Precondition(_))
        ));
    }

    #[test]
    fn assign_and_clear() {
        let room = finished_room(1, 2);
        let room = assign_slot(&room, "team_1", SlotRole::Ar, 2, "b0").unwrap().room;
        assert_eq!(room.team_layout["team_1"].slots.ar[2].as_deref(), Some("b0"));
        let room = clear_slot(&room, "team_1", SlotRole::Ar, 2).unwrap().room;
        assert_eq!(room.team_layout["team_1"].filled_count(), 0);
    }

    #[test]
    fn player_occupies_one_slot_at_most() {
        let room = finished_room(1, 2);
        let room = assign_slot(&room, "team_1", SlotRole::Bat, 0, "b0").unwrap().room;
        let err = assign_slot(&room, "team_1", SlotRole::Bowl, 3, "b0").unwrap_err();
        assert!(matches!(err, AuctionError::Rejected(_)));
        assert!(assign_slot(&room, "team_1", SlotRole::Bat, 1, "b0").is_err());

        let layout = &room.team_layout["team_1"];
        let placed: Vec<&str> = layout.slots.placed().collect();
        assert_eq!(placed, vec!["b0"]);
    }

    #[test]
    fn only_own_purchases_and_valid_indices() {
        let room = finished_room(2, 1);
        assert!(assign_slot(&room, "team_1", SlotRole::Bat, 0, "p1").is_err());
        assert!(assign_slot(&room, "team_1", SlotRole::Ar, 3, "b0").is_err());
        assert!(matches!(
            assign_slot(&room, "ghost", SlotRole::Bat, 0, "b0"),
            Err(AuctionError::NotFound(_))
        ));
    }

    #[test]
    fn finalize_needs_every_bought_player_placed() {
        let room = finished_room(1, 12);
        let cells: Vec<(SlotRole, usize, String)> = first_n_cells(12)
            .into_iter()
            .enumerate()
            .map(|(i, (r, idx))| (r, idx, format!("b{i}")))
            .collect();
        let borrowed: Vec<(SlotRole, usize, &str)> =
            cells.iter().map(|(r, i, id)| (*r, *i, id.as_str())).collect();

        let partial = place(room.clone(), &borrowed[..10]);
        let err = finalize_layout(&partial, "team_1").unwrap_err();
        assert!(matches!(err, AuctionError::Precondition(_)));
        assert!(!partial.team_layout["team_1"].finalized);

        let full = place(partial, &borrowed[10..]);
        let update = finalize_layout(&full, "team_1").unwrap();
        assert!(update.room.team_layout["team_1"].finalized);

        // One-way, and no more edits.
        assert!(finalize_layout(&update.room, "team_1").is_err());
        assert!(clear_slot(&update.room, "team_1", SlotRole::Bat, 0).is_err());
    }

    #[test]
    fn finalize_caps_requirement_at_fifteen() {
        let room = finished_room(1, 18);
        let cells: Vec<(SlotRole, usize, String)> = first_n_cells(15)
            .into_iter()
            .enumerate()
            .map(|(i, (r, idx))| (r, idx, format!("b{i}")))
            .collect();
        let borrowed: Vec<(SlotRole, usize, &str)> =
            cells.iter().map(|(r, i, id)| (*r, *i, id.as_str())).collect();
        let room = place(room, &borrowed);
        assert!(finalize_layout(&room, "team_1").is_ok());
    }

    #[test]
    fn empty_squad_can_finalize_immediately() {
        let room = finished_room(2, 0);
        assert!(finalize_layout(&room, "team_2").is_ok());
    }

    #[test]
    fn leaderboard_waits_for_everyone_then_ranks() {
        let room = finished_room(2, 2);
        let season = vec![
            SeasonPlayer {
                id: "b0".into(),
                name: "Buy 0".into(),
                batting: BattingStats {
                    runs: 300.0,
                    ..Default::default()
                },
                ..Default::default()
            },
            SeasonPlayer {
                id: "b1".into(),
                name: "Buy 1".into(),
                batting: BattingStats {
                    runs: 100.0,
                    ..Default::default()
                },
                ..Default::default()
            },
        ];

        let room = place(room, &[(SlotRole::Bat, 0, "b0"), (SlotRole::Bowl, 5, "b1")]);
        let room = finalize_layout(&room, "team_1").unwrap().room;
        assert!(matches!(
            leaderboard(&room, &season),
            Err(AuctionError::Precondition(_))
        ));

        let room = finalize_layout(&room, "team_2").unwrap().room;
        assert!(all_finalized(&room));
        let rows = leaderboard(&room, &season).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].team_id, "team_1");
        assert_eq!(rows[0].total, 400.0);
        assert_eq!(rows[0].players[1].role, SlotRole::Bowl);
        assert_eq!(rows[1].total, 0.0);
    }

    #[test]
    fn leaderboard_ties_break_on_name() {
        let mut room = finished_room(3, 0);
        for layout in room.team_layout.values_mut() {
            layout.finalized = true;
        }
        let rows = leaderboard(&room, &[]).unwrap();
        let names: Vec<&str> = rows.iter().map(|r| r.team_name.as_str()).collect();
        assert_eq!(names, vec!["Team 1", "Team 2", "Team 3"]);
    }

    #[test]
    fn slot_json_uses_role_keys() {
        let json = serde_json::to_value(TeamLayout::new()).unwrap();
        assert_eq!(json["slots"]["BAT"].as_array().unwrap().len(), 6);
        assert_eq!(json["slots"]["AR"].as_array().unwrap().len(), 3);
        assert_eq!(serde_json::to_value(SlotRole::Bowl).unwrap(), "BOWL");
    }
}
