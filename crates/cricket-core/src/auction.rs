// Auction state machine.
//
//   not_started -> running <-> showing_result -> ... -> finished
//
// `running` is the only state that accepts bids. Settlement moves a player
// into `showing_result`; `advance` moves the pointer on (or finishes).

use tracing::info;

use crate::bidding;
use crate::error::{AuctionError, AuctionResult};
use crate::layout::TeamLayout;
use crate::room::{AuctionState, AuctionStatus, PlayerStatus, Room, RoomStatus, RoomUpdate};
use crate::rules::AuctionRules;

/// Borrow the auction or fail with a precondition error.
pub(crate) fn auction_of(room: &Room) -> AuctionResult<&AuctionState> {
    room.auction
        .as_ref()
        .ok_or_else(|| AuctionError::precondition("sets have not been generated yet"))
}

pub(crate) fn auction_mut(room: &mut Room) -> AuctionResult<&mut AuctionState> {
    room.auction
        .as_mut()
        .ok_or_else(|| AuctionError::precondition("sets have not been generated yet"))
}

/// A team sits out the current player if it explicitly opted out of this
/// player or can no longer afford one bid step.
pub fn is_effectively_sat_out(room: &Room, team_id: &str) -> bool {
    let explicitly = room
        .auction
        .as_ref()
        .is_some_and(|a| a.sat_out_teams.contains(team_id));
    let broke = room
        .teams
        .get(team_id)
        .map_or(true, |t| t.is_out_of_purse());
    explicitly || broke
}

/// Teams still able to bid on the current player, in id order.
pub fn active_team_ids(room: &Room) -> Vec<&str> {
    room.teams
        .keys()
        .map(String::as_str)
        .filter(|id| !is_effectively_sat_out(room, id))
        .collect()
}

/// The auction can stop early only when every team is both out of purse and
/// at the squad cap.
pub fn should_end_early(room: &Room, rules: &AuctionRules) -> bool {
    !room.teams.is_empty()
        && room.teams.values().all(|t| t.is_out_of_purse())
        && room
            .teams
            .values()
            .all(|t| t.squad_size() >= rules.max_squad_size)
}

/// Put the player under the pointer on the block with a fresh deadline.
fn arm_current_player(room: &mut Room, rules: &AuctionRules, now: i64) -> AuctionResult<()> {
    let auction = auction_mut(room)?;
    auction.clear_bidding();
    auction.result_message = None;
    auction.result_until_ts = None;
    auction.status = AuctionStatus::Running;
    auction.bid_deadline_ts = Some(now + rules.bid_window_ms);

    let Some(player_id) = auction.current_player_id().map(str::to_string) else {
        return Ok(());
    };
    if let Some(player) = room.players.get_mut(&player_id) {
        if player.status.can_become(PlayerStatus::InAuction) {
            player.status = PlayerStatus::InAuction;
        }
    }
    Ok(())
}

/// Terminal transition. Seeds an empty squad layout for every team.
pub(crate) fn finish(room: &mut Room) -> AuctionResult<String> {
    let auction = auction_mut(room)?;
    auction.clear_bidding();
    auction.status = AuctionStatus::Finished;
    auction.result_message = None;
    auction.result_until_ts = None;
    room.status = RoomStatus::Completed;

    let team_ids: Vec<String> = room.teams.keys().cloned().collect();
    for id in team_ids {
        room.team_layout.entry(id).or_insert_with(TeamLayout::new);
    }
    info!("Auction in room {} finished", room.code);
    Ok("Auction finished".to_string())
}

/// Admin: `not_started -> running`.
pub fn start_auction(
    room: &Room,
    uid: &str,
    rules: &AuctionRules,
    now: i64,
) -> AuctionResult<RoomUpdate> {
    room.require_admin(uid)?;
    let auction = auction_of(room)?;
    if auction.status != AuctionStatus::NotStarted {
        return Err(AuctionError::precondition("the auction has already started"));
    }
    if room.teams.is_empty() {
        return Err(AuctionError::precondition("at least one team must join first"));
    }

    let mut next = room.clone();
    next.status = RoomStatus::Auction;
    let line = if auction.current_player_id().is_some() {
        arm_current_player(&mut next, rules, now)?;
        format!("Auction started with {} players", auction.total_players())
    } else {
        finish(&mut next)?
    };
    Ok(RoomUpdate::with_log(next, line))
}

/// `showing_result -> running | finished`, once the result window elapses.
///
/// The target is derived only from the snapshot, so two advances computed
/// from the same snapshot agree.
pub fn advance(room: &Room, rules: &AuctionRules, now: i64) -> AuctionResult<RoomUpdate> {
    let auction = auction_of(room)?;
    if auction.status != AuctionStatus::ShowingResult {
        return Err(AuctionError::precondition("no result is being shown"));
    }
    if auction.result_until_ts.is_some_and(|until| now < until) {
        return Err(AuctionError::precondition("the result window is still open"));
    }

    let mut next = room.clone();
    match auction.next_pointer() {
        Some((set, idx)) if !should_end_early(room, rules) => {
            let a = auction_mut(&mut next)?;
            a.current_set_index = set;
            a.current_player_index = idx;
            arm_current_player(&mut next, rules, now)?;
            Ok(RoomUpdate::new(next))
        }
        _ => {
            let line = finish(&mut next)?;
            Ok(RoomUpdate::with_log(next, line))
        }
    }
}

/// Admin: pass on the current player while nobody has bid.
///
/// The player is always settled unsold through the normal settlement path.
/// When the early-termination condition already holds, the same update also
/// finishes the auction.
pub fn skip_player(
    room: &Room,
    uid: &str,
    rules: &AuctionRules,
    now: i64,
) -> AuctionResult<RoomUpdate> {
    room.require_admin(uid)?;
    let auction = auction_of(room)?;
    if auction.status != AuctionStatus::Running {
        return Err(AuctionError::precondition("the auction is not running"));
    }
    if auction.current_bid_lakhs.is_some() {
        return Err(AuctionError::precondition(
            "cannot skip while a bid is active on this player",
        ));
    }

    let mut update = bidding::settle(room, rules, now)?;
    if should_end_early(room, rules) {
        let line = finish(&mut update.room)?;
        update.log.push(line);
    }
    Ok(update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::test_support::*;
    use crate::room::BoughtPlayer;

    fn rules() -> AuctionRules {
        AuctionRules::default()
    }

    fn showing(mut room: Room, until: i64) -> Room {
        let a = room.auction.as_mut().unwrap();
        a.status = AuctionStatus::ShowingResult;
        a.result_message = Some("done".into());
        a.result_until_ts = Some(until);
        a.clear_bidding();
        let current = a.current_player_id().unwrap().to_string();
        room.players.get_mut(&current).unwrap().status = PlayerStatus::Unsold;
        room
    }

    fn exhaust(room: &mut Room, team_id: &str, squad: usize) {
        let team = room.teams.get_mut(team_id).unwrap();
        team.purse_remaining_lakhs = 20;
        for i in 0..squad {
            team.players_bought.insert(
                format!("{team_id}_bought_{i}"),
                BoughtPlayer {
                    name: format!("Bought {i}"),
                    price_lakhs: 50,
                },
            );
        }
    }

    #[test]
    fn start_arms_first_player() {
        let mut room = running_room(2, vec![vec!["p1", "p2"]]);
        {
            let a = room.auction.as_mut().unwrap();
            a.status = AuctionStatus::NotStarted;
            a.bid_deadline_ts = None;
        }
        room.players.get_mut("p1").unwrap().status = PlayerStatus::NotStarted;
        room.status = RoomStatus::Lobby;

        let update = start_auction(&room, "uid_1", &rules(), 1_000).unwrap();
        let a = update.room.auction.as_ref().unwrap();
        assert_eq!(a.status, AuctionStatus::Running);
        assert_eq!(a.bid_deadline_ts, Some(31_000));
        assert_eq!(update.room.players["p1"].status, PlayerStatus::InAuction);
        assert_eq!(update.room.status, RoomStatus::Auction);
    }

    #[test]
    fn start_requires_sets_admin_and_not_started() {
        let lobby = room_with_teams(2);
        assert!(matches!(
            start_auction(&lobby, "uid_1", &rules(), 0),
            Err(AuctionError::Precondition(_))
        ));
        let running = running_room(2, vec![vec!["p1"]]);
        assert!(matches!(
            start_auction(&running, "uid_2", &rules(), 0),
            Err(AuctionError::Rejected(_))
        ));
        assert!(matches!(
            start_auction(&running, "uid_1", &rules(), 0),
            Err(AuctionError::Precondition(_))
        ));
    }

    #[test]
    fn sat_out_is_per_player_or_purse() {
        let mut room = running_room(3, vec![vec!["p1"]]);
        room.auction
            .as_mut()
            .unwrap()
            .sat_out_teams
            .insert("team_2".into());
        room.teams.get_mut("team_3").unwrap().purse_remaining_lakhs = 49;

        assert!(!is_effectively_sat_out(&room, "team_1"));
        assert!(is_effectively_sat_out(&room, "team_2"));
        assert!(is_effectively_sat_out(&room, "team_3"));
        assert_eq!(active_team_ids(&room), vec!["team_1"]);
    }

    #[test]
    fn advance_moves_within_set_then_across_sets() {
        let room = showing(running_room(2, vec![vec!["p1", "p2"], vec!["p3"]]), 10_000);
        let update = advance(&room, &rules(), 10_000).unwrap();
        let a = update.room.auction.as_ref().unwrap();
        assert_eq!((a.current_set_index, a.current_player_index), (0, 1));
        assert_eq!(a.status, AuctionStatus::Running);
        assert_eq!(a.bid_deadline_ts, Some(40_000));
        assert!(a.result_message.is_none());
        assert_eq!(update.room.players["p2"].status, PlayerStatus::InAuction);

        let room = showing(update.room, 50_000);
        let update = advance(&room, &rules(), 50_000).unwrap();
        let a = update.room.auction.as_ref().unwrap();
        assert_eq!((a.current_set_index, a.current_player_index), (1, 0));
    }

    #[test]
    fn advance_waits_for_result_window() {
        let room = showing(running_room(2, vec![vec!["p1", "p2"]]), 10_000);
        assert!(matches!(
            advance(&room, &rules(), 9_999),
            Err(AuctionError::Precondition(_))
        ));
    }

    #[test]
    fn advance_past_last_player_finishes() {
        let room = showing(running_room(2, vec![vec!["p1"]]), 10_000);
        let update = advance(&room, &rules(), 10_000).unwrap();
        let a = update.room.auction.as_ref().unwrap();
        assert_eq!(a.status, AuctionStatus::Finished);
        assert_eq!(a.bid_deadline_ts, None);
        assert_eq!(update.room.status, RoomStatus::Completed);
        assert_eq!(update.room.team_layout.len(), 2);
        // Pointer never regresses on finish.
        assert_eq!(a.current_set_index, 0);
    }

    #[test]
    fn advance_twice_from_same_snapshot_converges() {
        let room = showing(running_room(2, vec![vec!["p1", "p2"]]), 10_000);
        let a = advance(&room, &rules(), 12_000).unwrap().room;
        let b = advance(&room, &rules(), 12_000).unwrap().room;
        assert_eq!(a, b);
        // And the result is no longer advanceable.
        assert!(advance(&a, &rules(), 12_000).is_err());
    }

    #[test]
    fn early_termination_needs_both_conditions() {
        let mut room = running_room(2, vec![vec!["p1", "p2"]]);
        exhaust(&mut room, "team_1", 15);
        exhaust(&mut room, "team_2", 14);
        assert!(!should_end_early(&room, &rules()));

        exhaust(&mut room, "team_2", 15);
        assert!(should_end_early(&room, &rules()));

        // Out of purse but under the cap keeps the auction going.
        let mut room = running_room(2, vec![vec!["p1"]]);
        room.teams.get_mut("team_1").unwrap().purse_remaining_lakhs = 0;
        room.teams.get_mut("team_2").unwrap().purse_remaining_lakhs = 0;
        assert!(!should_end_early(&room, &rules()));
    }

    #[test]
    fn advance_finishes_early_when_everyone_is_done() {
        let mut room = showing(running_room(2, vec![vec!["p1", "p2", "p3"]]), 0);
        exhaust(&mut room, "team_1", 15);
        exhaust(&mut room, "team_2", 15);
        let update = advance(&room, &rules(), 1).unwrap();
        assert_eq!(update.room.auction_status(), Some(AuctionStatus::Finished));
        assert_eq!(update.room.players["p2"].status, PlayerStatus::NotStarted);
    }

    #[test]
    fn skip_settles_unsold() {
        let room = running_room(2, vec![vec!["p1", "p2"]]);
        let update = skip_player(&room, "uid_1", &rules(), 5_000).unwrap();
        assert_eq!(update.room.players["p1"].status, PlayerStatus::Unsold);
        assert_eq!(
            update.room.auction_status(),
            Some(AuctionStatus::ShowingResult)
        );
    }

    #[test]
    fn skip_blocked_while_bid_active() {
        let mut room = running_room(2, vec![vec!["p1"]]);
        let a = room.auction.as_mut().unwrap();
        a.current_bid_lakhs = Some(200);
        a.current_bid_team_id = Some("team_1".into());
        assert!(matches!(
            skip_player(&room, "uid_1", &rules(), 0),
            Err(AuctionError::Precondition(_))
        ));
    }

    #[test]
    fn skip_finishes_when_early_termination_holds() {
        let mut room = running_room(2, vec![vec!["p1", "p2"]]);
        exhaust(&mut room, "team_1", 15);
        exhaust(&mut room, "team_2", 15);
        let update = skip_player(&room, "uid_1", &rules(), 0).unwrap();
        assert_eq!(update.room.auction_status(), Some(AuctionStatus::Finished));
        assert_eq!(update.room.players["p1"].status, PlayerStatus::Unsold);
        assert_eq!(update.room.players["p2"].status, PlayerStatus::NotStarted);
        assert_eq!(update.room.status, RoomStatus::Completed);
        assert_eq!(
            update.log,
            vec!["P1 went unsold".to_string(), "Auction finished".to_string()]
        );
    }
}
