// Bid validation, sit-outs, time bank, and settlement.
//
// Every bid path runs the same checks against the snapshot it is handed, in
// this order: auction running, deadline not passed, bidder neither sat out
// nor already on top, amount rule, purse. The first failure wins and the
// room is returned untouched.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::auction::{auction_mut, auction_of, is_effectively_sat_out};
use crate::error::{AuctionError, AuctionResult};
use crate::room::{AuctionStatus, BoughtPlayer, PlayerStatus, Room, RoomUpdate, Team};
use crate::rules::{format_price, AuctionRules, BID_UNIT_LAKHS, LAKHS_PER_CRORE};

/// Unit the bidder typed a custom amount in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceUnit {
    Lakh,
    Crore,
}

/// Convert a displayed amount to whole lakhs.
pub fn lakhs_from_display(amount: f64, unit: PriceUnit) -> AuctionResult<u32> {
    let factor = match unit {
        PriceUnit::Lakh => 1.0,
        PriceUnit::Crore => LAKHS_PER_CRORE as f64,
    };
    let lakhs = amount * factor;
    if !lakhs.is_finite() || lakhs <= 0.0 {
        return Err(AuctionError::rejected("bid must be a positive amount"));
    }
    let rounded = lakhs.round();
    if (lakhs - rounded).abs() > 1e-6 || rounded > u32::MAX as f64 {
        return Err(AuctionError::rejected("bid must be a whole number of lakhs"));
    }
    Ok(rounded as u32)
}

// ---------------------------------------------------------------------------
// Shared checks
// ---------------------------------------------------------------------------

/// Checks 1-3: running, deadline open, bidder eligible.
fn check_bidder<'a>(room: &'a Room, team_id: &str, now: i64) -> AuctionResult<&'a Team> {
    let auction = auction_of(room)?;
    if auction.status != AuctionStatus::Running {
        return Err(AuctionError::rejected("bidding is not open right now"));
    }
    if auction.bid_deadline_ts.is_some_and(|deadline| now > deadline) {
        return Err(AuctionError::rejected("the bidding window has closed"));
    }
    let team = room.team(team_id)?;
    if is_effectively_sat_out(room, team_id) {
        return Err(AuctionError::rejected("your team is sitting out this player"));
    }
    if auction.current_bid_team_id.as_deref() == Some(team_id) {
        return Err(AuctionError::rejected("you already hold the highest bid"));
    }
    Ok(team)
}

/// Check 5, then write the bid and re-arm the deadline.
fn commit_bid(
    room: &Room,
    team: &Team,
    amount: u32,
    rules: &AuctionRules,
    now: i64,
) -> AuctionResult<RoomUpdate> {
    if amount > team.purse_remaining_lakhs {
        return Err(AuctionError::rejected(format!(
            "insufficient purse: {} left, bid is {}",
            format_price(team.purse_remaining_lakhs),
            format_price(amount)
        )));
    }

    let mut next = room.clone();
    let auction = auction_mut(&mut next)?;
    auction.current_bid_lakhs = Some(amount);
    auction.current_bid_team_id = Some(team.id.clone());
    auction.bid_deadline_ts = Some(now + rules.bid_window_ms);
    debug!("{} bid {} in room {}", team.name, format_price(amount), room.code);
    Ok(RoomUpdate::new(next))
}

fn current_base_price(room: &Room) -> AuctionResult<u32> {
    let auction = auction_of(room)?;
    let player_id = auction
        .current_player_id()
        .ok_or_else(|| AuctionError::precondition("no player is up for auction"))?;
    room.players
        .get(player_id)
        .map(|p| p.base_price_lakhs)
        .ok_or_else(|| AuctionError::not_found(format!("player {player_id}")))
}

// ---------------------------------------------------------------------------
// Bid operations
// ---------------------------------------------------------------------------

/// Opening bid at exactly the player's base price.
pub fn place_start_bid(
    room: &Room,
    team_id: &str,
    rules: &AuctionRules,
    now: i64,
) -> AuctionResult<RoomUpdate> {
    let team = check_bidder(room, team_id, now)?;
    if auction_of(room)?.current_bid_lakhs.is_some() {
        return Err(AuctionError::rejected("the opening bid has already been placed"));
    }
    let amount = current_base_price(room)?;
    commit_bid(room, team, amount, rules, now)
}

/// Raise the standing bid (or the base price if nobody has bid) by a fixed
/// increment.
pub fn raise_bid(
    room: &Room,
    team_id: &str,
    increment_lakhs: u32,
    rules: &AuctionRules,
    now: i64,
) -> AuctionResult<RoomUpdate> {
    let team = check_bidder(room, team_id, now)?;
    if increment_lakhs == 0 {
        return Err(AuctionError::rejected("increment must be positive"));
    }
    let standing = match auction_of(room)?.current_bid_lakhs {
        Some(bid) => bid,
        None => current_base_price(room)?,
    };
    let amount = standing
        .checked_add(increment_lakhs)
        .ok_or_else(|| AuctionError::rejected("bid is too large"))?;
    if amount % BID_UNIT_LAKHS != 0 {
        return Err(AuctionError::rejected(format!(
            "bids must be in steps of {}",
            format_price(BID_UNIT_LAKHS)
        )));
    }
    commit_bid(room, team, amount, rules, now)
}

/// Bid an absolute amount typed by the user.
///
/// The amount must beat the highest bid in this snapshot, which rejects a
/// bid computed from a stale view. With no bid yet it must reach the base
/// price.
pub fn place_custom_bid(
    room: &Room,
    team_id: &str,
    amount: f64,
    unit: PriceUnit,
    rules: &AuctionRules,
    now: i64,
) -> AuctionResult<RoomUpdate> {
    let team = check_bidder(room, team_id, now)?;
    let amount = lakhs_from_display(amount, unit)?;
    if amount % BID_UNIT_LAKHS != 0 {
        return Err(AuctionError::rejected(format!(
            "bids must be in steps of {}",
            format_price(BID_UNIT_LAKHS)
        )));
    }
    match auction_of(room)?.current_bid_lakhs {
        Some(current) if amount <= current => {
            return Err(AuctionError::rejected(format!(
                "bid must be higher than the current {}",
                format_price(current)
            )));
        }
        None => {
            let base = current_base_price(room)?;
            if amount < base {
                return Err(AuctionError::rejected(format!(
                    "opening bid must be at least the base price of {}",
                    format_price(base)
                )));
            }
        }
        Some(_) => {}
    }
    commit_bid(room, team, amount, rules, now)
}

/// Opt out of the current player. One-way until the pointer moves on.
///
/// The holder of the highest bid cannot sit out.
pub fn sit_out(room: &Room, team_id: &str, now: i64) -> AuctionResult<RoomUpdate> {
    let auction = auction_of(room)?;
    if auction.status != AuctionStatus::Running {
        return Err(AuctionError::rejected("bidding is not open right now"));
    }
    if auction.bid_deadline_ts.is_some_and(|deadline| now > deadline) {
        return Err(AuctionError::rejected("the bidding window has closed"));
    }
    let team = room.team(team_id)?;
    if auction.sat_out_teams.contains(team_id) {
        return Err(AuctionError::rejected("already sitting out this player"));
    }
    if auction.current_bid_team_id.as_deref() == Some(team_id) {
        return Err(AuctionError::rejected(
            "you hold the highest bid and cannot sit out",
        ));
    }

    let mut next = room.clone();
    auction_mut(&mut next)?.sat_out_teams.insert(team_id.to_string());
    debug!("{} sat out in room {}", team.name, room.code);
    Ok(RoomUpdate::new(next))
}

/// Spend one time-bank step to push the current deadline back.
pub fn use_time_bank(
    room: &Room,
    team_id: &str,
    rules: &AuctionRules,
    now: i64,
) -> AuctionResult<RoomUpdate> {
    let auction = auction_of(room)?;
    if auction.status != AuctionStatus::Running {
        return Err(AuctionError::rejected("bidding is not open right now"));
    }
    let deadline = auction.bid_deadline_ts.unwrap_or(now);
    if now > deadline {
        return Err(AuctionError::rejected("the bidding window has closed"));
    }
    let team = room.team(team_id)?;
    if team.time_bank_seconds < rules.time_bank_step_secs {
        return Err(AuctionError::rejected("time bank is empty"));
    }

    let mut next = room.clone();
    next.team_mut(team_id)?.time_bank_seconds -= rules.time_bank_step_secs;
    auction_mut(&mut next)?.bid_deadline_ts =
        Some(deadline + i64::from(rules.time_bank_step_secs) * 1_000);
    let line = format!(
        "{} used {}s of time bank",
        team.name, rules.time_bank_step_secs
    );
    Ok(RoomUpdate::with_log(next, line))
}

// ---------------------------------------------------------------------------
// Settlement
// ---------------------------------------------------------------------------

/// Close the current player: sold to the standing bidder, or unsold.
///
/// Player, team, and auction fields all change in the one returned room.
/// Settlement only applies to a `running` auction, so a second attempt on
/// the resulting snapshot is refused.
pub fn settle(room: &Room, rules: &AuctionRules, now: i64) -> AuctionResult<RoomUpdate> {
    let auction = auction_of(room)?;
    if auction.status != AuctionStatus::Running {
        return Err(AuctionError::precondition("the auction is not running"));
    }
    let player_id = auction
        .current_player_id()
        .ok_or_else(|| AuctionError::precondition("no player is up for auction"))?
        .to_string();

    let mut next = room.clone();
    let winning = auction
        .current_bid_team_id
        .clone()
        .zip(auction.current_bid_lakhs);

    let player = next
        .players
        .get_mut(&player_id)
        .ok_or_else(|| AuctionError::not_found(format!("player {player_id}")))?;
    let player_name = player.name.clone();

    let message = match winning {
        Some((team_id, price)) => {
            if !player.status.can_become(PlayerStatus::Sold) {
                return Err(AuctionError::precondition("player has already been settled"));
            }
            player.status = PlayerStatus::Sold;
            player.sold_to_team_id = Some(team_id.clone());
            player.sold_price_lakhs = Some(price);

            let team = next.team_mut(&team_id)?;
            team.purse_remaining_lakhs = team
                .purse_remaining_lakhs
                .checked_sub(price)
                .ok_or_else(|| AuctionError::rejected("insufficient purse"))?;
            team.players_bought.insert(
                player_id.clone(),
                BoughtPlayer {
                    name: player_name.clone(),
                    price_lakhs: price,
                },
            );
            format!("{player_name} sold to {} for {}", team.name, format_price(price))
        }
        None => {
            if !player.status.can_become(PlayerStatus::Unsold) {
                return Err(AuctionError::precondition("player has already been settled"));
            }
            player.status = PlayerStatus::Unsold;
            format!("{player_name} went unsold")
        }
    };

    let a = auction_mut(&mut next)?;
    a.clear_bidding();
    a.status = AuctionStatus::ShowingResult;
    a.result_message = Some(message.clone());
    a.result_until_ts = Some(now + rules.result_window_ms);

    info!("Room {}: {}", room.code, message);
    Ok(RoomUpdate::with_log(next, message))
}
