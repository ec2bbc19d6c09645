// Timer-driven transitions.
//
// The server calls `tick` for every live room on a fixed interval and again
// right after each committed command. The decision reads only the snapshot
// and `now`, so repeated calls on an unchanged room do the same thing, and
// once a transition lands the next call sees the new status and does nothing.

use tracing::debug;

use crate::auction::{self, active_team_ids};
use crate::bidding;
use crate::error::AuctionResult;
use crate::room::{AuctionStatus, Room, RoomUpdate};
use crate::rules::AuctionRules;

/// Why a running player is being settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleReason {
    DeadlineExpired,
    /// Exactly one team can still bid and it already holds the top bid.
    SoleActiveBidder,
    /// No team can bid on this player any more.
    AllSatOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    Settle(SettleReason),
    Advance,
}

/// What, if anything, the room needs at `now`.
pub fn due_action(room: &Room, now: i64) -> Option<TickAction> {
    let auction = room.auction.as_ref()?;
    match auction.status {
        AuctionStatus::Running => {
            if auction.bid_deadline_ts.is_some_and(|deadline| now > deadline) {
                return Some(TickAction::Settle(SettleReason::DeadlineExpired));
            }
            let active = active_team_ids(room);
            match active.as_slice() {
                [] => Some(TickAction::Settle(SettleReason::AllSatOut)),
                [only] if auction.current_bid_team_id.as_deref() == Some(*only) => {
                    Some(TickAction::Settle(SettleReason::SoleActiveBidder))
                }
                _ => None,
            }
        }
        AuctionStatus::ShowingResult => match auction.result_until_ts {
            Some(until) if now < until => None,
            _ => Some(TickAction::Advance),
        },
        AuctionStatus::NotStarted | AuctionStatus::Finished => None,
    }
}

/// Apply the due transition, if any.
pub fn tick(room: &Room, rules: &AuctionRules, now: i64) -> AuctionResult<Option<RoomUpdate>> {
    let Some(action) = due_action(room, now) else {
        return Ok(None);
    };
    debug!("Room {}: tick -> {:?}", room.code, action);
    let update = match action {
        TickAction::Settle(_) => bidding::settle(room, rules, now)?,
        TickAction::Advance => auction::advance(room, rules, now)?,
    };
    Ok(Some(update))
}
