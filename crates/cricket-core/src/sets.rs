// Set generation: quality-sorted, price-tiered, shuffled within each set.

use std::collections::BTreeMap;

use rand::Rng;

use crate::error::{AuctionError, AuctionResult};
use crate::room::{AuctionState, Player, PlayerStatus, Room, RoomUpdate};
use crate::scoring::{rank_players, ScoredPlayer, SeasonPlayer};

/// Players per set.
pub const SET_SIZE: usize = 20;

/// Base price for every player in set `set_index` (0-based).
///
/// Sets 0-1 open at 2 Cr, sets 2-4 at 1 Cr, the rest at 0.5 Cr. The tier
/// bounds are written as `< 2` / `< 5`.
pub fn base_price_for_set(set_index: usize) -> u32 {
    if set_index < 2 {
        200
    } else if set_index < 5 {
        100
    } else {
        50
    }
}

/// Uniform in-place permutation (Fisher-Yates, walking down from the end).
pub fn fisher_yates<T, R: Rng + ?Sized>(items: &mut [T], rng: &mut R) {
    for i in (1..items.len()).rev() {
        let j = rng.gen_range(0..=i);
        items.swap(i, j);
    }
}

/// The output of set generation before it is folded into a room.
#[derive(Debug, Clone)]
pub struct GeneratedSets {
    pub sets: Vec<Vec<String>>,
    pub players: BTreeMap<String, Player>,
}

/// Chunk ranked players into sets, price each set, and shuffle inside it.
///
/// `ranked` must already be sorted best-first.
pub fn build_sets<R: Rng + ?Sized>(ranked: &[ScoredPlayer], rng: &mut R) -> GeneratedSets {
    let mut sets = Vec::with_capacity(ranked.len().div_ceil(SET_SIZE));
    let mut players = BTreeMap::new();

    for (set_index, chunk) in ranked.chunks(SET_SIZE).enumerate() {
        let base = base_price_for_set(set_index);
        let mut ids: Vec<String> = Vec::with_capacity(chunk.len());
        for p in chunk {
            players.insert(
                p.id.clone(),
                Player {
                    name: p.name.clone(),
                    base_price_lakhs: base,
                    status: PlayerStatus::NotStarted,
                    sold_to_team_id: None,
                    sold_price_lakhs: None,
                },
            );
            ids.push(p.id.clone());
        }
        fisher_yates(&mut ids, rng);
        sets.push(ids);
    }

    GeneratedSets { sets, players }
}

/// Admin operation: score the room's season, replace all players, and reset
/// the auction to `not_started` over freshly generated sets.
///
/// Nothing is produced when the season has no players, so a failed
/// generation leaves the room untouched.
pub fn generate_sets<R: Rng + ?Sized>(
    room: &Room,
    uid: &str,
    season_players: &[SeasonPlayer],
    rng: &mut R,
) -> AuctionResult<RoomUpdate> {
    room.require_admin(uid)?;
    if !room.is_pre_auction() {
        return Err(AuctionError::precondition(
            "sets cannot be regenerated after the auction starts",
        ));
    }

    let ranked = rank_players(season_players, &room.config.coefficients());
    if ranked.is_empty() {
        return Err(AuctionError::precondition(format!(
            "no scored players found for season {}",
            room.config.season
        )));
    }

    let generated = build_sets(&ranked, rng);
    let mut next = room.clone();
    let line = format!(
        "Generated {} sets from {} players (season {})",
        generated.sets.len(),
        generated.players.len(),
        room.config.season
    );
    next.players = generated.players;
    next.auction = Some(AuctionState::new(generated.sets));
    Ok(RoomUpdate::with_log(next, line))
}
