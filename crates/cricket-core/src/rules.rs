// Auction timing and money rules shared by every room on a server.

use serde::{Deserialize, Serialize};

/// Smallest bid step. Every accepted bid and every base price is a multiple.
pub const BID_UNIT_LAKHS: u32 = 50;

/// Lakhs per crore, used for display conversion.
pub const LAKHS_PER_CRORE: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuctionRules {
    /// Bidding window armed for each player and re-armed by every bid.
    pub bid_window_ms: i64,
    /// How long the sold/unsold banner stays up before the next player.
    pub result_window_ms: i64,
    /// Starting purse for each team.
    pub initial_purse_lakhs: u32,
    /// Starting time bank for each team.
    pub time_bank_seconds: u32,
    /// Seconds spent (and added to the deadline) per time-bank use.
    pub time_bank_step_secs: u32,
    /// Squad cap used by the early-termination check.
    pub max_squad_size: usize,
}

impl Default for AuctionRules {
    fn default() -> Self {
        AuctionRules {
            bid_window_ms: 30_000,
            result_window_ms: 5_000,
            initial_purse_lakhs: 10_000,
            time_bank_seconds: 120,
            time_bank_step_secs: 15,
            max_squad_size: 15,
        }
    }
}

/// Render a lakh amount the way the room shows it: crores above one crore,
/// lakhs below.
pub fn format_price(lakhs: u32) -> String {
    if lakhs >= LAKHS_PER_CRORE {
        let crores = lakhs as f64 / LAKHS_PER_CRORE as f64;
        let text = format!("{crores:.2}");
        let text = text.trim_end_matches('0').trim_end_matches('.');
        format!("{text} Cr")
    } else {
        format!("{lakhs} L")
    }
}
