// Season statistics and the batting/bowling/all-rounder scoring formula.
//
// Scores are never stored. Every reader recomputes them from the raw season
// stats and the room's current coefficients, so a coefficient change re-ranks
// the whole pool immediately.

use std::collections::BTreeMap;

use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize};

// ---------------------------------------------------------------------------
// Raw season data
// ---------------------------------------------------------------------------

/// Batting line from the season dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BattingStats {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub runs: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub avg: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub sr: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub fours: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub sixes: f64,
}

/// Bowling line from the season dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BowlingStats {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub wickets: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub avg: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub econ: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub sr: f64,
}

/// One player in a season dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeasonPlayer {
    /// Dataset key. Filled from the map key when parsing a dataset file.
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub batting: BattingStats,
    #[serde(default)]
    pub bowling: BowlingStats,
}

/// Accept numbers, numeric strings, or anything else (which becomes 0).
fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(coerce_stat(&value))
}

/// Coerce a raw JSON stat value to a finite number; missing, null,
/// non-numeric, and non-finite values are 0.
pub fn coerce_stat(value: &serde_json::Value) -> f64 {
    let n = match value {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        serde_json::Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    if n.is_finite() {
        n
    } else {
        0.0
    }
}

/// Parse a season dataset: a JSON object keyed by player id.
///
/// Players come back sorted by id so imports are deterministic.
pub fn parse_season_dataset(text: &str) -> anyhow::Result<Vec<SeasonPlayer>> {
    let raw: BTreeMap<String, SeasonPlayer> =
        serde_json::from_str(text).context("failed to parse season dataset")?;
    Ok(raw
        .into_iter()
        .map(|(id, mut player)| {
            player.id = id;
            player
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// The three room-configurable scoring coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coefficients {
    /// Weight per wicket.
    pub cf1: f64,
    /// Numerator of the economy term.
    pub cf2: f64,
    /// Multiplier on the combined score.
    pub cf3: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerScores {
    pub batting: f64,
    pub bowling: f64,
    pub all_rounder: f64,
}

/// Unweighted sum of the batting line.
pub fn batting_score(b: &BattingStats) -> f64 {
    b.runs + b.sr + b.avg + b.fours + b.sixes
}

/// `CF1 * wickets + CF2 / economy`. An economy of 0 means the player did not
/// bowl, so the economy term contributes nothing.
pub fn bowling_score(b: &BowlingStats, coeffs: &Coefficients) -> f64 {
    let economy_term = if b.econ > 0.0 { coeffs.cf2 / b.econ } else { 0.0 };
    coeffs.cf1 * b.wickets + economy_term
}

pub fn score_player(player: &SeasonPlayer, coeffs: &Coefficients) -> PlayerScores {
    let batting = batting_score(&player.batting);
    let bowling = bowling_score(&player.bowling, coeffs);
    PlayerScores {
        batting,
        bowling,
        all_rounder: coeffs.cf3 * (batting + bowling),
    }
}

/// A season player paired with freshly computed scores.
#[derive(Debug, Clone)]
pub struct ScoredPlayer {
    pub id: String,
    pub name: String,
    pub scores: PlayerScores,
}

/// Score every player and sort by all-rounder score, best first.
///
/// Ties keep dataset id order so the ranking is reproducible.
pub fn rank_players(players: &[SeasonPlayer], coeffs: &Coefficients) -> Vec<ScoredPlayer> {
    let mut scored: Vec<ScoredPlayer> = players
        .iter()
        .map(|p| ScoredPlayer {
            id: p.id.clone(),
            name: p.name.clone(),
            scores: score_player(p, coeffs),
        })
        .collect();

    scored.sort_by(|a, b| {
        b.scores
            .all_rounder
            .total_cmp(&a.scores.all_rounder)
            .then_with(|| a.id.cmp(&b.id))
    });
    scored
}
