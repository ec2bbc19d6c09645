// Startup import of season datasets (`<seasons_dir>/<season>.json`).

use std::path::Path;

use anyhow::Context;
use cricket_core::db::Database;
use cricket_core::scoring::parse_season_dataset;
use tracing::{info, warn};

/// Import every `*.json` file in `dir` as the season named by its file stem.
///
/// A missing directory is not an error; the server simply starts without
/// datasets. Returns `(season, player_count)` for each imported file.
pub fn import_seasons_dir(db: &Database, dir: &Path) -> anyhow::Result<Vec<(String, usize)>> {
    if !dir.is_dir() {
        warn!("Seasons directory {} not found; no datasets imported", dir.display());
        return Ok(vec![]);
    }

    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read seasons directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut imported = Vec::with_capacity(paths.len());
    for path in paths {
        let Some(season) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let players = parse_season_dataset(&text)
            .with_context(|| format!("invalid season dataset {}", path.display()))?;
        let count = db.import_season(season, &players)?;
        info!("Imported season {season}: {count} players");
        imported.push((season.to_string(), count));
    }
    Ok(imported)
}
