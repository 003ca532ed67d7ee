//! showsync-resolver: recovery suggestions for tasks whose target item is
//! gone.
//!
//! When a task's target id no longer resolves, the resolver ranks every
//! tracked item by a weighted similarity score so the user can re-link the
//! task instead of losing it. Advisory only — nothing is re-linked without
//! an explicit choice.

pub mod relink;

use showsync_types::{MatchCandidate, MediaItem, ScheduledTask};

pub use relink::{RelinkResult, relink_batch};

/// Auto-created tasks are named "<title> auto-import"; the suffix is
/// stripped before title comparison.
pub(crate) const TASK_NAME_SUFFIX: &str = " auto-import";

const SCORE_EXACT_TITLE: i64 = 100;
const SCORE_PARTIAL_MAX: f64 = 80.0;
const SCORE_PROXIMITY_MAX: f64 = 20.0;
const SCORE_PLATFORM_FLAG: i64 = 30;
const SCORE_SEASON_MATCH: i64 = 25;
const PROXIMITY_WINDOW_DAYS: f64 = 3.0;

/// Candidates scoring at or below this are noise and are discarded.
const MIN_SCORE: i64 = 30;

/// Score every item as a replacement target for the task and return the
/// ranked candidates, best first.
///
/// Deterministic for a given input set: ties are broken by ascending item id.
pub fn find_candidates(task: &ScheduledTask, items: &[MediaItem]) -> Vec<MatchCandidate> {
    let mut candidates: Vec<MatchCandidate> = items
        .iter()
        .filter_map(|item| score_candidate(task, item))
        .filter(|c| c.score > MIN_SCORE)
        .collect();

    candidates.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.item.id.cmp(&b.item.id)));
    candidates
}

/// The title a task is matched by: the cached target title when present,
/// otherwise the task name without the auto-import suffix.
fn reference_title(task: &ScheduledTask) -> &str {
    let title = if task.target_title.is_empty() {
        &task.name
    } else {
        &task.target_title
    };
    title.strip_suffix(TASK_NAME_SUFFIX).unwrap_or(title)
}

fn score_candidate(task: &ScheduledTask, item: &MediaItem) -> Option<MatchCandidate> {
    // (points, reason) per contributing factor; the primary reason is the
    // highest-scoring one.
    let mut factors: Vec<(i64, String)> = Vec::new();

    let task_title = reference_title(task).trim().to_lowercase();
    let item_title = item.title.trim().to_lowercase();

    if !task_title.is_empty() {
        if task_title == item_title {
            factors.push((SCORE_EXACT_TITLE, "exact title match".to_string()));
        } else if task_title.contains(&item_title) || item_title.contains(&task_title) {
            let shorter = task_title.chars().count().min(item_title.chars().count());
            let longer = task_title.chars().count().max(item_title.chars().count());
            let ratio = shorter as f64 / longer as f64;
            let points = (SCORE_PARTIAL_MAX * ratio).round() as i64;
            factors.push((
                points,
                format!("title overlap {}%", (ratio * 100.0).round() as i64),
            ));
        }
    }

    let days_apart = (task.created_at - item.created_at).num_seconds().abs() as f64 / 86_400.0;
    if days_apart < PROXIMITY_WINDOW_DAYS {
        let points =
            (SCORE_PROXIMITY_MAX * (1.0 - days_apart / PROXIMITY_WINDOW_DAYS)).round() as i64;
        if points > 0 {
            factors.push((points, format!("created {days_apart:.1} days apart")));
        }
    }

    if task.action.anime_numbering && item.is_anime {
        factors.push((
            SCORE_PLATFORM_FLAG,
            "anime numbering matches platform".to_string(),
        ));
    }

    if let Some(season) = task.action.season {
        if item.seasons.contains(&season) {
            factors.push((SCORE_SEASON_MATCH, format!("has season {season}")));
        }
    }

    if factors.is_empty() {
        return None;
    }

    let score: i64 = factors.iter().map(|(points, _)| points).sum();
    let primary_reason = factors
        .iter()
        .max_by_key(|(points, _)| *points)
        .map(|(_, reason)| reason.clone())
        .unwrap_or_default();

    Some(MatchCandidate {
        item: item.clone(),
        score,
        primary_reason,
        all_reasons: factors.into_iter().map(|(_, reason)| reason).collect(),
    })
}
