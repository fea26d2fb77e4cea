use std::collections::HashMap;

use anyhow::{Context, Result};
use tracing::info;

use trendpulse_store::Store;
use trendpulse_store::queries::item;
use trendpulse_types::{MergeStatus, SourceItem, Window};

/// Heat for items without a platform score, and for platforms whose scores
/// are all identical (min == max carries no ranking information).
const NEUTRAL_HEAT: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct PlatformHeatStats {
    pub count: usize,
    pub avg_normalized: f64,
}

#[derive(Debug, Clone)]
pub struct HeatReport {
    pub window: String,
    pub total_items: usize,
    pub platforms: HashMap<String, PlatformHeatStats>,
}

/// Normalize raw heat for every pending item of a window.
///
/// Per platform: min-max over the non-null raw scores, neutral 0.5 for null
/// scores and for score-free platforms. Then weight by
/// `platform_weight / Σ weights` and finally divide by the window total so
/// the window's normalized heat sums to 1.0. Pure recomputation: replaying
/// the same window yields the same values.
pub fn normalize_window_heat(
    store: &Store,
    window: &Window,
    platform_weights: &HashMap<String, f64>,
) -> Result<HeatReport> {
    let items = item::list_by_window_status(&store.conn(), window, MergeStatus::PendingPeriod)
        .context("loading pending items for heat normalization")?;

    if items.is_empty() {
        return Ok(HeatReport {
            window: window.to_string(),
            total_items: 0,
            platforms: HashMap::new(),
        });
    }

    let mut by_platform: HashMap<&str, Vec<&SourceItem>> = HashMap::new();
    for it in &items {
        by_platform.entry(it.platform.as_str()).or_default().push(it);
    }

    // Weights cover configured platforms; anything unconfigured weighs 1.0.
    let total_weight: f64 = {
        let mut sum = 0.0;
        for platform in by_platform.keys() {
            sum += platform_weights.get(*platform).copied().unwrap_or(1.0);
        }
        sum
    };

    let mut normalized: HashMap<i64, f64> = HashMap::new();

    for (platform, platform_items) in &by_platform {
        let raw: Vec<f64> = platform_items.iter().filter_map(|it| it.raw_heat).collect();
        let (min, max) = match (
            raw.iter().copied().reduce(f64::min),
            raw.iter().copied().reduce(f64::max),
        ) {
            (Some(min), Some(max)) => (min, max),
            _ => (0.0, 0.0),
        };

        let weight = platform_weights.get(*platform).copied().unwrap_or(1.0);
        for it in platform_items {
            let base = match it.raw_heat {
                None => NEUTRAL_HEAT,
                Some(_) if raw.is_empty() => NEUTRAL_HEAT,
                Some(_) if max == min => NEUTRAL_HEAT,
                Some(value) => (value - min) / (max - min),
            };
            normalized.insert(it.id, base * weight / total_weight);
        }
    }

    let window_total: f64 = normalized.values().sum();
    if window_total > 0.0 {
        for value in normalized.values_mut() {
            *value /= window_total;
        }
    }

    for it in &items {
        let value = normalized[&it.id];
        item::set_normalized_heat(&store.conn(), it.id, value)
            .context("persisting normalized heat")?;
    }

    let mut platform_stats = HashMap::new();
    for (platform, platform_items) in &by_platform {
        let sum: f64 = platform_items.iter().map(|it| normalized[&it.id]).sum();
        platform_stats.insert(
            platform.to_string(),
            PlatformHeatStats {
                count: platform_items.len(),
                avg_normalized: sum / platform_items.len() as f64,
            },
        );
    }

    info!(
        window = %window,
        items = items.len(),
        platforms = platform_stats.len(),
        "heat normalization finished"
    );

    Ok(HeatReport {
        window: window.to_string(),
        total_items: items.len(),
        platforms: platform_stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use trendpulse_testing::{ItemSpec, seed_items, test_window};

    fn load_heats(store: &Store, window: &Window) -> Vec<(String, Option<f64>)> {
        item::list_by_window_status(&store.conn(), window, MergeStatus::PendingPeriod)
            .unwrap()
            .into_iter()
            .map(|it| (it.platform, it.normalized_heat))
            .collect()
    }

    #[test]
    fn test_lone_item_gets_full_window_heat() {
        let store = Store::open_in_memory().unwrap();
        let window = test_window();
        seed_items(&store, &window, &[ItemSpec::new("weibo", "headline").heat(100.0)]);

        let report =
            normalize_window_heat(&store, &window, &HashMap::new()).unwrap();
        assert_eq!(report.total_items, 1);

        let heats = load_heats(&store, &window);
        assert_eq!(heats[0].1, Some(1.0));
    }

    #[test]
    fn test_window_heat_sums_to_one() {
        let store = Store::open_in_memory().unwrap();
        let window = test_window();
        seed_items(
            &store,
            &window,
            &[
                ItemSpec::new("weibo", "a").heat(1000.0),
                ItemSpec::new("weibo", "b").heat(500.0),
                ItemSpec::new("zhihu", "c").heat(80.0),
                ItemSpec::new("zhihu", "d").heat(20.0),
                ItemSpec::new("sina", "e"), // platform without heat
            ],
        );

        let mut weights = HashMap::new();
        weights.insert("weibo".to_string(), 1.2);
        weights.insert("zhihu".to_string(), 1.1);
        weights.insert("sina".to_string(), 0.8);

        normalize_window_heat(&store, &window, &weights).unwrap();

        let total: f64 = load_heats(&store, &window)
            .iter()
            .map(|(_, h)| h.unwrap())
            .sum();
        assert!((total - 1.0).abs() < 1e-9, "total = {}", total);
    }

    #[test]
    fn test_null_heat_inside_scored_platform_gets_neutral() {
        let store = Store::open_in_memory().unwrap();
        let window = test_window();
        seed_items(
            &store,
            &window,
            &[
                ItemSpec::new("weibo", "top").heat(100.0),
                ItemSpec::new("weibo", "bottom").heat(0.0),
                ItemSpec::new("weibo", "unscored"),
            ],
        );

        normalize_window_heat(&store, &window, &HashMap::new()).unwrap();

        let heats = load_heats(&store, &window);
        // Pre-global-normalization bases are 1.0, 0.0, 0.5; after dividing by
        // the window total (1.5) they are 2/3, 0, 1/3.
        assert!((heats[0].1.unwrap() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(heats[1].1.unwrap(), 0.0);
        assert!((heats[2].1.unwrap() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_flat_scores_all_neutral() {
        let store = Store::open_in_memory().unwrap();
        let window = test_window();
        seed_items(
            &store,
            &window,
            &[
                ItemSpec::new("hupu", "a").heat(42.0),
                ItemSpec::new("hupu", "b").heat(42.0),
            ],
        );

        normalize_window_heat(&store, &window, &HashMap::new()).unwrap();

        let heats = load_heats(&store, &window);
        assert_eq!(heats[0].1.unwrap(), 0.5);
        assert_eq!(heats[1].1.unwrap(), 0.5);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let store = Store::open_in_memory().unwrap();
        let window = test_window();
        seed_items(
            &store,
            &window,
            &[
                ItemSpec::new("weibo", "a").heat(123.0),
                ItemSpec::new("zhihu", "b").heat(45.0),
                ItemSpec::new("sina", "c"),
            ],
        );

        normalize_window_heat(&store, &window, &HashMap::new()).unwrap();
        let first = load_heats(&store, &window);

        normalize_window_heat(&store, &window, &HashMap::new()).unwrap();
        let second = load_heats(&store, &window);

        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_window_is_a_noop() {
        let store = Store::open_in_memory().unwrap();
        let window = test_window();
        let report = normalize_window_heat(&store, &window, &HashMap::new()).unwrap();
        assert_eq!(report.total_items, 0);
    }
}
