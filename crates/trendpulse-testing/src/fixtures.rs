use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use trendpulse_store::Store;
use trendpulse_store::queries::item::{self, NewSourceItem};
use trendpulse_types::{Interactions, Window, WindowSlot};

/// The window most fixtures live in.
pub fn test_window() -> Window {
    Window::new(
        NaiveDate::from_ymd_opt(2025, 11, 7).unwrap(),
        WindowSlot::Am,
    )
}

/// Builder for a crawled-item row.
#[derive(Debug, Clone)]
pub struct ItemSpec {
    pub platform: String,
    pub title: String,
    pub summary: Option<String>,
    pub raw_heat: Option<f64>,
    pub fetched_at: DateTime<Utc>,
    pub interactions: Option<Interactions>,
}

impl ItemSpec {
    pub fn new(platform: &str, title: &str) -> Self {
        Self {
            platform: platform.to_string(),
            title: title.to_string(),
            summary: None,
            raw_heat: None,
            fetched_at: Utc.with_ymd_and_hms(2025, 11, 7, 2, 0, 0).unwrap(),
            interactions: None,
        }
    }

    pub fn summary(mut self, summary: &str) -> Self {
        self.summary = Some(summary.to_string());
        self
    }

    pub fn heat(mut self, heat: f64) -> Self {
        self.raw_heat = Some(heat);
        self
    }

    pub fn fetched_at(mut self, at: DateTime<Utc>) -> Self {
        self.fetched_at = at;
        self
    }

    pub fn interactions(mut self, pairs: &[(&str, i64)]) -> Self {
        self.interactions = Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<Interactions>(),
        );
        self
    }
}

/// Insert one item; the dedup key is derived from platform + title so specs
/// stay collision-free inside a test.
pub fn seed_item(store: &Store, window: &Window, seq: usize, spec: &ItemSpec) -> i64 {
    let url = format!("https://{}.example.com/item/{}", spec.platform, seq);
    let url_hash = format!("h{:04}", seq);
    item::insert(
        &store.conn(),
        &NewSourceItem {
            platform: spec.platform.clone(),
            title: spec.title.clone(),
            summary: spec.summary.clone(),
            url,
            url_hash: url_hash.clone(),
            dedup_key: format!("{}:{}:test_run", spec.platform, url_hash),
            published_at: None,
            fetched_at: spec.fetched_at,
            interactions: spec.interactions.clone(),
            raw_heat: spec.raw_heat,
            window: *window,
            run_id: Some("test_run".to_string()),
        },
    )
    .expect("seed item")
}

/// Insert a batch of items, returning their ids in spec order.
pub fn seed_items(store: &Store, window: &Window, specs: &[ItemSpec]) -> Vec<i64> {
    specs
        .iter()
        .enumerate()
        .map(|(seq, spec)| seed_item(store, window, seq, spec))
        .collect()
}
