//! In-memory pick order for one drain of the pending set.
//!
//! Pending assets split into a "recent" band and an "old" backlog. The
//! backlog is sorted by size and consumed from both ends, so each draw
//! serves either something new, the smallest unseen file, or the largest.

use std::collections::VecDeque;

use chrono::{DateTime, Days, Local, Utc};
use rand::Rng as _;

use crate::icloud::photos::PhotoAsset;

/// Tuning for [`AssetQueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueuePolicy {
    /// Assets added on or after local midnight minus this many days are recent.
    pub recent_days: u64,
    /// Draws at or below this go to the recent band.
    pub recent_threshold: f64,
    /// Draws above `recent_threshold` and at or below this go to the small end.
    pub small_threshold: f64,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            recent_days: 2,
            recent_threshold: 0.30,
            small_threshold: 0.50,
        }
    }
}

/// Source of uniform draws in `[0, 1)`.
pub trait Draw: Send {
    fn draw(&mut self) -> f64;
}

/// Production draw source.
#[derive(Debug, Default)]
pub struct ThreadRngDraw;

impl Draw for ThreadRngDraw {
    fn draw(&mut self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Recent,
    Small,
    Big,
}

/// Size-ascending backlog with a low pointer (smallest unseen) and a high
/// pointer (one past the largest unseen).
#[derive(Debug, Default)]
struct SizeBands {
    items: Vec<Option<PhotoAsset>>,
    low: usize,
    high: usize,
}

impl SizeBands {
    fn new(mut assets: Vec<PhotoAsset>) -> Self {
        assets.sort_by_key(PhotoAsset::size);
        let high = assets.len();
        Self {
            items: assets.into_iter().map(Some).collect(),
            low: 0,
            high,
        }
    }

    fn is_exhausted(&self) -> bool {
        self.low >= self.high
    }

    fn next_small(&mut self) -> Option<PhotoAsset> {
        if self.is_exhausted() {
            return None;
        }
        let item = self.items[self.low].take();
        self.low += 1;
        item
    }

    fn next_big(&mut self) -> Option<PhotoAsset> {
        if self.is_exhausted() {
            return None;
        }
        self.high -= 1;
        self.items[self.high].take()
    }
}

pub struct AssetQueue {
    recent: VecDeque<PhotoAsset>,
    old: SizeBands,
    policy: QueuePolicy,
    draw: Box<dyn Draw>,
}

impl std::fmt::Debug for AssetQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetQueue")
            .field("recent", &self.recent.len())
            .field("old", &(self.old.high.saturating_sub(self.old.low)))
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl AssetQueue {
    /// Partition `assets` relative to local midnight of `now`.
    pub fn new(
        assets: Vec<PhotoAsset>,
        policy: QueuePolicy,
        draw: Box<dyn Draw>,
        now: DateTime<Local>,
    ) -> Self {
        let cutoff = recent_cutoff(now, policy.recent_days);
        let (recent, old): (Vec<_>, Vec<_>) = assets
            .into_iter()
            .partition(|a| cutoff.is_some_and(|c| a.added_date() >= c));
        tracing::debug!(
            recent = recent.len(),
            old = old.len(),
            "Built download queue"
        );
        Self {
            recent: recent.into(),
            old: SizeBands::new(old),
            policy,
            draw,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty() && self.old.is_exhausted()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.recent.len() + self.old.high.saturating_sub(self.old.low)
    }

    /// One draw. `None` when the drawn band has nothing left.
    pub fn pick_once(&mut self) -> Option<(Band, PhotoAsset)> {
        let draw = self.draw.draw();
        if draw <= self.policy.recent_threshold {
            self.recent.pop_front().map(|a| (Band::Recent, a))
        } else if draw <= self.policy.small_threshold {
            self.old.next_small().map(|a| (Band::Small, a))
        } else {
            self.old.next_big().map(|a| (Band::Big, a))
        }
    }

    /// Redraw until an item comes out or the queue is empty.
    pub fn pick(&mut self) -> Option<PhotoAsset> {
        while !self.is_empty() {
            if let Some((_, asset)) = self.pick_once() {
                return Some(asset);
            }
        }
        None
    }
}

fn recent_cutoff(now: DateTime<Local>, days: u64) -> Option<DateTime<Utc>> {
    let midnight = now
        .date_naive()
        .checked_sub_days(Days::new(days))?
        .and_hms_opt(0, 0, 0)?
        .and_local_timezone(Local)
        .earliest()?;
    Some(midnight.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::Duration;
    use serde_json::json;

    use super::*;

    /// Replays a fixed list of draws, wrapping around.
    struct Scripted {
        draws: Vec<f64>,
        next: usize,
    }

    impl Scripted {
        fn boxed(draws: Vec<f64>) -> Box<dyn Draw> {
            Box::new(Self { draws, next: 0 })
        }
    }

    impl Draw for Scripted {
        fn draw(&mut self) -> f64 {
            let d = self.draws[self.next % self.draws.len()];
            self.next += 1;
            d
        }
    }

    fn asset(id: &str, size: u64, added: DateTime<Utc>) -> PhotoAsset {
        PhotoAsset::new(
            json!({
                "recordName": id,
                "created": {"timestamp": added.timestamp_millis()},
                "fields": {"resOriginalRes": {"value": {"size": size}}}
            }),
            None,
        )
    }

    /// 100 recent, then 100 old assets with sizes 1..=100.
    fn library(now: DateTime<Local>) -> Vec<PhotoAsset> {
        let fresh = now.with_timezone(&Utc) - Duration::hours(1);
        let stale = now.with_timezone(&Utc) - Duration::days(30);
        let mut assets: Vec<_> = (0..100)
            .map(|i| asset(&format!("r{i}"), 5000, fresh))
            .collect();
        assets.extend((1..=200).map(|i| asset(&format!("o{i}"), i, stale)));
        assets
    }

    fn even_draws() -> Vec<f64> {
        (0..100).map(|k| k as f64 * 0.01 + 0.005).collect()
    }

    #[test]
    fn test_weighted_fractions() {
        let now = Local::now();
        let mut queue = AssetQueue::new(
            library(now),
            QueuePolicy::default(),
            Scripted::boxed(even_draws()),
            now,
        );
        let mut counts = [0usize; 3];
        for _ in 0..100 {
            let (band, _) = queue.pick_once().unwrap();
            counts[band as usize] += 1;
        }
        assert_eq!(counts, [30, 20, 50]);
    }

    #[test]
    fn test_small_and_big_ends() {
        let now = Local::now();
        let mut queue = AssetQueue::new(
            library(now),
            QueuePolicy::default(),
            Scripted::boxed(vec![0.4, 0.9, 0.4, 0.9]),
            now,
        );
        let sizes: Vec<u64> = (0..4).map(|_| queue.pick_once().unwrap().1.size()).collect();
        assert_eq!(sizes, vec![1, 200, 2, 199]);
    }

    #[test]
    fn test_exhausted_band_yields_nothing() {
        let now = Local::now();
        let stale = now.with_timezone(&Utc) - Duration::days(30);
        let assets = vec![asset("a", 1, stale), asset("b", 2, stale)];
        let mut queue = AssetQueue::new(
            assets,
            QueuePolicy::default(),
            Scripted::boxed(vec![0.1]),
            now,
        );
        for _ in 0..10 {
            assert!(queue.pick_once().is_none());
        }
        assert!(!queue.is_empty());
    }

    #[test]
    fn test_bands_meet_and_queue_empties() {
        let now = Local::now();
        let stale = now.with_timezone(&Utc) - Duration::days(30);
        let assets = (1..=5).map(|i| asset(&format!("o{i}"), i, stale)).collect();
        let mut queue = AssetQueue::new(
            assets,
            QueuePolicy::default(),
            Scripted::boxed(vec![0.4, 0.9]),
            now,
        );
        let mut seen = Vec::new();
        while let Some(a) = queue.pick() {
            seen.push(a.size());
        }
        assert_eq!(seen, vec![1, 5, 2, 4, 3]);
        assert!(queue.is_empty());
        assert!(queue.pick_once().is_none());
    }

    #[test]
    fn test_pick_covers_pending_set_once() {
        let now = Local::now();
        let mut queue = AssetQueue::new(
            library(now),
            QueuePolicy::default(),
            Box::new(ThreadRngDraw),
            now,
        );
        assert_eq!(queue.len(), 300);
        let mut ids = HashSet::new();
        while let Some(a) = queue.pick() {
            assert!(ids.insert(a.id().to_string()), "{} served twice", a.id());
        }
        assert_eq!(ids.len(), 300);
    }

    #[test]
    fn test_recent_cutoff_is_local_midnight() {
        let now = Local::now();
        let cutoff = recent_cutoff(now, 2).unwrap().with_timezone(&Local);
        assert_eq!(cutoff.date_naive(), now.date_naive() - Days::new(2));
        assert_eq!(cutoff.time(), chrono::NaiveTime::MIN);
    }
}
