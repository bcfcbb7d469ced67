//! Incremental cursor tracking for delta reads.
//!
//! Scored entries on the store only ever grow; instead of re-scanning a set
//! each round, a cursor remembers the highest score already consumed per
//! (key, source) pair and reads strictly past it. Marks are local per-node
//! bookkeeping, never visible to peers.

use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::store::CoordStore;

/// High-water marks for delta reads, keyed by store key and optional
/// upstream source address.
#[derive(Debug, Default)]
pub struct CursorTracker {
    marks: HashMap<(String, Option<String>), f64>,
}

impl CursorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current mark for a cursor; unseen cursors start at the zero score.
    pub fn mark(&self, key: &str, source: Option<&str>) -> f64 {
        self.marks
            .get(&(key.to_string(), source.map(str::to_string)))
            .copied()
            .unwrap_or(0.0)
    }

    /// Items on `store` under `key` with score strictly above the cursor,
    /// advancing the mark to the highest score seen. An empty batch leaves
    /// the mark untouched; the mark never decreases.
    pub async fn read_updated<S: CoordStore>(
        &mut self,
        store: &S,
        key: &str,
    ) -> Result<HashSet<String>> {
        self.read_from(store, key, None).await
    }

    /// Union of delta reads across upstream sources, each with its own mark.
    pub async fn read_upstream<S: CoordStore>(
        &mut self,
        sources: &[(String, S)],
        key: &str,
    ) -> Result<HashSet<String>> {
        let mut items = HashSet::new();
        for (addr, store) in sources {
            items.extend(self.read_from(store, key, Some(addr)).await?);
        }
        Ok(items)
    }

    async fn read_from<S: CoordStore>(
        &mut self,
        store: &S,
        key: &str,
        source: Option<&str>,
    ) -> Result<HashSet<String>> {
        let mark = self.mark(key, source);
        let batch = store.zrange_by_score_after(key, mark).await?;
        let mut highest = mark;
        let mut items = HashSet::with_capacity(batch.len());
        for (member, score) in batch {
            if score > highest {
                highest = score;
            }
            items.insert(member);
        }
        if highest > mark {
            self.marks
                .insert((key.to_string(), source.map(str::to_string)), highest);
        }
        tracing::debug!(key, ?source, mark, advanced_to = highest, count = items.len(), "delta read");
        Ok(items)
    }

    /// Forget all marks; the next engine run starts from the zero score.
    pub fn reset(&mut self) {
        self.marks.clear();
    }
}
