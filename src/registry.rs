//! Tag registry: identities, admission, lock lifecycle, and staleness.
//!
//! The registry is the single owner of tag state. Tags enter through
//! [`TagRegistry::add`], leave only through eviction or an explicit
//! [`TagRegistry::remove`], and keep their insertion order: anchor selection
//! and display names both depend on it.

use std::time::{Duration, Instant};

use crate::domain::{ShortAddr, Tag, TagRole};

/// A radio identity we have heard from, tracked separately from decoded
/// tags because identity arrives before protocol decoding succeeds.
#[derive(Debug, Clone)]
struct SeenIdentity {
    identity: String,
    last_seen: Instant,
}

/// Owns all tags, their roles, and the anchor lock state.
#[derive(Debug, Default)]
pub struct TagRegistry {
    tags: Vec<Tag>,
    seen: Vec<SeenIdentity>,
    anchors_locked: bool,
    /// Short addresses of the anchors captured by the active lock.
    lock_snapshot: Option<Vec<ShortAddr>>,
}

impl TagRegistry {
    /// Empty registry with anchors unlocked.
    pub fn new() -> Self {
        Self::default()
    }

    /// True once an advertisement under this identity has been recorded.
    pub fn is_known(&self, identity: &str) -> bool {
        self.seen.iter().any(|s| s.identity == identity)
    }

    /// Refresh the last-seen time for an identity, registering it if new.
    pub fn record_seen(&mut self, identity: &str, now: Instant) {
        match self.seen.iter_mut().find(|s| s.identity == identity) {
            Some(entry) => entry.last_seen = now,
            None => self.seen.push(SeenIdentity {
                identity: identity.to_string(),
                last_seen: now,
            }),
        }
    }

    /// Number of identities currently tracked for staleness.
    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Whether an advertisement may create or refresh a tag right now.
    ///
    /// While anchors are unlocked only anchor-flagged devices participate,
    /// so trackers cannot enter before the topology is fixed; once locked,
    /// every device is admissible.
    pub fn admits(&self, is_anchor: bool) -> bool {
        self.anchors_locked || is_anchor
    }

    /// Insert a new tag. Returns `None` without inserting when the short
    /// address is already taken (short addresses are unique).
    pub fn add(&mut self, tag: Tag) -> Option<&mut Tag> {
        if self.lookup_by_short_address(&tag.short_addr).is_some() {
            return None;
        }
        self.tags.push(tag);
        self.tags.last_mut()
    }

    /// Remove a tag and its seen-identity entry. Filters live on the tag and
    /// are dropped with it.
    pub fn remove(&mut self, short_addr: &ShortAddr) -> Option<Tag> {
        let idx = self.tags.iter().position(|t| t.short_addr == *short_addr)?;
        let tag = self.tags.remove(idx);
        self.seen.retain(|s| s.identity != tag.identity);
        Some(tag)
    }

    /// Tags in insertion order.
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Mutable access for the solver sweep.
    pub fn tags_mut(&mut self) -> &mut [Tag] {
        &mut self.tags
    }

    /// Find a tag by its short protocol address.
    pub fn lookup_by_short_address(&self, short_addr: &ShortAddr) -> Option<&Tag> {
        self.tags.iter().find(|t| t.short_addr == *short_addr)
    }

    /// Mutable lookup by short address.
    pub fn lookup_by_short_address_mut(&mut self, short_addr: &ShortAddr) -> Option<&mut Tag> {
        self.tags.iter_mut().find(|t| t.short_addr == *short_addr)
    }

    /// Find a tag by its radio identity.
    pub fn lookup_by_identity_mut(&mut self, identity: &str) -> Option<&mut Tag> {
        self.tags.iter_mut().find(|t| t.identity == identity)
    }

    /// True while the anchor topology is locked.
    pub fn anchors_locked(&self) -> bool {
        self.anchors_locked
    }

    /// Freeze the current anchors.
    ///
    /// The first lock captures the current fixed tags as a snapshot and
    /// marks them locked. Re-locking while a snapshot exists re-asserts
    /// fixed/locked on the snapshot members only; anchors promoted since are
    /// deliberately not absorbed, so unlock always reverts exactly the set
    /// the operator originally froze.
    pub fn lock_anchors(&mut self) {
        match &self.lock_snapshot {
            None => {
                let snapshot: Vec<ShortAddr> = self
                    .tags
                    .iter()
                    .filter(|t| t.role == TagRole::Fixed)
                    .map(|t| t.short_addr)
                    .collect();
                for tag in &mut self.tags {
                    if tag.role == TagRole::Fixed {
                        tag.locked = true;
                    }
                }
                tracing::info!(anchors = snapshot.len(), "anchors locked");
                self.lock_snapshot = Some(snapshot);
            }
            Some(snapshot) => {
                let snapshot = snapshot.clone();
                for addr in &snapshot {
                    if let Some(tag) = self.lookup_by_short_address_mut(addr) {
                        tag.role = TagRole::Fixed;
                        tag.locked = true;
                    }
                }
            }
        }
        self.anchors_locked = true;
    }

    /// Revert the snapshotted anchors to mobile and clear the lock.
    /// Without a snapshot this is a no-op.
    pub fn unlock_anchors(&mut self) {
        let Some(snapshot) = self.lock_snapshot.take() else {
            return;
        };
        for addr in &snapshot {
            if let Some(tag) = self.lookup_by_short_address_mut(addr) {
                tag.role = TagRole::Mobile;
                tag.locked = false;
            }
        }
        self.anchors_locked = false;
        tracing::info!(anchors = snapshot.len(), "anchors unlocked");
    }

    /// Drop every tag whose identity has been unseen past the threshold.
    pub fn evict_stale(&mut self, threshold: Duration, now: Instant) {
        let stale: Vec<String> = self
            .seen
            .iter()
            .filter(|s| now.duration_since(s.last_seen) > threshold)
            .map(|s| s.identity.clone())
            .collect();
        for identity in stale {
            if let Some(idx) = self.tags.iter().position(|t| t.identity == identity) {
                let tag = self.tags.remove(idx);
                tracing::info!(
                    short_addr = %tag.short_addr,
                    name = %tag.name,
                    "evicted stale tag"
                );
            }
            self.seen.retain(|s| s.identity != identity);
        }
    }
}
