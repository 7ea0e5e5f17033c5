//! Remote selection rendering data.
//!
//! Turns remote awareness entries into decorations an editor can paint:
//! a caret or highlight range resolved against the local replica, a color
//! derived from the user id, and an opacity that drops to zero once the
//! selection has been idle past the recency window. Render state is cached
//! per user id: the color seed, the latest change seen from any of the
//! user's clients, and the style last rendered.
//!
//! ```text
//!  AwarenessEntry ──► resolve anchor/head (LogicalPosition → index)
//!        │                      │
//!        │                      ▼
//!        │            range = min..max, Caret if empty
//!        ▼
//!  changed_at ──► opacity (1.0 within window, else 0.0)
//!  user.id    ──► CursorColor (FNV-1a → HSL)
//! ```
//!
//! Reference: Akenine-Möller, Real-Time Rendering, Section 18.6

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::time::{Duration, Instant};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::awareness::AwarenessEntry;
use crate::protocol::ClientId;
use crate::replica::Replica;

// ───────────────────────────────────────────────────────────────────
// Color
// ───────────────────────────────────────────────────────────────────

/// RGBA color for caret and highlight rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable color for a user id. Same id, same color, on every replica.
    pub fn from_user(user_id: &str) -> Self {
        Self::from_seed(color_seed(user_id))
    }

    fn from_seed(seed: u64) -> Self {
        let hue = (seed % 360) as f32 / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    /// `#rrggbb` for CSS consumers.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!(
            "#{:02x}{:02x}{:02x}",
            channel(self.r),
            channel(self.g),
            channel(self.b)
        )
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

/// Stable per-user seed the color is derived from.
pub fn color_seed(user_id: &str) -> u64 {
    fnv1a(user_id.as_bytes())
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

fn opacity_at(window: Duration, changed_at: Instant, now: Instant) -> f32 {
    if now.saturating_duration_since(changed_at) <= window {
        1.0
    } else {
        0.0
    }
}

// ───────────────────────────────────────────────────────────────────
// Decorations
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecorationKind {
    Caret,
    Highlight,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecorationStyle {
    pub color: CursorColor,
    /// 1.0 while the selection is recent, 0.0 once idle
    pub opacity: f32,
}

/// One remote caret or highlight, in current local indices.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoration {
    pub client_id: ClientId,
    pub user_id: String,
    /// Display name for the caret label
    pub label: String,
    pub kind: DecorationKind,
    pub range: Range<u32>,
    pub style: DecorationStyle,
}

impl Decoration {
    pub fn is_visible(&self) -> bool {
        self.style.opacity > 0.0
    }
}

/// Per-user render state, refreshed on every `decorate` pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionCacheEntry {
    pub color_seed: u64,
    /// Most recent selection change across the user's clients
    pub last_changed_at: Instant,
    pub rendered_style: DecorationStyle,
}

/// Builds decorations from awareness state.
#[derive(Debug)]
pub struct SelectionDecorator {
    recency_window: Duration,
    cache: HashMap<String, SelectionCacheEntry>,
}

impl SelectionDecorator {
    pub fn new(recency_window: Duration) -> Self {
        Self {
            recency_window,
            cache: HashMap::new(),
        }
    }

    /// Opacity for a selection last changed at `changed_at`.
    ///
    /// The window is inclusive: exactly `recency_window` old is still opaque.
    pub fn opacity(&self, changed_at: Instant, now: Instant) -> f32 {
        opacity_at(self.recency_window, changed_at, now)
    }

    /// Decorations for every remote client with a resolvable selection.
    pub fn decorate(
        &mut self,
        replica: &Replica,
        local_id: ClientId,
        entries: &BTreeMap<ClientId, AwarenessEntry>,
        now: Instant,
    ) -> Vec<Decoration> {
        self.cache
            .retain(|user_id, _| entries.values().any(|e| e.state.user.id == *user_id));

        let mut out = Vec::with_capacity(entries.len());
        for (client_id, entry) in entries {
            if *client_id == local_id {
                continue;
            }
            let Some(selection) = &entry.state.selection else {
                continue;
            };
            let (Some(anchor), Some(head)) = (
                replica.resolve_position(&selection.anchor),
                replica.resolve_position(&selection.head),
            ) else {
                debug!("Skipping undecodable selection from {client_id}");
                continue;
            };

            let user_id = &entry.state.user.id;
            let style = self.style_for(user_id, entry.changed_at, now);
            let range = anchor.min(head)..anchor.max(head);
            let kind = if range.is_empty() {
                DecorationKind::Caret
            } else {
                DecorationKind::Highlight
            };

            out.push(Decoration {
                client_id: *client_id,
                user_id: user_id.clone(),
                label: entry.state.user.name.clone(),
                kind,
                range,
                style,
            });
        }
        out
    }

    fn style_for(&mut self, user_id: &str, changed_at: Instant, now: Instant) -> DecorationStyle {
        let window = self.recency_window;
        let entry = self
            .cache
            .entry(user_id.to_string())
            .or_insert_with(|| {
                let color_seed = color_seed(user_id);
                SelectionCacheEntry {
                    color_seed,
                    last_changed_at: changed_at,
                    rendered_style: DecorationStyle {
                        color: CursorColor::from_seed(color_seed),
                        opacity: 0.0,
                    },
                }
            });
        entry.last_changed_at = entry.last_changed_at.max(changed_at);
        entry.rendered_style.opacity = opacity_at(window, changed_at, now);
        entry.rendered_style
    }

    /// Cached render state for a user seen in the last `decorate` pass.
    pub fn cached(&self, user_id: &str) -> Option<&SelectionCacheEntry> {
        self.cache.get(user_id)
    }

    pub fn recency_window(&self) -> Duration {
        self.recency_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribution::IdentityAttribution;
    use crate::awareness::{AwarenessFields, Selection};
    use crate::protocol::UserIdentity;
    use crate::replica::Mutation;

    fn seeded_replica(text: &str) -> Replica {
        let client = ClientId::random();
        let replica = Replica::new(client);
        let mut attribution = IdentityAttribution::new(client, UserIdentity::new("seed"));
        replica
            .apply_local(&Mutation::insert(0, text), &mut attribution)
            .unwrap();
        replica
    }

    fn entry(replica: &Replica, user: &str, anchor: u32, head: u32, at: Instant) -> AwarenessEntry {
        AwarenessEntry {
            state: AwarenessFields::new(UserIdentity::with_name(user, user.to_uppercase()))
                .with_selection(Selection {
                    anchor: replica.logical_position(anchor).unwrap(),
                    head: replica.logical_position(head).unwrap(),
                }),
            clock: 1,
            updated_at: at,
            changed_at: at,
        }
    }

    #[test]
    fn test_color_is_deterministic() {
        assert_eq!(CursorColor::from_user("alice"), CursorColor::from_user("alice"));
        assert_ne!(CursorColor::from_user("alice"), CursorColor::from_user("bob"));
        assert_eq!(CursorColor::from_user("alice").a, 1.0);
    }

    #[test]
    fn test_color_hex_format() {
        let hex = CursorColor::from_user("carol").to_hex();
        assert_eq!(hex.len(), 7);
        assert!(hex.starts_with('#'));
    }

    #[test]
    fn test_fnv1a_known_vector() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn test_opacity_window_is_inclusive() {
        let decorator = SelectionDecorator::new(Duration::from_secs(10));
        let t0 = Instant::now();

        assert_eq!(decorator.opacity(t0, t0 + Duration::from_secs(9)), 1.0);
        assert_eq!(decorator.opacity(t0, t0 + Duration::from_secs(10)), 1.0);
        assert_eq!(decorator.opacity(t0, t0 + Duration::from_millis(10_001)), 0.0);
    }

    #[test]
    fn test_caret_and_highlight() {
        let replica = seeded_replica("hello world");
        let mut decorator = SelectionDecorator::new(Duration::from_secs(10));
        let now = Instant::now();

        let caret_id = ClientId::random();
        let range_id = ClientId::random();
        let mut entries = BTreeMap::new();
        entries.insert(caret_id, entry(&replica, "bob", 3, 3, now));
        entries.insert(range_id, entry(&replica, "eve", 8, 2, now));

        let decorations = decorator.decorate(&replica, ClientId::random(), &entries, now);
        assert_eq!(decorations.len(), 2);

        let caret = decorations.iter().find(|d| d.client_id == caret_id).unwrap();
        assert_eq!(caret.kind, DecorationKind::Caret);
        assert_eq!(caret.range, 3..3);
        assert_eq!(caret.label, "BOB");

        let highlight = decorations.iter().find(|d| d.client_id == range_id).unwrap();
        assert_eq!(highlight.kind, DecorationKind::Highlight);
        assert_eq!(highlight.range, 2..8);
        assert_eq!(highlight.style.color, CursorColor::from_user("eve"));
    }

    #[test]
    fn test_local_client_and_empty_selection_skipped() {
        let replica = seeded_replica("abc");
        let mut decorator = SelectionDecorator::new(Duration::from_secs(10));
        let now = Instant::now();

        let local = ClientId::random();
        let idle = ClientId::random();
        let mut entries = BTreeMap::new();
        entries.insert(local, entry(&replica, "me", 1, 1, now));
        entries.insert(
            idle,
            AwarenessEntry {
                state: AwarenessFields::new(UserIdentity::new("idle")),
                clock: 1,
                updated_at: now,
                changed_at: now,
            },
        );

        assert!(decorator.decorate(&replica, local, &entries, now).is_empty());
    }

    #[test]
    fn test_stale_selection_fades() {
        let replica = seeded_replica("abc");
        let mut decorator = SelectionDecorator::new(Duration::from_secs(10));
        let t0 = Instant::now();

        let mut entries = BTreeMap::new();
        entries.insert(ClientId::random(), entry(&replica, "bob", 1, 2, t0));

        let fresh = decorator.decorate(&replica, ClientId::random(), &entries, t0);
        assert!(fresh[0].is_visible());

        let stale = decorator.decorate(
            &replica,
            ClientId::random(),
            &entries,
            t0 + Duration::from_secs(11),
        );
        assert_eq!(stale[0].style.opacity, 0.0);
    }

    #[test]
    fn test_cache_keyed_by_user() {
        let replica = seeded_replica("hello");
        let mut decorator = SelectionDecorator::new(Duration::from_secs(10));
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(3);

        // Same user from two tabs shares one cache entry.
        let mut entries = BTreeMap::new();
        entries.insert(ClientId::random(), entry(&replica, "bob", 1, 1, t0));
        entries.insert(ClientId::random(), entry(&replica, "bob", 2, 4, t1));
        decorator.decorate(&replica, ClientId::random(), &entries, t1);

        let cached = decorator.cached("bob").unwrap();
        assert_eq!(cached.color_seed, color_seed("bob"));
        assert_eq!(cached.last_changed_at, t1);
        assert_eq!(cached.rendered_style.color, CursorColor::from_user("bob"));
        assert_eq!(cached.rendered_style.opacity, 1.0);

        decorator.decorate(&replica, ClientId::random(), &BTreeMap::new(), t1);
        assert!(decorator.cached("bob").is_none());
    }
}
