//! Visibility Engine
//!
//! Per-viewer projection of hidden information. Everything here is a pure
//! function of its inputs: nothing reads or writes the replicated store, so
//! what a viewer can learn is decided entirely by the arguments.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::game::state::{Card, CardId, Player, PlayerId, TableMaps, Zone, ZoneId, ZoneType};

/// Perspective a viewer observes the table from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewerRole {
    /// Seated player.
    Player,
    /// Non-participating observer.
    Spectator,
}

/// Table-level library reveal setting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevealMode {
    /// Nothing beyond per-card reveals.
    #[default]
    None,
    /// Top card of every library is public.
    All,
}

/// Per-card disclosure decision.
pub trait RevealPredicate {
    /// May `viewer_id` (acting as `role`) see `card`?
    fn is_revealed(&self, card: &Card, viewer_id: &PlayerId, role: ViewerRole) -> bool;
}

/// Players see cards revealed to everyone or to them; spectators only the former.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultReveal;

impl RevealPredicate for DefaultReveal {
    fn is_revealed(&self, card: &Card, viewer_id: &PlayerId, role: ViewerRole) -> bool {
        if card.revealed_to_all {
            return true;
        }
        match role {
            ViewerRole::Player => card.revealed_to.contains(viewer_id),
            ViewerRole::Spectator => false,
        }
    }
}

impl<F> RevealPredicate for F
where
    F: Fn(&Card, &PlayerId, ViewerRole) -> bool,
{
    fn is_revealed(&self, card: &Card, viewer_id: &PlayerId, role: ViewerRole) -> bool {
        self(card, viewer_id, role)
    }
}

/// Library card ids `viewer_id` may see, top card first.
///
/// Empty for non-library zones and for the zone's owner.
pub fn revealed_library_card_ids(
    zone: &Zone,
    cards_by_id: &BTreeMap<CardId, Card>,
    viewer_id: &PlayerId,
    viewer_role: ViewerRole,
    reveal_mode: RevealMode,
    predicate: &dyn RevealPredicate,
) -> Vec<CardId> {
    if zone.zone_type != ZoneType::Library || &zone.owner_id == viewer_id {
        return Vec::new();
    }

    let top_index = zone.card_ids.len().checked_sub(1);
    zone.card_ids
        .iter()
        .enumerate()
        .rev()
        .filter(|(index, id)| {
            if reveal_mode == RevealMode::All && Some(*index) == top_index {
                return true;
            }
            cards_by_id
                .get(*id)
                .map(|card| predicate.is_revealed(card, viewer_id, viewer_role))
                .unwrap_or(false)
        })
        .map(|(_, id)| id.clone())
        .collect()
}

// =============================================================================
// VIEWER PROJECTION
// =============================================================================

/// A zone as one viewer sees it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerZone {
    /// Zone id.
    pub id: ZoneId,
    /// Zone kind.
    #[serde(rename = "type")]
    pub zone_type: ZoneType,
    /// Owner.
    pub owner_id: PlayerId,
    /// Number of cards, always visible.
    pub card_count: usize,
    /// Card ids the viewer may see. Bottom first for open zones; top first
    /// for another player's library.
    pub visible_card_ids: Vec<CardId>,
}

/// The whole table as one viewer sees it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerTable {
    /// Viewer.
    pub viewer_id: PlayerId,
    /// Players (public information).
    pub players: BTreeMap<PlayerId, Player>,
    /// Zones.
    pub zones: BTreeMap<ZoneId, ViewerZone>,
    /// Records of the cards listed in some `visible_card_ids`.
    pub cards: BTreeMap<CardId, Card>,
    /// Global counters.
    pub global_counters: BTreeMap<String, i64>,
}

/// Project the table for one viewer.
///
/// Open zones are listed whole, but a face-down card there shows only its
/// public state (position, tap, counters) unless the viewer controls it or
/// the predicate reveals it. The viewer's own hand is visible; their own
/// library is not. Other players' hidden zones expose a count plus whatever
/// the predicate (and, for libraries, the reveal mode) discloses.
pub fn project_for_viewer(
    maps: &TableMaps,
    viewer_id: &PlayerId,
    viewer_role: ViewerRole,
    reveal_mode: RevealMode,
    predicate: &dyn RevealPredicate,
) -> ViewerTable {
    let mut view = ViewerTable {
        viewer_id: viewer_id.clone(),
        players: maps.players.clone(),
        global_counters: maps.global_counters.clone(),
        ..Default::default()
    };

    for zone in maps.zones.values() {
        let own = &zone.owner_id == viewer_id && viewer_role == ViewerRole::Player;
        let visible: Vec<CardId> = match zone.zone_type {
            ZoneType::Library => revealed_library_card_ids(
                zone,
                &maps.cards,
                viewer_id,
                viewer_role,
                reveal_mode,
                predicate,
            ),
            ZoneType::Hand if own => zone.card_ids.clone(),
            ZoneType::Hand => zone
                .card_ids
                .iter()
                .filter(|id| {
                    maps.card(id)
                        .map(|card| predicate.is_revealed(card, viewer_id, viewer_role))
                        .unwrap_or(false)
                })
                .cloned()
                .collect(),
            _ => zone.card_ids.clone(),
        };

        let open = !matches!(zone.zone_type, ZoneType::Library | ZoneType::Hand);
        for id in &visible {
            if let Some(card) = maps.card(id) {
                let record = if open && card.face_down && !sees_face(card, viewer_id, viewer_role, predicate) {
                    masked(card)
                } else {
                    card.clone()
                };
                view.cards.insert(id.clone(), record);
            }
        }
        view.zones.insert(
            zone.id.clone(),
            ViewerZone {
                id: zone.id.clone(),
                zone_type: zone.zone_type,
                owner_id: zone.owner_id.clone(),
                card_count: zone.card_ids.len(),
                visible_card_ids: visible,
            },
        );
    }

    view
}

fn sees_face(card: &Card, viewer_id: &PlayerId, viewer_role: ViewerRole, predicate: &dyn RevealPredicate) -> bool {
    (viewer_role == ViewerRole::Player && &card.controller_id == viewer_id)
        || predicate.is_revealed(card, viewer_id, viewer_role)
}

/// Face-down record with the face cleared.
fn masked(card: &Card) -> Card {
    Card {
        name: String::new(),
        power: None,
        toughness: None,
        transformed: false,
        ..card.clone()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::mutators;
    use crate::game::state::tests::sample_table;

    fn library_view(maps: &TableMaps, viewer: &str, role: ViewerRole, mode: RevealMode) -> Vec<CardId> {
        let zone = maps.zone(&"alice-library".into()).unwrap();
        revealed_library_card_ids(zone, &maps.cards, &viewer.into(), role, mode, &DefaultReveal)
    }

    #[test]
    fn test_reveal_all_shows_only_top_card() {
        let maps = sample_table();
        assert_eq!(
            library_view(&maps, "bob", ViewerRole::Player, RevealMode::All),
            vec![CardId::new("c3")]
        );
    }

    #[test]
    fn test_owner_sees_nothing() {
        let mut maps = sample_table();
        mutators::reveal_card(&mut maps, &"c1".into(), true, &[]);
        assert!(library_view(&maps, "alice", ViewerRole::Player, RevealMode::All).is_empty());
    }

    #[test]
    fn test_non_library_zone_is_empty() {
        let maps = sample_table();
        let hand = maps.zone(&"alice-battlefield".into()).unwrap();
        let ids = revealed_library_card_ids(
            hand,
            &maps.cards,
            &"bob".into(),
            ViewerRole::Player,
            RevealMode::All,
            &DefaultReveal,
        );
        assert!(ids.is_empty());
    }

    #[test]
    fn test_predicate_reveals_are_top_first() {
        let mut maps = sample_table();
        mutators::reveal_card(&mut maps, &"c1".into(), false, &["bob".into()]);
        mutators::reveal_card(&mut maps, &"c2".into(), false, &["bob".into()]);

        assert_eq!(
            library_view(&maps, "bob", ViewerRole::Player, RevealMode::None),
            vec![CardId::new("c2"), CardId::new("c1")]
        );
        assert_eq!(
            library_view(&maps, "bob", ViewerRole::Player, RevealMode::All),
            vec![CardId::new("c3"), CardId::new("c2"), CardId::new("c1")]
        );
        // Targeted reveals do not reach spectators
        assert!(library_view(&maps, "eve", ViewerRole::Spectator, RevealMode::None).is_empty());
    }

    #[test]
    fn test_closure_predicate() {
        let maps = sample_table();
        let zone = maps.zone(&"alice-library".into()).unwrap();
        let only_c2 = |card: &Card, _: &PlayerId, _: ViewerRole| card.id.as_str() == "c2";
        let ids = revealed_library_card_ids(
            zone,
            &maps.cards,
            &"bob".into(),
            ViewerRole::Player,
            RevealMode::None,
            &only_c2,
        );
        assert_eq!(ids, vec![CardId::new("c2")]);
    }

    #[test]
    fn test_projection_hides_other_hands() {
        let mut maps = sample_table();
        mutators::move_card(&mut maps, &"c3".into(), &"alice-hand".into(), None);
        mutators::move_card(&mut maps, &"c2".into(), &"alice-hand".into(), None);

        let bob = project_for_viewer(&maps, &"bob".into(), ViewerRole::Player, RevealMode::None, &DefaultReveal);
        let hand = &bob.zones[&ZoneId::new("alice-hand")];
        assert_eq!(hand.card_count, 2);
        assert!(hand.visible_card_ids.is_empty());
        assert!(!bob.cards.contains_key(&CardId::new("c2")));
        assert!(bob.cards.contains_key(&CardId::new("b1")));

        let alice = project_for_viewer(&maps, &"alice".into(), ViewerRole::Player, RevealMode::None, &DefaultReveal);
        assert_eq!(alice.zones[&ZoneId::new("alice-hand")].visible_card_ids.len(), 2);
        assert!(alice.zones[&ZoneId::new("alice-library")].visible_card_ids.is_empty());
        assert!(!alice.cards.contains_key(&CardId::new("c1")));
    }

    #[test]
    fn test_face_down_card_masked_for_others() {
        let mut maps = sample_table();
        {
            let card = maps.cards.get_mut(&CardId::new("b1")).unwrap();
            card.face_down = true;
            card.power = Some("2".into());
            card.toughness = Some("2".into());
            card.tapped = true;
        }

        let bob = project_for_viewer(&maps, &"bob".into(), ViewerRole::Player, RevealMode::None, &DefaultReveal);
        assert!(bob.zones[&ZoneId::new("alice-battlefield")].visible_card_ids.contains(&CardId::new("b1")));
        let seen = &bob.cards[&CardId::new("b1")];
        assert!(seen.name.is_empty());
        assert_eq!(seen.power, None);
        assert_eq!(seen.toughness, None);
        assert!(seen.face_down && seen.tapped);

        let spectator = project_for_viewer(&maps, &"eve".into(), ViewerRole::Spectator, RevealMode::None, &DefaultReveal);
        assert!(spectator.cards[&CardId::new("b1")].name.is_empty());

        // The controller sees the face
        let alice = project_for_viewer(&maps, &"alice".into(), ViewerRole::Player, RevealMode::None, &DefaultReveal);
        assert_eq!(alice.cards[&CardId::new("b1")].name, "Card b1");

        // So does anyone it was revealed to
        maps.cards.get_mut(&CardId::new("b1")).unwrap().revealed_to.push("bob".into());
        let bob = project_for_viewer(&maps, &"bob".into(), ViewerRole::Player, RevealMode::None, &DefaultReveal);
        assert_eq!(bob.cards[&CardId::new("b1")].power.as_deref(), Some("2"));
    }

    #[test]
    fn test_projection_does_not_touch_maps() {
        let maps = sample_table();
        let before = maps.clone();
        let _ = project_for_viewer(&maps, &"eve".into(), ViewerRole::Spectator, RevealMode::All, &DefaultReveal);
        assert_eq!(maps, before);
    }
}
