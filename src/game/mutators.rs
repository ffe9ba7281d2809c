//! Shared-Document Mutators
//!
//! The closed set of operators applied to the replicated maps during command
//! replay. Every operator:
//! - is deterministic (same maps + same arguments = same result),
//! - tolerates re-application (replaying an envelope twice changes nothing
//!   the second time),
//! - keeps zone membership consistent: `card.zone_id` and exactly one zone
//!   sequence agree after it returns.
//!
//! Operators return `true` when they found their target, `false` when they
//! were a no-op because the target does not exist.

use serde::{Deserialize, Serialize};

use crate::game::state::{
    Card, CardFace, CardId, Player, PlayerId, Position, TableMaps, Zone, ZoneId, ZoneType,
};

// =============================================================================
// PATCH TYPES
// =============================================================================

/// Partial card update. Zone membership is deliberately absent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardPatch {
    /// New name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// New controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_id: Option<PlayerId>,
    /// Tapped state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tapped: Option<bool>,
    /// Face-down state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face_down: Option<bool>,
    /// Position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Rotation in degrees
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<i32>,
    /// Power
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<String>,
    /// Toughness
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toughness: Option<String>,
}

/// Partial player update.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerPatch {
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Player counters to set; a value of zero removes the counter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counters: Option<std::collections::BTreeMap<String, i32>>,
    /// Cursor position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Position>,
}

// =============================================================================
// ZONE MEMBERSHIP
// =============================================================================

/// Remove every occurrence of `card_id` from every zone sequence.
///
/// Scanning all zones (rather than trusting `card.zone_id`) repairs stray
/// references left by concurrent writers.
fn detach(maps: &mut TableMaps, card_id: &CardId) {
    for zone in maps.zones.values_mut() {
        zone.card_ids.retain(|id| id != card_id);
    }
}

/// Move a card to `target_zone_id`, placing it on top.
///
/// Moving a card to the zone it already occupies never duplicates it.
pub fn move_card(
    maps: &mut TableMaps,
    card_id: &CardId,
    target_zone_id: &ZoneId,
    position: Option<Position>,
) -> bool {
    move_card_to_index(maps, card_id, target_zone_id, position, None)
}

/// Move a card to `target_zone_id` at `index` (clamped; `None` = top).
pub fn move_card_to_index(
    maps: &mut TableMaps,
    card_id: &CardId,
    target_zone_id: &ZoneId,
    position: Option<Position>,
    index: Option<usize>,
) -> bool {
    // Single read of everything the move depends on.
    let Some(target_type) = maps.zones.get(target_zone_id).map(|z| z.zone_type) else {
        return false;
    };
    let Some(source_type) = maps
        .cards
        .get(card_id)
        .map(|c| maps.zones.get(&c.zone_id).map(|z| z.zone_type))
    else {
        return false;
    };

    detach(maps, card_id);
    if let Some(zone) = maps.zones.get_mut(target_zone_id) {
        let at = index.unwrap_or(zone.card_ids.len()).min(zone.card_ids.len());
        zone.card_ids.insert(at, card_id.clone());
    }

    if let Some(card) = maps.cards.get_mut(card_id) {
        card.zone_id = target_zone_id.clone();
        if let Some(position) = position {
            card.position = position;
        }
        // Cards leaving one kind of zone for another shed table state.
        if source_type != Some(target_type) {
            card.tapped = false;
            card.counters.clear();
            if target_type.is_hidden() {
                card.face_down = false;
                card.revealed_to_all = false;
                card.revealed_to.clear();
            }
        }
    }
    true
}

/// Replace a zone's order. `order` must be a permutation of the current ids.
pub fn reorder_zone(maps: &mut TableMaps, zone_id: &ZoneId, order: &[CardId]) -> bool {
    let Some(zone) = maps.zones.get_mut(zone_id) else {
        return false;
    };
    let mut current = zone.card_ids.clone();
    let mut proposed = order.to_vec();
    current.sort();
    proposed.sort();
    if current != proposed {
        return false;
    }
    zone.card_ids = order.to_vec();
    true
}

/// Add a zone. Existing zones are left untouched; the new zone starts empty.
pub fn add_zone(maps: &mut TableMaps, zone: &Zone) -> bool {
    if maps.zones.contains_key(&zone.id) {
        return false;
    }
    let mut zone = zone.clone();
    zone.card_ids.clear();
    maps.zones.insert(zone.id.clone(), zone);
    true
}

// =============================================================================
// CARD RECORDS
// =============================================================================

/// Merge a partial update into a card record.
pub fn patch_card(maps: &mut TableMaps, card_id: &CardId, patch: &CardPatch) -> bool {
    let Some(card) = maps.cards.get_mut(card_id) else {
        return false;
    };
    if let Some(name) = &patch.name {
        card.name = name.clone();
    }
    if let Some(controller_id) = &patch.controller_id {
        card.controller_id = controller_id.clone();
    }
    if let Some(tapped) = patch.tapped {
        card.tapped = tapped;
    }
    if let Some(face_down) = patch.face_down {
        card.face_down = face_down;
    }
    if let Some(position) = patch.position {
        card.position = position;
    }
    if let Some(rotation) = patch.rotation {
        card.rotation = rotation;
    }
    if let Some(power) = &patch.power {
        card.power = Some(power.clone());
    }
    if let Some(toughness) = &patch.toughness {
        card.toughness = Some(toughness.clone());
    }
    true
}

/// Set a card's tapped state.
pub fn tap_card(maps: &mut TableMaps, card_id: &CardId, tapped: bool) -> bool {
    match maps.cards.get_mut(card_id) {
        Some(card) => {
            card.tapped = tapped;
            true
        }
        None => false,
    }
}

/// Untap every tapped card controlled by `controller_id`. Returns how many changed.
pub fn untap_all(maps: &mut TableMaps, controller_id: &PlayerId) -> usize {
    let mut changed = 0;
    for card in maps.cards.values_mut() {
        if &card.controller_id == controller_id && card.tapped {
            card.tapped = false;
            changed += 1;
        }
    }
    changed
}

/// Add `amount` counters of `kind`.
pub fn add_counter_to_card(maps: &mut TableMaps, card_id: &CardId, kind: &str, amount: u32) -> bool {
    let Some(card) = maps.cards.get_mut(card_id) else {
        return false;
    };
    if amount > 0 {
        let count = card.counters.entry(kind.to_string()).or_insert(0);
        *count = count.saturating_add(amount);
    }
    true
}

/// Remove up to `amount` counters of `kind`. Reaching zero drops the entry.
pub fn remove_counter_from_card(
    maps: &mut TableMaps,
    card_id: &CardId,
    kind: &str,
    amount: u32,
) -> bool {
    let Some(card) = maps.cards.get_mut(card_id) else {
        return false;
    };
    if let Some(count) = card.counters.get_mut(kind) {
        *count = count.saturating_sub(amount);
        if *count == 0 {
            card.counters.remove(kind);
        }
    }
    true
}

/// Clone a card under `new_id`, directly above the source in the same zone.
///
/// The new id is chosen by the command author, so replaying the duplicate
/// finds the copy already present and does nothing.
pub fn duplicate_card(maps: &mut TableMaps, source_id: &CardId, new_id: &CardId) -> bool {
    if maps.cards.contains_key(new_id) {
        return false;
    }
    let Some(source) = maps.cards.get(source_id) else {
        return false;
    };
    let mut copy = source.clone();
    copy.id = new_id.clone();

    let Some(zone) = maps.zones.get_mut(&copy.zone_id) else {
        return false;
    };
    let at = zone
        .card_ids
        .iter()
        .position(|id| id == source_id)
        .map(|i| i + 1)
        .unwrap_or(zone.card_ids.len());
    zone.card_ids.insert(at, new_id.clone());
    maps.cards.insert(new_id.clone(), copy);
    true
}

/// Delete a card and every zone reference to it.
pub fn remove_card(maps: &mut TableMaps, card_id: &CardId) -> bool {
    let existed = maps.cards.remove(card_id).is_some();
    detach(maps, card_id);
    existed
}

/// Swap in a different face, keeping id, zone and position.
pub fn transform_card(
    maps: &mut TableMaps,
    card_id: &CardId,
    face: &CardFace,
    transformed: bool,
) -> bool {
    let Some(card) = maps.cards.get_mut(card_id) else {
        return false;
    };
    card.name = face.name.clone();
    card.power = face.power.clone();
    card.toughness = face.toughness.clone();
    card.transformed = transformed;
    true
}

/// Reveal a card to everyone or to specific players.
pub fn reveal_card(
    maps: &mut TableMaps,
    card_id: &CardId,
    to_all: bool,
    to_players: &[PlayerId],
) -> bool {
    let Some(card) = maps.cards.get_mut(card_id) else {
        return false;
    };
    card.revealed_to_all = to_all;
    for player in to_players {
        if !card.revealed_to.contains(player) {
            card.revealed_to.push(player.clone());
        }
    }
    card.revealed_to.sort();
    true
}

/// Insert a full card record, or overwrite an existing one.
///
/// Membership follows the record's `zone_id`; a record naming an unknown
/// zone is rejected so no card is left without a zone.
pub fn upsert_card(maps: &mut TableMaps, card: &Card) -> bool {
    let Some(zone) = maps.zones.get(&card.zone_id) else {
        return false;
    };
    let already_placed = zone.contains(&card.id)
        && maps
            .zones
            .values()
            .filter(|z| z.contains(&card.id))
            .count()
            == 1
        && zone.card_ids.iter().filter(|id| *id == &card.id).count() == 1;

    if !already_placed {
        detach(maps, &card.id);
        if let Some(zone) = maps.zones.get_mut(&card.zone_id) {
            zone.card_ids.push(card.id.clone());
        }
    }
    maps.cards.insert(card.id.clone(), card.clone());
    true
}

// =============================================================================
// PLAYERS & GLOBALS
// =============================================================================

/// Insert a player, or overwrite the record of an existing one.
pub fn upsert_player(maps: &mut TableMaps, player: &Player) -> bool {
    maps.players.insert(player.id.clone(), player.clone());
    true
}

/// Merge a partial update into a player record.
pub fn patch_player(maps: &mut TableMaps, player_id: &PlayerId, patch: &PlayerPatch) -> bool {
    let Some(player) = maps.players.get_mut(player_id) else {
        return false;
    };
    if let Some(name) = &patch.name {
        player.name = name.clone();
    }
    if let Some(counters) = &patch.counters {
        for (kind, value) in counters {
            if *value == 0 {
                player.counters.remove(kind);
            } else {
                player.counters.insert(kind.clone(), *value);
            }
        }
    }
    if let Some(cursor) = patch.cursor {
        player.cursor = Some(cursor);
    }
    true
}

/// Set a player's life total.
pub fn set_life(maps: &mut TableMaps, player_id: &PlayerId, life: i32) -> bool {
    match maps.players.get_mut(player_id) {
        Some(player) => {
            player.life = life;
            true
        }
        None => false,
    }
}

/// Set commander damage dealt to `player_id` by `source_id`'s commander.
pub fn set_commander_damage(
    maps: &mut TableMaps,
    player_id: &PlayerId,
    source_id: &PlayerId,
    amount: u32,
) -> bool {
    let Some(player) = maps.players.get_mut(player_id) else {
        return false;
    };
    if amount == 0 {
        player.commander_damage.remove(source_id);
    } else {
        player.commander_damage.insert(source_id.clone(), amount);
    }
    true
}

/// Set a player's commander tax.
pub fn set_commander_tax(maps: &mut TableMaps, player_id: &PlayerId, tax: u32) -> bool {
    match maps.players.get_mut(player_id) {
        Some(player) => {
            player.commander_tax = tax;
            true
        }
        None => false,
    }
}

/// Set a table-wide counter.
pub fn set_global_counter(maps: &mut TableMaps, key: &str, value: i64) -> bool {
    maps.global_counters.insert(key.to_string(), value);
    true
}

/// Remove a player together with their zones and every card they own or
/// that sits in one of their zones.
pub fn remove_player(maps: &mut TableMaps, player_id: &PlayerId) -> bool {
    let existed = maps.players.remove(player_id).is_some();

    let owned_zones: Vec<ZoneId> = maps.zones_of(player_id).map(|z| z.id.clone()).collect();
    let doomed: Vec<CardId> = maps
        .cards
        .values()
        .filter(|c| &c.owner_id == player_id || owned_zones.contains(&c.zone_id))
        .map(|c| c.id.clone())
        .collect();

    for card_id in &doomed {
        remove_card(maps, card_id);
    }
    for zone_id in &owned_zones {
        maps.zones.remove(zone_id);
    }
    for player in maps.players.values_mut() {
        player.commander_damage.remove(player_id);
    }
    existed || !owned_zones.is_empty()
}

/// Library zone of a player, if any.
pub fn library_of<'a>(maps: &'a TableMaps, player_id: &PlayerId) -> Option<&'a Zone> {
    maps.find_zone(player_id, ZoneType::Library)
}

// =============================================================================
// TESTS
// =============================================================================
