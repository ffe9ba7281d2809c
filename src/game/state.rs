//! Table State Definitions
//!
//! All replicated state types for a shared tabletop session.
//! Uses BTreeMap for deterministic iteration order, so the canonical form
//! (and therefore the snapshot hash) is identical on every peer.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// IDENTIFIERS
// =============================================================================

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Wrap an existing identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Fresh random identifier (UUID v4).
            pub fn random() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// Borrow as str.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

opaque_id!(
    /// Unique player identifier, stable for the session.
    PlayerId
);
opaque_id!(
    /// Unique card identifier, stable for the session.
    CardId
);
opaque_id!(
    /// Unique zone identifier, stable for the session.
    ZoneId
);

// =============================================================================
// ZONES
// =============================================================================

/// Kind of zone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneType {
    /// Draw pile, hidden, ordered bottom to top.
    Library,
    /// Hidden from other players.
    Hand,
    /// Public play area.
    Battlefield,
    /// Public discard pile.
    Graveyard,
    /// Public removed-from-game pile.
    Exile,
    /// Commander zone.
    Command,
    /// Out-of-game cards.
    Sideboard,
}

impl ZoneType {
    /// Zones whose contents are hidden from non-owners.
    pub fn is_hidden(self) -> bool {
        matches!(self, ZoneType::Library | ZoneType::Hand)
    }
}

/// An ordered container of cards owned by one player.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    /// Zone id.
    pub id: ZoneId,
    /// Zone kind.
    #[serde(rename = "type")]
    pub zone_type: ZoneType,
    /// Owning player.
    pub owner_id: PlayerId,
    /// Card ids; for libraries, index 0 is the bottom.
    pub card_ids: Vec<CardId>,
}

impl Zone {
    /// Create an empty zone.
    pub fn new(id: impl Into<ZoneId>, zone_type: ZoneType, owner_id: impl Into<PlayerId>) -> Self {
        Self {
            id: id.into(),
            zone_type,
            owner_id: owner_id.into(),
            card_ids: Vec::new(),
        }
    }

    /// Does the zone hold this card?
    pub fn contains(&self, card_id: &CardId) -> bool {
        self.card_ids.contains(card_id)
    }

    /// Top card (last element).
    pub fn top(&self) -> Option<&CardId> {
        self.card_ids.last()
    }
}

// =============================================================================
// CARDS
// =============================================================================

/// Table position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Horizontal coordinate.
    pub x: f64,
    /// Vertical coordinate.
    pub y: f64,
}

impl Position {
    /// Create a position.
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// The printed face of a card that `transform` swaps in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardFace {
    /// Face name.
    pub name: String,
    /// Printed power.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<String>,
    /// Printed toughness.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toughness: Option<String>,
}

/// A card on the table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    /// Card id
    pub id: CardId,
    /// Owning player
    pub owner_id: PlayerId,
    /// Controlling player
    pub controller_id: PlayerId,
    /// Zone currently holding the card
    pub zone_id: ZoneId,
    /// Current face name
    pub name: String,
    /// Tapped (rotated sideways)
    #[serde(default)]
    pub tapped: bool,
    /// Face down
    #[serde(default)]
    pub face_down: bool,
    /// Position within the zone
    #[serde(default)]
    pub position: Position,
    /// Rotation in degrees
    #[serde(default)]
    pub rotation: i32,
    /// Counter kind -> count (never zero, never negative)
    #[serde(default)]
    pub counters: BTreeMap<String, u32>,

    // =========================================================================
    // Face state
    // =========================================================================

    /// Current power
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<String>,
    /// Current toughness
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toughness: Option<String>,
    /// Showing the back face of a double-faced card
    #[serde(default)]
    pub transformed: bool,

    // =========================================================================
    // Reveal state
    // =========================================================================

    /// Revealed to every viewer
    #[serde(default)]
    pub revealed_to_all: bool,
    /// Revealed to specific players
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revealed_to: Vec<PlayerId>,
}

impl Card {
    /// Create a card owned and controlled by `owner_id` in `zone_id`.
    pub fn new(
        id: impl Into<CardId>,
        owner_id: impl Into<PlayerId>,
        zone_id: impl Into<ZoneId>,
        name: impl Into<String>,
    ) -> Self {
        let owner_id = owner_id.into();
        Self {
            id: id.into(),
            controller_id: owner_id.clone(),
            owner_id,
            zone_id: zone_id.into(),
            name: name.into(),
            tapped: false,
            face_down: false,
            position: Position::default(),
            rotation: 0,
            counters: BTreeMap::new(),
            power: None,
            toughness: None,
            transformed: false,
            revealed_to_all: false,
            revealed_to: Vec::new(),
        }
    }

    /// Current face as a [`CardFace`].
    pub fn face(&self) -> CardFace {
        CardFace {
            name: self.name.clone(),
            power: self.power.clone(),
            toughness: self.toughness.clone(),
        }
    }
}

// =============================================================================
// PLAYERS
// =============================================================================

/// A seated player.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    /// Player id
    pub id: PlayerId,
    /// Display name
    pub name: String,
    /// Life total (may go negative)
    pub life: i32,
    /// Player counters (poison, energy, ...)
    #[serde(default)]
    pub counters: BTreeMap<String, i32>,
    /// Commander damage received, keyed by source player
    #[serde(default)]
    pub commander_damage: BTreeMap<PlayerId, u32>,
    /// Commander tax paid
    #[serde(default)]
    pub commander_tax: u32,
    /// Last shared cursor position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Position>,
}

/// Starting life total.
pub const DEFAULT_LIFE: i32 = 40;

impl Player {
    /// Create a player with default life.
    pub fn new(id: impl Into<PlayerId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            life: DEFAULT_LIFE,
            counters: BTreeMap::new(),
            commander_damage: BTreeMap::new(),
            commander_tax: 0,
            cursor: None,
        }
    }
}

// =============================================================================
// TABLE MAPS
// =============================================================================

/// The replicated maps: the authority for "what is true now".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMaps {
    /// Players by id.
    pub players: BTreeMap<PlayerId, Player>,
    /// Zones by id.
    pub zones: BTreeMap<ZoneId, Zone>,
    /// Cards by id.
    pub cards: BTreeMap<CardId, Card>,
    /// Table-wide counters (turn, storm, ...).
    pub global_counters: BTreeMap<String, i64>,
}

/// A zone-membership invariant violation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsistencyError {
    /// A card's `zone_id` names a zone that does not exist.
    MissingZone {
        /// Card.
        card_id: CardId,
        /// Referenced zone.
        zone_id: ZoneId,
    },
    /// A card's zone does not list it.
    NotInZone {
        /// Card.
        card_id: CardId,
        /// Referenced zone.
        zone_id: ZoneId,
    },
    /// A card id is listed more than once across all zones.
    Duplicated {
        /// Card.
        card_id: CardId,
    },
    /// A zone lists a card that has no record, or whose record points elsewhere.
    Dangling {
        /// Zone.
        zone_id: ZoneId,
        /// Card.
        card_id: CardId,
    },
}

impl TableMaps {
    /// Create empty maps.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a zone (replacing any zone with the same id).
    pub fn insert_zone(&mut self, zone: Zone) {
        self.zones.insert(zone.id.clone(), zone);
    }

    /// Add a card to the top of its zone. Used for table setup.
    pub fn insert_card(&mut self, card: Card) {
        if let Some(zone) = self.zones.get_mut(&card.zone_id) {
            if !zone.contains(&card.id) {
                zone.card_ids.push(card.id.clone());
            }
        }
        self.cards.insert(card.id.clone(), card);
    }

    /// Get a card.
    pub fn card(&self, id: &CardId) -> Option<&Card> {
        self.cards.get(id)
    }

    /// Get a zone.
    pub fn zone(&self, id: &ZoneId) -> Option<&Zone> {
        self.zones.get(id)
    }

    /// Get a player.
    pub fn player(&self, id: &PlayerId) -> Option<&Player> {
        self.players.get(id)
    }

    /// Zones owned by a player, in id order.
    pub fn zones_of(&self, owner: &PlayerId) -> impl Iterator<Item = &Zone> {
        let owner = owner.clone();
        self.zones.values().filter(move |z| z.owner_id == owner)
    }

    /// First zone of the given type owned by `owner`.
    pub fn find_zone(&self, owner: &PlayerId, zone_type: ZoneType) -> Option<&Zone> {
        self.zones
            .values()
            .find(|z| &z.owner_id == owner && z.zone_type == zone_type)
    }

    /// Check the zone-membership invariant: every card sits in exactly one
    /// zone sequence, and that zone is the one its record names.
    pub fn check_consistency(&self) -> Result<(), ConsistencyError> {
        // Count memberships across every zone before judging any one of them
        let mut memberships: BTreeMap<&CardId, usize> = BTreeMap::new();
        for card_id in self.zones.values().flat_map(|zone| &zone.card_ids) {
            *memberships.entry(card_id).or_insert(0) += 1;
        }
        if let Some((card_id, _)) = memberships.iter().find(|(_, count)| **count > 1) {
            return Err(ConsistencyError::Duplicated {
                card_id: (*card_id).clone(),
            });
        }

        for zone in self.zones.values() {
            for card_id in &zone.card_ids {
                match self.cards.get(card_id) {
                    Some(card) if card.zone_id == zone.id => {}
                    _ => {
                        return Err(ConsistencyError::Dangling {
                            zone_id: zone.id.clone(),
                            card_id: card_id.clone(),
                        })
                    }
                }
            }
        }

        for card in self.cards.values() {
            if !self.zones.contains_key(&card.zone_id) {
                return Err(ConsistencyError::MissingZone {
                    card_id: card.id.clone(),
                    zone_id: card.zone_id.clone(),
                });
            }
            if !memberships.contains_key(&card.id) {
                return Err(ConsistencyError::NotInZone {
                    card_id: card.id.clone(),
                    zone_id: card.zone_id.clone(),
                });
            }
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Two players, each with a library, hand and battlefield.
    /// Alice's library holds c1, c2, c3 (bottom to top); her battlefield holds b1, b2.
    pub(crate) fn sample_table() -> TableMaps {
        let mut maps = TableMaps::new();
        for (pid, name) in [("alice", "Alice"), ("bob", "Bob")] {
            maps.players.insert(PlayerId::new(pid), Player::new(pid, name));
            maps.insert_zone(Zone::new(format!("{pid}-library"), ZoneType::Library, pid));
            maps.insert_zone(Zone::new(format!("{pid}-hand"), ZoneType::Hand, pid));
            maps.insert_zone(Zone::new(format!("{pid}-battlefield"), ZoneType::Battlefield, pid));
            maps.insert_zone(Zone::new(format!("{pid}-graveyard"), ZoneType::Graveyard, pid));
        }
        for id in ["c1", "c2", "c3"] {
            maps.insert_card(Card::new(id, "alice", "alice-library", format!("Card {id}")));
        }
        for id in ["b1", "b2"] {
            maps.insert_card(Card::new(id, "alice", "alice-battlefield", format!("Card {id}")));
        }
        maps.insert_card(Card::new("x1", "bob", "bob-battlefield", "Bob's card"));
        maps
    }

    #[test]
    fn test_sample_table_is_consistent() {
        let maps = sample_table();
        assert_eq!(maps.check_consistency(), Ok(()));
        assert_eq!(
            maps.zone(&"alice-library".into()).unwrap().top(),
            Some(&CardId::new("c3"))
        );
    }

    #[test]
    fn test_detects_duplicate_membership() {
        let mut maps = sample_table();
        maps.zones
            .get_mut(&ZoneId::new("alice-graveyard"))
            .unwrap()
            .card_ids
            .push(CardId::new("c1"));
        assert_eq!(
            maps.check_consistency(),
            Err(ConsistencyError::Duplicated { card_id: "c1".into() })
        );
    }

    #[test]
    fn test_duplicate_wins_over_zone_order() {
        // Stray copy in a zone sorting after the card's real zone
        let mut maps = sample_table();
        maps.insert_card(Card::new("g1", "alice", "alice-graveyard", "Grave"));
        maps.zones
            .get_mut(&ZoneId::new("alice-library"))
            .unwrap()
            .card_ids
            .push(CardId::new("g1"));
        assert_eq!(
            maps.check_consistency(),
            Err(ConsistencyError::Duplicated { card_id: "g1".into() })
        );
    }

    #[test]
    fn test_detects_dangling_reference() {
        let mut maps = sample_table();
        maps.cards.remove(&CardId::new("b1"));
        assert!(matches!(
            maps.check_consistency(),
            Err(ConsistencyError::Dangling { .. })
        ));
    }

    #[test]
    fn test_detects_orphaned_card() {
        let mut maps = sample_table();
        maps.zones
            .get_mut(&ZoneId::new("alice-battlefield"))
            .unwrap()
            .card_ids
            .retain(|id| id.as_str() != "b2");
        assert_eq!(
            maps.check_consistency(),
            Err(ConsistencyError::NotInZone {
                card_id: "b2".into(),
                zone_id: "alice-battlefield".into()
            })
        );
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let maps = sample_table();
        let json = serde_json::to_value(&maps).unwrap();
        assert!(json.get("globalCounters").is_some());
        let zone = &json["zones"]["alice-library"];
        assert_eq!(zone["type"], "library");
        assert_eq!(zone["cardIds"][2], "c3");
        let card = &json["cards"]["c1"];
        assert_eq!(card["zoneId"], "alice-library");
        assert!(card.get("power").is_none());
    }

    #[test]
    fn test_roundtrip_preserves_state() {
        let maps = sample_table();
        let json = serde_json::to_string(&maps).unwrap();
        let back: TableMaps = serde_json::from_str(&json).unwrap();
        assert_eq!(back, maps);
    }

    #[test]
    fn test_hidden_zone_types() {
        assert!(ZoneType::Library.is_hidden());
        assert!(ZoneType::Hand.is_hidden());
        assert!(!ZoneType::Battlefield.is_hidden());
    }
}
