//! Command Set
//!
//! The closed, versioned set of player intents carried by the command log.
//! Each command has a stable wire name (`card.move`, `card.untapAll`, ...)
//! and a public payload; replay maps it onto exactly one mutator.
//!
//! Payloads are produced by a [`CommandBuilder`] at append time, against the
//! latest local state, so commands like "draw" resolve to the card that is
//! actually on top when the command is signed.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::game::mutators::{self, CardPatch, PlayerPatch};
use crate::game::state::{
    Card, CardFace, CardId, Player, PlayerId, Position, TableMaps, Zone, ZoneId, ZoneType,
};

/// Command set version, bumped whenever a payload shape changes.
pub const COMMAND_SET_VERSION: u32 = 1;

/// Errors building or decoding commands.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// Type is not part of the command set.
    #[error("unknown command type: {0}")]
    UnknownType(String),
    /// Payload does not match the type's shape.
    #[error("invalid payload for {command_type}: {reason}")]
    InvalidPayload {
        /// Command type.
        command_type: String,
        /// Decode failure.
        reason: String,
    },
    /// Builder referenced a card that does not exist.
    #[error("unknown card: {0}")]
    UnknownCard(CardId),
    /// Builder referenced a zone that does not exist.
    #[error("unknown zone: {0}")]
    UnknownZone(ZoneId),
    /// Builder needed a card from an empty zone.
    #[error("zone is empty: {0}")]
    EmptyZone(ZoneId),
}

// =============================================================================
// COMMANDS
// =============================================================================

/// A player intent. Serialized as `{"type": <wire name>, "payload": {...}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Command {
    /// Move a card to a zone (top by default).
    #[serde(rename = "card.move", rename_all = "camelCase")]
    MoveCard {
        /// Card to move.
        card_id: CardId,
        /// Destination zone.
        zone_id: ZoneId,
        /// New position.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<Position>,
        /// Insert index (bottom = 0).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
    },
    /// Patch a card record.
    #[serde(rename = "card.patch", rename_all = "camelCase")]
    PatchCard {
        /// Card to patch.
        card_id: CardId,
        /// Fields to change.
        patch: CardPatch,
    },
    /// Tap or untap a card.
    #[serde(rename = "card.tap", rename_all = "camelCase")]
    TapCard {
        /// Card.
        card_id: CardId,
        /// Target state.
        tapped: bool,
    },
    /// Untap every card a player controls.
    #[serde(rename = "card.untapAll", rename_all = "camelCase")]
    UntapAll {
        /// Controller.
        player_id: PlayerId,
    },
    /// Add counters to a card.
    #[serde(rename = "card.addCounter", rename_all = "camelCase")]
    AddCounter {
        /// Card.
        card_id: CardId,
        /// Counter kind.
        kind: String,
        /// How many.
        amount: u32,
    },
    /// Remove counters from a card.
    #[serde(rename = "card.removeCounter", rename_all = "camelCase")]
    RemoveCounter {
        /// Card.
        card_id: CardId,
        /// Counter kind.
        kind: String,
        /// How many.
        amount: u32,
    },
    /// Copy a card under an id chosen by the author.
    #[serde(rename = "card.duplicate", rename_all = "camelCase")]
    DuplicateCard {
        /// Source card.
        card_id: CardId,
        /// Id of the copy.
        new_card_id: CardId,
    },
    /// Delete a card.
    #[serde(rename = "card.remove", rename_all = "camelCase")]
    RemoveCard {
        /// Card.
        card_id: CardId,
    },
    /// Flip a double-faced card.
    #[serde(rename = "card.transform", rename_all = "camelCase")]
    TransformCard {
        /// Card.
        card_id: CardId,
        /// Face to show.
        face: CardFace,
        /// Whether the face shown is the back face.
        transformed: bool,
    },
    /// Insert or overwrite a full card record.
    #[serde(rename = "card.upsert", rename_all = "camelCase")]
    UpsertCard {
        /// Record.
        card: Card,
    },
    /// Reveal a card.
    #[serde(rename = "card.reveal", rename_all = "camelCase")]
    RevealCard {
        /// Card.
        card_id: CardId,
        /// Reveal to every viewer.
        to_all: bool,
        /// Reveal to these players.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        to_players: Vec<PlayerId>,
    },
    /// Create a zone.
    #[serde(rename = "zone.add", rename_all = "camelCase")]
    AddZone {
        /// Zone (cards are ignored).
        zone: Zone,
    },
    /// Reorder a zone.
    #[serde(rename = "zone.reorder", rename_all = "camelCase")]
    ReorderZone {
        /// Zone.
        zone_id: ZoneId,
        /// New order, bottom first.
        order: Vec<CardId>,
    },
    /// Shuffle result for a zone.
    #[serde(rename = "zone.shuffle", rename_all = "camelCase")]
    ShuffleZone {
        /// Zone.
        zone_id: ZoneId,
        /// Shuffled order, bottom first.
        order: Vec<CardId>,
    },
    /// Seat a player.
    #[serde(rename = "player.join", rename_all = "camelCase")]
    JoinPlayer {
        /// Player record.
        player: Player,
    },
    /// Patch a player record.
    #[serde(rename = "player.patch", rename_all = "camelCase")]
    PatchPlayer {
        /// Player.
        player_id: PlayerId,
        /// Fields to change.
        patch: PlayerPatch,
    },
    /// Set a life total.
    #[serde(rename = "player.life", rename_all = "camelCase")]
    SetLife {
        /// Player.
        player_id: PlayerId,
        /// New total.
        life: i32,
    },
    /// Set commander damage.
    #[serde(rename = "player.commanderDamage", rename_all = "camelCase")]
    SetCommanderDamage {
        /// Damaged player.
        player_id: PlayerId,
        /// Commander's owner.
        source_id: PlayerId,
        /// Total damage.
        amount: u32,
    },
    /// Set commander tax.
    #[serde(rename = "player.commanderTax", rename_all = "camelCase")]
    SetCommanderTax {
        /// Player.
        player_id: PlayerId,
        /// Tax.
        tax: u32,
    },
    /// Remove a player and everything they own.
    #[serde(rename = "player.leave", rename_all = "camelCase")]
    LeavePlayer {
        /// Player.
        player_id: PlayerId,
    },
    /// Set a table-wide counter.
    #[serde(rename = "counter.global", rename_all = "camelCase")]
    SetGlobalCounter {
        /// Counter name.
        key: String,
        /// Value.
        value: i64,
    },
}

/// Every wire name, in declaration order.
pub const COMMAND_TYPES: &[&str] = &[
    "card.move",
    "card.patch",
    "card.tap",
    "card.untapAll",
    "card.addCounter",
    "card.removeCounter",
    "card.duplicate",
    "card.remove",
    "card.transform",
    "card.upsert",
    "card.reveal",
    "zone.add",
    "zone.reorder",
    "zone.shuffle",
    "player.join",
    "player.patch",
    "player.life",
    "player.commanderDamage",
    "player.commanderTax",
    "player.leave",
    "counter.global",
];

impl Command {
    /// Wire name of this command.
    pub fn command_type(&self) -> &'static str {
        match self {
            Command::MoveCard { .. } => "card.move",
            Command::PatchCard { .. } => "card.patch",
            Command::TapCard { .. } => "card.tap",
            Command::UntapAll { .. } => "card.untapAll",
            Command::AddCounter { .. } => "card.addCounter",
            Command::RemoveCounter { .. } => "card.removeCounter",
            Command::DuplicateCard { .. } => "card.duplicate",
            Command::RemoveCard { .. } => "card.remove",
            Command::TransformCard { .. } => "card.transform",
            Command::UpsertCard { .. } => "card.upsert",
            Command::RevealCard { .. } => "card.reveal",
            Command::AddZone { .. } => "zone.add",
            Command::ReorderZone { .. } => "zone.reorder",
            Command::ShuffleZone { .. } => "zone.shuffle",
            Command::JoinPlayer { .. } => "player.join",
            Command::PatchPlayer { .. } => "player.patch",
            Command::SetLife { .. } => "player.life",
            Command::SetCommanderDamage { .. } => "player.commanderDamage",
            Command::SetCommanderTax { .. } => "player.commanderTax",
            Command::LeavePlayer { .. } => "player.leave",
            Command::SetGlobalCounter { .. } => "counter.global",
        }
    }

    /// Split into wire name and public payload.
    pub fn to_parts(&self) -> Result<(String, Value), CommandError> {
        let invalid = |reason: String| CommandError::InvalidPayload {
            command_type: self.command_type().to_string(),
            reason,
        };
        let mut tagged = serde_json::to_value(self).map_err(|e| invalid(e.to_string()))?;
        let payload = tagged
            .get_mut("payload")
            .map(Value::take)
            .ok_or_else(|| invalid("missing payload".into()))?;
        Ok((self.command_type().to_string(), payload))
    }

    /// Rebuild from wire name and public payload.
    pub fn from_parts(command_type: &str, payload: &Value) -> Result<Self, CommandError> {
        if !COMMAND_TYPES.contains(&command_type) {
            return Err(CommandError::UnknownType(command_type.to_string()));
        }
        let tagged = serde_json::json!({ "type": command_type, "payload": payload });
        serde_json::from_value(tagged).map_err(|e| CommandError::InvalidPayload {
            command_type: command_type.to_string(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// REPLAY
// =============================================================================

/// Apply a command to the replicated maps. Returns false when it was a no-op.
pub fn apply_command(maps: &mut TableMaps, command: &Command) -> bool {
    match command {
        Command::MoveCard { card_id, zone_id, position, index } => {
            mutators::move_card_to_index(maps, card_id, zone_id, *position, *index)
        }
        Command::PatchCard { card_id, patch } => mutators::patch_card(maps, card_id, patch),
        Command::TapCard { card_id, tapped } => mutators::tap_card(maps, card_id, *tapped),
        Command::UntapAll { player_id } => mutators::untap_all(maps, player_id) > 0,
        Command::AddCounter { card_id, kind, amount } => {
            mutators::add_counter_to_card(maps, card_id, kind, *amount)
        }
        Command::RemoveCounter { card_id, kind, amount } => {
            mutators::remove_counter_from_card(maps, card_id, kind, *amount)
        }
        Command::DuplicateCard { card_id, new_card_id } => {
            mutators::duplicate_card(maps, card_id, new_card_id)
        }
        Command::RemoveCard { card_id } => mutators::remove_card(maps, card_id),
        Command::TransformCard { card_id, face, transformed } => {
            mutators::transform_card(maps, card_id, face, *transformed)
        }
        Command::UpsertCard { card } => mutators::upsert_card(maps, card),
        Command::RevealCard { card_id, to_all, to_players } => {
            mutators::reveal_card(maps, card_id, *to_all, to_players)
        }
        Command::AddZone { zone } => mutators::add_zone(maps, zone),
        Command::ReorderZone { zone_id, order } | Command::ShuffleZone { zone_id, order } => {
            mutators::reorder_zone(maps, zone_id, order)
        }
        Command::JoinPlayer { player } => mutators::upsert_player(maps, player),
        Command::PatchPlayer { player_id, patch } => mutators::patch_player(maps, player_id, patch),
        Command::SetLife { player_id, life } => mutators::set_life(maps, player_id, *life),
        Command::SetCommanderDamage { player_id, source_id, amount } => {
            mutators::set_commander_damage(maps, player_id, source_id, *amount)
        }
        Command::SetCommanderTax { player_id, tax } => {
            mutators::set_commander_tax(maps, player_id, *tax)
        }
        Command::LeavePlayer { player_id } => mutators::remove_player(maps, player_id),
        Command::SetGlobalCounter { key, value } => mutators::set_global_counter(maps, key, *value),
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

/// Payloads produced at append time.
#[derive(Clone, Debug, PartialEq)]
pub struct BuiltPayloads {
    /// The command (its payload becomes `payloadPublic`).
    pub command: Command,
    /// Optional unsigned private payload.
    pub payload_private: Option<Value>,
}

impl From<Command> for BuiltPayloads {
    fn from(command: Command) -> Self {
        Self {
            command,
            payload_private: None,
        }
    }
}

/// Produces a command from a read-only view of the latest local state.
pub trait CommandBuilder {
    /// Wire name of the command this builder produces.
    fn command_type(&self) -> &'static str;

    /// Build the payloads. Called exactly once, immediately before signing.
    fn build(&self, state: &TableMaps) -> Result<BuiltPayloads, CommandError>;
}

/// Builder for commands whose payload does not depend on state.
#[derive(Clone, Debug, PartialEq)]
pub struct StaticCommand(pub Command);

impl CommandBuilder for StaticCommand {
    fn command_type(&self) -> &'static str {
        self.0.command_type()
    }

    fn build(&self, _state: &TableMaps) -> Result<BuiltPayloads, CommandError> {
        Ok(self.0.clone().into())
    }
}

/// Duplicate a card, allocating the copy's id at build time.
#[derive(Clone, Debug)]
pub struct DuplicateCardBuilder {
    /// Source card.
    pub card_id: CardId,
}

impl CommandBuilder for DuplicateCardBuilder {
    fn command_type(&self) -> &'static str {
        "card.duplicate"
    }

    fn build(&self, state: &TableMaps) -> Result<BuiltPayloads, CommandError> {
        if state.card(&self.card_id).is_none() {
            return Err(CommandError::UnknownCard(self.card_id.clone()));
        }
        Ok(Command::DuplicateCard {
            card_id: self.card_id.clone(),
            new_card_id: CardId::random(),
        }
        .into())
    }
}

/// Shuffle a zone; the resulting order is fixed at build time.
#[derive(Clone, Debug)]
pub struct ShuffleZoneBuilder {
    /// Zone to shuffle.
    pub zone_id: ZoneId,
}

impl CommandBuilder for ShuffleZoneBuilder {
    fn command_type(&self) -> &'static str {
        "zone.shuffle"
    }

    fn build(&self, state: &TableMaps) -> Result<BuiltPayloads, CommandError> {
        let zone = state
            .zone(&self.zone_id)
            .ok_or_else(|| CommandError::UnknownZone(self.zone_id.clone()))?;
        let mut order = zone.card_ids.clone();
        order.shuffle(&mut rand::thread_rng());
        Ok(Command::ShuffleZone {
            zone_id: self.zone_id.clone(),
            order,
        }
        .into())
    }
}

/// Draw the top card of a player's library into their hand.
#[derive(Clone, Debug)]
pub struct DrawCardBuilder {
    /// Drawing player.
    pub player_id: PlayerId,
}

impl CommandBuilder for DrawCardBuilder {
    fn command_type(&self) -> &'static str {
        "card.move"
    }

    fn build(&self, state: &TableMaps) -> Result<BuiltPayloads, CommandError> {
        let library = state
            .find_zone(&self.player_id, ZoneType::Library)
            .ok_or_else(|| CommandError::UnknownZone(ZoneId::new(format!("{}:library", self.player_id))))?;
        let hand = state
            .find_zone(&self.player_id, ZoneType::Hand)
            .ok_or_else(|| CommandError::UnknownZone(ZoneId::new(format!("{}:hand", self.player_id))))?;
        let top = library
            .top()
            .ok_or_else(|| CommandError::EmptyZone(library.id.clone()))?;

        Ok(Command::MoveCard {
            card_id: top.clone(),
            zone_id: hand.id.clone(),
            position: None,
            index: None,
        }
        .into())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::tests::sample_table;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let command = Command::UntapAll { player_id: "alice".into() };
        let (command_type, payload) = command.to_parts().unwrap();
        assert_eq!(command_type, "card.untapAll");
        assert_eq!(payload, json!({ "playerId": "alice" }));
    }

    #[test]
    fn test_optional_fields_are_absent() {
        let command = Command::MoveCard {
            card_id: "c1".into(),
            zone_id: "alice-hand".into(),
            position: None,
            index: None,
        };
        let (_, payload) = command.to_parts().unwrap();
        assert_eq!(payload, json!({ "cardId": "c1", "zoneId": "alice-hand" }));
    }

    #[test]
    fn test_parts_roundtrip_for_every_shape() {
        let commands = vec![
            Command::MoveCard {
                card_id: "c1".into(),
                zone_id: "z".into(),
                position: Some(Position::new(1.5, -2.0)),
                index: Some(0),
            },
            Command::PatchCard {
                card_id: "c1".into(),
                patch: CardPatch { tapped: Some(true), ..Default::default() },
            },
            Command::TransformCard {
                card_id: "c1".into(),
                face: CardFace { name: "Back".into(), power: None, toughness: None },
                transformed: true,
            },
            Command::SetGlobalCounter { key: "turn".into(), value: -1 },
        ];
        for command in commands {
            let (command_type, payload) = command.to_parts().unwrap();
            assert_eq!(Command::from_parts(&command_type, &payload).unwrap(), command);
        }
    }

    #[test]
    fn test_every_variant_name_is_registered() {
        let sample = Command::SetLife { player_id: "p".into(), life: 1 };
        assert!(COMMAND_TYPES.contains(&sample.command_type()));
        assert_eq!(COMMAND_TYPES.len(), 21);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = Command::from_parts("card.explode", &json!({})).unwrap_err();
        assert_eq!(err, CommandError::UnknownType("card.explode".into()));
    }

    #[test]
    fn test_malformed_payload_rejected() {
        let err = Command::from_parts("card.tap", &json!({ "cardId": 5 })).unwrap_err();
        assert!(matches!(err, CommandError::InvalidPayload { .. }));
    }

    #[test]
    fn test_apply_untap_all() {
        let mut maps = sample_table();
        mutators::tap_card(&mut maps, &"b1".into(), true);
        mutators::tap_card(&mut maps, &"b2".into(), true);
        mutators::tap_card(&mut maps, &"x1".into(), true);

        assert!(apply_command(&mut maps, &Command::UntapAll { player_id: "alice".into() }));
        assert!(!maps.card(&"b1".into()).unwrap().tapped);
        assert!(!maps.card(&"b2".into()).unwrap().tapped);
        assert!(maps.card(&"x1".into()).unwrap().tapped);
    }

    #[test]
    fn test_draw_builder_reads_latest_top() {
        let mut maps = sample_table();
        let builder = DrawCardBuilder { player_id: "alice".into() };

        let built = builder.build(&maps).unwrap();
        assert_eq!(
            built.command,
            Command::MoveCard {
                card_id: "c3".into(),
                zone_id: "alice-hand".into(),
                position: None,
                index: None
            }
        );

        apply_command(&mut maps, &built.command);
        let next = builder.build(&maps).unwrap();
        assert!(matches!(next.command, Command::MoveCard { ref card_id, .. } if card_id.as_str() == "c2"));
    }

    #[test]
    fn test_draw_from_empty_library_fails() {
        let mut maps = sample_table();
        for id in ["c1", "c2", "c3"] {
            mutators::remove_card(&mut maps, &id.into());
        }
        let err = DrawCardBuilder { player_id: "alice".into() }.build(&maps).unwrap_err();
        assert_eq!(err, CommandError::EmptyZone("alice-library".into()));
    }

    #[test]
    fn test_duplicate_builder_allocates_fresh_id() {
        let maps = sample_table();
        let builder = DuplicateCardBuilder { card_id: "b1".into() };

        let a = builder.build(&maps).unwrap();
        let b = builder.build(&maps).unwrap();
        assert_ne!(a.command, b.command);

        let missing = DuplicateCardBuilder { card_id: "ghost".into() }.build(&maps);
        assert_eq!(missing.unwrap_err(), CommandError::UnknownCard("ghost".into()));
    }

    #[test]
    fn test_shuffle_builder_is_permutation() {
        let mut maps = sample_table();
        let built = ShuffleZoneBuilder { zone_id: "alice-library".into() }
            .build(&maps)
            .unwrap();
        assert!(apply_command(&mut maps, &built.command));

        let mut order = maps.zone(&"alice-library".into()).unwrap().card_ids.clone();
        order.sort();
        assert_eq!(order, vec![CardId::new("c1"), CardId::new("c2"), CardId::new("c3")]);
        assert_eq!(maps.check_consistency(), Ok(()));
    }

    #[test]
    fn test_static_command_builds_unchanged() {
        let maps = sample_table();
        let command = Command::SetLife { player_id: "bob".into(), life: 12 };
        let builder = StaticCommand(command.clone());
        assert_eq!(builder.command_type(), "player.life");
        let built = builder.build(&maps).unwrap();
        assert_eq!(built.command, command);
        assert_eq!(built.payload_private, None);
    }
}
