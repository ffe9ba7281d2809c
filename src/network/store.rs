//! Replicated Store
//!
//! The shared document every peer of a session holds a replica of: the
//! table maps plus the append-only command and snapshot sequences. It is
//! always injected; nothing in the crate reaches for an ambient document.
//!
//! The command sequence is kept sorted by [`CommandEnvelope::entry_id`].
//! Replicas holding the same set of entries therefore hold the same
//! sequence, and an entry that arrives late can land anywhere in it, not
//! only at the end.

use std::collections::BTreeSet;

use crate::game::state::TableMaps;
use crate::proof::envelope::CommandEnvelope;
use crate::proof::snapshot::SignedSnapshot;

/// Capability handed to the command log and mutators.
pub trait ReplicatedStore {
    /// Replicated table maps.
    fn maps(&self) -> &TableMaps;

    /// Mutable table maps.
    fn maps_mut(&mut self) -> &mut TableMaps;

    /// Command log, sorted by entry id. Every replica agrees on this order.
    fn commands(&self) -> &[CommandEnvelope];

    /// Snapshot checkpoints, in replica order.
    fn snapshots(&self) -> &[SignedSnapshot];

    /// Insert a command at its sorted position. Returns false when an
    /// identical entry is already present. Entries are never edited or
    /// removed.
    fn append_command(&mut self, envelope: CommandEnvelope) -> bool;

    /// Append a snapshot checkpoint.
    fn append_snapshot(&mut self, snapshot: SignedSnapshot);
}

/// In-process replica.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    maps: TableMaps,
    commands: Vec<CommandEnvelope>,
    snapshots: Vec<SignedSnapshot>,
}

impl MemoryStore {
    /// Create an empty replica.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver every log entry `other` has that this replica lacks.
    /// Returns the number of commands delivered.
    ///
    /// Commands are identified by entry id, so repeated merges are
    /// idempotent and two envelopes claiming the same `(author, seq)` are
    /// both delivered for verification to judge.
    pub fn merge_log_from(&mut self, other: &MemoryStore) -> usize {
        let mut delivered = 0;
        for envelope in &other.commands {
            if self.append_command(envelope.clone()) {
                delivered += 1;
            }
        }

        let known_snapshots: BTreeSet<&str> = self.snapshots.iter().map(|s| s.signature.as_str()).collect();
        let incoming: Vec<SignedSnapshot> = other
            .snapshots
            .iter()
            .filter(|s| !known_snapshots.contains(s.signature.as_str()))
            .cloned()
            .collect();
        self.snapshots.extend(incoming);

        delivered
    }
}

impl ReplicatedStore for MemoryStore {
    fn maps(&self) -> &TableMaps {
        &self.maps
    }

    fn maps_mut(&mut self) -> &mut TableMaps {
        &mut self.maps
    }

    fn commands(&self) -> &[CommandEnvelope] {
        &self.commands
    }

    fn snapshots(&self) -> &[SignedSnapshot] {
        &self.snapshots
    }

    fn append_command(&mut self, envelope: CommandEnvelope) -> bool {
        let id = envelope.entry_id();
        match self.commands.binary_search_by(|e| e.entry_id().cmp(&id)) {
            Ok(_) => false,
            Err(position) => {
                self.commands.insert(position, envelope);
                true
            }
        }
    }

    fn append_snapshot(&mut self, snapshot: SignedSnapshot) {
        self.snapshots.push(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::SessionIdentity;
    use crate::game::commands::Command;
    use crate::game::state::PlayerId;
    use crate::proof::envelope::EnvelopeDraft;

    fn entry(identity: &SessionIdentity, seq: u64) -> CommandEnvelope {
        entry_at(identity, seq, seq)
    }

    fn entry_at(identity: &SessionIdentity, seq: u64, lamport: u64) -> CommandEnvelope {
        EnvelopeDraft {
            session_id: "room".into(),
            seq,
            lamport,
            command: Command::SetGlobalCounter { key: "turn".into(), value: seq as i64 },
            payload_private: None,
            author_id: identity.player_id.clone(),
            timestamp: 0,
        }
        .sign(identity.signing())
        .unwrap()
    }

    #[test]
    fn test_merge_is_idempotent() {
        let alice = SessionIdentity::create(Some(b"alice"));
        let bob = SessionIdentity::create(Some(b"bob"));

        let mut a = MemoryStore::new();
        let mut b = MemoryStore::new();
        a.append_command(entry(&alice, 1));
        a.append_command(entry(&alice, 2));
        b.append_command(entry(&bob, 1));

        assert_eq!(b.merge_log_from(&a), 2);
        assert_eq!(b.merge_log_from(&a), 0);
        assert_eq!(b.commands().len(), 3);

        assert_eq!(a.merge_log_from(&b), 1);
        assert_eq!(a.commands().len(), 3);
    }

    #[test]
    fn test_replicas_agree_on_order() {
        let alice = SessionIdentity::create(Some(b"alice"));
        let bob = SessionIdentity::create(Some(b"bob"));

        // Concurrent appends: both authors at the same Lamport clock
        let mut a = MemoryStore::new();
        let mut b = MemoryStore::new();
        a.append_command(entry_at(&alice, 1, 1));
        b.append_command(entry_at(&bob, 1, 1));
        a.append_command(entry_at(&alice, 2, 2));

        b.merge_log_from(&a);
        a.merge_log_from(&b);

        let order = |store: &MemoryStore| -> Vec<(PlayerId, u64)> {
            store.commands().iter().map(|e| (e.author_id.clone(), e.seq)).collect()
        };
        assert_eq!(order(&a), order(&b));
        assert_eq!(a.commands().last().unwrap().lamport, 2);
    }

    #[test]
    fn test_conflicting_claims_both_delivered() {
        let alice = SessionIdentity::create(Some(b"alice"));
        let mallory = SessionIdentity::create(Some(b"mallory"));

        let genuine = entry(&alice, 1);
        let mut forged = entry(&alice, 1);
        forged.signature = entry(&mallory, 1).signature;

        let mut a = MemoryStore::new();
        a.append_command(genuine.clone());
        let mut b = MemoryStore::new();
        b.append_command(forged);

        assert_eq!(a.merge_log_from(&b), 1);
        assert_eq!(a.commands().len(), 2);
        assert!(!a.append_command(genuine));
    }

    #[test]
    fn test_merge_preserves_order() {
        let alice = SessionIdentity::create(Some(b"alice"));
        let mut a = MemoryStore::new();
        for seq in 1..=3 {
            a.append_command(entry(&alice, seq));
        }
        let mut b = MemoryStore::new();
        b.merge_log_from(&a);
        let seqs: Vec<u64> = b.commands().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }
}
