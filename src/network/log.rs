//! Command Log
//!
//! Per-session driver over the replicated command and snapshot sequences.
//!
//! ```text
//! Idle ──attach──▶ Attached ──enqueue──▶ Appending ──▶ Attached
//!                     │
//!                     └────sync/hydrate──▶ Replaying ──▶ Attached
//! ```
//!
//! Appending builds the payload against the latest local maps, signs it
//! (the commit point), and inserts it. Replaying walks the log from the
//! local cursor in log order, verifying every entry before dispatching it
//! to the mutators. Bad entries are reported and skipped; they never stop
//! replay of the entries after them.
//!
//! Log order is the store's agreed order (Lamport clock, author, seq). A
//! concurrent entry can sort in ahead of the cursor; when the entry just
//! behind the cursor is no longer the one last replayed, the maps are
//! rebuilt by full replay so every replica applies the same sequence.
//!
//! Divergence policy: when a verified checkpoint's hash disagrees with the
//! local maps at its log position, the maps are rebuilt by full replay of
//! the log from genesis (empty maps). If the rebuilt state still disagrees,
//! the checkpoint is distrusted and reported, and the replayed state is kept.
//! Checkpoints behind the cursor are compared against a bounded history of
//! replayed state hashes.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::{debug, info, instrument, warn};

use crate::config::env_or;
use crate::core::canonical::CanonicalError;
use crate::core::hash::StateHash;
use crate::core::identity::SessionIdentity;
use crate::game::commands::{apply_command, CommandBuilder, CommandError};
use crate::game::state::{PlayerId, TableMaps};
use crate::network::session::{SessionDirectory, SessionHandle};
use crate::network::store::ReplicatedStore;
use crate::proof::envelope::{CommandEnvelope, EntryId, EnvelopeDraft, LogOrder};
use crate::proof::snapshot::{covers_prefix, table_state_hash, SignedSnapshot};
use crate::proof::verify::{
    verify_envelope, verify_log, CheckpointResult, KeyDirectory, SeqTracker, VerificationError,
};
use thiserror::Error;

/// Replayed positions whose state hash is kept for late checkpoints.
const CHECKPOINT_HISTORY: usize = 256;

/// Snapshot cadence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotPolicy {
    /// Snapshot after this many log entries.
    pub every_entries: u64,
    /// Or after this much time, if anything was appended.
    pub every_ms: i64,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            every_entries: 50,
            every_ms: 60_000,
        }
    }
}

impl SnapshotPolicy {
    /// Create policy from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            every_entries: env_or("SNAPSHOT_EVERY_ENTRIES", defaults.every_entries),
            every_ms: env_or("SNAPSHOT_EVERY_MS", defaults.every_ms),
        }
    }
}

/// Log driver state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogState {
    /// Not bound to a session.
    Idle,
    /// Bound and quiescent.
    Attached,
    /// Building, signing and appending a local command.
    Appending,
    /// Verifying and applying log entries.
    Replaying,
}

/// Command log errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandLogError {
    /// No session is attached.
    #[error("command log is not attached to a session")]
    NotAttached,
    /// The builder failed.
    #[error(transparent)]
    Build(#[from] CommandError),
    /// The builder produced a different command than it declared.
    #[error("builder declared {declared} but produced {produced}")]
    TypeMismatch {
        /// Declared type.
        declared: &'static str,
        /// Produced type.
        produced: &'static str,
    },
    /// Signing or hashing failed.
    #[error("signing failed: {0}")]
    Signing(#[from] CanonicalError),
}

/// A checkpoint that disagreed with local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DivergenceReport {
    /// Checkpoint log position.
    pub snapshot_seq: u64,
    /// Checkpoint author.
    pub author_id: PlayerId,
    /// Hash carried by the checkpoint.
    pub expected: StateHash,
    /// Hash of local state before the rebuild.
    pub computed: StateHash,
    /// Did a full replay reproduce the checkpoint?
    pub resolved: bool,
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Entries applied.
    pub applied: usize,
    /// Redelivered entries skipped.
    pub duplicates: usize,
    /// Entries and checkpoints that failed verification.
    pub rejected: Vec<VerificationError>,
    /// Checkpoints whose signature verified.
    pub snapshots_verified: usize,
    /// Checkpoints that disagreed with local state.
    pub divergences: Vec<DivergenceReport>,
    /// Full replays from genesis.
    pub rebuilds: usize,
}

impl SyncReport {
    /// No rejections and no divergence.
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty() && self.divergences.is_empty()
    }

    fn absorb(&mut self, other: SyncReport) {
        self.applied += other.applied;
        self.duplicates += other.duplicates;
        self.rejected.extend(other.rejected);
        self.snapshots_verified += other.snapshots_verified;
        self.divergences.extend(other.divergences);
        self.rebuilds += other.rebuilds;
    }
}

/// A verified checkpoint waiting for replay to reach its position.
#[derive(Debug, Clone)]
struct PendingCheckpoint {
    seq: u64,
    through: Option<LogOrder>,
    hash: StateHash,
    author_id: PlayerId,
}

/// Per-session binding.
struct Binding<S> {
    session_id: String,
    store: SessionHandle<S>,
    next_seq: u64,
    tracker: SeqTracker,
    /// Log position replayed up to.
    cursor: usize,
    /// Entry at `cursor - 1` when it was replayed.
    cursor_entry: Option<EntryId>,
    /// Every entry replay has already accounted for.
    seen: BTreeSet<EntryId>,
    /// State hash after each recent position, oldest first.
    history: VecDeque<(usize, StateHash)>,
    /// Snapshot sequence position inspected up to.
    snapshot_cursor: usize,
    pending: Vec<PendingCheckpoint>,
    last_snapshot_seq: u64,
    last_snapshot_ms: i64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Signed, append-only command log for one client.
pub struct CommandLog<S> {
    identity: SessionIdentity,
    keys: KeyDirectory,
    policy: SnapshotPolicy,
    snapshot_peer: bool,
    state: LogState,
    binding: Option<Binding<S>>,
}

impl<S: ReplicatedStore> CommandLog<S> {
    /// Create an idle log for `identity`. The identity's own key is registered.
    pub fn new(identity: SessionIdentity, mut keys: KeyDirectory, policy: SnapshotPolicy) -> Self {
        keys.register(&identity.public());
        Self {
            identity,
            keys,
            policy,
            snapshot_peer: false,
            state: LogState::Idle,
            binding: None,
        }
    }

    /// Make this client the designated snapshot peer.
    pub fn with_snapshot_peer(mut self, snapshot_peer: bool) -> Self {
        self.snapshot_peer = snapshot_peer;
        self
    }

    /// Current state.
    pub fn state(&self) -> LogState {
        self.state
    }

    /// Author identity.
    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Known author keys.
    pub fn keys_mut(&mut self) -> &mut KeyDirectory {
        &mut self.keys
    }

    /// Attached session id.
    pub fn session_id(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.session_id.as_str())
    }

    /// Next seq this author will use.
    pub fn next_seq(&self) -> Option<u64> {
        self.binding.as_ref().map(|b| b.next_seq)
    }

    /// Bind to a session's replica. Returns `None` when the session is not
    /// registered; the log stays idle.
    #[instrument(skip(self, directory), fields(author = %self.identity.player_id))]
    pub async fn attach(
        &mut self,
        directory: &SessionDirectory<S>,
        session_id: &str,
    ) -> Option<SessionHandle<S>> {
        let Some(store) = directory.get_session(session_id).await else {
            debug!("No active session handle");
            return None;
        };
        if let Err(e) = directory.register_player(self.identity.player_id.clone(), session_id).await {
            // Closed between lookup and seating
            debug!(error = %e, "Could not seat player");
            return None;
        }

        let (next_seq, last_snapshot_seq) = {
            let replica = store.read().await;
            let own_high = replica
                .commands()
                .iter()
                .filter(|e| e.author_id == self.identity.player_id && e.session_id == session_id)
                .map(|e| e.seq)
                .max()
                .unwrap_or(0);
            let last_snapshot = replica
                .snapshots()
                .iter()
                .filter(|s| s.session_id == session_id)
                .map(|s| s.seq)
                .max()
                .unwrap_or(0);
            (own_high + 1, last_snapshot)
        };

        self.binding = Some(Binding {
            session_id: session_id.to_string(),
            store: store.clone(),
            next_seq,
            tracker: SeqTracker::new(),
            cursor: 0,
            cursor_entry: None,
            seen: BTreeSet::new(),
            history: VecDeque::new(),
            snapshot_cursor: 0,
            pending: Vec::new(),
            last_snapshot_seq,
            last_snapshot_ms: now_ms(),
        });
        self.state = LogState::Attached;
        info!(next_seq, "Command log attached");
        Some(store)
    }

    /// Unbind from the session and give up the seat.
    pub async fn detach(&mut self, directory: &SessionDirectory<S>) {
        if self.binding.take().is_some() {
            directory.unregister_player(&self.identity.player_id).await;
        }
        self.state = LogState::Idle;
    }

    /// Build, sign and append a local command, then apply it.
    ///
    /// The builder runs once, against the maps as they are after every
    /// already-delivered entry has been replayed.
    pub async fn enqueue_local_command(
        &mut self,
        builder: &dyn CommandBuilder,
    ) -> Result<CommandEnvelope, CommandLogError> {
        let Some(binding) = self.binding.as_mut() else {
            return Err(CommandLogError::NotAttached);
        };
        self.state = LogState::Appending;

        let handle = binding.store.clone();
        let mut store = handle.write().await;
        let result = append_local(&self.identity, &self.keys, binding, &mut *store, builder);

        self.state = LogState::Attached;
        result
    }

    /// Replay everything delivered since the last pass.
    pub async fn sync(&mut self) -> Result<SyncReport, CommandLogError> {
        let Some(binding) = self.binding.as_mut() else {
            return Err(CommandLogError::NotAttached);
        };
        self.state = LogState::Replaying;

        let handle = binding.store.clone();
        let mut store = handle.write().await;
        let report = replay_pending(&self.keys, binding, &mut *store);

        self.state = LogState::Attached;
        Ok(report)
    }

    /// Append a checkpoint if this is the snapshot peer and the policy says
    /// one is due.
    pub async fn maybe_snapshot(&mut self, now_ms: i64) -> Result<Option<SignedSnapshot>, CommandLogError> {
        if !self.snapshot_peer {
            return Ok(None);
        }
        let Some(binding) = self.binding.as_mut() else {
            return Err(CommandLogError::NotAttached);
        };

        let handle = binding.store.clone();
        let mut store = handle.write().await;
        replay_pending(&self.keys, binding, &mut *store);

        let covered = binding.cursor as u64;
        let since = covered.saturating_sub(binding.last_snapshot_seq);
        let due = since >= self.policy.every_entries
            || (since > 0 && now_ms - binding.last_snapshot_ms >= self.policy.every_ms);
        if !due {
            return Ok(None);
        }

        let through = binding.cursor.checked_sub(1).and_then(|last| store.commands().get(last)).map(|e| e.order());
        let snapshot = SignedSnapshot::create(
            binding.session_id.clone(),
            covered,
            through,
            store.maps(),
            self.identity.player_id.clone(),
            self.identity.signing(),
            now_ms,
        )?;
        store.append_snapshot(snapshot.clone());
        binding.last_snapshot_seq = covered;
        binding.last_snapshot_ms = now_ms;
        info!(seq = covered, state_hash = %snapshot.state_hash, "Snapshot appended");
        Ok(Some(snapshot))
    }

    /// Reconnect path: start from `mirrored` (the replicated maps as
    /// received) if it matches the newest verified checkpoint, replaying
    /// only the entries after it. Otherwise replay from genesis.
    pub async fn hydrate(&mut self, mirrored: TableMaps) -> Result<SyncReport, CommandLogError> {
        let Some(binding) = self.binding.as_mut() else {
            return Err(CommandLogError::NotAttached);
        };
        self.state = LogState::Replaying;

        let handle = binding.store.clone();
        let mut store = handle.write().await;
        let mut report = SyncReport::default();

        let commands = store.commands();
        let newest = store
            .snapshots()
            .iter()
            .filter(|s| s.session_id == binding.session_id && s.covers(commands))
            .filter_map(|s| s.verify(&self.keys).ok().map(|hash| (s, hash)))
            .max_by_key(|(s, _)| s.seq)
            .map(|(s, hash)| PendingCheckpoint {
                seq: s.seq,
                through: s.through.clone(),
                hash,
                author_id: s.author_id.clone(),
            });

        binding.tracker = SeqTracker::new();
        binding.seen.clear();
        binding.history.clear();
        binding.pending.clear();
        binding.snapshot_cursor = 0;

        match newest {
            Some(checkpoint) => {
                let computed = table_state_hash(&mirrored)?;
                if computed == checkpoint.hash {
                    // Entries before a verified checkpoint are covered by it
                    let covered = checkpoint.seq as usize;
                    for envelope in &store.commands()[..covered] {
                        binding.seen.insert(envelope.entry_id());
                        if envelope.session_id == binding.session_id && envelope.verify(&self.keys).is_ok() {
                            binding.tracker.record(&envelope.author_id, envelope.seq);
                        }
                    }
                    binding.cursor_entry = covered.checked_sub(1).map(|last| store.commands()[last].entry_id());
                    *store.maps_mut() = mirrored;
                    binding.cursor = covered;
                    binding.history.push_back((covered, computed));
                    info!(seq = checkpoint.seq, "Hydrated from checkpoint");
                } else {
                    debug!(snapshot_seq = checkpoint.seq, "Mirrored state does not match checkpoint");
                    resolve_divergence(&self.keys, binding, &mut *store, checkpoint, computed, &mut report);
                }
            }
            None => {
                *store.maps_mut() = TableMaps::default();
                binding.cursor = 0;
                binding.cursor_entry = None;
            }
        }

        report.absorb(replay_pending(&self.keys, binding, &mut *store));
        self.state = LogState::Attached;
        Ok(report)
    }
}

// =============================================================================
// REPLAY
// =============================================================================

fn append_local<S: ReplicatedStore>(
    identity: &SessionIdentity,
    keys: &KeyDirectory,
    binding: &mut Binding<S>,
    store: &mut S,
    builder: &dyn CommandBuilder,
) -> Result<CommandEnvelope, CommandLogError> {
    replay_pending(keys, binding, store);

    let built = builder.build(store.maps())?;
    let produced = built.command.command_type();
    if produced != builder.command_type() {
        return Err(CommandLogError::TypeMismatch {
            declared: builder.command_type(),
            produced,
        });
    }

    let envelope = EnvelopeDraft {
        session_id: binding.session_id.clone(),
        seq: binding.next_seq,
        // Log is sorted by clock, so the last entry carries the highest one
        lamport: store.commands().last().map_or(0, |e| e.lamport).saturating_add(1),
        command: built.command,
        payload_private: built.payload_private,
        author_id: identity.player_id.clone(),
        timestamp: now_ms(),
    }
    .sign(identity.signing())?;

    store.append_command(envelope.clone());
    binding.next_seq += 1;
    debug!(seq = envelope.seq, lamport = envelope.lamport, r#type = %envelope.command_type, "Command appended");

    replay_pending(keys, binding, store);
    Ok(envelope)
}

fn replay_pending<S: ReplicatedStore>(
    keys: &KeyDirectory,
    binding: &mut Binding<S>,
    store: &mut S,
) -> SyncReport {
    let mut report = SyncReport::default();

    if prefix_shifted(binding, store) {
        info!(cursor = binding.cursor, "Entries sorted in ahead of the cursor, replaying from genesis");
        rebuild_from_genesis(keys, binding, store, &mut report);
    }

    for (checkpoint, computed) in collect_checkpoints(keys, binding, store, &mut report) {
        resolve_divergence(keys, binding, store, checkpoint, computed, &mut report);
    }

    loop {
        if let Some((checkpoint, computed)) = check_checkpoints(binding, store) {
            resolve_divergence(keys, binding, store, checkpoint, computed, &mut report);
            continue;
        }

        let Some(envelope) = store.commands().get(binding.cursor).cloned() else {
            break;
        };
        binding.cursor += 1;
        let entry_id = envelope.entry_id();
        binding.seen.insert(entry_id.clone());
        binding.cursor_entry = Some(entry_id);

        match verify_envelope(&envelope, &binding.session_id, keys, &binding.tracker) {
            Ok(command) => {
                apply_command(store.maps_mut(), &command);
                binding.tracker.record(&envelope.author_id, envelope.seq);
                report.applied += 1;
                #[cfg(feature = "debug-tracing")]
                debug!(
                    position = binding.cursor - 1,
                    author = %envelope.author_id,
                    seq = envelope.seq,
                    r#type = %envelope.command_type,
                    "Replayed"
                );
            }
            Err(e) if e.is_duplicate() => report.duplicates += 1,
            Err(e) => {
                warn!(
                    author = %envelope.author_id,
                    seq = envelope.seq,
                    r#type = %envelope.command_type,
                    error = %e,
                    "Rejected command envelope"
                );
                report.rejected.push(e);
            }
        }
        record_history(binding, store);
    }

    report
}

/// Has an entry been inserted at or before the last replayed position?
fn prefix_shifted<S: ReplicatedStore>(binding: &Binding<S>, store: &S) -> bool {
    let Some(last) = binding.cursor.checked_sub(1) else {
        return false;
    };
    store.commands().get(last).map(|e| e.entry_id()) != binding.cursor_entry
}

fn record_history<S: ReplicatedStore>(binding: &mut Binding<S>, store: &S) {
    let Ok(hash) = table_state_hash(store.maps()) else {
        return;
    };
    binding.history.push_back((binding.cursor, hash));
    while binding.history.len() > CHECKPOINT_HISTORY {
        binding.history.pop_front();
    }
}

/// Verify newly delivered checkpoints. Ones replay can still reach are
/// queued; ones behind the cursor are compared against replay history
/// and returned when they disagree.
fn collect_checkpoints<S: ReplicatedStore>(
    keys: &KeyDirectory,
    binding: &mut Binding<S>,
    store: &S,
    report: &mut SyncReport,
) -> Vec<(PendingCheckpoint, StateHash)> {
    let mut mismatches = Vec::new();
    let snapshots = store.snapshots();
    for snapshot in &snapshots[binding.snapshot_cursor.min(snapshots.len())..] {
        if snapshot.session_id != binding.session_id {
            continue;
        }
        let hash = match snapshot.verify(keys) {
            Ok(hash) => hash,
            Err(e) => {
                warn!(author = %snapshot.author_id, seq = snapshot.seq, error = %e, "Rejected snapshot");
                report.rejected.push(e);
                continue;
            }
        };
        report.snapshots_verified += 1;
        let checkpoint = PendingCheckpoint {
            seq: snapshot.seq,
            through: snapshot.through.clone(),
            hash,
            author_id: snapshot.author_id.clone(),
        };

        if snapshot.seq >= binding.cursor as u64 {
            binding.pending.push(checkpoint);
            continue;
        }
        if !snapshot.covers(store.commands()) {
            debug!(snapshot_seq = snapshot.seq, "Checkpoint superseded by reordered entries");
            continue;
        }
        let recorded = binding
            .history
            .iter()
            .find(|(position, _)| *position as u64 == snapshot.seq)
            .map(|(_, hash)| *hash);
        match recorded {
            Some(computed) if computed != hash => mismatches.push((checkpoint, computed)),
            Some(_) => {}
            None => debug!(snapshot_seq = snapshot.seq, cursor = binding.cursor, "Checkpoint older than replay history"),
        }
    }
    binding.snapshot_cursor = snapshots.len();
    mismatches
}

/// Check queued checkpoints at the current cursor. Returns the first
/// mismatch with the locally computed hash.
fn check_checkpoints<S: ReplicatedStore>(
    binding: &mut Binding<S>,
    store: &S,
) -> Option<(PendingCheckpoint, StateHash)> {
    let position = binding.cursor as u64;
    if !binding.pending.iter().any(|c| c.seq == position) {
        return None;
    }

    let due: Vec<PendingCheckpoint> = binding.pending.iter().filter(|c| c.seq == position).cloned().collect();
    binding.pending.retain(|c| c.seq != position);

    let computed = table_state_hash(store.maps()).ok()?;
    due.into_iter()
        .filter(|c| covers_prefix(store.commands(), c.seq, c.through.as_ref()))
        .find(|c| c.hash != computed)
        .map(|c| (c, computed))
}

/// Rebuild from genesis after a checkpoint disagreed with local state, and
/// record whether the rebuilt state reproduces it.
fn resolve_divergence<S: ReplicatedStore>(
    keys: &KeyDirectory,
    binding: &mut Binding<S>,
    store: &mut S,
    checkpoint: PendingCheckpoint,
    computed: StateHash,
    report: &mut SyncReport,
) {
    warn!(
        snapshot_seq = checkpoint.seq,
        author = %checkpoint.author_id,
        expected = %hex::encode(checkpoint.hash),
        computed = %hex::encode(computed),
        "State diverged from checkpoint, rebuilding from genesis"
    );
    let results = rebuild_from_genesis(keys, binding, store, report);
    let replayed = results
        .iter()
        .find(|c| c.seq == checkpoint.seq && c.expected == checkpoint.hash)
        .map(|c| c.computed);
    let resolved = replayed == Some(checkpoint.hash);

    if resolved {
        info!(snapshot_seq = checkpoint.seq, "Full replay reproduced checkpoint");
    } else {
        let replayed = replayed.unwrap_or(computed);
        warn!(
            snapshot_seq = checkpoint.seq,
            expected = %hex::encode(checkpoint.hash),
            computed = %hex::encode(replayed),
            "Checkpoint distrusted, keeping replayed state"
        );
        report.rejected.push(VerificationError::SnapshotHashMismatch {
            seq: checkpoint.seq,
            expected: checkpoint.hash,
            computed: replayed,
        });
    }
    report.divergences.push(DivergenceReport {
        snapshot_seq: checkpoint.seq,
        author_id: checkpoint.author_id,
        expected: checkpoint.hash,
        computed,
        resolved,
    });
}

/// Replace local maps with a full replay of the log from empty maps.
///
/// Entries replay had not accounted for yet are reported the way the
/// cursor walk reports them. Returns the replay's checkpoint results.
fn rebuild_from_genesis<S: ReplicatedStore>(
    keys: &KeyDirectory,
    binding: &mut Binding<S>,
    store: &mut S,
    report: &mut SyncReport,
) -> Vec<CheckpointResult> {
    let replay = verify_log(
        &TableMaps::default(),
        &binding.session_id,
        store.commands(),
        store.snapshots(),
        keys,
    );
    let rejected: BTreeMap<usize, VerificationError> = replay.rejected.into_iter().collect();

    for (position, envelope) in store.commands().iter().enumerate() {
        if !binding.seen.insert(envelope.entry_id()) {
            continue;
        }
        match rejected.get(&position) {
            None => report.applied += 1,
            Some(e) if e.is_duplicate() => report.duplicates += 1,
            Some(e) => {
                warn!(
                    author = %envelope.author_id,
                    seq = envelope.seq,
                    r#type = %envelope.command_type,
                    error = %e,
                    "Rejected command envelope"
                );
                report.rejected.push(e.clone());
            }
        }
    }

    let log_len = store.commands().len();
    binding.cursor_entry = log_len.checked_sub(1).map(|last| store.commands()[last].entry_id());
    *store.maps_mut() = replay.maps;
    binding.tracker = replay.tracker;
    binding.cursor = log_len;
    binding.pending.retain(|c| c.seq > log_len as u64);
    binding.history.clear();
    record_history(binding, store);
    report.rebuilds += 1;

    replay.checkpoint_results
}

// =============================================================================
// TESTS
// =============================================================================
