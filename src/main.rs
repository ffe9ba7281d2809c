//! Tabletop Sync demo
//!
//! Runs two in-process peers against one room: one seats players and
//! plays a few commands, the other receives the log, verifies and replays
//! it, and both compare canonical state hashes.

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tabletop_sync::{
    config::SyncConfig,
    game::{
        commands::{Command, DrawCardBuilder, ShuffleZoneBuilder, StaticCommand},
        state::{Card, Player, Zone, ZoneType},
        visibility::{project_for_viewer, DefaultReveal, RevealMode, ViewerRole},
    },
    network::{
        log::CommandLog,
        session::SessionDirectory,
        store::{MemoryStore, ReplicatedStore},
    },
    proof::{snapshot::table_state_hash, verify::KeyDirectory},
    SessionIdentity, VERSION,
};

const ROOM: &str = "demo-room";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;

    info!("Tabletop Sync v{}", VERSION);
    let config = SyncConfig::from_env();
    info!(
        every_entries = config.snapshots.every_entries,
        max_attempts = config.backoff.max_attempts,
        "Configuration loaded"
    );

    demo_session(config).await
}

/// Demo: two replicas of one room converge on the same hash.
async fn demo_session(config: SyncConfig) -> Result<()> {
    info!("=== Starting Demo Session ===");

    let host_identity = SessionIdentity::create(None);
    let guest_identity = SessionIdentity::create(None);
    let host_id = host_identity.player_id.clone();
    let guest_id = guest_identity.player_id.clone();
    info!("Host: {}", host_id);
    info!("Guest: {}", guest_id);

    let mut keys = KeyDirectory::new();
    keys.register(&host_identity.public());
    keys.register(&guest_identity.public());

    // Each peer holds its own replica of the room
    let host_directory = SessionDirectory::new();
    let guest_directory = SessionDirectory::new();
    host_directory.open_session(ROOM, MemoryStore::new()).await?;
    guest_directory.open_session(ROOM, MemoryStore::new()).await?;

    let mut host = CommandLog::new(host_identity, keys.clone(), config.snapshots.clone()).with_snapshot_peer(true);
    let mut guest = CommandLog::new(guest_identity, keys, config.snapshots);
    let Some(host_store) = host.attach(&host_directory, ROOM).await else {
        bail!("host could not attach to {ROOM}");
    };
    let Some(guest_store) = guest.attach(&guest_directory, ROOM).await else {
        bail!("guest could not attach to {ROOM}");
    };

    // Host seats both players and deals a small library
    let library = format!("{host_id}-library");
    let hand = format!("{host_id}-hand");
    let setup = vec![
        Command::JoinPlayer { player: Player::new(host_id.clone(), "Host") },
        Command::JoinPlayer { player: Player::new(guest_id.clone(), "Guest") },
        Command::AddZone { zone: Zone::new(library.as_str(), ZoneType::Library, host_id.clone()) },
        Command::AddZone { zone: Zone::new(hand.as_str(), ZoneType::Hand, host_id.clone()) },
    ];
    for command in setup {
        host.enqueue_local_command(&StaticCommand(command)).await?;
    }
    for i in 1..=7 {
        let card = Card::new(format!("card-{i}"), host_id.clone(), library.as_str(), format!("Card {i}"));
        host.enqueue_local_command(&StaticCommand(Command::UpsertCard { card })).await?;
    }
    host.enqueue_local_command(&ShuffleZoneBuilder { zone_id: library.as_str().into() })
        .await?;
    for _ in 0..3 {
        host.enqueue_local_command(&DrawCardBuilder { player_id: host_id.clone() })
            .await?;
    }
    host.enqueue_local_command(&StaticCommand(Command::SetLife {
        player_id: guest_id.clone(),
        life: 37,
    }))
    .await?;
    if let Some(snapshot) = host.maybe_snapshot(chrono::Utc::now().timestamp_millis() + 60_000).await? {
        info!("Checkpoint at {}: {}", snapshot.seq, snapshot.state_hash);
    }

    // Deliver the host's log to the guest replica
    let delivered = {
        let source = host_store.read().await;
        guest_store.write().await.merge_log_from(&source)
    };
    info!("Delivered {} entries", delivered);

    let report = guest.sync().await?;
    info!(
        "Guest replayed {} entries ({} rejected, {} checkpoints)",
        report.applied,
        report.rejected.len(),
        report.snapshots_verified
    );

    // Compare replicas
    info!("=== Verifying Convergence ===");
    let host_hash = table_state_hash(host_store.read().await.maps())?;
    let guest_hash = table_state_hash(guest_store.read().await.maps())?;
    info!("Host State Hash:  {}", hex::encode(host_hash));
    info!("Guest State Hash: {}", hex::encode(guest_hash));

    if host_hash == guest_hash {
        info!("CONVERGENCE VERIFIED: Hashes match!");
    } else {
        warn!("CONVERGENCE FAILURE: Hashes differ!");
    }

    // What the guest is allowed to see
    let replica = guest_store.read().await;
    let view = project_for_viewer(replica.maps(), &guest_id, ViewerRole::Player, RevealMode::None, &DefaultReveal);
    for zone in view.zones.values() {
        info!(
            "{:?} of {}: {} cards, {} visible",
            zone.zone_type,
            zone.owner_id,
            zone.card_count,
            zone.visible_card_ids.len()
        );
    }
    drop(replica);

    // Leaving the table frees both rooms
    host.detach(&host_directory).await;
    guest.detach(&guest_directory).await;
    let closed = host_directory.cleanup().await + guest_directory.cleanup().await;
    info!("Closed {} idle rooms", closed);

    Ok(())
}
