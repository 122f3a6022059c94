//! djlink: a Pioneer DJ Link protocol client library.
//!
//! [`DjLink::start`] wires together the Device Finder (§4.3), Beat Finder
//! (§4.4), Virtual Player (§4.5), Virtual Rekordbox (§4.6), the dbserver
//! Connection Manager (§4.7), and the metadata cache (§4.9) into one
//! event stream, mirroring the teacher's `Prolink::join`/`next`/
//! `terminate` shape.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

pub mod cache;
pub mod dbserver;
pub mod device;
pub mod finder;
pub mod message;
pub mod metronome;
pub mod player;
pub mod proto;
pub mod rekordbox;
pub mod safety;
pub mod schema;

use cache::metadata::MetadataCache;
use dbserver::pool::ConnectionManager;
use finder::beat::BeatFinder;
use finder::device::{DeviceEvent, DeviceFinder};
pub use message::Event;
use player::Player;
use rekordbox::VirtualRekordbox;

/// Error taxonomy (spec.md §7): transient I/O and bad-packet cases never
/// reach here (they're logged-and-dropped at the receiver boundary);
/// what does reach a caller is a protocol violation, a resource
/// conflict, or caller misuse.
#[derive(Error, Debug)]
pub enum DjLinkError {
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("unknown packet type 0x{type_byte:02x} on port {port}")]
    UnknownPacketType { port: u16, type_byte: u8 },

    #[error("{kind} parse error at byte {pos}")]
    ParseError { kind: &'static str, pos: usize },

    #[error("protocol violation: {0}")]
    ProtocolError(String),

    #[error("no devices visible on the network")]
    NoDevicesVisible,

    #[error("menu lock held past its timeout")]
    MenuLockTimeout,

    #[error("operation attempted on a stopped component")]
    NotRunning,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O operation timed out")]
    IoTimeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DjLinkError>;

/// Runtime configuration (spec.md §2 "Configuration & lifecycle glue"):
/// a single struct plus explicit `start`/`stop`, per spec.md §9's design
/// note against constructor-smuggled mutable state.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name announced to the network.
    pub name: String,
    /// Desired device number; `0` self-assigns (spec.md §4.5 Phase B).
    pub device_num: u8,
    /// Network interface to bind to; `None` auto-detects from the route
    /// to the anchor device (spec.md §4.5 Phase A).
    pub interface_name: Option<String>,
    pub announce_interval_ms: u64,
    /// Self-assignment base: 2 (CDJ-like role) vs. 5 (broad use).
    pub prefer_cdj_slot: bool,
    /// Enables Phase D status/beat sending. Only numbers 1..4 are
    /// accepted by real CDJ mixers as status senders (spec.md §6); the
    /// same flag gates both the status and beat senders since a status
    /// sender that never sends a beat makes no sense on real hardware.
    pub send_status: bool,
    pub ignored_addresses: Vec<Ipv4Addr>,
    pub pool_idle_limit: Duration,
    pub menu_lock_timeout: Duration,
    /// PSSI archive index for Opus/Virtual Rekordbox matching (spec.md §4.6).
    pub archive_index: Vec<rekordbox::ArchiveEntry>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            name: "djlink".to_string(),
            device_num: 0,
            interface_name: None,
            announce_interval_ms: 1500,
            prefer_cdj_slot: false,
            send_status: false,
            ignored_addresses: Vec::new(),
            pool_idle_limit: dbserver::pool::DEFAULT_IDLE_LIMIT,
            menu_lock_timeout: dbserver::client::DEFAULT_MENU_LOCK_TIMEOUT,
            archive_index: Vec::new(),
        }
    }
}

/// Lifecycle handle for the whole library (spec.md §2): owns every
/// finder, the virtual player, the Connection Manager, and the metadata
/// cache, and funnels their events into one queue.
pub struct DjLink {
    device_finder: DeviceFinder,
    beat_finder: BeatFinder,
    player: Arc<Player>,
    pool: Arc<ConnectionManager>,
    metadata: MetadataCache,
    rekordbox: Arc<Mutex<Option<VirtualRekordbox>>>,
    rekordbox_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    events_rx: mpsc::Receiver<Event>,
    child_tasks: Vec<JoinHandle<()>>,
}

impl DjLink {
    /// Joins the network: starts the Device Finder, Beat Finder, Virtual
    /// Player, Connection Manager, and metadata cache, and wires a
    /// coordinator that starts Virtual Rekordbox the first time an Opus
    /// device is seen. Per spec.md §9's "Opus coexistence" design note,
    /// Virtual Player never starts Virtual Rekordbox directly; Device
    /// Finder's events drive a small coordinator instead.
    pub async fn start(config: Config) -> Result<DjLink> {
        let (device_finder, device_finder_handle) =
            DeviceFinder::start(config.ignored_addresses.clone()).await?;
        let (beat_finder, beat_finder_handle) =
            BeatFinder::start(config.ignored_addresses.clone()).await?;

        let (events_tx, events_rx) = mpsc::channel(256);
        let forward_handle = spawn_device_event_forwarder(&device_finder, events_tx.clone());

        let (player, player_handles) =
            Player::start(&config, &device_finder, &beat_finder, events_tx.clone()).await?;
        let player = Arc::new(player);

        let (pool, pool_handle) =
            ConnectionManager::start(config.menu_lock_timeout, config.pool_idle_limit);
        let pool = Arc::new(pool);

        let (metadata, metadata_handle) =
            MetadataCache::start(pool.clone(), device_finder.subscribe());

        let rekordbox = Arc::new(Mutex::new(None));
        let rekordbox_handles = Arc::new(Mutex::new(Vec::new()));
        let rekordbox_coordinator = spawn_rekordbox_coordinator(
            device_finder.clone(),
            player.clone(),
            config.name.clone(),
            config.archive_index.clone(),
            rekordbox.clone(),
            rekordbox_handles.clone(),
        );

        let mut child_tasks = vec![
            device_finder_handle,
            beat_finder_handle,
            forward_handle,
            pool_handle,
            metadata_handle,
            rekordbox_coordinator,
        ];
        child_tasks.extend(player_handles);

        Ok(DjLink {
            device_finder,
            beat_finder,
            player,
            pool,
            metadata,
            rekordbox,
            rekordbox_handles,
            events_rx,
            child_tasks,
        })
    }

    /// The next event (spec.md §6 "Outputs"): device-found/lost, a
    /// per-port update, or a master-changed transition.
    pub async fn next(&mut self) -> Result<Event> {
        self.events_rx.recv().await.ok_or(DjLinkError::NotRunning)
    }

    pub fn player(&self) -> &Player {
        &self.player
    }

    pub fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    pub fn pool(&self) -> &ConnectionManager {
        &self.pool
    }

    /// The API schema (spec.md §6), a fixed description independent of
    /// any running state.
    pub fn schema(&self) -> schema::ApiSchema {
        schema::schema()
    }

    /// Stops every component and waits for all background tasks to exit.
    pub async fn stop(self) {
        self.device_finder.stop();
        self.beat_finder.stop();
        self.player.stop();
        self.pool.stop();
        if let Some(vr) = self.rekordbox.lock().await.as_ref() {
            vr.stop();
        }

        drop(self.events_rx);

        for t in self.child_tasks {
            let _ = t.await;
        }
        for t in self.rekordbox_handles.lock().await.drain(..) {
            let _ = t.await;
        }
    }
}

fn spawn_device_event_forwarder(
    device_finder: &DeviceFinder,
    events_tx: mpsc::Sender<Event>,
) -> JoinHandle<()> {
    let mut rx = device_finder.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(DeviceEvent::Found(ann)) => {
                    let _ = events_tx.send(Event::DeviceFound(ann)).await;
                }
                Ok(DeviceEvent::Lost(ann)) => {
                    let _ = events_tx.send(Event::DeviceLost(ann)).await;
                }
                Err(broadcast::error::RecvError::Closed) => return,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    })
}

/// Starts Virtual Rekordbox the first time Device Finder reports an
/// Opus-shaped announcement, rather than Virtual Player controlling it
/// directly (spec.md §9).
fn spawn_rekordbox_coordinator(
    device_finder: DeviceFinder,
    player: Arc<Player>,
    name: String,
    archive_index: Vec<rekordbox::ArchiveEntry>,
    rekordbox: Arc<Mutex<Option<VirtualRekordbox>>>,
    rekordbox_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
) -> JoinHandle<()> {
    let mut rx = device_finder.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(e) => e,
                Err(broadcast::error::RecvError::Closed) => return,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            };
            let DeviceEvent::Found(ann) = event else {
                continue;
            };
            if device::opus_logical_numbers(&ann).is_none() {
                continue;
            }

            let mut slot = rekordbox.lock().await;
            if slot.is_some() {
                continue;
            }
            match VirtualRekordbox::start(&name, &device_finder, &player, archive_index.clone())
                .await
            {
                Ok((vr, handles)) => {
                    *slot = Some(vr);
                    rekordbox_handles.lock().await.extend(handles);
                    info!(target: "djlink", "Opus media detected, started virtual rekordbox");
                }
                Err(e) => warn!(target: "djlink", "failed to start virtual rekordbox: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_self_assigns() {
        let config = Config::default();
        assert_eq!(config.device_num, 0);
        assert!(!config.send_status);
    }

    #[test]
    fn test_error_display_includes_fields() {
        let err = DjLinkError::PacketTooShort {
            expected: 54,
            actual: 10,
        };
        assert!(err.to_string().contains("54"));
        assert!(err.to_string().contains("10"));
    }
}
