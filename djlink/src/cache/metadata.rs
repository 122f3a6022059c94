//! Track metadata cache (spec.md §4.9): hot cache, active-request dedup,
//! and a worker that fetches track metadata over the dbserver protocol on
//! a miss, purging entries when their device goes offline.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::dbserver::client::MenuItem;
use crate::dbserver::message::{message_type, Field, MenuItemType};
use crate::dbserver::pool::ConnectionManager;
use crate::finder::device::DeviceEvent;
use crate::{DjLinkError, Result};

/// One track's worth of metadata (spec.md §4.9), as much as the dbserver
/// menu protocol exposes per item type. Artwork/waveform binary blobs are
/// not fetched here — see DESIGN.md.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub genre: String,
    pub label: String,
    pub key: String,
    pub comment: String,
    pub rating: u32,
    pub year: u32,
    pub duration_seconds: u32,
    pub tempo_x100: u32,
}

/// Identifies one track on one device's media slot (spec.md §3 "track
/// reference").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackKey {
    pub device_ip: Ipv4Addr,
    pub slot: u8,
    pub rekordbox_id: u32,
}

const MAX_IN_FLIGHT: usize = 64;

struct Shared {
    hot: HashMap<TrackKey, TrackMetadata>,
    pending: HashSet<TrackKey>,
}

struct Request {
    key: TrackKey,
    posing_as: u8,
    result_tx: oneshot::Sender<Result<TrackMetadata>>,
}

/// A cheaply-cloneable handle; every clone shares the same hot cache and
/// in-flight dedup set.
#[derive(Clone)]
pub struct MetadataCache {
    shared: Arc<Mutex<Shared>>,
    request_tx: mpsc::Sender<Request>,
}

impl MetadataCache {
    pub fn start(
        pool: Arc<ConnectionManager>,
        mut device_events: broadcast::Receiver<DeviceEvent>,
    ) -> (MetadataCache, JoinHandle<()>) {
        let shared = Arc::new(Mutex::new(Shared {
            hot: HashMap::new(),
            pending: HashSet::new(),
        }));
        let (request_tx, mut request_rx) = mpsc::channel::<Request>(MAX_IN_FLIGHT);

        let worker_shared = shared.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = device_events.recv() => {
                        match event {
                            Ok(DeviceEvent::Lost(ann)) => {
                                let mut st = worker_shared.lock().await;
                                st.hot.retain(|k, _| k.device_ip != ann.address.ip_addr);
                            }
                            Ok(DeviceEvent::Found(_)) => {}
                            Err(broadcast::error::RecvError::Closed) => break,
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        }
                    }
                    req = request_rx.recv() => {
                        let Some(req) = req else { break };
                        let cached = { worker_shared.lock().await.hot.get(&req.key).cloned() };
                        if let Some(meta) = cached {
                            let _ = req.result_tx.send(Ok(meta));
                            continue;
                        }

                        worker_shared.lock().await.pending.insert(req.key);
                        let result = fetch(&pool, req.key, req.posing_as).await;
                        {
                            let mut st = worker_shared.lock().await;
                            st.pending.remove(&req.key);
                            if let Ok(meta) = &result {
                                st.hot.insert(req.key, meta.clone());
                            }
                        }
                        let _ = req.result_tx.send(result);
                    }
                }
            }
        });

        (MetadataCache { shared, request_tx }, handle)
    }

    /// Looks up a track's metadata, fetching over dbserver on a cache
    /// miss. `posing_as` is the player number the Connection Manager uses
    /// when opening a connection to `key.device_ip`.
    pub async fn lookup(&self, key: TrackKey, posing_as: u8) -> Result<TrackMetadata> {
        let (result_tx, result_rx) = oneshot::channel();
        self.request_tx
            .send(Request {
                key,
                posing_as,
                result_tx,
            })
            .await
            .map_err(|_| DjLinkError::NotRunning)?;
        result_rx.await.map_err(|_| DjLinkError::NotRunning)?
    }

    /// True while a fetch for `key` is already in flight, for callers that
    /// want to skip issuing a duplicate `lookup` of their own.
    pub async fn is_pending(&self, key: TrackKey) -> bool {
        self.shared.lock().await.pending.contains(&key)
    }
}

async fn fetch(pool: &ConnectionManager, key: TrackKey, posing_as: u8) -> Result<TrackMetadata> {
    pool.invoke_with_client_session(key.device_ip, posing_as, |client| async move {
        let mut guard = client.lock().await;
        let dmst = Field::dmst(0, 1, key.slot, 1);
        let items = guard
            .menu_request(
                message_type::MENU_REQ,
                vec![dmst, Field::U32(key.rekordbox_id)],
            )
            .await?;
        Ok(build_metadata(&items))
    })
    .await
}

fn build_metadata(items: &[MenuItem]) -> TrackMetadata {
    let mut meta = TrackMetadata::default();
    for item in items {
        match &item.item_type {
            Some(MenuItemType::TrackTitle) => meta.title = item.label.clone(),
            Some(MenuItemType::Artist) => meta.artist = item.label.clone(),
            Some(MenuItemType::AlbumTitle) => meta.album = item.label.clone(),
            Some(MenuItemType::Genre) => meta.genre = item.label.clone(),
            Some(MenuItemType::Label) => meta.label = item.label.clone(),
            Some(MenuItemType::Key) => meta.key = item.label.clone(),
            Some(MenuItemType::Comment) => meta.comment = item.label.clone(),
            Some(MenuItemType::Rating) => meta.rating = item.number,
            Some(MenuItemType::Year) => meta.year = item.number,
            Some(MenuItemType::Duration) => meta.duration_seconds = item.number,
            Some(MenuItemType::Tempo) => meta.tempo_x100 = item.number,
            _ => {}
        }
    }
    meta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_metadata_reads_known_item_types() {
        let items = vec![
            MenuItem {
                item_type: Some(MenuItemType::TrackTitle),
                raw_type: MenuItemType::TrackTitle as u32,
                number: 0,
                label: "Test Track".to_string(),
            },
            MenuItem {
                item_type: Some(MenuItemType::Rating),
                raw_type: MenuItemType::Rating as u32,
                number: 4,
                label: String::new(),
            },
        ];
        let meta = build_metadata(&items);
        assert_eq!(meta.title, "Test Track");
        assert_eq!(meta.rating, 4);
    }
}
