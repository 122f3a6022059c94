//! Connection Manager (spec.md §4.7 second half): probes each device for
//! its dbserver TCP port, pools one connection per (device, posed-as
//! player number), and closes idle connections on a timer. The teacher
//! opens a fresh connection per request (`prolink/src/metadata.rs`); this
//! pools them instead, since spec.md requires reuse across callers.

use std::collections::HashMap;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::client::Client;
use crate::Result;

const PORT_PROBE_PORT: u16 = 12523;
const PORT_PROBE_MESSAGE: &[u8] = b"\x00\x00\x00\x0fRemoteDBServer\x00";
pub const DEFAULT_IDLE_LIMIT: Duration = Duration::from_secs(1);

/// Probes `ip` on the fixed port-lookup port and returns the dbserver's
/// real TCP port. Grounded on the teacher's `get_metadata_port`
/// (`prolink/src/metadata.rs`): the same literal 19-byte `RemoteDBServer`
/// query, the same 2-byte big-endian port reply.
pub async fn probe_port(ip: Ipv4Addr) -> Result<u16> {
    let mut stream = TcpStream::connect((ip, PORT_PROBE_PORT)).await?;
    stream.write_all(PORT_PROBE_MESSAGE).await?;
    let port = stream.read_u16().await?;
    Ok(port)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PoolKey {
    ip: Ipv4Addr,
    posing_as: u8,
}

struct ClientRecord {
    client: Arc<Mutex<Client>>,
    use_count: u64,
    last_used: Instant,
}

/// Pools dbserver connections and evicts ones idle past `idle_limit`
/// (default 1s, spec.md §4.7).
pub struct ConnectionManager {
    menu_lock_timeout: Duration,
    clients: Arc<Mutex<HashMap<PoolKey, ClientRecord>>>,
    stop_tx: watch::Sender<bool>,
}

impl ConnectionManager {
    pub fn start(menu_lock_timeout: Duration, idle_limit: Duration) -> (ConnectionManager, JoinHandle<()>) {
        let clients: Arc<Mutex<HashMap<PoolKey, ClientRecord>>> = Arc::new(Mutex::new(HashMap::new()));
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let idle_clients = clients.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(500));
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => { if *stop_rx.borrow() { return; } }
                    _ = ticker.tick() => {
                        let stale: Vec<PoolKey> = {
                            let map = idle_clients.lock().await;
                            let now = Instant::now();
                            map.iter()
                                .filter(|(_, rec)| now.saturating_duration_since(rec.last_used) > idle_limit)
                                .map(|(k, _)| *k)
                                .collect()
                        };
                        for key in stale {
                            let removed = idle_clients.lock().await.remove(&key);
                            if let Some(rec) = removed {
                                let mut guard = rec.client.lock().await;
                                let _ = guard.teardown().await;
                                debug!(target: "djlink", "closed idle dbserver connection to {}", key.ip);
                            }
                        }
                    }
                }
            }
        });

        (
            ConnectionManager {
                menu_lock_timeout,
                clients,
                stop_tx,
            },
            handle,
        )
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// `invokeWithClientSession` (spec.md §4.7): runs `f` against a pooled
    /// connection to `ip`, posing as `posing_as` (our own device number,
    /// or a borrowed low number when ours falls outside the dbserver's
    /// accepted player range). Opens and probes a fresh connection on a
    /// pool miss.
    pub async fn invoke_with_client_session<F, Fut, T>(
        &self,
        ip: Ipv4Addr,
        posing_as: u8,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<Mutex<Client>>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = PoolKey { ip, posing_as };

        let client_arc = {
            let mut map = self.clients.lock().await;
            if let Some(rec) = map.get_mut(&key) {
                rec.use_count += 1;
                rec.last_used = Instant::now();
                rec.client.clone()
            } else {
                let port = probe_port(ip).await?;
                let client =
                    Client::connect(SocketAddr::new(ip.into(), port), posing_as, self.menu_lock_timeout)
                        .await?;
                let arc = Arc::new(Mutex::new(client));
                map.insert(
                    key,
                    ClientRecord {
                        client: arc.clone(),
                        use_count: 1,
                        last_used: Instant::now(),
                    },
                );
                arc
            }
        };

        f(client_arc).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_probe_message_is_exact_length() {
        assert_eq!(PORT_PROBE_MESSAGE.len(), 19);
    }
}
