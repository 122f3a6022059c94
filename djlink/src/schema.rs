//! API schema (spec.md §6): a static, JSON-serializable description of
//! every public operation, plus the external input/output surface, so a
//! caller can discover the API without reading source.

use serde::Serialize;

/// One parameter of a described operation.
#[derive(Debug, Clone, Serialize)]
pub struct ParamInfo {
    pub name: &'static str,
    pub ty: &'static str,
    pub description: &'static str,
    pub range: Option<(f64, f64)>,
}

fn param(name: &'static str, ty: &'static str, description: &'static str) -> ParamInfo {
    ParamInfo {
        name,
        ty,
        description,
        range: None,
    }
}

fn ranged_param(
    name: &'static str,
    ty: &'static str,
    description: &'static str,
    min: f64,
    max: f64,
) -> ParamInfo {
    ParamInfo {
        name,
        ty,
        description,
        range: Some((min, max)),
    }
}

/// One public operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ParamInfo>,
    pub returns: &'static str,
}

/// One external input or output surface.
#[derive(Debug, Clone, Serialize)]
pub struct IoInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub format: &'static str,
}

/// The complete, serializable description of the library's API surface
/// (spec.md §6 "API schema"). Returned whole by [`schema`].
#[derive(Debug, Clone, Serialize)]
pub struct ApiSchema {
    pub name: &'static str,
    pub version: &'static str,
    pub description: &'static str,
    pub operations: Vec<OperationInfo>,
    pub inputs: Vec<IoInfo>,
    pub outputs: Vec<IoInfo>,
}

/// Builds the API schema (spec.md §6). A single introspection call, no
/// state read — every field here is a fixed description of the API
/// shape, not a live status.
pub fn schema() -> ApiSchema {
    ApiSchema {
        name: "djlink",
        version: env!("CARGO_PKG_VERSION"),
        description: "Pioneer DJ Link protocol client library. Discovers DJ Link devices on \
            the local network, tracks tempo and playback state, and can join the network as a \
            virtual player to request track metadata over the dbserver protocol.",
        operations: vec![
            OperationInfo {
                name: "DeviceFinder::start",
                description: "Start discovering DJ Link devices on the network (UDP port 50000)",
                params: vec![param(
                    "ignored_addresses",
                    "Vec<Ipv4Addr>",
                    "Addresses to exclude from the device set",
                )],
                returns: "(DeviceFinder, JoinHandle)",
            },
            OperationInfo {
                name: "DeviceFinder::stop",
                description: "Stop the device discovery loop",
                params: vec![],
                returns: "void",
            },
            OperationInfo {
                name: "DeviceFinder::subscribe",
                description: "Register a channel for found/lost device events",
                params: vec![],
                returns: "broadcast::Receiver<DeviceEvent>",
            },
            OperationInfo {
                name: "BeatFinder::start",
                description: "Start receiving beat and related packets (UDP port 50001)",
                params: vec![param(
                    "ignored_addresses",
                    "Vec<Ipv4Addr>",
                    "Addresses to exclude from dispatch",
                )],
                returns: "(BeatFinder, JoinHandle)",
            },
            OperationInfo {
                name: "BeatFinder::subscribe",
                description: "Register a channel for beat-port events",
                params: vec![],
                returns: "broadcast::Receiver<BeatEvent>",
            },
            OperationInfo {
                name: "Player::start",
                description: "Join the network as a virtual player: claim a device number, \
                    announce, and optionally send status/beat packets",
                params: vec![
                    param("config", "&Config", "Runtime configuration"),
                    param("device_finder", "&DeviceFinder", "Must already be running"),
                    param("beat_finder", "&BeatFinder", "Must already be running"),
                ],
                returns: "(Player, Vec<JoinHandle>)",
            },
            OperationInfo {
                name: "Player::become_tempo_master",
                description: "Request to become the tempo master via the handoff protocol",
                params: vec![],
                returns: "Result<()>",
            },
            OperationInfo {
                name: "ConnectionManager::invoke_with_client_session",
                description: "Run a closure against a pooled dbserver connection to a device, \
                    opening one on a cache miss",
                params: vec![
                    param("ip", "Ipv4Addr", "Target device address"),
                    param("posing_as", "u8", "Player number to present as"),
                ],
                returns: "Result<T>",
            },
            OperationInfo {
                name: "MetadataCache::lookup",
                description: "Fetch a track's metadata, using the hot cache when available",
                params: vec![
                    param("key", "TrackKey", "Device, slot, and rekordbox id"),
                    param("posing_as", "u8", "Player number to present as"),
                ],
                returns: "Result<TrackMetadata>",
            },
            OperationInfo {
                name: "VirtualRekordbox::rekordbox_id_for_player",
                description: "The archive-side rekordbox id matched by PSSI content hash for \
                    a player's current Opus-sourced track",
                params: vec![param("player", "u8", "Player device number")],
                returns: "Option<u32>",
            },
            OperationInfo {
                name: "sanitize_bpm",
                description: "Clamp a BPM value for public exposure",
                params: vec![ranged_param("bpm", "f64", "Raw BPM value", 20.0, 300.0)],
                returns: "f64 (120.0 if non-finite or out of range)",
            },
        ],
        inputs: vec![
            IoInfo {
                name: "announcement_packets",
                description: "UDP packets on port 50000: hello, keep-alive, device-number claim",
                format: "binary",
            },
            IoInfo {
                name: "beat_packets",
                description: "UDP packets on port 50001: beat, on-air, fader-start, sync-control, \
                    master-handoff, precise-position",
                format: "binary",
            },
            IoInfo {
                name: "status_packets",
                description: "UDP packets on port 50002: mixer status, CDJ status, Opus metadata",
                format: "binary",
            },
            IoInfo {
                name: "dbserver_responses",
                description: "TCP dbserver protocol replies on the probed metadata port",
                format: "binary",
            },
        ],
        outputs: vec![
            IoInfo {
                name: "device-found",
                description: "A device entered the live device set",
                format: "json",
            },
            IoInfo {
                name: "device-lost",
                description: "A device was evicted after 10s of silence",
                format: "json",
            },
            IoInfo {
                name: "update",
                description: "A per-port device update (beat, CDJ status, mixer status)",
                format: "json",
            },
            IoInfo {
                name: "master-changed",
                description: "The tempo-master pointer changed",
                format: "json",
            },
            IoInfo {
                name: "error",
                description: "A background failure that was caught and logged",
                format: "json",
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_serializes_to_json() {
        let json = serde_json::to_string(&schema()).unwrap();
        assert!(json.contains("\"name\":\"djlink\""));
        assert!(json.contains("device-found"));
    }

    #[test]
    fn test_schema_lists_core_operations() {
        let s = schema();
        assert!(s.operations.iter().any(|o| o.name == "Player::start"));
        assert!(s.operations.iter().any(|o| o.name == "DeviceFinder::start"));
    }
}
