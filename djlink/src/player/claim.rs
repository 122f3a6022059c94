//! Device-number claim (spec.md §4.5 Phase B): three broadcast stages,
//! each repeated three times at 300ms, aborting when a `DeviceNumberInUse`
//! packet defends the number we're claiming.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use log::info;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::proto::{
    self, AssignmentRequestPacket, DeviceNumClaim1Packet, DeviceNumClaim2Packet,
    DeviceNumClaim3Packet, Packet,
};
use crate::DjLinkError;
use crate::Result;

const STAGE_INTERVAL: Duration = Duration::from_millis(300);
const REPEATS_PER_STAGE: u8 = 3;
const MAX_DEVICE_NUMBER: u8 = 127;
const MIXER_ASSIGN_WAIT: Duration = Duration::from_millis(50);

/// Self-assignment base per spec.md §4.5: 5 for broad use, 2 for a
/// CDJ-like role.
pub fn self_assignment_base(prefer_cdj_slot: bool) -> u8 {
    if prefer_cdj_slot {
        2
    } else {
        5
    }
}

/// Watches the announcement port for 4 seconds and returns the lowest
/// free number at or above `base`.
pub async fn self_assign(socket: &UdpSocket, base: u8) -> Result<u8> {
    let mut seen = HashSet::new();
    let mut buf = [0u8; 2048];

    let deadline = tokio::time::Instant::now() + Duration::from_secs(4);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => {
                if let Ok(Packet::DeviceHello(p)) | Ok(Packet::DeviceKeepAlive(p)) =
                    Packet::parse(&buf[..len], proto::ANNOUNCEMENT_PORT)
                {
                    seen.insert(p.device_num);
                }
            }
            _ => break,
        }
    }

    (base..=MAX_DEVICE_NUMBER)
        .find(|n| !seen.contains(n))
        .ok_or_else(|| DjLinkError::ProtocolError("no free device number".to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(u8),
    Defended,
}

async fn broadcast(
    socket: &UdpSocket,
    addr: SocketAddr,
    write: impl FnOnce(&mut Vec<u8>) -> std::io::Result<()>,
) -> Result<()> {
    let mut buf = Vec::new();
    write(&mut buf)?;
    socket.send_to(&buf, addr).await?;
    Ok(())
}

async fn watch_for_defense(
    socket: &UdpSocket,
    candidate: u8,
    duration: Duration,
) -> Result<Option<ClaimOutcome>> {
    let mut buf = [0u8; 2048];
    let deadline = tokio::time::Instant::now() + duration;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => {
                if let Ok(Packet::DeviceNumberInUse(p)) =
                    Packet::parse(&buf[..len], proto::ANNOUNCEMENT_PORT)
                {
                    if p.device_num == candidate {
                        return Ok(Some(ClaimOutcome::Defended));
                    }
                }
            }
            _ => return Ok(None),
        }
    }
}

async fn peek_will_assign(socket: &UdpSocket, duration: Duration) -> Result<bool> {
    let mut buf = [0u8; 2048];
    match timeout(duration, socket.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => Ok(matches!(
            Packet::parse(&buf[..len], proto::ANNOUNCEMENT_PORT),
            Ok(Packet::DeviceNumberWillAssign(_))
        )),
        _ => Ok(false),
    }
}

/// Waits briefly for the mixer's `DeviceNumberAssignPacket` reply to our
/// `AssignmentRequestPacket` and returns the number it picked, if any.
async fn wait_for_mixer_assignment(socket: &UdpSocket, duration: Duration) -> Result<Option<u8>> {
    let mut buf = [0u8; 2048];
    let deadline = tokio::time::Instant::now() + duration;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => {
                if let Ok(Packet::DeviceNumberAssign(p)) =
                    Packet::parse(&buf[..len], proto::ANNOUNCEMENT_PORT)
                {
                    return Ok(Some(p.device_num));
                }
            }
            _ => return Ok(None),
        }
    }
}

/// Runs one full three-stage claim attempt for `candidate`. If the mixer
/// offers to assign a number between stage 1 and stage 2, the assigned
/// number replaces `candidate` before stage 2 begins. Returns
/// [`ClaimOutcome::Defended`] if a `DeviceNumberInUse` packet names our
/// candidate at any point; callers pick a new candidate and retry.
pub async fn claim_once(
    socket: &UdpSocket,
    broadcast_addr: SocketAddr,
    name: &str,
    mac_addr: [u8; 6],
    ip_addr: [u8; 4],
    candidate: u8,
) -> Result<ClaimOutcome> {
    let mut candidate = candidate;

    for pkt_num in 1..=REPEATS_PER_STAGE {
        let pkt = DeviceNumClaim1Packet {
            name: name.to_string(),
            pkt_num,
            mac_addr,
        };
        broadcast(socket, broadcast_addr, |w| pkt.write(w)).await?;
        if let Some(outcome) = watch_for_defense(socket, candidate, STAGE_INTERVAL).await? {
            return Ok(outcome);
        }
    }

    if peek_will_assign(socket, Duration::from_millis(50)).await? {
        let preference = if candidate == 0 { 1 } else { 2 };
        let req = AssignmentRequestPacket {
            name: name.to_string(),
            mac_addr,
            preference,
        };
        broadcast(socket, broadcast_addr, |w| req.write(w)).await?;
        if let Some(assigned) = wait_for_mixer_assignment(socket, MIXER_ASSIGN_WAIT).await? {
            info!(target: "djlink", "mixer assigned device number {}", assigned);
            candidate = assigned;
        }
    }

    for pkt_num in 1..=REPEATS_PER_STAGE {
        let pkt = DeviceNumClaim2Packet {
            name: name.to_string(),
            ip_addr,
            mac_addr,
            device_num: candidate,
            pkt_num,
            auto_assign: candidate == 0,
        };
        broadcast(socket, broadcast_addr, |w| pkt.write(w)).await?;
        if let Some(outcome) = watch_for_defense(socket, candidate, STAGE_INTERVAL).await? {
            return Ok(outcome);
        }
    }

    for pkt_num in 1..=REPEATS_PER_STAGE {
        let pkt = DeviceNumClaim3Packet {
            name: name.to_string(),
            device_num: candidate,
            pkt_num,
        };
        broadcast(socket, broadcast_addr, |w| pkt.write(w)).await?;
        if let Some(outcome) = watch_for_defense(socket, candidate, STAGE_INTERVAL).await? {
            return Ok(outcome);
        }
    }

    info!(target: "djlink", "claimed device number {}", candidate);
    Ok(ClaimOutcome::Claimed(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_assignment_base() {
        assert_eq!(self_assignment_base(true), 2);
        assert_eq!(self_assignment_base(false), 5);
    }
}
