//! Master handoff state machine (spec.md §4.5 Phase E). Transitions are
//! driven only by handoff request/response packets and CDJ-status
//! observations — a beat packet alone never changes master state.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffState {
    NotMaster,
    Requesting { from: u8 },
    Master,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SendHandoffRequest { to: u8 },
    SendHandoffResponse { to: u8, yielded: bool },
    BecomeMasterLocally,
}

/// Per-player handoff bookkeeping; one instance lives on the virtual
/// player for its own lifetime.
#[derive(Debug)]
pub struct Handoff {
    state: HandoffState,
    master_yielded_from: Option<u8>,
    next_master: Option<u8>,
}

impl Default for Handoff {
    fn default() -> Self {
        Handoff {
            state: HandoffState::NotMaster,
            master_yielded_from: None,
            next_master: None,
        }
    }
}

impl Handoff {
    pub fn new() -> Handoff {
        Handoff::default()
    }

    pub fn state(&self) -> HandoffState {
        self.state
    }

    pub fn is_master(&self) -> bool {
        self.state == HandoffState::Master
    }

    /// The peer we've promised to yield to, if any; goes out as the
    /// CDJ-status "next master" byte while we're still master.
    pub fn pending_handoff_target(&self) -> Option<u8> {
        self.next_master
    }

    /// API `becomeTempoMaster()`. `current_master` is the current tempo
    /// master's device number, if any.
    pub fn request_master(&mut self, current_master: Option<u8>) -> Action {
        match current_master {
            Some(peer) => {
                self.state = HandoffState::Requesting { from: peer };
                Action::SendHandoffRequest { to: peer }
            }
            None => {
                self.state = HandoffState::Master;
                Action::BecomeMasterLocally
            }
        }
    }

    /// A peer replied to our handoff request.
    pub fn on_handoff_response(&mut self, from: u8, yielded: bool) {
        if yielded {
            if let HandoffState::Requesting { from: requested_of } = self.state {
                if requested_of == from {
                    self.master_yielded_from = Some(from);
                }
            }
        }
    }

    /// A peer sent us `MASTER_HANDOFF_REQUEST` while we are master.
    pub fn on_handoff_request(
        &mut self,
        from_peer: u8,
        our_device_num: u8,
        status_sending_enabled: bool,
    ) -> Option<Action> {
        if self.state == HandoffState::Master && status_sending_enabled && from_peer != our_device_num {
            self.next_master = Some(from_peer);
            Some(Action::SendHandoffResponse {
                to: from_peer,
                yielded: true,
            })
        } else {
            None
        }
    }

    /// A CDJ status from `peer` reports `yielding_to == our device number`.
    /// Completes the Requesting -> Master transition.
    pub fn on_peer_status_yielding_to_us(&mut self, peer: u8) -> bool {
        if self.master_yielded_from == Some(peer) {
            self.state = HandoffState::Master;
            self.master_yielded_from = None;
            true
        } else {
            false
        }
    }

    /// A CDJ status from `peer` asserts tempo-master; completes the
    /// Master -> NotMaster transition if we previously yielded to them.
    pub fn on_peer_asserts_master(&mut self, peer: u8) -> bool {
        if self.next_master == Some(peer) {
            self.state = HandoffState::NotMaster;
            self.next_master = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handoff_completion_scenario() {
        let mut h = Handoff::new();
        assert_eq!(h.request_master(Some(3)), Action::SendHandoffRequest { to: 3 });
        assert_eq!(h.state(), HandoffState::Requesting { from: 3 });

        h.on_handoff_response(3, true);
        assert!(!h.is_master());

        assert!(h.on_peer_status_yielding_to_us(3));
        assert!(h.is_master());
    }

    #[test]
    fn test_no_master_becomes_master_locally() {
        let mut h = Handoff::new();
        assert_eq!(h.request_master(None), Action::BecomeMasterLocally);
        assert!(h.is_master());
    }

    #[test]
    fn test_master_yields_on_incoming_request() {
        let mut h = Handoff::new();
        h.request_master(None);
        assert!(h.is_master());

        let action = h.on_handoff_request(4, 2, true);
        assert_eq!(
            action,
            Some(Action::SendHandoffResponse {
                to: 4,
                yielded: true
            })
        );

        assert!(h.on_peer_asserts_master(4));
        assert_eq!(h.state(), HandoffState::NotMaster);
    }

    #[test]
    fn test_handoff_request_ignored_when_not_master() {
        let mut h = Handoff::new();
        assert_eq!(h.on_handoff_request(4, 2, true), None);
    }
}
