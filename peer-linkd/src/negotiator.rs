//! Connection negotiation for a single active attempt.
//!
//! ```text
//! Idle --discover--> Discovering --connect--> ConnectRequested
//!   --radio accepted--> Negotiating --group formed--> Connected(role)
//! any --not connected--> Disconnected
//! ```
//!
//! A new `connect` supersedes whatever attempt is live. Callbacks and
//! notifications belonging to a superseded attempt are ignored.

use std::net::IpAddr;
use tokio::time::Instant;
use shared::types::{
    ConnectionInfo, ConnectionState, ConnectionStatus, Device, DeviceAddress, GroupRole,
};
use crate::error::{P2pError, P2pResult};
use crate::radio::RadioResult;

/// What the owner should do once the group role is known
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleDirective {
    /// We own the group: accept incoming transport connections
    Listen,
    /// Another peer owns the group: connect to it
    ConnectTo(Option<IpAddr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub directive: Option<RoleDirective>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionAttempt {
    pub id: u64,
    pub target: Device,
    deadline: Instant,
}

/// Result of a `connect` call being accepted into the negotiator
#[derive(Debug)]
pub struct Started {
    pub attempt: u64,
    pub superseded: Option<ConnectionAttempt>,
    pub transition: Option<Transition>,
}

/// Result of the radio's answer to a `connect` call
#[derive(Debug)]
pub struct ConnectOutcome {
    pub result: P2pResult<()>,
    pub transition: Option<Transition>,
}

#[derive(Debug, Default)]
pub struct ConnectionNegotiator {
    state: ConnectionState,
    attempt: Option<ConnectionAttempt>,
    /// Peer of an established group, inbound or outbound
    peer: Option<Device>,
    group_owner_address: Option<IpAddr>,
    next_attempt: u64,
    /// Bumped whenever the connection a reply could belong to ends
    epoch: u64,
}

impl ConnectionNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> Option<&ConnectionAttempt> {
        self.attempt.as_ref()
    }

    /// Connection info requested under another epoch is stale
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            peer: self
                .peer
                .clone()
                .or_else(|| self.attempt.as_ref().map(|a| a.target.clone())),
            group_owner_address: self.group_owner_address,
        }
    }

    /// Deadline of an attempt that has not reached a terminal state
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            ConnectionState::ConnectRequested | ConnectionState::Negotiating => {
                self.attempt.as_ref().map(|a| a.deadline)
            }
            _ => None,
        }
    }

    pub fn on_discovery_requested(&mut self) -> Option<Transition> {
        match self.state {
            ConnectionState::Idle | ConnectionState::Disconnected => {
                self.transition(ConnectionState::Discovering, None)
            }
            _ => None,
        }
    }

    pub fn on_discovery_failed(&mut self) -> Option<Transition> {
        match self.state {
            ConnectionState::Discovering => self.transition(ConnectionState::Idle, None),
            _ => None,
        }
    }

    /// Start an attempt towards `target`, superseding any live one
    pub fn begin_connect(&mut self, target: Device, deadline: Instant) -> Started {
        self.next_attempt += 1;
        self.epoch += 1;
        let id = self.next_attempt;

        let superseded = self.attempt.take().filter(|_| {
            !matches!(self.state, ConnectionState::Idle | ConnectionState::Disconnected)
        });
        if let Some(prior) = &superseded {
            tracing::info!(
                "Connect to {} supersedes attempt {} to {}",
                target.label(),
                prior.id,
                prior.target.label()
            );
        }

        tracing::debug!("Connecting to {}", target.label());
        self.peer = None;
        self.group_owner_address = None;
        self.attempt = Some(ConnectionAttempt { id, target, deadline });

        Started {
            attempt: id,
            superseded,
            transition: self.transition(ConnectionState::ConnectRequested, None),
        }
    }

    pub fn on_connect_result(&mut self, attempt: u64, result: RadioResult<()>) -> ConnectOutcome {
        let current = self.attempt.as_ref().map(|a| a.id);
        if current != Some(attempt) {
            return ConnectOutcome {
                result: Err(P2pError::ConnectFailed(
                    "superseded by a newer connection attempt".to_string(),
                )),
                transition: None,
            };
        }

        match result {
            Ok(()) => {
                // A connected notification may already have moved us on
                let transition = match self.state {
                    ConnectionState::ConnectRequested => {
                        self.transition(ConnectionState::Negotiating, None)
                    }
                    _ => None,
                };
                ConnectOutcome {
                    result: Ok(()),
                    transition,
                }
            }
            Err(failure) => {
                if let Some(attempt) = self.attempt.take() {
                    tracing::error!(
                        "Could not connect to {}, reason: {}",
                        attempt.target.label(),
                        failure
                    );
                }
                ConnectOutcome {
                    result: Err(P2pError::ConnectFailed(failure.reason)),
                    transition: self.transition(ConnectionState::Idle, None),
                }
            }
        }
    }

    /// Whether a connection notification about `peer` concerns us.
    /// A named peer must match the live attempt's target.
    pub fn accepts_peer(&self, peer: Option<&DeviceAddress>) -> bool {
        match (&self.attempt, peer) {
            (Some(attempt), Some(peer)) => &attempt.target.address == peer,
            _ => true,
        }
    }

    /// Resolve the group role from reported connection info.
    /// A group that is not formed yet keeps us negotiating.
    pub fn on_connected(&mut self, info: ConnectionInfo, peer: Option<Device>) -> Option<Transition> {
        if !self.accepts_peer(peer.as_ref().map(|p| &p.address)) {
            tracing::debug!(
                "Ignoring connection notification for superseded peer {}",
                peer.map(|p| p.label()).unwrap_or_default()
            );
            return None;
        }

        if !info.group_formed {
            tracing::debug!("Connected but group not formed yet, still negotiating");
            return None;
        }

        let role = if info.is_group_owner {
            GroupRole::GroupOwner
        } else {
            GroupRole::Client
        };

        if self.attempt.is_none() && !matches!(self.state, ConnectionState::Connected(_)) {
            tracing::info!("Inbound group formed");
        }

        self.group_owner_address = info.group_owner_address;
        match &self.attempt {
            Some(attempt) => self.peer = Some(attempt.target.clone()),
            None if peer.is_some() => self.peer = peer,
            None => {}
        }

        let directive = match role {
            GroupRole::GroupOwner => RoleDirective::Listen,
            GroupRole::Client => RoleDirective::ConnectTo(info.group_owner_address),
        };
        self.transition(ConnectionState::Connected(role), Some(directive))
    }

    /// Safety reset, permitted from every state
    pub fn on_disconnected(&mut self) -> Option<Transition> {
        self.epoch += 1;
        self.attempt = None;
        self.peer = None;
        self.group_owner_address = None;
        self.transition(ConnectionState::Disconnected, None)
    }

    /// Give up on an attempt that never reached a terminal state
    pub fn on_deadline(&mut self, now: Instant) -> Option<Transition> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }

        if let Some(attempt) = &self.attempt {
            tracing::warn!("Negotiation with {} timed out", attempt.target.label());
        }
        self.on_disconnected()
    }

    fn transition(
        &mut self,
        to: ConnectionState,
        directive: Option<RoleDirective>,
    ) -> Option<Transition> {
        if self.state == to {
            return None;
        }
        let from = std::mem::replace(&mut self.state, to);
        Some(Transition { from, to, directive })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use crate::radio::RadioFailure;

    fn peer(n: u8) -> Device {
        Device::new(format!("peer-{}", n), format!("02:00:00:00:00:{:02x}", n).as_str())
    }

    fn formed(owner: bool) -> ConnectionInfo {
        ConnectionInfo {
            group_formed: true,
            is_group_owner: owner,
            group_owner_address: Some(IpAddr::V4(Ipv4Addr::new(192, 168, 49, 1))),
        }
    }

    fn negotiating(target: Device) -> (ConnectionNegotiator, u64) {
        let mut negotiator = ConnectionNegotiator::new();
        let started = negotiator.begin_connect(target, Instant::now() + Duration::from_secs(45));
        negotiator.on_connect_result(started.attempt, Ok(())).result.unwrap();
        assert_eq!(negotiator.state(), ConnectionState::Negotiating);
        (negotiator, started.attempt)
    }

    #[test]
    fn test_discovery_is_idempotent() {
        let mut negotiator = ConnectionNegotiator::new();

        let t = negotiator.on_discovery_requested().unwrap();
        assert_eq!((t.from, t.to), (ConnectionState::Idle, ConnectionState::Discovering));
        assert!(negotiator.on_discovery_requested().is_none());
        assert!(negotiator.attempt().is_none());
    }

    #[test]
    fn test_failed_discovery_returns_to_idle() {
        let mut negotiator = ConnectionNegotiator::new();
        negotiator.on_discovery_requested();

        negotiator.on_discovery_failed();
        assert_eq!(negotiator.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_group_owner_role() {
        let (mut negotiator, _) = negotiating(peer(1));

        let t = negotiator.on_connected(formed(true), None).unwrap();
        assert_eq!(t.to, ConnectionState::Connected(GroupRole::GroupOwner));
        assert_eq!(t.directive, Some(RoleDirective::Listen));
    }

    #[test]
    fn test_client_role() {
        let (mut negotiator, _) = negotiating(peer(1));

        let t = negotiator.on_connected(formed(false), Some(peer(1))).unwrap();
        assert_eq!(t.to, ConnectionState::Connected(GroupRole::Client));
        assert_eq!(
            t.directive,
            Some(RoleDirective::ConnectTo(Some(IpAddr::V4(Ipv4Addr::new(192, 168, 49, 1)))))
        );
        assert_eq!(negotiator.status().peer, Some(peer(1)));
    }

    #[test]
    fn test_unformed_group_keeps_negotiating() {
        let (mut negotiator, _) = negotiating(peer(1));

        let info = ConnectionInfo {
            group_formed: false,
            is_group_owner: true,
            group_owner_address: None,
        };
        assert!(negotiator.on_connected(info, None).is_none());
        assert_eq!(negotiator.state(), ConnectionState::Negotiating);

        // Follow-up completes the negotiation
        assert!(negotiator.on_connected(formed(true), None).is_some());
    }

    #[test]
    fn test_disconnect_from_any_state() {
        let mut negotiator = ConnectionNegotiator::new();
        assert!(negotiator.on_disconnected().is_some());
        assert!(negotiator.on_disconnected().is_none());

        negotiator.on_discovery_requested();
        negotiator.on_disconnected();
        assert_eq!(negotiator.state(), ConnectionState::Disconnected);

        let (mut negotiator, _) = negotiating(peer(1));
        negotiator.on_connected(formed(true), None);
        negotiator.on_disconnected();
        assert_eq!(negotiator.state(), ConnectionState::Disconnected);
        assert!(negotiator.attempt().is_none());
    }

    #[test]
    fn test_new_connect_supersedes_negotiation() {
        let (mut negotiator, first) = negotiating(peer(1));

        let started = negotiator.begin_connect(peer(2), Instant::now() + Duration::from_secs(45));
        assert_eq!(started.superseded.map(|a| a.id), Some(first));
        assert_eq!(negotiator.state(), ConnectionState::ConnectRequested);

        // The late callback of the first attempt is stale
        let stale = negotiator.on_connect_result(first, Ok(()));
        assert!(matches!(stale.result, Err(P2pError::ConnectFailed(_))));
        assert!(stale.transition.is_none());

        negotiator.on_connect_result(started.attempt, Ok(())).result.unwrap();

        // Notifications about the first peer are ignored
        assert!(negotiator.on_connected(formed(true), Some(peer(1))).is_none());
        assert_eq!(negotiator.state(), ConnectionState::Negotiating);

        let t = negotiator.on_connected(formed(true), Some(peer(2))).unwrap();
        assert_eq!(t.to, ConnectionState::Connected(GroupRole::GroupOwner));
    }

    #[test]
    fn test_rejected_connect_returns_to_idle() {
        let mut negotiator = ConnectionNegotiator::new();
        negotiator.on_discovery_requested();
        let started = negotiator.begin_connect(peer(1), Instant::now() + Duration::from_secs(45));

        let outcome = negotiator.on_connect_result(started.attempt, Err(RadioFailure::new("busy")));
        assert_eq!(outcome.result, Err(P2pError::ConnectFailed("busy".to_string())));
        assert_eq!(outcome.transition.map(|t| t.to), Some(ConnectionState::Idle));
        assert!(negotiator.attempt().is_none());
    }

    #[test]
    fn test_inbound_connection_without_attempt() {
        let mut negotiator = ConnectionNegotiator::new();

        let t = negotiator.on_connected(formed(false), Some(peer(3))).unwrap();
        assert_eq!(t.to, ConnectionState::Connected(GroupRole::Client));
        assert_eq!(negotiator.status().peer, Some(peer(3)));
    }

    #[test]
    fn test_epoch_moves_with_each_connection() {
        let mut negotiator = ConnectionNegotiator::new();
        let initial = negotiator.epoch();

        negotiator.begin_connect(peer(1), Instant::now() + Duration::from_secs(45));
        let first = negotiator.epoch();
        assert_ne!(first, initial);

        negotiator.begin_connect(peer(2), Instant::now() + Duration::from_secs(45));
        let second = negotiator.epoch();
        assert_ne!(second, first);

        negotiator.on_disconnected();
        assert_ne!(negotiator.epoch(), second);

        // Reading the status does not end anything
        let current = negotiator.epoch();
        negotiator.status();
        assert_eq!(negotiator.epoch(), current);
    }

    #[test]
    fn test_deadline_only_while_pending() {
        let start = Instant::now();
        let (mut negotiator, _) = negotiating(peer(1));

        assert!(negotiator.on_deadline(start + Duration::from_secs(10)).is_none());
        let t = negotiator.on_deadline(start + Duration::from_secs(46)).unwrap();
        assert_eq!(t.to, ConnectionState::Disconnected);
        assert!(negotiator.deadline().is_none());

        let (mut negotiator, _) = negotiating(peer(1));
        negotiator.on_connected(formed(true), None);
        assert!(negotiator.deadline().is_none());
        assert!(negotiator.on_deadline(start + Duration::from_secs(100)).is_none());
    }
}
