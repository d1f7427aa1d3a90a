use shared::types::{ConnectionInfo, Device, DeviceAddress};

/// State-change notifications pushed by the radio service.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    RadioStateChanged {
        enabled: bool,
    },
    /// The peer list changed; the current list must be requested
    PeerListChanged,
    ConnectionStateChanged {
        connected: bool,
        /// Group details when the radio delivers them inline. When absent on a
        /// connected notification they are requested separately.
        info: Option<ConnectionInfo>,
        /// Peer the notification refers to, when the radio knows it
        peer: Option<DeviceAddress>,
    },
    LocalDeviceChanged(Device),
    /// A kind this build does not understand
    Unknown(String),
}

impl Notification {
    pub fn kind(&self) -> &str {
        match self {
            Notification::RadioStateChanged { .. } => "radio-state-changed",
            Notification::PeerListChanged => "peer-list-changed",
            Notification::ConnectionStateChanged { .. } => "connection-state-changed",
            Notification::LocalDeviceChanged(_) => "local-device-changed",
            Notification::Unknown(kind) => kind,
        }
    }
}

/// Owner of the components a notification is routed to.
///
/// Handlers run on the dispatch context and must not block: anything that
/// needs the radio is issued as a fire-and-forget call.
pub trait NotificationSink {
    fn on_radio_state_changed(&mut self, enabled: bool);
    fn on_peer_list_changed(&mut self);
    fn on_connection_state_changed(
        &mut self,
        connected: bool,
        info: Option<ConnectionInfo>,
        peer: Option<DeviceAddress>,
    );
    fn on_local_device_changed(&mut self, device: Device);
}

/// Route one notification to its handler before returning.
pub fn dispatch<S: NotificationSink + ?Sized>(sink: &mut S, notification: Notification) {
    tracing::trace!("Notification: {}", notification.kind());

    match notification {
        Notification::RadioStateChanged { enabled } => sink.on_radio_state_changed(enabled),
        Notification::PeerListChanged => sink.on_peer_list_changed(),
        Notification::ConnectionStateChanged { connected, info, peer } => {
            sink.on_connection_state_changed(connected, info, peer)
        }
        Notification::LocalDeviceChanged(device) => sink.on_local_device_changed(device),
        Notification::Unknown(kind) => {
            tracing::debug!("Dropping unknown notification: {}", kind);
        }
    }
}
