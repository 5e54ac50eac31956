//! Network reachability
//!
//! Hosts that know their connection state feed it into a
//! [`ConnectionMonitor`]; hosts that don't use [`AssumeReachable`]. A
//! dispatch is attempted unless the probe positively reports no
//! connection.

use std::sync::RwLock;

/// Best-effort connectivity check consulted before each dispatch
pub trait ReachabilityProbe: Send + Sync {
    /// False only when the platform reports no connection
    fn is_reachable(&self) -> bool;
}

/// Probe for platforms without a connectivity signal
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeReachable;

impl ReachabilityProbe for AssumeReachable {
    fn is_reachable(&self) -> bool {
        true
    }
}

/// Connection classes a platform may report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Unknown,
    Ethernet,
    Wifi,
    Cell2g,
    Cell3g,
    Cell4g,
    /// Cellular of unspecified generation
    Cell,
    None,
}

impl ConnectionType {
    /// Wired, local wireless and cellular data count as reachable
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionType::Ethernet
                | ConnectionType::Wifi
                | ConnectionType::Cell2g
                | ConnectionType::Cell3g
                | ConnectionType::Cell4g
                | ConnectionType::Cell
        )
    }

    /// Parse the names platforms commonly report (`wifi`, `4g`, `none`, ...)
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "ethernet" | "wired" => ConnectionType::Ethernet,
            "wifi" | "wlan" => ConnectionType::Wifi,
            "2g" | "cell_2g" => ConnectionType::Cell2g,
            "3g" | "cell_3g" => ConnectionType::Cell3g,
            "4g" | "cell_4g" => ConnectionType::Cell4g,
            "cell" | "cellular" => ConnectionType::Cell,
            "none" | "offline" => ConnectionType::None,
            _ => ConnectionType::Unknown,
        }
    }
}

/// Probe driven by connection updates pushed from the host
///
/// Until the first update there is no signal and the probe reports
/// reachable.
#[derive(Debug, Default)]
pub struct ConnectionMonitor {
    current: RwLock<Option<ConnectionType>>,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the connection the platform currently reports
    pub fn update(&self, connection: ConnectionType) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        if *current != Some(connection) {
            tracing::debug!(?connection, "Connection changed");
        }
        *current = Some(connection);
    }

    /// Last reported connection, if any
    pub fn current(&self) -> Option<ConnectionType> {
        *self.current.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl ReachabilityProbe for ConnectionMonitor {
    fn is_reachable(&self) -> bool {
        match self.current() {
            None => true,
            Some(connection) => connection.is_connected(),
        }
    }
}

impl<P: ReachabilityProbe + ?Sized> ReachabilityProbe for std::sync::Arc<P> {
    fn is_reachable(&self) -> bool {
        (**self).is_reachable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assume_reachable() {
        assert!(AssumeReachable.is_reachable());
    }

    #[test]
    fn test_monitor_without_signal_is_optimistic() {
        assert!(ConnectionMonitor::new().is_reachable());
    }

    #[test]
    fn test_monitor_follows_updates() {
        let monitor = ConnectionMonitor::new();

        monitor.update(ConnectionType::None);
        assert!(!monitor.is_reachable());

        monitor.update(ConnectionType::Cell3g);
        assert!(monitor.is_reachable());

        monitor.update(ConnectionType::Unknown);
        assert!(!monitor.is_reachable());
        assert_eq!(monitor.current(), Some(ConnectionType::Unknown));
    }

    #[test]
    fn test_connection_classes() {
        for connected in [
            ConnectionType::Ethernet,
            ConnectionType::Wifi,
            ConnectionType::Cell2g,
            ConnectionType::Cell4g,
            ConnectionType::Cell,
        ] {
            assert!(connected.is_connected(), "{connected:?}");
        }
        assert!(!ConnectionType::None.is_connected());
    }

    #[test]
    fn test_from_name() {
        assert_eq!(ConnectionType::from_name("WiFi"), ConnectionType::Wifi);
        assert_eq!(ConnectionType::from_name("4g"), ConnectionType::Cell4g);
        assert_eq!(ConnectionType::from_name("offline"), ConnectionType::None);
        assert_eq!(ConnectionType::from_name("bluetooth"), ConnectionType::Unknown);
    }
}
