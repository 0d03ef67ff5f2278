//! # HYPERDESK Discovery
//!
//! Enumerates reachable peers and advertises the local device.
//!
//! When `HYPERDESK_USE_MDNS=1`, discovery browses `_hyperdesk._tcp.local.`
//! and materializes devices from TXT records. On any error, or when the
//! browse comes back empty, it falls back to a deterministic simulated
//! device list so the rest of the stack stays exercisable on networks where
//! multicast is filtered.

#![warn(missing_docs)]
#![warn(clippy::all)]

use hyperdesk_core::models::{Device, PresenceStatus};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

/// mDNS service type for HYPERDESK daemons.
pub const SERVICE_TYPE: &str = "_hyperdesk._tcp.local.";

/// Environment flag enabling real mDNS.
pub const USE_MDNS_ENV: &str = "HYPERDESK_USE_MDNS";

/// Names used by the simulated fallback, in address order from
/// `192.168.1.100`.
const SIMULATED_NAMES: [&str; 5] = [
    "MYLAPTOP2",
    "ALIENWAREPC",
    "IPAD",
    "SAMSUNGFLIP3",
    "WORKSTATION",
];

/// Discovery errors.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// mDNS daemon failure
    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),
}

/// The local device's `(hostname, ip)` pair, with loopback fallbacks.
#[must_use]
pub fn local_identity() -> (String, String) {
    let name = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "hyperdesk".to_string());
    let ip = local_ip_address::local_ip()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string());
    (name, ip)
}

/// Build the local device record for this process.
#[must_use]
pub fn build_local_device() -> Device {
    let (name, ip) = local_identity();
    Device {
        id: uuid::Uuid::new_v4().to_string(),
        name,
        ip,
        status: PresenceStatus::Local,
        capabilities: vec!["hyperbox".to_string(), "requests".to_string()],
    }
}

/// Peer enumeration with optional mDNS support.
#[derive(Clone)]
pub struct NetworkDiscovery {
    use_mdns: bool,
}

impl Default for NetworkDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkDiscovery {
    /// Create a discovery service, reading [`USE_MDNS_ENV`] for the mode.
    #[must_use]
    pub fn new() -> Self {
        let use_mdns = std::env::var(USE_MDNS_ENV).map(|v| v == "1").unwrap_or(false);
        Self { use_mdns }
    }

    /// Create a discovery service with an explicit mode.
    #[must_use]
    pub fn with_mode(use_mdns: bool) -> Self {
        Self { use_mdns }
    }

    /// Whether real mDNS browsing is enabled.
    #[must_use]
    pub fn use_mdns(&self) -> bool {
        self.use_mdns
    }

    /// Enumerate up to `limit` reachable devices, browsing for `timeout`.
    ///
    /// Errors and empty browses are not surfaced; the simulated list is the
    /// answer of last resort.
    #[must_use]
    pub fn scan(&self, limit: usize, timeout: Duration) -> Vec<Device> {
        if self.use_mdns {
            match browse(timeout) {
                Ok(devices) if !devices.is_empty() => {
                    return devices.into_iter().take(limit).collect();
                }
                Ok(_) => tracing::debug!("mDNS browse found no peers, using fallback"),
                Err(error) => tracing::warn!("mDNS browse failed ({error}), using fallback"),
            }
        }
        simulated_devices(limit)
    }
}

/// Browse [`SERVICE_TYPE`] for `timeout` and collect resolved services.
fn browse(timeout: Duration) -> Result<Vec<Device>, DiscoveryError> {
    let daemon = ServiceDaemon::new()?;
    let receiver = daemon.browse(SERVICE_TYPE)?;
    let deadline = Instant::now() + timeout;
    let mut devices = Vec::new();

    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match receiver.recv_timeout(remaining) {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                if let Some(device) = device_from_info(&info) {
                    devices.push(device);
                }
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    let _ = daemon.stop_browse(SERVICE_TYPE);
    let _ = daemon.shutdown();
    Ok(devices)
}

/// Materialize a device from a resolved mDNS service.
fn device_from_info(info: &ServiceInfo) -> Option<Device> {
    let ip = info
        .get_addresses()
        .iter()
        .find_map(|addr| match addr {
            IpAddr::V4(v4) => Some(v4.to_string()),
            IpAddr::V6(_) => None,
        })
        .unwrap_or_else(|| "0.0.0.0".to_string());

    let name = info
        .get_property_val_str("name")
        .map(str::to_owned)
        .unwrap_or_else(|| {
            info.get_fullname()
                .split('.')
                .next()
                .unwrap_or_default()
                .to_string()
        });
    if name.is_empty() {
        return None;
    }

    let id = info
        .get_property_val_str("device_id")
        .map(str::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let capabilities = info
        .get_property_val_str("capabilities")
        .unwrap_or_default()
        .split(',')
        .filter(|c| !c.is_empty())
        .map(str::to_owned)
        .collect();

    Some(Device {
        id,
        name,
        ip,
        status: PresenceStatus::Online,
        capabilities,
    })
}

/// Deterministic fallback: the local host plus five named devices on
/// `192.168.1.100`–`104`.
#[must_use]
pub fn simulated_devices(limit: usize) -> Vec<Device> {
    let mut devices = vec![build_local_device()];
    for (index, name) in SIMULATED_NAMES.iter().enumerate() {
        devices.push(Device {
            id: uuid::Uuid::new_v4().to_string(),
            name: (*name).to_string(),
            ip: format!("192.168.1.{}", 100 + index),
            status: PresenceStatus::Online,
            capabilities: vec!["hyperbox".to_string()],
        });
    }
    devices.truncate(limit);
    devices
}

/// Advertises the local device over mDNS on the control port.
///
/// `start` and `stop` are idempotent so rapid daemon restarts cannot leave a
/// stale registration or double-register.
pub struct ServiceAnnouncer {
    device: Device,
    port: u16,
    daemon: Mutex<Option<ServiceDaemon>>,
}

impl ServiceAnnouncer {
    /// Create an announcer for `device` on `port`.
    #[must_use]
    pub fn new(device: Device, port: u16) -> Self {
        Self {
            device,
            port,
            daemon: Mutex::new(None),
        }
    }

    /// The full mDNS instance name of this device's record.
    #[must_use]
    pub fn instance_fullname(&self) -> String {
        format!("{}-{}.{}", self.device.name, self.device.id, SERVICE_TYPE)
    }

    /// Register the service record. A second call while registered is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon cannot start or the record is invalid.
    pub fn start(&self) -> Result<(), DiscoveryError> {
        let mut guard = self.daemon.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return Ok(());
        }
        let daemon = ServiceDaemon::new()?;
        let mut properties = HashMap::new();
        properties.insert("device_id".to_string(), self.device.id.clone());
        properties.insert("name".to_string(), self.device.name.clone());
        properties.insert(
            "capabilities".to_string(),
            self.device.capabilities.join(","),
        );
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            &format!("{}-{}", self.device.name, self.device.id),
            &format!("{}.local.", self.device.name),
            self.device.ip.as_str(),
            self.port,
            properties,
        )?;
        daemon.register(info)?;
        tracing::info!("announcing {} on port {}", self.instance_fullname(), self.port);
        *guard = Some(daemon);
        Ok(())
    }

    /// Unregister and shut the daemon down. A call while stopped is a no-op.
    pub fn stop(&self) {
        let mut guard = self.daemon.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(daemon) = guard.take() {
            let _ = daemon.unregister(&self.instance_fullname());
            let _ = daemon.shutdown();
        }
    }
}
