use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::BOOTLOADER_NAME_MARKER;
use crate::error::TransportError;

/// nRF Legacy DFU service & characteristic UUIDs
///
/// from [Legacy DFU Service](https://infocenter.nordicsemi.com/topic/sdk_nrf5_v11.0.0/bledfu_transport_bleservice.html)
/// and [Buttonless DFU Service](https://infocenter.nordicsemi.com/topic/sdk_nrf5_v17.1.0/service_dfu.html)
pub mod dfu_uuids {
    /// Legacy DFU Service
    pub const SERVICE: uuid::Uuid = uuid::Uuid::from_u128(0x00001530_1212_EFDE_1523_785FEABCD123);
    /// Control Point Characteristic
    pub const CTRL_PT: uuid::Uuid = uuid::Uuid::from_u128(0x00001531_1212_EFDE_1523_785FEABCD123);
    /// Packet Characteristic
    pub const PACKET: uuid::Uuid = uuid::Uuid::from_u128(0x00001532_1212_EFDE_1523_785FEABCD123);
    /// DFU Version Characteristic
    pub const VERSION: uuid::Uuid = uuid::Uuid::from_u128(0x00001534_1212_EFDE_1523_785FEABCD123);
    /// Buttonless DFU trigger Characteristic
    pub const BTTNLSS: uuid::Uuid = uuid::Uuid::from_u128(0x8EC90001_F315_4F60_9FB8_838830DAEA50);
}

/// Transport-level peer address.
#[derive(Debug, Clone)]
pub enum PeerAddress {
    /// Stable 48-bit hardware address, most significant byte first.
    Hardware([u8; 6]),
    /// Platform-assigned identifier (CoreBluetooth UUID and friends).
    Platform(String),
}

impl PeerAddress {
    /// Parse `AA:BB:CC:DD:EE:FF`; anything else is kept as a platform identifier.
    pub fn parse(s: &str) -> PeerAddress {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() == 6 {
            let mut bytes = [0u8; 6];
            let parsed = parts
                .iter()
                .zip(bytes.iter_mut())
                .all(|(p, b)| p.len() == 2 && u8::from_str_radix(p, 16).map(|v| *b = v).is_ok());
            if parsed {
                return PeerAddress::Hardware(bytes);
            }
        }
        PeerAddress::Platform(s.trim().to_string())
    }

    /// Address the Nordic bootloader advertises under after a reboot.
    ///
    /// Hardware addresses get their last byte incremented (wrapping at 0xFF);
    /// platform identifiers survive the reboot unchanged.
    pub fn bootloader_successor(&self) -> PeerAddress {
        match self {
            PeerAddress::Hardware(bytes) => {
                let mut next = *bytes;
                next[5] = next[5].wrapping_add(1);
                PeerAddress::Hardware(next)
            }
            PeerAddress::Platform(id) => PeerAddress::Platform(id.clone()),
        }
    }
}

impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PeerAddress::Hardware(a), PeerAddress::Hardware(b)) => a == b,
            (PeerAddress::Platform(a), PeerAddress::Platform(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        }
    }
}

impl Eq for PeerAddress {}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddress::Hardware(b) => write!(
                f,
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                b[0], b[1], b[2], b[3], b[4], b[5]
            ),
            PeerAddress::Platform(id) => f.write_str(id),
        }
    }
}

/// One peripheral as observed by one scan.
///
/// Only connect to an identity taken from a scan that started after the
/// peripheral last rebooted or dropped its link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralIdentity {
    pub address: PeerAddress,
    /// Name from the advertisement (or the platform's name cache).
    pub name: Option<String>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
}

impl PeripheralIdentity {
    pub fn new(address: PeerAddress, name: Option<String>, services: Vec<Uuid>) -> Self {
        PeripheralIdentity {
            address,
            name,
            services,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("unknown")
    }

    /// Advertised name contains the bootloader marker.
    pub fn name_suggests_bootloader(&self) -> bool {
        name_has_bootloader_marker(self.name.as_deref())
    }

    pub fn advertises_dfu_service(&self) -> bool {
        self.services.contains(&dfu_uuids::SERVICE)
    }
}

pub fn name_has_bootloader_marker(name: Option<&str>) -> bool {
    name.map(|n| n.to_ascii_uppercase().contains(BOOTLOADER_NAME_MARKER))
        .unwrap_or(false)
}

/// Per-link disconnect flag, set by the transport when the peer drops.
#[derive(Debug, Clone, Default)]
pub struct DisconnectObserver(Arc<AtomicBool>);

impl DisconnectObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify_disconnected(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_disconnected(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// GATT write flavour.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WriteMode {
    /// Write request, acknowledged by the peer.
    Acknowledged,
    /// Write command, no acknowledgment.
    Unacknowledged,
}

/// Receives every notification of a subscribed characteristic.
pub type NotifyFn = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// BLE central: discovery and link creation
#[async_trait]
pub trait BleTransport: Send + Sync {
    type Link: BleLink;

    /// Peripherals advertising during a scan window of `duration`.
    async fn scan(&self, duration: Duration) -> Result<Vec<PeripheralIdentity>, TransportError>;

    /// Open a link. `observer` must be armed before the connection is made
    /// and stays attached to the returned link.
    async fn connect(
        &self,
        peer: &PeripheralIdentity,
        timeout: Duration,
        observer: DisconnectObserver,
    ) -> Result<Self::Link, TransportError>;
}

/// One live GATT link
#[async_trait]
pub trait BleLink: Send + Sync {
    fn observer(&self) -> &DisconnectObserver;
    async fn is_connected(&self) -> bool;
    /// Services found by discovery after connect.
    fn services(&self) -> Vec<Uuid>;
    fn has_characteristic(&self, chr: Uuid) -> bool;
    async fn read(&self, chr: Uuid) -> Result<Vec<u8>, TransportError>;
    async fn write(&self, chr: Uuid, bytes: &[u8], mode: WriteMode) -> Result<(), TransportError>;
    async fn subscribe(&self, chr: Uuid, on_notify: NotifyFn) -> Result<(), TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
}
