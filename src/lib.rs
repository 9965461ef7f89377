//! Nordic Legacy DFU over Bluetooth LE.
//!
//! Updates the application image on nRF5x peripherals running the Legacy
//! (SDK 11 era) bootloader, including the hop from application firmware into
//! the bootloader and back.

pub mod bootloader;
pub mod config;
pub mod error;
pub mod package;
pub mod protocol;
pub mod report;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod transport_btleplug;

#[cfg(test)]
mod test_support;

pub use config::DfuOptions;
pub use error::{DfuError, DfuResult, TransportError, TransportErrorKind};
pub use report::Callbacks;
pub use session::{perform_dfu, scan_for_devices, CancelSignal, DfuSession, Target};
pub use transport::{BleLink, BleTransport, PeerAddress, PeripheralIdentity};
pub use transport_btleplug::BtleplugTransport;
