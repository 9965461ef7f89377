//! End-to-end DFU session: package, bootloader transition, connection,
//! engine sequence and teardown.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::bootloader::{find_rebooted_target, is_already_in_bootloader, trigger_reboot, Matcher};
use crate::config::DfuOptions;
use crate::error::{DfuError, DfuResult, TransportError};
use crate::package::{read_package, FirmwarePackage};
use crate::protocol::{ImageType, LegacyDfu};
use crate::report::{Callbacks, Reporter};
use crate::supervisor::{connect_with_retry, disconnect_quietly, LiveLink};
use crate::transport::dfu_uuids::SERVICE;
use crate::transport::{BleLink, BleTransport, PeerAddress, PeripheralIdentity};

/// Which peripheral to update.
#[derive(Debug, Clone)]
pub enum Target {
    /// An advertisement picked from an earlier scan.
    Identity(PeripheralIdentity),
    /// A bare address, resolved with a scan first.
    Address(String),
}

impl From<PeripheralIdentity> for Target {
    fn from(identity: PeripheralIdentity) -> Self {
        Target::Identity(identity)
    }
}

/// Cooperative cancellation shared between a session and its caller.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        CancelSignal { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// One firmware update against one peripheral.
pub struct DfuSession<'t, T: BleTransport> {
    transport: &'t T,
    options: DfuOptions,
    reporter: Reporter,
    cancel: CancelSignal,
}

impl<'t, T: BleTransport> DfuSession<'t, T> {
    pub fn new(transport: &'t T, options: DfuOptions) -> Self {
        DfuSession {
            transport,
            options,
            reporter: Reporter::silent(),
            cancel: CancelSignal::new(),
        }
    }

    pub fn callbacks(mut self, callbacks: Callbacks) -> Self {
        self.reporter = Reporter::new(callbacks);
        self
    }

    pub fn cancel_signal(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Flash the application image in `package_path` onto `target`.
    ///
    /// Whatever the outcome, an open link is disconnected before returning.
    pub async fn run(&self, package_path: impl AsRef<Path>, target: Target) -> DfuResult<()> {
        if self.cancel.is_cancelled() {
            return Err(DfuError::Cancelled);
        }
        let package = read_package(package_path)?;
        self.describe(&package);
        let image_size = u32::try_from(package.firmware.len()).map_err(|_| {
            DfuError::MalformedPackage(format!(
                "firmware image too large: {} bytes",
                package.firmware.len()
            ))
        })?;

        let live = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DfuError::Cancelled),
            live = self.reach_bootloader(target) => live?,
        };

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DfuError::Cancelled),
            done = self.update(&live, &package, image_size) => done,
        };
        disconnect_quietly(&live.link).await;

        match &outcome {
            Ok(()) => self
                .reporter
                .info("DFU complete, device is rebooting into the new firmware."),
            Err(DfuError::Cancelled) => self.reporter.warn("DFU cancelled."),
            Err(_) => {}
        }
        outcome
    }

    fn describe(&self, package: &FirmwarePackage) {
        self.reporter.info(&format!(
            "Firmware: {} ({} bytes)",
            package.bin_file,
            package.firmware.len()
        ));
        self.reporter
            .info(&format!("Init packet: {} bytes", package.init_packet.len()));
        if let Some(crc) = package.expected_crc16 {
            self.reporter.info(&format!("Firmware CRC16: 0x{:04X}", crc));
        }
        if let Some(version) = package.application_version {
            self.reporter.info(&format!("Application version: {}", version));
        }
    }

    /// Turn an address string into a live advertisement.
    async fn resolve(&self, address: &str) -> DfuResult<PeripheralIdentity> {
        let timings = &self.options.timings;
        let wanted = PeerAddress::parse(address);
        self.reporter.info(&format!("Scanning for device {}...", wanted));
        for attempt in 1..=timings.resolve_attempts {
            let seen = self.transport.scan(timings.resolve_scan_duration).await?;
            if let Some(found) = seen.into_iter().find(|p| p.address == wanted) {
                self.reporter
                    .info(&format!("Found {} ({})", found.display_name(), found.address));
                return Ok(found);
            }
            if attempt < timings.resolve_attempts {
                self.reporter.info(&format!(
                    "Device not found (attempt {}/{}), retrying...",
                    attempt, timings.resolve_attempts
                ));
                tokio::time::sleep(timings.resolve_retry_pause).await;
            }
        }
        Err(DfuError::DeviceNotFound(format!(
            "no device with address {} after {} scans",
            wanted, timings.resolve_attempts
        )))
    }

    /// Get a stable link to the peripheral's bootloader, rebooting it first
    /// when it still runs application firmware.
    async fn reach_bootloader(&self, target: Target) -> DfuResult<LiveLink<T::Link>> {
        let timings = &self.options.timings;
        let identity = match target {
            Target::Identity(identity) => identity,
            Target::Address(address) => self.resolve(&address).await?,
        };

        let dfu_target = if is_already_in_bootloader(self.transport, &identity, timings, &self.reporter).await? {
            identity
        } else if trigger_reboot(self.transport, &identity, timings, &self.reporter).await? {
            self.reporter.info("Waiting for device to reboot into DFU mode...");
            tokio::time::sleep(timings.reboot_settle).await;
            let found = find_rebooted_target(
                self.transport,
                &identity.address,
                timings.reboot_search_deadline,
                timings,
                &self.reporter,
            )
            .await?;
            self.reporter.info(&format!(
                "Found DFU target: {} ({})",
                found.display_name(),
                found.address
            ));
            found
        } else {
            identity
        };

        self.reporter.info("Connecting to DFU target...");
        let matchers = [
            Matcher::Address(dfu_target.address.clone()),
            Matcher::BootloaderName,
        ];
        connect_with_retry(
            self.transport,
            &matchers,
            timings.connect_attempts,
            timings,
            &self.reporter,
        )
        .await
    }

    async fn update(
        &self,
        live: &LiveLink<T::Link>,
        package: &FirmwarePackage,
        image_size: u32,
    ) -> DfuResult<()> {
        let link = &live.link;
        if !link.services().contains(&SERVICE) {
            return Err(DfuError::ServiceNotFound);
        }

        let mut dfu = LegacyDfu::new(link, &self.reporter, &self.options.timings);
        match dfu.read_version().await {
            Ok((major, minor)) => self
                .reporter
                .info(&format!("DFU bootloader version: {}.{}", major, minor)),
            Err(e) => self
                .reporter
                .warn(&format!("Could not read DFU version: {}", e)),
        }

        dfu.subscribe().await?;
        if live.observer().is_disconnected() || !link.is_connected().await {
            return Err(TransportError::disconnected("device disconnected before DFU could start").into());
        }

        self.reporter.info("Starting DFU...");
        dfu.start_dfu(image_size, ImageType::Application).await?;
        self.reporter.info("Sending init packet...");
        dfu.init_dfu(&package.init_packet).await?;
        dfu.send_firmware(&package.firmware, self.options.prn).await?;
        self.reporter.info("Activating new firmware...");
        dfu.activate_and_reset().await
    }
}

/// Run a complete update with default cancellation.
pub async fn perform_dfu<T: BleTransport>(
    transport: &T,
    package_path: impl AsRef<Path>,
    target: Target,
    options: DfuOptions,
    callbacks: Callbacks,
) -> DfuResult<()> {
    DfuSession::new(transport, options)
        .callbacks(callbacks)
        .run(package_path, target)
        .await
}

/// Named peripherals seen during one scan, strongest candidates first.
pub async fn scan_for_devices<T: BleTransport>(
    transport: &T,
    duration: Duration,
) -> DfuResult<Vec<PeripheralIdentity>> {
    let mut named: Vec<PeripheralIdentity> = transport
        .scan(duration)
        .await?
        .into_iter()
        .filter(|p| p.name.is_some())
        .collect();
    named.sort_by_key(|p| !(p.name_suggests_bootloader() || p.advertises_dfu_service()));
    Ok(named)
}
