//! Application-to-bootloader transition: detection, reboot trigger, and
//! re-discovery of the peripheral under its bootloader identity.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::time::Instant;

use crate::config::Timings;
use crate::error::{DfuError, DfuResult};
use crate::protocol::{ImageType, OpCode};
use crate::report::Reporter;
use crate::supervisor::{connect_with_retry, disconnect_quietly};
use crate::transport::dfu_uuids::*;
use crate::transport::{BleLink, BleTransport, PeerAddress, PeripheralIdentity, WriteMode};

/// One way of recognising a peripheral in a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// Advertises under exactly this address.
    Address(PeerAddress),
    /// Live advertised name carries the bootloader marker.
    BootloaderName,
    /// Advertises the Legacy DFU service.
    DfuService,
}

impl Matcher {
    pub fn matches(&self, seen: &PeripheralIdentity) -> bool {
        match self {
            Matcher::Address(addr) => seen.address == *addr,
            Matcher::BootloaderName => seen.name_suggests_bootloader(),
            Matcher::DfuService => seen.advertises_dfu_service(),
        }
    }
}

/// First observation, in scan order, accepted by any matcher.
pub fn first_match<'a, 'm>(
    matchers: &'m [Matcher],
    seen: &'a [PeripheralIdentity],
) -> Option<(&'a PeripheralIdentity, &'m Matcher)> {
    seen.iter()
        .find_map(|p| matchers.iter().find(|m| m.matches(p)).map(|m| (p, m)))
}

/// Heuristics for the peripheral that used to be at `original`.
pub fn rebooted_target_matchers(original: &PeerAddress) -> Vec<Matcher> {
    vec![
        Matcher::Address(original.bootloader_successor()),
        Matcher::BootloaderName,
        Matcher::DfuService,
    ]
}

/// Check with a fresh scan whether `identity` already runs its bootloader.
///
/// When the peripheral does not show up at all, its earlier name is used as
/// a weak hint so a bootloader that paused advertising is not rebooted again.
pub async fn is_already_in_bootloader<T: BleTransport>(
    transport: &T,
    identity: &PeripheralIdentity,
    timings: &Timings,
    reporter: &Reporter,
) -> DfuResult<bool> {
    let mut fresh = None;
    for attempt in 0..timings.detect_scan_attempts {
        let seen = transport.scan(timings.detect_scan_duration).await?;
        fresh = seen.into_iter().find(|p| p.address == identity.address);
        if fresh.is_some() {
            break;
        }
        if attempt + 1 < timings.detect_scan_attempts {
            tokio::time::sleep(timings.detect_retry_pause).await;
        }
    }

    match fresh {
        Some(live) => {
            if live.name_suggests_bootloader() || live.advertises_dfu_service() {
                reporter.info("Device is already in DFU bootloader mode, skipping trigger.");
                return Ok(true);
            }
            let name = live.name.as_deref().or(identity.name.as_deref()).unwrap_or("unknown");
            reporter.info(&format!("Device '{}' is in application mode.", name));
            Ok(false)
        }
        None if identity.name_suggests_bootloader() => {
            reporter.info("Device not visible in scan but name suggests DFU mode, skipping trigger.");
            Ok(true)
        }
        None => {
            reporter.info("Device not visible in scan, attempting bootloader trigger anyway...");
            Ok(false)
        }
    }
}

/// Ask application firmware to reboot into its bootloader.
///
/// Returns `false` when the peripheral offers no trigger (manual reset needed).
pub async fn trigger_reboot<T: BleTransport>(
    transport: &T,
    identity: &PeripheralIdentity,
    timings: &Timings,
    reporter: &Reporter,
) -> DfuResult<bool> {
    let matchers = [Matcher::Address(identity.address.clone())];
    let live = connect_with_retry(
        transport,
        &matchers,
        timings.trigger_connect_attempts,
        timings,
        reporter,
    )
    .await?;
    let outcome = fire_trigger(&live.link, reporter).await;
    disconnect_quietly(&live.link).await;
    outcome
}

async fn fire_trigger<L: BleLink>(link: &L, reporter: &Reporter) -> DfuResult<bool> {
    let (chr, payload) = if link.has_characteristic(BTTNLSS) {
        reporter.info("Found Buttonless DFU characteristic, triggering...");
        (BTTNLSS, vec![0x01])
    } else if link.has_characteristic(CTRL_PT) {
        reporter.info("Found Legacy DFU service, sending reboot command...");
        (CTRL_PT, vec![OpCode::StartDfu.into(), ImageType::Application.into()])
    } else {
        reporter.info("No DFU trigger characteristic found, assuming manual reset or already in bootloader.");
        return Ok(false);
    };

    // the trigger only answers on an enabled CCCD
    let sent = match link.subscribe(chr, Arc::new(|_: Vec<u8>| {})).await {
        Ok(()) => link.write(chr, &payload, WriteMode::Acknowledged).await,
        Err(e) => Err(e),
    };
    match sent {
        Ok(()) => reporter.info("Reboot trigger accepted."),
        Err(e) if e.is_disconnect() || link.observer().is_disconnected() => {
            debug!("trigger write ended the link: {}", e);
            reporter.info("Reboot trigger accepted (device disconnected as expected).");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(true)
}

/// Scan until the rebooted peripheral shows up or `deadline` passes.
pub async fn find_rebooted_target<T: BleTransport>(
    transport: &T,
    original: &PeerAddress,
    deadline: Duration,
    timings: &Timings,
    reporter: &Reporter,
) -> DfuResult<PeripheralIdentity> {
    let matchers = rebooted_target_matchers(original);
    let until = Instant::now() + deadline;
    let mut round = 0;
    while Instant::now() < until {
        match transport.scan(timings.reboot_scan_duration).await {
            Ok(seen) => {
                if let Some((found, matcher)) = first_match(&matchers, &seen) {
                    debug!("{} matched by {:?}", found.address, matcher);
                    return Ok(found.clone());
                }
            }
            Err(e) => warn!("scan failed while looking for the bootloader: {}", e),
        }
        round += 1;
        reporter.info(&format!("Scan {}: DFU target not found yet, retrying...", round));
        tokio::time::sleep(timings.reboot_poll_interval).await;
    }
    Err(DfuError::DeviceNotFound(format!(
        "DFU target not found after {:?}",
        deadline
    )))
}
