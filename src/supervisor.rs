//! Connection establishment with fresh discovery, stability checks and retries.

use log::debug;

use crate::bootloader::{first_match, Matcher};
use crate::config::{Timings, GATT_OP_TIMEOUT};
use crate::error::{DfuError, DfuResult};
use crate::report::Reporter;
use crate::transport::{BleLink, BleTransport, DisconnectObserver, PeripheralIdentity};

/// A connected link plus the advertisement it was opened from.
pub struct LiveLink<L> {
    pub link: L,
    pub identity: PeripheralIdentity,
}

impl<L: BleLink> LiveLink<L> {
    pub fn observer(&self) -> &DisconnectObserver {
        self.link.observer()
    }
}

/// Best-effort teardown; failures only reach the debug log.
pub async fn disconnect_quietly<L: BleLink>(link: &L) {
    if let Err(e) = link.disconnect().await {
        debug!("disconnect failed: {}", e);
    }
}

/// Look for a current advertisement accepted by `matchers`.
///
/// Cached identities go stale across reboots, so every connection attempt
/// starts from a new scan.
async fn find_fresh<T: BleTransport>(
    transport: &T,
    matchers: &[Matcher],
    timings: &Timings,
) -> Option<PeripheralIdentity> {
    for attempt in 0..timings.fresh_scan_tries {
        match transport.scan(timings.fresh_scan_duration).await {
            Ok(seen) => {
                if let Some((found, matcher)) = first_match(matchers, &seen) {
                    debug!("fresh advertisement from {} ({:?})", found.address, matcher);
                    return Some(found.clone());
                }
            }
            Err(e) => debug!("scan failed: {}", e),
        }
        if attempt + 1 < timings.fresh_scan_tries {
            tokio::time::sleep(timings.fresh_scan_pause).await;
        }
    }
    None
}

/// Connect to the first peripheral accepted by `matchers`.
///
/// A link that drops right after connecting counts as a failed attempt.
/// Gives up with [`DfuError::ConnectionFailed`] after `max_attempts`.
pub async fn connect_with_retry<T: BleTransport>(
    transport: &T,
    matchers: &[Matcher],
    max_attempts: usize,
    timings: &Timings,
    reporter: &Reporter,
) -> DfuResult<LiveLink<T::Link>> {
    let mut reason = String::from("no connection attempt made");

    for attempt in 1..=max_attempts {
        if attempt > 1 {
            let backoff = timings.connect_backoff * attempt as u32;
            reporter.info(&format!(
                "Retry {}/{} in {:.1}s...",
                attempt,
                max_attempts,
                backoff.as_secs_f64()
            ));
            tokio::time::sleep(backoff).await;
        }

        let Some(fresh) = find_fresh(transport, matchers, timings).await else {
            reason = String::from("device not visible in scan");
            reporter.warn(&format!(
                "Device not found in scan (attempt {}/{}).",
                attempt, max_attempts
            ));
            continue;
        };

        // connect plus service discovery, each bounded inside the transport
        let budget = timings.connect_timeout + GATT_OP_TIMEOUT;
        let observer = DisconnectObserver::new();
        let connected = tokio::time::timeout(
            budget,
            transport.connect(&fresh, timings.connect_timeout, observer.clone()),
        )
        .await;

        match connected {
            Ok(Ok(link)) => {
                if observer.is_disconnected() || !link.is_connected().await {
                    disconnect_quietly(&link).await;
                    reason = String::from("device disconnected immediately after connect");
                    reporter.warn(&format!(
                        "Device disconnected immediately after connect (attempt {}/{}).",
                        attempt, max_attempts
                    ));
                    continue;
                }
                reporter.info(&format!("Connected to {}.", fresh.display_name()));
                return Ok(LiveLink {
                    link,
                    identity: fresh,
                });
            }
            Ok(Err(e)) => {
                reason = e.to_string();
                reporter.warn(&format!(
                    "Connection failed: {} (attempt {}/{}).",
                    e, attempt, max_attempts
                ));
                if attempt < max_attempts {
                    tokio::time::sleep(timings.connect_error_pause).await;
                }
            }
            Err(_) => {
                reason = format!("connect timed out after {:?}", budget);
                reporter.warn(&format!(
                    "Connection timed out (attempt {}/{}).",
                    attempt, max_attempts
                ));
            }
        }
    }

    Err(DfuError::ConnectionFailed {
        attempts: max_attempts,
        reason,
    })
}
