use std::num::NonZeroU16;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::{Timings, CHUNK_SIZE};
use crate::error::{DfuError, DfuResult, TransportError};
use crate::report::Reporter;
use crate::transport::dfu_uuids::*;
use crate::transport::{BleLink, WriteMode};

// As defined in nRF5_SDK_11.0.0/components/libraries/bootloader_dfu/dfu_ble_svc.h
// and the Legacy DFU BLE transport (dfu_transport_ble.c)

/// Legacy DFU control point opcodes
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum OpCode {
    StartDfu = 0x01,
    InitDfuParams = 0x02,
    ReceiveFirmwareImage = 0x03,
    ValidateFirmware = 0x04,
    ActivateAndReset = 0x05,
    ReceiptNotifRequest = 0x08,
}

/// First byte of every control point notification
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum Notification {
    Response = 0x10,
    PacketReceipt = 0x11,
}

/// Image type argument of Start DFU
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive)]
#[repr(u8)]
pub enum ImageType {
    SoftDevice = 0x01,
    Bootloader = 0x02,
    SoftDeviceBootloader = 0x03,
    Application = 0x04,
}

/// Response status codes
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
enum ResponseCode {
    Success = 0x01,
    /// Accepted as success; several bootloaders answer Start DFU with it.
    SuccessAlt = 0x02,
    NotSupported = 0x03,
    DataSizeExceedsLimit = 0x04,
    CrcError = 0x05,
    OperationFailed = 0x06,
}

/// Engine phase. Moves forward only; any failure ends in `Failed`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Phase {
    Idle,
    VersionRead,
    Subscribed,
    StartSent,
    StartAcked,
    InitSent,
    InitAcked,
    PrnConfigured,
    Transferring,
    TransferAcked,
    ValidateSent,
    ValidateAcked,
    Activated,
    Terminated,
    Failed,
}

fn status_of(bytes: &[u8]) -> Option<ResponseCode> {
    bytes.get(2).and_then(|s| ResponseCode::try_from(*s).ok())
}

fn is_receipt(bytes: &[u8]) -> bool {
    bytes.first() == Some(&u8::from(Notification::PacketReceipt))
}

/// `[0x10, opcode, status]` with a success status.
fn verify_header(opcode: OpCode, bytes: &[u8]) -> bool {
    bytes.len() >= 3
        && bytes[0] == u8::from(Notification::Response)
        && bytes[1] == u8::from(opcode)
        && matches!(
            status_of(bytes),
            Some(ResponseCode::Success | ResponseCode::SuccessAlt)
        )
}

/// Single-slot mailbox between the notification callback and the engine.
///
/// A newer notification replaces an unconsumed older one.
#[derive(Debug, Default)]
pub struct ResponseMailbox {
    slot: Mutex<Option<Vec<u8>>>,
    wake: Notify,
}

impl ResponseMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called from the transport's notification handler.
    pub fn deliver(&self, bytes: Vec<u8>) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(bytes);
        self.wake.notify_one();
    }

    pub fn clear(&self) {
        self.take();
    }

    fn take(&self) -> Option<Vec<u8>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Return the queued response, or wait for the next one.
    pub async fn wait(&self, timeout: Duration) -> DfuResult<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(rsp) = self.take() {
                return Ok(rsp);
            }
            // a stale permit only costs one extra pass through the loop
            if tokio::time::timeout_at(deadline, self.wake.notified()).await.is_err() {
                return Err(DfuError::ResponseTimeout(timeout));
            }
        }
    }
}

/// Legacy DFU engine for one session over one connected link.
///
/// The link is borrowed; closing it is the caller's job.
pub struct LegacyDfu<'a, L: BleLink> {
    link: &'a L,
    reporter: &'a Reporter,
    timings: &'a Timings,
    mailbox: Arc<ResponseMailbox>,
    phase: Phase,
    offset: usize,
    prn: u16,
}

impl<'a, L: BleLink> LegacyDfu<'a, L> {
    pub fn new(link: &'a L, reporter: &'a Reporter, timings: &'a Timings) -> Self {
        LegacyDfu {
            link,
            reporter,
            timings,
            mailbox: Arc::new(ResponseMailbox::new()),
            phase: Phase::Idle,
            offset: 0,
            prn: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Bytes of the image written so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn expect_phase(&mut self, operation: &'static str, allowed: &[Phase]) -> DfuResult<()> {
        if allowed.contains(&self.phase) {
            return Ok(());
        }
        let phase = format!("{:?}", self.phase);
        self.phase = Phase::Failed;
        Err(DfuError::OutOfSequence { operation, phase })
    }

    fn settle<T>(&mut self, result: DfuResult<T>) -> DfuResult<T> {
        if result.is_err() {
            self.phase = Phase::Failed;
        }
        result
    }

    async fn write_ctrl(&self, bytes: &[u8]) -> DfuResult<()> {
        debug!("control point <- {:02X?}", bytes);
        Ok(self.link.write(CTRL_PT, bytes, WriteMode::Acknowledged).await?)
    }

    async fn write_data(&self, bytes: &[u8]) -> DfuResult<()> {
        Ok(self.link.write(PACKET, bytes, WriteMode::Unacknowledged).await?)
    }

    async fn wait_for_response(&self) -> DfuResult<Vec<u8>> {
        let rsp = self.mailbox.wait(self.timings.response_timeout).await?;
        debug!("control point -> {:02X?}", rsp);
        Ok(rsp)
    }

    /// Read the bootloader's DFU version as `(major, minor)`.
    ///
    /// A failure leaves the engine usable.
    pub async fn read_version(&mut self) -> DfuResult<(u8, u8)> {
        self.expect_phase("read_version", &[Phase::Idle])?;
        let data = self.link.read(VERSION).await?;
        let raw: [u8; 2] = data
            .get(..2)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| TransportError::other(format!("short DFU version value: {data:02X?}")))?;
        let version = u16::from_le_bytes(raw);
        self.phase = Phase::VersionRead;
        Ok(((version >> 8) as u8, (version & 0xFF) as u8))
    }

    /// Enable control point notifications. Must precede every command.
    pub async fn subscribe(&mut self) -> DfuResult<()> {
        self.expect_phase("subscribe", &[Phase::Idle, Phase::VersionRead])?;
        let mailbox = self.mailbox.clone();
        let result = self
            .link
            .subscribe(CTRL_PT, Arc::new(move |bytes| mailbox.deliver(bytes)))
            .await
            .map_err(DfuError::from);
        self.settle(result)?;
        self.phase = Phase::Subscribed;
        Ok(())
    }

    /// Start DFU for an image of `image_size` bytes.
    pub async fn start_dfu(&mut self, image_size: u32, image: ImageType) -> DfuResult<()> {
        self.expect_phase("start_dfu", &[Phase::Subscribed])?;
        let result = self.start_dfu_inner(image_size, image).await;
        self.settle(result)
    }

    async fn start_dfu_inner(&mut self, image_size: u32, image: ImageType) -> DfuResult<()> {
        self.mailbox.clear();
        self.write_ctrl(&[OpCode::StartDfu.into(), image.into()]).await?;
        self.phase = Phase::StartSent;

        // softdevice size, bootloader size, application size
        let mut sizes = Vec::with_capacity(12);
        sizes.extend_from_slice(&0u32.to_le_bytes());
        sizes.extend_from_slice(&0u32.to_le_bytes());
        sizes.extend_from_slice(&image_size.to_le_bytes());
        self.write_data(&sizes).await?;

        let response = self.wait_for_response().await?;
        if !verify_header(OpCode::StartDfu, &response) {
            return Err(DfuError::StartRejected { response });
        }
        self.phase = Phase::StartAcked;
        Ok(())
    }

    /// Send the init packet (image metadata / signature).
    pub async fn init_dfu(&mut self, init_packet: &[u8]) -> DfuResult<()> {
        self.expect_phase("init_dfu", &[Phase::StartAcked])?;
        let result = self.init_dfu_inner(init_packet).await;
        self.settle(result)
    }

    async fn init_dfu_inner(&mut self, init_packet: &[u8]) -> DfuResult<()> {
        let op: u8 = OpCode::InitDfuParams.into();
        self.mailbox.clear();
        self.write_ctrl(&[op, 0x00]).await?;
        self.phase = Phase::InitSent;
        tokio::time::sleep(self.timings.init_settle).await;

        let mut chunks = init_packet.chunks(CHUNK_SIZE).peekable();
        while let Some(chunk) = chunks.next() {
            self.write_data(chunk).await?;
            if chunks.peek().is_some() {
                tokio::time::sleep(self.timings.init_chunk_pause).await;
            }
        }

        tokio::time::sleep(self.timings.init_settle).await;
        self.write_ctrl(&[op, 0x01]).await?;

        let response = self.wait_for_response().await?;
        if !verify_header(OpCode::InitDfuParams, &response) {
            return Err(DfuError::InitRejected { response });
        }
        self.phase = Phase::InitAcked;
        Ok(())
    }

    /// Transfer the image, then ask the bootloader to validate it.
    ///
    /// `prn` is the number of chunks between packet receipt notifications.
    pub async fn send_firmware(&mut self, firmware: &[u8], prn: NonZeroU16) -> DfuResult<()> {
        self.expect_phase("send_firmware", &[Phase::InitAcked])?;
        let result = self.transfer(firmware, prn).await;
        self.settle(result)?;
        let result = self.validate().await;
        self.settle(result)
    }

    async fn transfer(&mut self, firmware: &[u8], prn: NonZeroU16) -> DfuResult<()> {
        if firmware.is_empty() {
            return Err(DfuError::MalformedPackage("firmware image is empty".into()));
        }
        let total = firmware.len();
        self.reporter.info(&format!("Sending firmware ({} bytes)...", total));

        self.mailbox.clear();
        self.prn = prn.get();
        let mut payload = vec![OpCode::ReceiptNotifRequest.into()];
        payload.extend_from_slice(&self.prn.to_le_bytes());
        self.write_ctrl(&payload).await?;
        self.phase = Phase::PrnConfigured;

        self.write_ctrl(&[OpCode::ReceiveFirmwareImage.into()]).await?;
        self.phase = Phase::Transferring;
        self.offset = 0;

        let mut since_receipt: u16 = 0;
        let mut receipt_ok = false;
        let mut early: Option<Vec<u8>> = None;
        for chunk in firmware.chunks(CHUNK_SIZE) {
            if self.link.observer().is_disconnected() {
                return Err(TransportError::disconnected(format!(
                    "link lost after {} of {} bytes",
                    self.offset, total
                ))
                .into());
            }
            self.write_data(chunk).await?;
            self.offset += chunk.len();
            since_receipt += 1;
            self.reporter.progress(self.offset as f64 / total as f64 * 100.0);

            if since_receipt >= self.prn {
                since_receipt = 0;
                // receipts are advisory: a missing one does not stop the transfer
                match self.wait_for_response().await {
                    Ok(rsp) if is_receipt(&rsp) => receipt_ok = true,
                    Ok(rsp) => {
                        early = Some(rsp);
                        break;
                    }
                    Err(DfuError::ResponseTimeout(t)) => {
                        receipt_ok = false;
                        warn!("No packet receipt within {:?} at offset {}, continuing", t, self.offset);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let response = match early {
            Some(rsp) => rsp,
            None => self.wait_for_completion(since_receipt == 0 && receipt_ok).await?,
        };
        Self::check_completion(&response)?;
        if self.offset < total {
            // completion reported before the whole image was sent
            return Err(DfuError::TransferRejected { response });
        }
        info!("Firmware transfer of {} bytes acknowledged", total);
        self.phase = Phase::TransferAcked;
        Ok(())
    }

    /// The completion response is mandatory, unlike receipts. Right after an
    /// acknowledged receipt boundary one extra wait is granted before giving up.
    async fn wait_for_completion(&self, at_receipt_boundary: bool) -> DfuResult<Vec<u8>> {
        let response = match self.wait_for_response().await {
            Ok(rsp) => rsp,
            Err(DfuError::ResponseTimeout(_)) if at_receipt_boundary => {
                self.mailbox.clear();
                self.wait_for_response().await?
            }
            Err(e) => return Err(e),
        };
        if is_receipt(&response) {
            // trailing receipt ahead of the real completion response
            debug!("discarding trailing packet receipt {:02X?}", response);
            return self.wait_for_response().await;
        }
        Ok(response)
    }

    fn check_completion(response: &[u8]) -> DfuResult<()> {
        let framed = response.len() >= 3
            && response[0] == u8::from(Notification::Response)
            && response[1] == u8::from(OpCode::ReceiveFirmwareImage);
        let rejected = || DfuError::TransferRejected {
            response: response.to_vec(),
        };
        if !framed {
            return Err(rejected());
        }
        match status_of(response) {
            Some(ResponseCode::Success | ResponseCode::SuccessAlt) => Ok(()),
            Some(ResponseCode::OperationFailed) => Err(DfuError::TransferOperationFailed),
            _ => Err(rejected()),
        }
    }

    async fn validate(&mut self) -> DfuResult<()> {
        self.mailbox.clear();
        self.write_ctrl(&[OpCode::ValidateFirmware.into()]).await?;
        self.phase = Phase::ValidateSent;
        let response = self.wait_for_response().await?;
        if !verify_header(OpCode::ValidateFirmware, &response) {
            return Err(DfuError::ValidationFailed { response });
        }
        self.phase = Phase::ValidateAcked;
        Ok(())
    }

    /// Activate the new image and reset. The peripheral drops the link while
    /// doing so, which is not an error.
    pub async fn activate_and_reset(&mut self) -> DfuResult<()> {
        self.expect_phase("activate_and_reset", &[Phase::ValidateAcked])?;
        self.mailbox.clear();
        let result = self.write_ctrl(&[OpCode::ActivateAndReset.into()]).await;
        self.phase = Phase::Activated;
        tokio::time::sleep(self.timings.activate_grace).await;
        match result {
            Ok(()) => {}
            Err(e) if e.is_disconnect() => {
                debug!("link dropped on activate: {}", e);
            }
            Err(_) if self.link.observer().is_disconnected() => {}
            Err(e) => self
                .reporter
                .warn(&format!("Warning during activate and reset: {}", e)),
        }
        self.phase = Phase::Terminated;
        Ok(())
    }
}
