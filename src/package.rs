use std::io::prelude::*;
use std::path::Path;

use crate::error::{DfuError, DfuResult};

/// `application_version` value meaning "not specified".
const VERSION_UNSPECIFIED: u64 = 0xFFFF_FFFF;

/// Contents of a Nordic Legacy DFU package.
#[derive(Debug, Clone)]
pub struct FirmwarePackage {
    /// Init packet (`.dat`)
    pub init_packet: Vec<u8>,
    /// Application image (`.bin`)
    pub firmware: Vec<u8>,
    /// Archive member name of the image.
    pub bin_file: String,
    pub expected_crc16: Option<u16>,
    pub application_version: Option<u32>,
}

/// CRC-16/CCITT-FALSE, the variant nrfutil stores in `firmware_crc16`.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    crc16::State::<crc16::CCITT_FALSE>::calculate(data)
}

fn malformed(msg: impl Into<String>) -> DfuError {
    DfuError::MalformedPackage(msg.into())
}

fn read_member<R: Read + Seek>(zip: &mut zip::ZipArchive<R>, name: &str) -> DfuResult<Vec<u8>> {
    let mut member = zip
        .by_name(name)
        .map_err(|_| malformed(format!("manifest references a file not in the archive: {name}")))?;
    let mut buf = Vec::new();
    member.read_to_end(&mut buf)?;
    if buf.is_empty() {
        return Err(malformed(format!("{name} is empty")));
    }
    Ok(buf)
}

/// Read a Nordic DFU ZIP produced by nrfutil / the nRF5 SDK tools.
pub fn read_package(path: impl AsRef<Path>) -> DfuResult<FirmwarePackage> {
    let reader = std::fs::File::open(path.as_ref())?;
    let mut zip =
        zip::ZipArchive::new(reader).map_err(|e| malformed(format!("invalid ZIP file: {e}")))?;

    let manifest: serde_json::Value = {
        let manifest_raw = zip
            .by_name("manifest.json")
            .map_err(|_| malformed("not a Nordic DFU ZIP: manifest.json not found"))?;
        serde_json::from_reader(manifest_raw)
            .map_err(|e| malformed(format!("invalid manifest.json: {e}")))?
    };

    let app = &manifest["manifest"]["application"];
    if !app.is_object() {
        return Err(malformed("manifest has no application image"));
    }
    let bin_name = app["bin_file"]
        .as_str()
        .ok_or_else(|| malformed("manifest application entry lacks bin_file"))?
        .to_string();
    let dat_name = app["dat_file"]
        .as_str()
        .ok_or_else(|| malformed("manifest application entry lacks dat_file"))?;

    let firmware = read_member(&mut zip, &bin_name)?;
    let init_packet = read_member(&mut zip, dat_name)?;

    let ipd = &app["init_packet_data"];
    let expected_crc16 = match ipd.get("firmware_crc16") {
        None | Some(serde_json::Value::Null) => None,
        Some(v) => {
            let crc = v
                .as_u64()
                .and_then(|c| u16::try_from(c).ok())
                .ok_or_else(|| malformed(format!("invalid firmware_crc16: {v}")))?;
            let computed = crc16_ccitt(&firmware);
            if computed != crc {
                return Err(malformed(format!(
                    "firmware CRC mismatch: expected {crc:#06x}, got {computed:#06x}"
                )));
            }
            Some(crc)
        }
    };

    let application_version = ipd
        .get("application_version")
        .and_then(|v| v.as_u64())
        .filter(|v| *v != VERSION_UNSPECIFIED)
        .and_then(|v| u32::try_from(v).ok());

    Ok(FirmwarePackage {
        init_packet,
        firmware,
        bin_file: bin_name,
        expected_crc16,
        application_version,
    })
}
