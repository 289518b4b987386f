// src/fc.rs
//
// =============================================================================
// BBSYNCER: FC DETECTION
// =============================================================================
//
// One-shot MSP handshake that classifies whatever is on the other end of
// the serial port. Only Betaflight with on-board dataflash is syncable;
// SD-card blackbox must be read by pulling the card.

use thiserror::Error;

use crate::msp::client::FlightController;
use crate::msp::{MspError, BLACKBOX_DEVICE_NONE, BLACKBOX_DEVICE_SDCARD, BTFL_VARIANT};

/// Identity of the connected flight controller, captured once per sync.
#[derive(Debug, Clone)]
pub struct FcInfo {
    pub api_major: u8,
    pub api_minor: u8,
    pub variant: [u8; 4],
    /// 24 lowercase hex chars, or the literal "unknown".
    pub uid: String,
    pub blackbox_device: u8,
}

impl FcInfo {
    pub fn variant_str(&self) -> String {
        String::from_utf8_lossy(&self.variant).into_owned()
    }

    /// First 8 chars of the UID, used in session directory names.
    pub fn uid_short(&self) -> &str {
        if self.uid == "unknown" {
            "unknown"
        } else {
            &self.uid[..self.uid.len().min(8)]
        }
    }
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("expected BTFL variant, got {0:?}")]
    NotBetaflight(String),

    #[error("FC uses an SD card for blackbox; remove the card and read it directly")]
    SdCardBlackbox,

    #[error("MSP {stage} failed: {source}")]
    Msp {
        stage: &'static str,
        source: MspError,
    },
}

/// Run the identification handshake: api_version → fc_variant → uid →
/// blackbox_config.
///
/// UID and blackbox-config failures are tolerated (falling back to
/// "unknown" / device 0); version or variant failures are not.
pub fn detect_fc(fc: &mut dyn FlightController) -> Result<FcInfo, DetectError> {
    let (api_major, api_minor) = fc.get_api_version().map_err(|source| DetectError::Msp {
        stage: "API_VERSION",
        source,
    })?;
    log::info!("MSP API version: {}.{}", api_major, api_minor);

    let variant = fc.get_fc_variant().map_err(|source| DetectError::Msp {
        stage: "FC_VARIANT",
        source,
    })?;
    log::info!("FC variant: {}", String::from_utf8_lossy(&variant));

    if &variant != BTFL_VARIANT {
        return Err(DetectError::NotBetaflight(
            String::from_utf8_lossy(&variant).into_owned(),
        ));
    }

    let uid = match fc.get_uid() {
        Ok(uid) => {
            log::info!("FC UID: {}", uid);
            uid
        }
        Err(_) => {
            log::warn!("Could not read FC UID, using 'unknown'");
            "unknown".to_string()
        }
    };

    let blackbox_device = match fc.get_blackbox_config() {
        Ok(device) => {
            log::info!("Blackbox device type: {}", device);
            device
        }
        Err(e) => {
            log::warn!("Could not read BLACKBOX_CONFIG: {}", e);
            BLACKBOX_DEVICE_NONE
        }
    };

    if blackbox_device == BLACKBOX_DEVICE_SDCARD {
        return Err(DetectError::SdCardBlackbox);
    }

    Ok(FcInfo {
        api_major,
        api_minor,
        variant,
        uid,
        blackbox_device,
    })
}
