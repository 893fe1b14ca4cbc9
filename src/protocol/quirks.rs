//! Client compatibility quirks
//!
//! Each deviation from the wire format that real clients are known to
//! produce is handled in exactly one place, here, so the main state
//! machines stay strict.
//!
//! # Known Quirks
//!
//! ## librtmp
//! - Opens the protocol control chunk stream (id 2) with a fmt1 header when
//!   sending its first ping, instead of the mandatory fmt0.
//!
//! ## AMF3 clients
//! - Command (17) and data (15) messages carry one format byte before
//!   plain AMF0 values.
//!
//! ## Encoders in general
//! - Some stop repeating the extended timestamp on fmt3 continuation
//!   chunks; the chunk decoder detects this and rewinds (see
//!   [`ChunkDecoder`](super::chunk::ChunkDecoder)).

use super::constants::{CHUNK_FMT_1, CSID_PROTOCOL_CONTROL};

/// Whether a fresh chunk stream may open with `fmt` instead of fmt0.
///
/// Only the librtmp ping on the protocol control stream qualifies.
pub fn allows_short_first_header(csid: u32, fmt: u8) -> bool {
    csid == CSID_PROTOCOL_CONTROL && fmt == CHUNK_FMT_1
}

/// AMF0 portion of an AMF3 command or data payload
pub fn skip_amf3_format_byte(payload: &[u8]) -> &[u8] {
    payload.get(1..).unwrap_or_default()
}

/// Detected encoder type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderType {
    Unknown,
    Obs,
    Ffmpeg,
    Wirecast,
    FlashMediaEncoder,
    Xsplit,
    Larix,
    Other,
}

impl EncoderType {
    /// Detect encoder from connect command's flashVer
    pub fn from_flash_ver(flash_ver: &str) -> Self {
        let lower = flash_ver.to_lowercase();

        if lower.is_empty() {
            EncoderType::Unknown
        } else if lower.contains("obs") {
            EncoderType::Obs
        } else if lower.contains("fmle") || lower.contains("flash media") {
            EncoderType::FlashMediaEncoder
        } else if lower.contains("wirecast") {
            EncoderType::Wirecast
        } else if lower.contains("xsplit") {
            EncoderType::Xsplit
        } else if lower.contains("larix") {
            EncoderType::Larix
        } else if lower.contains("lavf") || lower.contains("librtmp") {
            EncoderType::Ffmpeg
        } else {
            EncoderType::Other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_first_header_only_on_control_stream() {
        assert!(allows_short_first_header(2, 1));
        assert!(!allows_short_first_header(2, 2));
        assert!(!allows_short_first_header(2, 3));
        assert!(!allows_short_first_header(3, 1));
    }

    #[test]
    fn test_skip_amf3_format_byte() {
        assert_eq!(skip_amf3_format_byte(&[0x00, 0x02, 0x00]), &[0x02, 0x00]);
        assert!(skip_amf3_format_byte(&[]).is_empty());
    }

    #[test]
    fn test_encoder_detection() {
        assert_eq!(
            EncoderType::from_flash_ver("OBS-Studio/29.1.3"),
            EncoderType::Obs
        );
        assert_eq!(
            EncoderType::from_flash_ver("FMLE/3.0 (compatible; FMSc/1.0)"),
            EncoderType::FlashMediaEncoder
        );
        assert_eq!(
            EncoderType::from_flash_ver("LNX 9,0,124,2"),
            EncoderType::Other
        );
        assert_eq!(EncoderType::from_flash_ver(""), EncoderType::Unknown);
    }
}
