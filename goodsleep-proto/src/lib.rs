//! Good Sleep wire protocol - provisioning command and status frames
//!
//! Controller to device: a single Latin-1 command string written to the
//! command characteristic in one call.
//!
//! Device to controller: notifications on the status characteristic. Frames
//! starting with [`STATUS_MAGIC`] carry a status code in their final byte,
//! anything else is free-form text.

pub mod ble;

/// Product tag that prefixes every provisioning command
pub const PRODUCT_TAG: &str = "Good Sleep";

/// Magic prefix of a status frame
pub const STATUS_MAGIC: [u8; 4] = [0x55, 0xAA, 0x55, 0xAA];

// Status codes
pub const STATUS_LINK_UP: u8 = 0x01;
pub const STATUS_LINK_FAILED: u8 = 0x03;
pub const STATUS_SESSION_UP: u8 = 0x04;
pub const STATUS_SESSION_DROPPED: u8 = 0x05;
pub const STATUS_LINK_DROPPED: u8 = 0x06;
pub const STATUS_OFF_BED: u8 = 0x07;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("character {ch:?} at position {position} does not fit in one byte")]
    NotLatin1 { ch: char, position: usize },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("command does not start with `{0} WIFI ID:\"`")]
    MissingHeader(String),
    #[error("command is missing the `\",\"` separator")]
    MissingSeparator,
    #[error("command is not terminated by a quote")]
    Unterminated,
}

/// Status code reported by the device in a status frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Wi-Fi link is up, cloud session not yet established
    LinkUp,
    /// Wi-Fi link could not be established (firmware keeps retrying)
    LinkFailed,
    /// Wi-Fi link and cloud session are both up
    SessionUp,
    /// Cloud session dropped
    SessionDropped,
    /// Wi-Fi link dropped
    LinkDropped,
    /// Nobody is lying on the sensor
    OffBed,
    Unknown(u8),
}

impl StatusCode {
    pub fn from_byte(b: u8) -> Self {
        match b {
            STATUS_LINK_UP => Self::LinkUp,
            STATUS_LINK_FAILED => Self::LinkFailed,
            STATUS_SESSION_UP => Self::SessionUp,
            STATUS_SESSION_DROPPED => Self::SessionDropped,
            STATUS_LINK_DROPPED => Self::LinkDropped,
            STATUS_OFF_BED => Self::OffBed,
            other => Self::Unknown(other),
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            Self::LinkUp => STATUS_LINK_UP,
            Self::LinkFailed => STATUS_LINK_FAILED,
            Self::SessionUp => STATUS_SESSION_UP,
            Self::SessionDropped => STATUS_SESSION_DROPPED,
            Self::LinkDropped => STATUS_LINK_DROPPED,
            Self::OffBed => STATUS_OFF_BED,
            Self::Unknown(b) => *b,
        }
    }

    /// Only a fully established session ends provisioning
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, Self::SessionUp)
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::LinkUp => "wifi link established",
            Self::LinkFailed => "wifi link failed",
            Self::SessionUp => "wifi link and session established",
            Self::SessionDropped => "session dropped",
            Self::LinkDropped => "wifi link dropped",
            Self::OffBed => "off bed",
            Self::Unknown(_) => "unknown status",
        };
        write!(f, "{} (0x{:02x})", text, self.as_byte())
    }
}

/// A notification received on the status characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Status(StatusCode),
    Text(String),
}

impl Frame {
    /// Classify a raw notification
    ///
    /// The magic prefix alone decides the kind; the status code is always the
    /// last byte of the frame.
    pub fn parse(data: &[u8]) -> Self {
        if data.len() >= STATUS_MAGIC.len() && data[..STATUS_MAGIC.len()] == STATUS_MAGIC {
            // non-empty, checked above
            let code = data[data.len() - 1];
            Self::Status(StatusCode::from_byte(code))
        } else {
            Self::Text(latin1_to_string(data))
        }
    }

    /// Build a status frame the way the firmware sends it
    pub fn status_bytes(code: u8) -> Vec<u8> {
        let mut buf = Vec::with_capacity(STATUS_MAGIC.len() + 1);
        buf.extend_from_slice(&STATUS_MAGIC);
        buf.push(code);
        buf
    }
}

/// Wi-Fi provisioning command: `<tag> WIFI ID:"<ssid>","<password>"`
#[derive(Clone, PartialEq, Eq)]
pub struct ProvisionCommand {
    pub tag: String,
    pub ssid: String,
    pub password: String,
}

impl std::fmt::Debug for ProvisionCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionCommand")
            .field("tag", &self.tag)
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl ProvisionCommand {
    pub fn new(ssid: &str, password: &str) -> Self {
        Self::with_tag(PRODUCT_TAG, ssid, password)
    }

    pub fn with_tag(tag: &str, ssid: &str, password: &str) -> Self {
        Self {
            tag: tag.to_string(),
            ssid: ssid.to_string(),
            password: password.to_string(),
        }
    }

    fn header(tag: &str) -> String {
        format!("{tag} WIFI ID:\"")
    }

    /// The command text as sent on the wire
    pub fn to_text(&self) -> String {
        format!("{}{}\",\"{}\"", Self::header(&self.tag), self.ssid, self.password)
    }

    /// The command text with the password masked, for logs
    pub fn to_masked_text(&self) -> String {
        format!("{}{}\",\"{}\"", Self::header(&self.tag), self.ssid, "*".repeat(self.password.chars().count()))
    }

    /// Encode one byte per character
    ///
    /// The firmware has no multi-byte decoding, so anything outside Latin-1 is
    /// rejected instead of being silently truncated.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let text = self.to_text();
        let mut buf = Vec::with_capacity(text.len());
        for (position, ch) in text.chars().enumerate() {
            let code = ch as u32;
            if code > 0xFF {
                return Err(EncodeError::NotLatin1 { ch, position });
            }
            buf.push(code as u8);
        }
        Ok(buf)
    }

    /// Parse a command previously produced by [`ProvisionCommand::to_bytes`]
    ///
    /// The SSID ends at the first `","`; the password runs to the final quote.
    pub fn from_bytes(tag: &str, data: &[u8]) -> Result<Self, DecodeError> {
        let text = latin1_to_string(data);
        let header = Self::header(tag);
        let rest = text
            .strip_prefix(&header)
            .ok_or_else(|| DecodeError::MissingHeader(tag.to_string()))?;
        let (ssid, tail) = rest.split_once("\",\"").ok_or(DecodeError::MissingSeparator)?;
        let password = tail.strip_suffix('"').ok_or(DecodeError::Unterminated)?;
        Ok(Self::with_tag(tag, ssid, password))
    }
}

/// Decode bytes as Latin-1, every byte maps to exactly one character
pub fn latin1_to_string(data: &[u8]) -> String {
    data.iter().map(|&b| b as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_frame_uses_last_byte() {
        assert_eq!(
            Frame::parse(&[0x55, 0xAA, 0x55, 0xAA, 0x04]),
            Frame::Status(StatusCode::SessionUp)
        );
        // padding between magic and code is ignored
        assert_eq!(
            Frame::parse(&[0x55, 0xAA, 0x55, 0xAA, 0x00, 0x00, 0x03]),
            Frame::Status(StatusCode::LinkFailed)
        );
        assert_eq!(
            Frame::parse(&Frame::status_bytes(0x42)),
            Frame::Status(StatusCode::Unknown(0x42))
        );
    }

    #[test]
    fn anything_without_magic_is_text() {
        assert_eq!(Frame::parse(b"AT+OK"), Frame::Text("AT+OK".to_string()));
        assert_eq!(Frame::parse(&[0x55, 0xAA, 0x55]), Frame::Text("U\u{aa}U".to_string()));
        assert_eq!(Frame::parse(&[]), Frame::Text(String::new()));
    }

    #[test]
    fn only_session_up_is_terminal() {
        for b in 0u8..=0xFF {
            let code = StatusCode::from_byte(b);
            assert_eq!(code.as_byte(), b);
            assert_eq!(code.is_terminal_success(), b == STATUS_SESSION_UP);
        }
    }

    #[test]
    fn command_text_and_bytes() {
        let cmd = ProvisionCommand::new("HomeNet", "s3cret!");
        let bytes = cmd.to_bytes().unwrap();
        let text = latin1_to_string(&bytes);
        assert_eq!(text, "Good Sleep WIFI ID:\"HomeNet\",\"s3cret!\"");
        assert_eq!(bytes.len(), text.chars().count());
        assert_eq!(ProvisionCommand::from_bytes(PRODUCT_TAG, &bytes).unwrap(), cmd);
    }

    #[test]
    fn latin1_is_one_byte_per_char() {
        let cmd = ProvisionCommand::new("Café", "pässwörd");
        let bytes = cmd.to_bytes().unwrap();
        assert_eq!(bytes.len(), cmd.to_text().chars().count());
        assert!(bytes.contains(&0xE9));
    }

    #[test]
    fn non_latin1_is_rejected() {
        let err = ProvisionCommand::new("家", "password").to_bytes().unwrap_err();
        assert_eq!(err, EncodeError::NotLatin1 { ch: '家', position: 20 });
    }

    #[test]
    fn masked_text_hides_password() {
        let cmd = ProvisionCommand::new("HomeNet", "s3cret!");
        assert_eq!(cmd.to_masked_text(), "Good Sleep WIFI ID:\"HomeNet\",\"*******\"");
        assert!(!format!("{cmd:?}").contains("s3cret"));
    }

    #[test]
    fn decode_rejects_foreign_commands() {
        assert_eq!(
            ProvisionCommand::from_bytes(PRODUCT_TAG, b"Other WIFI ID:\"a\",\"b\""),
            Err(DecodeError::MissingHeader(PRODUCT_TAG.to_string()))
        );
        assert_eq!(
            ProvisionCommand::from_bytes(PRODUCT_TAG, b"Good Sleep WIFI ID:\"a\""),
            Err(DecodeError::MissingSeparator)
        );
        assert_eq!(
            ProvisionCommand::from_bytes(PRODUCT_TAG, b"Good Sleep WIFI ID:\"a\",\"b"),
            Err(DecodeError::Unterminated)
        );
    }
}
