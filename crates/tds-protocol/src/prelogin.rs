//! PRELOGIN message.
//!
//! The first exchange on a TDS 7.x connection. It negotiates encryption and
//! reports the server's product version before LOGIN7 is sent.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::ensure;
use crate::error::ProtocolError;

/// Pre-login option tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PreLoginOption {
    /// Product version.
    Version = 0x00,
    /// Encryption negotiation.
    Encryption = 0x01,
    /// Instance name.
    Instance = 0x02,
    /// Client thread id.
    ThreadId = 0x03,
    /// MARS.
    Mars = 0x04,
    /// Trace id.
    TraceId = 0x05,
    /// Federated auth required.
    FedAuthRequired = 0x06,
    /// Nonce.
    Nonce = 0x07,
    /// End of option list.
    Terminator = 0xFF,
}

impl PreLoginOption {
    /// Map a raw option byte.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0x00 => Self::Version,
            0x01 => Self::Encryption,
            0x02 => Self::Instance,
            0x03 => Self::ThreadId,
            0x04 => Self::Mars,
            0x05 => Self::TraceId,
            0x06 => Self::FedAuthRequired,
            0x07 => Self::Nonce,
            0xFF => Self::Terminator,
            _ => return Err(ProtocolError::InvalidPreloginOption(value)),
        })
    }
}

/// Encryption negotiation values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EncryptionLevel {
    /// Encrypt the login only.
    Off = 0x00,
    /// Encrypt everything.
    On = 0x01,
    /// No TLS at all.
    NotSupported = 0x02,
    /// TLS required.
    #[default]
    Required = 0x03,
}

impl EncryptionLevel {
    /// Map a raw byte; unknown values are treated as `Off`.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Self::On,
            0x02 => Self::NotSupported,
            0x03 => Self::Required,
            _ => Self::Off,
        }
    }

    /// Whether the client must run a TLS handshake before LOGIN7.
    #[must_use]
    pub const fn needs_tls(&self) -> bool {
        !matches!(self, Self::NotSupported)
    }
}

/// A PRELOGIN request or response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreLogin {
    /// Product version (major, minor, build) and sub-build.
    pub version: (u8, u8, u16, u16),
    /// Encryption level.
    pub encryption: EncryptionLevel,
    /// Instance name.
    pub instance: Option<String>,
    /// Client thread id.
    pub thread_id: Option<u32>,
    /// MARS requested/accepted.
    pub mars: bool,
}

impl PreLogin {
    /// A client PRELOGIN with the given encryption request.
    #[must_use]
    pub fn new(encryption: EncryptionLevel) -> Self {
        Self {
            version: (0, 6, 0, 0),
            encryption,
            ..Self::default()
        }
    }

    /// Encode to a PRELOGIN payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut options: Vec<(PreLoginOption, Vec<u8>)> = Vec::with_capacity(5);

        let (major, minor, build, sub_build) = self.version;
        let mut version = vec![major, minor];
        version.extend_from_slice(&build.to_be_bytes());
        version.extend_from_slice(&sub_build.to_le_bytes());
        options.push((PreLoginOption::Version, version));
        options.push((PreLoginOption::Encryption, vec![self.encryption as u8]));
        if let Some(instance) = &self.instance {
            let mut data = instance.as_bytes().to_vec();
            data.push(0);
            options.push((PreLoginOption::Instance, data));
        }
        if let Some(thread_id) = self.thread_id {
            options.push((PreLoginOption::ThreadId, thread_id.to_be_bytes().to_vec()));
        }
        options.push((PreLoginOption::Mars, vec![u8::from(self.mars)]));

        let mut offset = (options.len() * 5 + 1) as u16;
        let mut buf = BytesMut::with_capacity(64);
        for (option, data) in &options {
            buf.put_u8(*option as u8);
            buf.put_u16(offset);
            buf.put_u16(data.len() as u16);
            offset += data.len() as u16;
        }
        buf.put_u8(PreLoginOption::Terminator as u8);
        for (_, data) in &options {
            buf.put_slice(data);
        }
        buf.freeze()
    }

    /// Decode a PRELOGIN payload.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut src = payload;
        let mut entries = Vec::new();
        loop {
            ensure(&src, 1)?;
            let raw = src.get_u8();
            if raw == PreLoginOption::Terminator as u8 {
                break;
            }
            ensure(&src, 4)?;
            let offset = src.get_u16() as usize;
            let length = src.get_u16() as usize;
            entries.push((PreLoginOption::from_u8(raw)?, offset, length));
        }

        let mut prelogin = Self::default();
        for (option, offset, length) in entries {
            let Some(data) = payload.get(offset..offset + length) else {
                return Err(ProtocolError::IncompletePacket {
                    expected: offset + length,
                    actual: payload.len(),
                });
            };
            match option {
                PreLoginOption::Version if data.len() >= 6 => {
                    prelogin.version = (
                        data[0],
                        data[1],
                        u16::from_be_bytes([data[2], data[3]]),
                        u16::from_le_bytes([data[4], data[5]]),
                    );
                }
                PreLoginOption::Encryption if !data.is_empty() => {
                    prelogin.encryption = EncryptionLevel::from_u8(data[0]);
                }
                PreLoginOption::Instance => {
                    let name = data.split(|b| *b == 0).next().unwrap_or_default();
                    if !name.is_empty() {
                        prelogin.instance = Some(String::from_utf8_lossy(name).into_owned());
                    }
                }
                PreLoginOption::ThreadId if data.len() >= 4 => {
                    prelogin.thread_id =
                        Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]));
                }
                PreLoginOption::Mars if !data.is_empty() => prelogin.mars = data[0] != 0,
                _ => {}
            }
        }
        Ok(prelogin)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_prelogin_roundtrip() {
        let mut original = PreLogin::new(EncryptionLevel::On);
        original.instance = Some("SQLEXPRESS".into());
        original.mars = true;

        let encoded = original.encode();
        assert_eq!(encoded[0], PreLoginOption::Version as u8);

        let decoded = PreLogin::decode(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_server_response() {
        // VERSION 15.0.2000, ENCRYPTION NOT_SUP
        let payload = [
            0x00, 0x00, 0x0B, 0x00, 0x06, 0x01, 0x00, 0x11, 0x00, 0x01, 0xFF, 0x0F, 0x00, 0x07,
            0xD0, 0x00, 0x00, 0x02,
        ];
        let decoded = PreLogin::decode(&payload).unwrap();
        assert_eq!(decoded.version, (15, 0, 2000, 0));
        assert_eq!(decoded.encryption, EncryptionLevel::NotSupported);
        assert!(!decoded.encryption.needs_tls());
    }

    #[test]
    fn test_offset_past_end() {
        let payload = [0x01, 0x00, 0x40, 0x00, 0x01, 0xFF];
        assert!(PreLogin::decode(&payload).is_err());
    }
}
