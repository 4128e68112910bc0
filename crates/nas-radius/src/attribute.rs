//! RADIUS attributes and the accounting value enums used by the client
//! (RFC 2865 Section 5, RFC 2866 Section 5).

use std::io::{Cursor, Read, Write};

use crate::packet::PacketError;

/// RADIUS attribute: one-byte type, one-byte length, value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: u8,
    pub value: Vec<u8>,
}

impl Attribute {
    /// Type + length fields.
    pub const MIN_LENGTH: usize = 2;
    /// Maximum encoded length including type and length.
    pub const MAX_LENGTH: usize = 255;
    /// Maximum value length.
    pub const MAX_VALUE_LENGTH: usize = 253;

    pub fn new(attr_type: u8, value: Vec<u8>) -> Result<Self, PacketError> {
        if value.len() > Self::MAX_VALUE_LENGTH {
            return Err(PacketError::AttributeError(format!(
                "Attribute value too long: {} bytes (max {})",
                value.len(),
                Self::MAX_VALUE_LENGTH
            )));
        }
        Ok(Attribute { attr_type, value })
    }

    pub fn string(attr_type: u8, value: impl Into<String>) -> Result<Self, PacketError> {
        Self::new(attr_type, value.into().into_bytes())
    }

    /// 32-bit big-endian integer attribute.
    pub fn integer(attr_type: u8, value: u32) -> Result<Self, PacketError> {
        Self::new(attr_type, value.to_be_bytes().to_vec())
    }

    pub fn ipv4(attr_type: u8, value: [u8; 4]) -> Result<Self, PacketError> {
        Self::new(attr_type, value.to_vec())
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let length = self.encoded_length();
        if length > Self::MAX_LENGTH {
            return Err(PacketError::AttributeError(format!(
                "Encoded attribute too long: {} bytes",
                length
            )));
        }

        let mut buffer = Vec::with_capacity(length);
        buffer.write_all(&[self.attr_type])?;
        buffer.write_all(&[length as u8])?;
        buffer.write_all(&self.value)?;

        Ok(buffer)
    }

    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < Self::MIN_LENGTH {
            return Err(PacketError::AttributeError(format!(
                "Attribute data too short: {} bytes",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);

        let mut type_buf = [0u8; 1];
        cursor.read_exact(&mut type_buf)?;
        let attr_type = type_buf[0];

        let mut len_buf = [0u8; 1];
        cursor.read_exact(&mut len_buf)?;
        let length = len_buf[0] as usize;

        if !(Self::MIN_LENGTH..=Self::MAX_LENGTH).contains(&length) {
            return Err(PacketError::AttributeError(format!(
                "Invalid attribute length: {}",
                length
            )));
        }
        if data.len() < length {
            return Err(PacketError::AttributeError(format!(
                "Insufficient data for attribute: expected {}, got {}",
                length,
                data.len()
            )));
        }

        let value_length = length - Self::MIN_LENGTH;
        let mut value = vec![0u8; value_length];
        cursor.read_exact(&mut value)?;

        Ok(Attribute { attr_type, value })
    }

    pub fn encoded_length(&self) -> usize {
        Self::MIN_LENGTH + self.value.len()
    }

    pub fn as_string(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.value.clone())
    }

    pub fn as_integer(&self) -> Result<u32, PacketError> {
        if self.value.len() != 4 {
            return Err(PacketError::AttributeError(format!(
                "Expected 4 bytes for integer, got {}",
                self.value.len()
            )));
        }
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.value);
        Ok(u32::from_be_bytes(bytes))
    }
}

/// The attribute subset carried by session authentication and accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AttributeType {
    /// User-Name (1) - RFC 2865
    UserName = 1,
    /// User-Password (2) - RFC 2865
    UserPassword = 2,
    /// NAS-IP-Address (4) - RFC 2865
    NasIpAddress = 4,
    /// NAS-Port (5) - RFC 2865
    NasPort = 5,
    /// Service-Type (6) - RFC 2865
    ServiceType = 6,
    /// Framed-Protocol (7) - RFC 2865
    FramedProtocol = 7,
    /// Framed-IP-Address (8) - RFC 2865
    FramedIpAddress = 8,
    /// Session-Timeout (27) - RFC 2865
    SessionTimeout = 27,
    /// NAS-Identifier (32) - RFC 2865
    NasIdentifier = 32,
    /// Acct-Status-Type (40) - RFC 2866
    AcctStatusType = 40,
    /// Acct-Delay-Time (41) - RFC 2866
    AcctDelayTime = 41,
    /// Acct-Input-Octets (42) - RFC 2866
    AcctInputOctets = 42,
    /// Acct-Output-Octets (43) - RFC 2866
    AcctOutputOctets = 43,
    /// Acct-Session-Id (44) - RFC 2866
    AcctSessionId = 44,
    /// Acct-Authentic (45) - RFC 2866
    AcctAuthentic = 45,
    /// Acct-Session-Time (46) - RFC 2866
    AcctSessionTime = 46,
    /// Acct-Input-Packets (47) - RFC 2866
    AcctInputPackets = 47,
    /// Acct-Output-Packets (48) - RFC 2866
    AcctOutputPackets = 48,
    /// Acct-Terminate-Cause (49) - RFC 2866
    AcctTerminateCause = 49,
    /// Acct-Input-Gigawords (52) - RFC 2869: high 32 bits of the 64-bit
    /// input octet counter
    AcctInputGigawords = 52,
    /// Acct-Output-Gigawords (53) - RFC 2869
    AcctOutputGigawords = 53,
    /// Acct-Interim-Interval (85) - RFC 2869
    AcctInterimInterval = 85,
}

impl AttributeType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Acct-Status-Type values (RFC 2866 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AcctStatusType {
    /// Start (1) - session has begun
    Start = 1,
    /// Stop (2) - session has ended
    Stop = 2,
    /// Interim-Update (3) - periodic usage snapshot
    InterimUpdate = 3,
}

impl AcctStatusType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(AcctStatusType::Start),
            2 => Some(AcctStatusType::Stop),
            3 => Some(AcctStatusType::InterimUpdate),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_attribute() {
        let attr = Attribute::string(AttributeType::UserName.as_u8(), "testuser").unwrap();
        assert_eq!(attr.attr_type, 1);
        assert_eq!(attr.as_string().unwrap(), "testuser");
    }

    #[test]
    fn test_integer_attribute() {
        let attr = Attribute::integer(AttributeType::NasPort.as_u8(), 1234).unwrap();
        assert_eq!(attr.as_integer().unwrap(), 1234);
    }

    #[test]
    fn test_attribute_encode_decode() {
        let attr = Attribute::string(AttributeType::AcctSessionId.as_u8(), "a1b2c3").unwrap();
        let encoded = attr.encode().unwrap();
        let decoded = Attribute::decode(&encoded).unwrap();
        assert_eq!(attr, decoded);
    }

    #[test]
    fn test_max_value_length() {
        let value = vec![0u8; 254];
        assert!(Attribute::new(1, value).is_err());
    }

    #[test]
    fn test_acct_status_type_conversion() {
        assert_eq!(AcctStatusType::Start.as_u32(), 1);
        assert_eq!(AcctStatusType::Stop.as_u32(), 2);
        assert_eq!(AcctStatusType::InterimUpdate.as_u32(), 3);
        assert_eq!(AcctStatusType::from_u32(3), Some(AcctStatusType::InterimUpdate));
        assert_eq!(AcctStatusType::from_u32(99), None);
    }
}
