//! RADIUS packet framing (RFC 2865 Section 3).

use std::io::{self, Cursor, Read, Write};

use thiserror::Error;

use crate::attribute::{Attribute, AttributeType};

#[derive(Error, Debug)]
pub enum PacketError {
    #[error("Invalid packet length: {0}")]
    InvalidLength(usize),
    #[error("Invalid packet code: {0}")]
    InvalidCode(u8),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Attribute error: {0}")]
    AttributeError(String),
    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),
}

/// RADIUS packet codes used by the client side of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Code {
    AccessRequest = 1,
    AccessAccept = 2,
    AccessReject = 3,
    AccountingRequest = 4,
    AccountingResponse = 5,
}

impl Code {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Code::AccessRequest),
            2 => Some(Code::AccessAccept),
            3 => Some(Code::AccessReject),
            4 => Some(Code::AccountingRequest),
            5 => Some(Code::AccountingResponse),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A RADIUS datagram: code, identifier, length, 16-byte authenticator and
/// an attribute list.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     Code      |  Identifier   |            Length             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                         Authenticator                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Attributes ...
/// +-+-+-+-+-+-+-+-+-+-+-+-+-
/// ```
#[derive(Debug, Clone)]
pub struct Packet {
    pub code: Code,
    /// Correlates replies with requests; also covered by the response
    /// authenticator digest.
    pub identifier: u8,
    pub authenticator: [u8; 16],
    pub attributes: Vec<Attribute>,
}

impl Packet {
    /// Header size: code + identifier + length + authenticator.
    pub const MIN_PACKET_SIZE: usize = 20;
    /// Maximum RADIUS packet size per RFC 2865.
    pub const MAX_PACKET_SIZE: usize = 4096;

    pub fn new(code: Code, identifier: u8, authenticator: [u8; 16]) -> Self {
        Packet {
            code,
            identifier,
            authenticator,
            attributes: Vec::new(),
        }
    }

    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    /// Replace the value of an existing attribute, or append it.
    ///
    /// Used when refreshing accounting counters and retry bookkeeping on a
    /// packet that is re-sent; the caller must re-sign afterwards.
    pub fn set_integer(&mut self, attr_type: AttributeType, value: u32) {
        let raw = attr_type.as_u8();
        match self.attributes.iter_mut().find(|a| a.attr_type == raw) {
            Some(attr) => attr.value = value.to_be_bytes().to_vec(),
            None => self
                .attributes
                .push(Attribute::integer(raw, value).expect("4-byte value always fits")),
        }
    }

    /// First attribute of the given type, decoded as an integer.
    pub fn integer(&self, attr_type: AttributeType) -> Option<u32> {
        self.find_attribute(attr_type.as_u8())
            .and_then(|a| a.as_integer().ok())
    }

    pub fn find_attribute(&self, attr_type: u8) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.attr_type == attr_type)
    }

    /// Encode packet to bytes.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let mut buffer = Vec::with_capacity(self.length());

        buffer.write_all(&[self.code.as_u8()])?;
        buffer.write_all(&[self.identifier])?;

        let length_pos = buffer.len();
        buffer.write_all(&[0, 0])?;
        buffer.write_all(&self.authenticator)?;

        for attr in &self.attributes {
            let attr_bytes = attr.encode()?;
            buffer.write_all(&attr_bytes)?;
        }

        let total_length = buffer.len();
        if total_length > Self::MAX_PACKET_SIZE {
            return Err(PacketError::PacketTooLarge(total_length));
        }

        buffer[length_pos] = (total_length >> 8) as u8;
        buffer[length_pos + 1] = (total_length & 0xff) as u8;

        Ok(buffer)
    }

    /// Decode packet from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < Self::MIN_PACKET_SIZE {
            return Err(PacketError::InvalidLength(data.len()));
        }

        let mut cursor = Cursor::new(data);

        let mut code_buf = [0u8; 1];
        cursor.read_exact(&mut code_buf)?;
        let code = Code::from_u8(code_buf[0]).ok_or(PacketError::InvalidCode(code_buf[0]))?;

        let mut id_buf = [0u8; 1];
        cursor.read_exact(&mut id_buf)?;
        let identifier = id_buf[0];

        let mut len_buf = [0u8; 2];
        cursor.read_exact(&mut len_buf)?;
        let length = u16::from_be_bytes(len_buf) as usize;

        if length < Self::MIN_PACKET_SIZE || length > Self::MAX_PACKET_SIZE {
            return Err(PacketError::InvalidLength(length));
        }
        if data.len() < length {
            return Err(PacketError::InvalidLength(data.len()));
        }

        let mut authenticator = [0u8; 16];
        cursor.read_exact(&mut authenticator)?;

        let mut attributes = Vec::new();
        let position = cursor.position() as usize;
        let mut attr_data = &data[position..length];

        while !attr_data.is_empty() {
            let attr = Attribute::decode(attr_data)?;
            let attr_len = attr.encoded_length();
            attributes.push(attr);
            attr_data = &attr_data[attr_len..];
        }

        Ok(Packet {
            code,
            identifier,
            authenticator,
            attributes,
        })
    }

    /// Length of the encoded packet.
    pub fn length(&self) -> usize {
        let mut len = Self::MIN_PACKET_SIZE;
        for attr in &self.attributes {
            len += attr.encoded_length();
        }
        len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_encode_decode() {
        let mut packet = Packet::new(Code::AccountingRequest, 42, [1u8; 16]);
        packet.add_attribute(Attribute::string(AttributeType::UserName.as_u8(), "ppp0").unwrap());
        let encoded = packet.encode().unwrap();
        let decoded = Packet::decode(&encoded).unwrap();

        assert_eq!(decoded.code, Code::AccountingRequest);
        assert_eq!(decoded.identifier, 42);
        assert_eq!(decoded.authenticator, [1u8; 16]);
        assert_eq!(decoded.attributes.len(), 1);
    }

    #[test]
    fn test_packet_min_size() {
        let data = vec![0u8; 19];
        assert!(Packet::decode(&data).is_err());
    }

    #[test]
    fn test_packet_invalid_code() {
        let mut data = Packet::new(Code::AccessRequest, 1, [0u8; 16]).encode().unwrap();
        data[0] = 99;
        assert!(matches!(
            Packet::decode(&data),
            Err(PacketError::InvalidCode(99))
        ));
    }

    #[test]
    fn test_set_integer_replaces_in_place() {
        let mut packet = Packet::new(Code::AccountingRequest, 1, [0u8; 16]);
        packet.set_integer(AttributeType::AcctInputOctets, 100);
        packet.set_integer(AttributeType::AcctInputOctets, 200);
        assert_eq!(packet.integer(AttributeType::AcctInputOctets), Some(200));
        assert_eq!(packet.attributes.len(), 1);
    }
}
