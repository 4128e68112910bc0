//! Authenticator digests and password obfuscation (RFC 2865 Section 3,
//! RFC 2866 Section 3).

use rand::Rng;

use crate::packet::{Packet, PacketError};

/// Random Request Authenticator for Access-Request packets.
pub fn request_authenticator() -> [u8; 16] {
    let mut rng = rand::rng();
    let mut authenticator = [0u8; 16];
    rng.fill(&mut authenticator);
    authenticator
}

/// Sign an Accounting-Request in place.
///
/// Request Authenticator = MD5(Code ∥ Identifier ∥ Length ∥ 16 zero octets
/// ∥ Attributes ∥ Secret). Must be recomputed whenever the identifier or
/// any attribute changes after signing.
pub fn sign_accounting(packet: &mut Packet, secret: &[u8]) -> Result<(), PacketError> {
    packet.authenticator = [0u8; 16];
    let mut data = packet.encode()?;
    data.extend_from_slice(secret);
    let digest = md5::compute(&data);
    packet.authenticator.copy_from_slice(&digest.0);
    Ok(())
}

/// Response Authenticator = MD5(Code ∥ Identifier ∥ Length ∥ Request
/// Authenticator ∥ Attributes ∥ Secret), where the request authenticator is
/// the one carried by the corresponding request.
pub fn response_authenticator(
    reply: &Packet,
    request_authenticator: &[u8; 16],
    secret: &[u8],
) -> Result<[u8; 16], PacketError> {
    let mut copy = reply.clone();
    copy.authenticator = *request_authenticator;
    let mut data = copy.encode()?;
    data.extend_from_slice(secret);
    let digest = md5::compute(&data);
    let mut authenticator = [0u8; 16];
    authenticator.copy_from_slice(&digest.0);
    Ok(authenticator)
}

/// Check a reply against the request it answers. A mismatch means the reply
/// is spoofed, corrupted, or signed with the wrong secret.
pub fn verify_response(
    reply: &Packet,
    request_authenticator: &[u8; 16],
    secret: &[u8],
) -> bool {
    match response_authenticator(reply, request_authenticator, secret) {
        Ok(expected) => expected == reply.authenticator,
        Err(_) => false,
    }
}

/// Obfuscate User-Password per RFC 2865 Section 5.2: pad to a 16-byte
/// multiple, then XOR each block with MD5(secret ∥ previous block), seeded
/// by the request authenticator.
pub fn encrypt_password(password: &str, secret: &[u8], authenticator: &[u8; 16]) -> Vec<u8> {
    let mut padded = password.as_bytes().to_vec();
    let padding = (16 - padded.len() % 16) % 16;
    padded.resize(padded.len() + padding, 0);
    if padded.is_empty() {
        padded.resize(16, 0);
    }

    let mut result = Vec::with_capacity(padded.len());
    let mut previous: Vec<u8> = authenticator.to_vec();

    for chunk in padded.chunks(16) {
        let mut data = Vec::with_capacity(secret.len() + 16);
        data.extend_from_slice(secret);
        data.extend_from_slice(&previous);
        let hash = md5::compute(&data);

        let mut block = [0u8; 16];
        for i in 0..16 {
            block[i] = chunk[i] ^ hash.0[i];
        }

        previous = block.to_vec();
        result.extend_from_slice(&block);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{AcctStatusType, Attribute, AttributeType};
    use crate::packet::Code;

    #[test]
    fn test_request_authenticator_random() {
        assert_ne!(request_authenticator(), request_authenticator());
    }

    #[test]
    fn test_accounting_signature_changes_with_identifier() {
        let mut packet = Packet::new(Code::AccountingRequest, 1, [0u8; 16]);
        packet.set_integer(AttributeType::AcctStatusType, AcctStatusType::Start.as_u32());
        sign_accounting(&mut packet, b"secret").unwrap();
        let first = packet.authenticator;

        packet.identifier = packet.identifier.wrapping_add(1);
        sign_accounting(&mut packet, b"secret").unwrap();
        assert_ne!(first, packet.authenticator);
    }

    #[test]
    fn test_response_verification_roundtrip() {
        let mut request = Packet::new(Code::AccountingRequest, 7, [0u8; 16]);
        request.set_integer(AttributeType::AcctStatusType, AcctStatusType::Stop.as_u32());
        sign_accounting(&mut request, b"secret").unwrap();

        let mut reply = Packet::new(Code::AccountingResponse, 7, [0u8; 16]);
        reply.authenticator =
            response_authenticator(&reply, &request.authenticator, b"secret").unwrap();

        assert!(verify_response(&reply, &request.authenticator, b"secret"));
        assert!(!verify_response(&reply, &request.authenticator, b"wrong"));
    }

    #[test]
    fn test_tampered_reply_rejected() {
        let request_auth = [3u8; 16];
        let mut reply = Packet::new(Code::AccountingResponse, 9, [0u8; 16]);
        reply.authenticator =
            response_authenticator(&reply, &request_auth, b"secret").unwrap();
        reply.add_attribute(
            Attribute::string(AttributeType::UserName.as_u8(), "injected").unwrap(),
        );
        assert!(!verify_response(&reply, &request_auth, b"secret"));
    }

    #[test]
    fn test_password_encryption_block_padding() {
        let encrypted = encrypt_password("short", b"secret", &[1u8; 16]);
        assert_eq!(encrypted.len(), 16);
        let encrypted = encrypt_password("a-password-longer-than-16", b"secret", &[1u8; 16]);
        assert_eq!(encrypted.len(), 32);
    }
}
