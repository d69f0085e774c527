//! Unit tests for ACL packet parsing, fragmentation and recombination

use super::constants::*;
use super::packet::*;
use crate::error::CodecError;

#[test]
fn test_acl_packet_serialization() {
    let packet = AclPacket::new(0x0002, vec![0x01, 0x02, 0x03]);
    let bytes = packet.to_bytes();

    // Handle 0x002 with PB=0b10 (first flushable), BC=0b00
    let handle_and_flags = u16::from_le_bytes([bytes[0], bytes[1]]);
    assert_eq!(handle_and_flags, 0x2002);
    assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 3);
    assert_eq!(&bytes[4..], &[0x01, 0x02, 0x03]);

    let with_indicator = packet.to_packet();
    assert_eq!(with_indicator[0], HCI_ACL_PKT);
    assert_eq!(&with_indicator[1..], &bytes[..]);
}

#[test]
fn test_acl_packet_parse() {
    let bytes = [0x0B, 0x10, 0x02, 0x00, 0xAA, 0xBB];
    let packet = AclPacket::parse(&bytes).unwrap();

    assert_eq!(packet.handle, 0x000B);
    assert_eq!(packet.packet_boundary, PacketBoundary::Continuing);
    assert_eq!(packet.broadcast, BroadcastFlag::PointToPoint);
    assert_eq!(packet.payload, vec![0xAA, 0xBB]);

    // Handle and flags survive a serialization pass unchanged
    assert_eq!(packet.to_bytes(), bytes.to_vec());
}

#[test]
fn test_acl_packet_parse_errors() {
    assert!(matches!(
        AclPacket::parse(&[0x01, 0x00]),
        Err(CodecError::TooShort { .. })
    ));

    // Declares 4 bytes, carries 2
    assert_eq!(
        AclPacket::parse(&[0x01, 0x20, 0x04, 0x00, 0x01, 0x02]),
        Err(CodecError::LengthMismatch {
            declared: 4,
            actual: 2
        })
    );

    // Handle 0xF00 is reserved
    assert!(matches!(
        AclPacket::parse(&[0x00, 0x2F, 0x00, 0x00]),
        Err(CodecError::InvalidAclHeader(_))
    ));
}

#[test]
fn test_fragmentation_and_recombination() {
    // L2CAP basic frame: length 6, CID 0x0040, payload 1..=6
    let pdu = vec![0x06, 0x00, 0x40, 0x00, 1, 2, 3, 4, 5, 6];
    let fragments = AclPacket::fragment(0x0001, &pdu, 4);

    assert_eq!(fragments.len(), 3);
    assert_eq!(fragments[0].packet_boundary, PacketBoundary::FirstFlushable);
    assert_eq!(fragments[1].packet_boundary, PacketBoundary::Continuing);
    assert_eq!(fragments[2].packet_boundary, PacketBoundary::Continuing);
    assert_eq!(fragments[2].payload, vec![5, 6]);

    let mut recombiner = AclRecombiner::new();
    assert_eq!(recombiner.push(fragments[0].clone()).unwrap(), None);
    assert_eq!(recombiner.push(fragments[1].clone()).unwrap(), None);
    assert_eq!(recombiner.push(fragments[2].clone()).unwrap(), Some(pdu));
}

#[test]
fn test_recombiner_rejects_orphan_continuation() {
    let mut recombiner = AclRecombiner::new();
    let mut orphan = AclPacket::new(0x0001, vec![1, 2, 3]);
    orphan.packet_boundary = PacketBoundary::Continuing;

    assert!(recombiner.push(orphan).is_err());
}

#[test]
fn test_recombiner_restarts_on_new_start_fragment() {
    let mut recombiner = AclRecombiner::new();

    // First PDU is never finished
    let stale = AclPacket::new(0x0001, vec![0x08, 0x00, 0x40, 0x00, 1]);
    assert_eq!(recombiner.push(stale).unwrap(), None);

    let complete = vec![0x01, 0x00, 0x41, 0x00, 9];
    let fresh = AclPacket::new(0x0001, complete.clone());
    assert_eq!(recombiner.push(fresh).unwrap(), Some(complete));
}
