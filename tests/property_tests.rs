//! Property-based tests for tftpsim
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Wire Codec Properties
// ============================================================================

mod codec_properties {
    use super::*;
    use tftpsim_core::{BLOCK_SIZE, ErrorCode, Message, Mode};

    fn ascii_text() -> impl Strategy<Value = String> {
        "[ -~]{0,64}"
    }

    fn error_code() -> impl Strategy<Value = ErrorCode> {
        (0u16..8).prop_map(ErrorCode::from)
    }

    fn message() -> impl Strategy<Value = Message> {
        prop_oneof![
            ("[!-~]{1,64}", any::<bool>(), any::<bool>()).prop_map(|(name, write, octet)| {
                let mode = if octet { Mode::Octet } else { Mode::NetAscii };
                if write {
                    Message::write(name, mode)
                } else {
                    Message::read(name, mode)
                }
            }),
            (any::<u16>(), prop::collection::vec(any::<u8>(), 0..=BLOCK_SIZE))
                .prop_map(|(block, payload)| Message::data(block, payload)),
            any::<u16>().prop_map(Message::ack),
            (error_code(), ascii_text()).prop_map(|(code, text)| Message::error(code, text)),
        ]
    }

    proptest! {
        /// Every well-formed message decodes back to itself
        #[test]
        fn message_roundtrip(message in message()) {
            let encoded = message.encode();
            prop_assert_eq!(encoded.len(), message.encoded_len());
            prop_assert_eq!(encoded[0], 0);
            prop_assert_eq!(Message::decode(&encoded).unwrap(), message);
        }

        /// Decoding arbitrary bytes returns a value or an error, never panics
        #[test]
        fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..700)) {
            let _ = Message::decode(&bytes);
        }

        /// A nonzero first byte is always rejected
        #[test]
        fn nonzero_lead_byte_rejected(lead in 1u8.., rest in prop::collection::vec(any::<u8>(), 0..32)) {
            let mut bytes = vec![lead];
            bytes.extend(rest);
            prop_assert!(Message::decode(&bytes).is_err());
        }

        /// Block numbers are big-endian on the wire
        #[test]
        fn ack_block_big_endian(block in any::<u16>()) {
            let encoded = Message::ack(block).encode();
            prop_assert_eq!(&encoded[2..], &block.to_be_bytes()[..]);
        }

        /// Only payloads shorter than a full block end a transfer
        #[test]
        fn final_data_iff_short(len in 0usize..=BLOCK_SIZE) {
            let message = Message::data(1, vec![0u8; len]);
            prop_assert_eq!(message.is_final_data(), len < BLOCK_SIZE);
        }

        /// Unknown error codes are treated as illegal operations
        #[test]
        fn unknown_error_code_maps_to_illegal_operation(code in 8u16..) {
            prop_assert_eq!(ErrorCode::from(code), ErrorCode::IllegalOperation);
        }
    }
}

// ============================================================================
// Fault Description Properties
// ============================================================================

mod fault_properties {
    use super::*;
    use std::time::Duration;
    use tftpsim_faults::{FaultKind, FaultSpec, PacketModifier};

    fn fault() -> impl Strategy<Value = FaultSpec> {
        let kind = prop_oneof![
            Just(FaultKind::Drop),
            (0u64..10_000).prop_map(|ms| FaultKind::Delay(Duration::from_millis(ms))),
            (0u64..10_000).prop_map(|ms| FaultKind::Duplicate(Duration::from_millis(ms))),
            any::<u16>().prop_map(|op| FaultKind::Modify(PacketModifier::opcode(op))),
            Just(FaultKind::WrongSender),
        ];
        (1u64..1_000, kind).prop_map(|(packet, kind)| FaultSpec { packet, kind })
    }

    proptest! {
        /// The textual form of a fault parses back to the same fault
        #[test]
        fn fault_text_roundtrip(spec in fault()) {
            let parsed: FaultSpec = spec.to_string().parse().unwrap();
            prop_assert_eq!(parsed, spec);
        }

        /// Parsing arbitrary text never panics
        #[test]
        fn fault_parse_never_panics(text in "\\PC{0,40}") {
            let _ = text.parse::<FaultSpec>();
        }

        /// An opcode rewrite touches the first two bytes only
        #[test]
        fn opcode_rewrite_preserves_body(
            opcode in any::<u16>(),
            block in any::<u16>(),
            payload in prop::collection::vec(any::<u8>(), 0..=512),
        ) {
            let original = tftpsim_core::Message::data(block, payload).encode();
            let rewritten = PacketModifier::opcode(opcode).apply(&original);
            prop_assert_eq!(rewritten.len(), original.len());
            prop_assert_eq!(&rewritten[..2], &opcode.to_be_bytes()[..]);
            prop_assert_eq!(&rewritten[2..], &original[2..]);
        }
    }
}
