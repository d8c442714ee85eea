//! Property tests for the wire codec: every message type round-trips
//! byte-exactly, and the parser never panics on arbitrary or truncated
//! input.

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;

use norm_transport::seq::{BlockId, ObjectId};
use norm_transport::wire::{
    repair_flags, AckMsg, AckPayload, AckType, CcFeedback, CcFeedbackExt, CmdBody, CmdMsg,
    DataMsg, EchoTime, FtiExt, InfoMsg, Message, NackMsg, ObjectMsgBase, PayloadId, RepairItem,
    RepairRequest, ReportMsg, RequestForm, WatermarkId, FEC_ID_RS8, FEC_ID_SB8,
};

// ─── Strategies ─────────────────────────────────────────────────────────────

fn fec_id_strategy() -> impl Strategy<Value = u8> {
    prop_oneof![Just(FEC_ID_RS8), Just(FEC_ID_SB8)]
}

fn payload_id_strategy(fec_id: u8) -> impl Strategy<Value = PayloadId> {
    // Field widths depend on the payload id layout.
    let (block_max, sym_max, len_max): (u32, u16, u16) = match fec_id {
        FEC_ID_RS8 => (0x00FF_FFFF, 0xFF, u16::MAX),
        _ => (0xFFFF, 0xFF, 0xFF),
    };
    (0..=block_max, 0..=sym_max, 0..=len_max).prop_map(|(b, s, l)| PayloadId {
        block_id: BlockId(b),
        symbol_id: s,
        block_len: l,
    })
}

fn object_base_strategy() -> impl Strategy<Value = (ObjectMsgBase, u8)> {
    (
        fec_id_strategy(),
        any::<u16>(),
        any::<u32>(),
        any::<u16>(),
        1u16..=8192,
        any::<u8>(),
        any::<u16>(),
        any::<bool>(),
        any::<u64>(),
        (1u16..=255, 0u16..=64),
    )
        .prop_map(
            |(
                fec_id,
                sequence,
                source_id,
                instance_id,
                segment_size,
                flags,
                object_id,
                with_fti,
                size,
                (ndata, nparity),
            )| {
                let fti = with_fti.then_some(FtiExt {
                    object_size: size & 0x0000_FFFF_FFFF_FFFF,
                    fec_instance: 0,
                    segment_size,
                    ndata,
                    nparity,
                });
                (
                    ObjectMsgBase {
                        sequence,
                        source_id,
                        instance_id,
                        segment_size,
                        flags,
                        fec_id,
                        object_id: ObjectId(object_id),
                        fti,
                    },
                    fec_id,
                )
            },
        )
}

fn repair_request_strategy() -> impl Strategy<Value = RepairRequest> {
    (
        fec_id_strategy(),
        prop_oneof![
            Just(RequestForm::Items),
            Just(RequestForm::Ranges),
            Just(RequestForm::Erasures)
        ],
        prop_oneof![
            Just(repair_flags::SEGMENT),
            Just(repair_flags::BLOCK),
            Just(repair_flags::OBJECT | repair_flags::INFO)
        ],
        1usize..=4,
    )
        .prop_flat_map(|(fec_id, form, flags, n)| {
            let n = if form == RequestForm::Ranges { n * 2 } else { n };
            (
                prop::collection::vec((any::<u16>(), payload_id_strategy(fec_id)), n),
                Just(form),
                Just(flags),
                Just(fec_id),
            )
        })
        .prop_map(|(raw, form, flags, fec_id)| RepairRequest {
            form,
            flags,
            items: raw
                .into_iter()
                .map(|(obj, payload_id)| RepairItem {
                    fec_id,
                    object_id: ObjectId(obj),
                    payload_id,
                })
                .collect(),
        })
}

fn message_strategy() -> impl Strategy<Value = Message> {
    prop_oneof![
        // INFO
        (object_base_strategy(), prop::collection::vec(any::<u8>(), 0..256)).prop_map(
            |((base, _), info)| {
                Message::Info(InfoMsg {
                    base,
                    info: Bytes::from(info),
                })
            }
        ),
        // DATA
        (object_base_strategy(), prop::collection::vec(any::<u8>(), 0..512)).prop_flat_map(
            |((base, fec_id), payload)| {
                payload_id_strategy(fec_id).prop_map(move |payload_id| {
                    Message::Data(DataMsg {
                        base: base.clone(),
                        payload_id,
                        payload: Bytes::from(payload.clone()),
                    })
                })
            }
        ),
        // CMD (assorted flavors)
        cmd_strategy().prop_map(Message::Cmd),
        // NACK
        (
            any::<u16>(),
            any::<u32>(),
            any::<u32>(),
            any::<u16>(),
            any::<u32>(),
            0u32..=999_999,
            prop::collection::vec(repair_request_strategy(), 0..4)
        )
            .prop_map(|(sequence, source_id, server_id, instance_id, sec, usec, requests)| {
                Message::Nack(NackMsg {
                    sequence,
                    source_id,
                    server_id,
                    instance_id,
                    grtt_response: EchoTime { sec, usec },
                    requests,
                })
            }),
        // ACK
        ack_strategy().prop_map(Message::Ack),
        // REPORT
        (any::<u16>(), any::<u32>()).prop_map(|(sequence, source_id)| {
            Message::Report(ReportMsg {
                sequence,
                source_id,
            })
        }),
    ]
}

fn cmd_strategy() -> impl Strategy<Value = CmdMsg> {
    let body = prop_oneof![
        Just(CmdBody::Eot),
        fec_id_strategy().prop_flat_map(|fec_id| {
            (
                payload_id_strategy(fec_id),
                any::<u16>(),
                prop::collection::vec(any::<u32>(), 0..4),
            )
                .prop_map(move |(payload_id, object_id, acking_nodes)| CmdBody::Flush {
                    fec_id,
                    object_id: ObjectId(object_id),
                    payload_id,
                    acking_nodes,
                })
        }),
        fec_id_strategy().prop_flat_map(|fec_id| {
            (
                payload_id_strategy(fec_id),
                any::<u16>(),
                prop::collection::vec(any::<u16>(), 0..4),
            )
                .prop_map(move |(payload_id, object_id, stale)| CmdBody::Squelch {
                    fec_id,
                    object_id: ObjectId(object_id),
                    payload_id,
                    stale_objects: stale.into_iter().map(ObjectId).collect(),
                })
        }),
        (
            any::<u16>(),
            any::<u32>(),
            0u32..=999_999,
            any::<u16>(),
            prop::collection::vec(
                (any::<u32>(), any::<u8>(), any::<u8>(), any::<u16>()),
                0..4
            )
        )
            .prop_map(|(cc_sequence, sec, usec, rate_q, fb)| CmdBody::Cc {
                cc_sequence,
                send_time: EchoTime { sec, usec },
                rate_q,
                feedback: fb
                    .into_iter()
                    .map(|(node_id, flags, rtt_q, rate_q)| CcFeedback {
                        node_id,
                        flags,
                        rtt_q,
                        rate_q,
                    })
                    .collect(),
            }),
        prop::collection::vec(repair_request_strategy(), 0..3).prop_map(|requests| {
            CmdBody::RepairAdv {
                flags: 0,
                rate_q: Some(777),
                requests,
            }
        }),
        prop::collection::vec(any::<u8>(), 0..128)
            .prop_map(|data| CmdBody::Application(Bytes::from(data))),
    ];
    (
        any::<u16>(),
        any::<u32>(),
        any::<u16>(),
        any::<u8>(),
        0u8..=15,
        0u8..=15,
        body,
    )
        .prop_map(
            |(sequence, source_id, instance_id, grtt_q, backoff, gsize_q, body)| CmdMsg {
                sequence,
                source_id,
                instance_id,
                grtt_q,
                backoff,
                gsize_q,
                body,
            },
        )
}

fn ack_strategy() -> impl Strategy<Value = AckMsg> {
    (
        any::<u16>(),
        any::<u32>(),
        any::<u32>(),
        any::<u16>(),
        any::<u32>(),
        0u32..=999_999,
        any::<bool>(),
        prop_oneof![
            Just(AckType::Cc),
            Just(AckType::Flush),
            Just(AckType::Watermark)
        ],
    )
        .prop_flat_map(
            |(sequence, source_id, server_id, instance_id, sec, usec, with_fb, ack_type)| {
                let payload = match ack_type {
                    AckType::Watermark => payload_id_strategy(FEC_ID_RS8)
                        .prop_map(|payload_id| {
                            AckPayload::Watermark(WatermarkId {
                                fec_id: FEC_ID_RS8,
                                object_id: ObjectId(3),
                                payload_id,
                            })
                        })
                        .boxed(),
                    _ => Just(AckPayload::None).boxed(),
                };
                payload.prop_map(move |payload| AckMsg {
                    sequence,
                    source_id,
                    server_id,
                    instance_id,
                    ack_type,
                    ack_id: 0,
                    grtt_response: EchoTime { sec, usec },
                    cc_feedback: with_fb.then_some(CcFeedbackExt {
                        flags: 4,
                        rtt_q: 100,
                        loss_q: 5,
                        rate_q: 1600,
                        cc_sequence: 2,
                    }),
                    payload,
                })
            },
        )
}

// ─── Properties ─────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Unpack(Pack(msg)) == msg, and re-packing yields identical bytes.
    #[test]
    fn message_roundtrip_byte_exact(msg in message_strategy()) {
        let encoded = msg.encode();
        let decoded = Message::decode(encoded.clone().freeze())
            .expect("own encoding must parse");
        prop_assert_eq!(&decoded, &msg);

        let reencoded = decoded.encode();
        prop_assert_eq!(
            &encoded[..],
            &reencoded[..],
            "pack/unpack/pack must be byte-identical"
        );
    }

    /// Arbitrary bytes never panic the parser.
    #[test]
    fn decode_arbitrary_bytes_is_total(data in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = Message::decode(Bytes::from(data));
    }

    /// Any truncation of a valid message either parses or fails cleanly —
    /// truncations inside the header always fail.
    #[test]
    fn truncation_never_panics(msg in message_strategy(), cut in any::<prop::sample::Index>()) {
        let encoded = msg.encode().freeze();
        if encoded.is_empty() {
            return Ok(());
        }
        let cut = cut.index(encoded.len());
        let _ = Message::decode(encoded.slice(..cut));
        if cut < 8 {
            prop_assert!(Message::decode(encoded.slice(..cut)).is_none());
        }
    }

    /// Flipping the fec_id byte of a DATA message to an unsupported scheme
    /// is rejected.
    #[test]
    fn unsupported_fec_id_rejected(bad_id in 0u8..=255) {
        prop_assume!(bad_id != FEC_ID_RS8 && bad_id != FEC_ID_SB8);
        let msg = Message::Data(DataMsg {
            base: ObjectMsgBase {
                sequence: 0,
                source_id: 1,
                instance_id: 0,
                segment_size: 64,
                flags: 0,
                fec_id: FEC_ID_RS8,
                object_id: ObjectId(0),
                fti: None,
            },
            payload_id: PayloadId::new(BlockId(0), 0, 8),
            payload: Bytes::from_static(b"x"),
        });
        let mut encoded: BytesMut = msg.encode();
        encoded[13] = bad_id;
        prop_assert!(Message::decode(encoded.freeze()).is_none());
    }
}
