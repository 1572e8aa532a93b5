//! JSON and `MsgPack` codecs over the shared wire structs.
//!
//! `decode(encode(m)) == m` holds for every legal canonical value on both
//! codecs. The only asymmetry is the JSON legacy shim: a tensor without a
//! `shape` is accepted by [`JsonCodec`] and promoted to `[1, len]`, while
//! [`MsgPackCodec`] rejects it.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::CodecError;
use crate::messages::{
    DecodeOptions, Feedback, Message, MessageList, WireFeedback, WireMessage, WireMessageList,
};

/// A canonical type with a serde wire form.
pub trait WireForm: Sized {
    type Wire: Serialize + DeserializeOwned;

    /// # Errors
    ///
    /// Returns `CodecError::Malformed` when the wire value violates an
    /// envelope invariant.
    fn from_wire(wire: Self::Wire, opts: DecodeOptions) -> Result<Self, CodecError>;

    fn to_wire(&self) -> Self::Wire;
}

impl WireForm for Message {
    type Wire = WireMessage;

    fn from_wire(wire: WireMessage, opts: DecodeOptions) -> Result<Self, CodecError> {
        wire.into_message(opts)
    }

    fn to_wire(&self) -> WireMessage {
        WireMessage::from_message(self)
    }
}

impl WireForm for Feedback {
    type Wire = WireFeedback;

    fn from_wire(wire: WireFeedback, opts: DecodeOptions) -> Result<Self, CodecError> {
        wire.into_feedback(opts)
    }

    fn to_wire(&self) -> WireFeedback {
        WireFeedback::from_feedback(self)
    }
}

impl WireForm for MessageList {
    type Wire = WireMessageList;

    fn from_wire(wire: WireMessageList, opts: DecodeOptions) -> Result<Self, CodecError> {
        wire.into_list(opts)
    }

    fn to_wire(&self) -> WireMessageList {
        WireMessageList::from_list(self)
    }
}

/// Bytes to canonical values and back.
pub trait WireCodec {
    /// # Errors
    ///
    /// Returns a [`CodecError`] for undecodable bytes or an invalid envelope.
    fn decode<T: WireForm>(&self, bytes: &[u8]) -> Result<T, CodecError>;

    /// # Errors
    ///
    /// Returns a [`CodecError`] if the serializer fails.
    fn encode<T: WireForm>(&self, value: &T) -> Result<Vec<u8>, CodecError>;
}

/// The text transport's codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    const OPTIONS: DecodeOptions = DecodeOptions {
        infer_missing_shape: true,
    };

    /// Decodes from an already-parsed JSON document.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the document does not match the wire form
    /// or violates an envelope invariant.
    pub fn decode_value<T: WireForm>(&self, value: Value) -> Result<T, CodecError> {
        let wire: T::Wire = serde_json::from_value(value)?;
        T::from_wire(wire, Self::OPTIONS)
    }

    /// # Errors
    ///
    /// Returns a [`CodecError`] if serialization fails.
    pub fn encode_value<T: WireForm>(&self, value: &T) -> Result<Value, CodecError> {
        Ok(serde_json::to_value(value.to_wire())?)
    }
}

impl WireCodec for JsonCodec {
    fn decode<T: WireForm>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        let wire: T::Wire = serde_json::from_slice(bytes)?;
        T::from_wire(wire, Self::OPTIONS)
    }

    fn encode<T: WireForm>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(&value.to_wire())?)
    }
}

/// The binary RPC transport's codec: named `MsgPack` maps.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl WireCodec for MsgPackCodec {
    fn decode<T: WireForm>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        let wire: T::Wire = rmp_serde::from_slice(bytes)?;
        T::from_wire(wire, DecodeOptions::default())
    }

    fn encode<T: WireForm>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec_named(&value.to_wire())?)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::messages::{Meta, MetricRecord, Payload, Tensor};

    fn sample_meta() -> Meta {
        let mut meta = Meta {
            puid: Some("abc".into()),
            ..Meta::default()
        };
        meta.tags.insert("mytag".into(), json!(1));
        meta.routing.insert("router".into(), 2);
        meta.request_path.insert("model".into(), "img:0.1".into());
        meta.metrics.push(MetricRecord::counter("mycounter", 1.0));
        meta
    }

    fn roundtrip<C: WireCodec>(codec: &C, msg: &Message) -> Message {
        let bytes = codec.encode(msg).expect("encode");
        codec.decode(&bytes).expect("decode")
    }

    #[test]
    fn every_payload_roundtrips_on_both_codecs() {
        let payloads = vec![
            Payload::Tensor(Tensor::new(vec![2, 2], vec![1.0, -2.5, 0.0, 4.0]).unwrap()),
            Payload::NdArray(vec![json!([1, "a", true]), json!([2.5, null, {"k": "v"}])]),
            Payload::Binary(vec![0, 1, 2, 254, 255]),
            Payload::Str("hello".into()),
            Payload::Json(json!({"nested": {"list": [1, 2, 3]}})),
            Payload::Json(Value::Null),
        ];
        for payload in payloads {
            let msg = Message::from_payload(payload).with_meta(sample_meta());
            assert_eq!(roundtrip(&JsonCodec, &msg), msg);
            assert_eq!(roundtrip(&MsgPackCodec, &msg), msg);
        }
    }

    #[test]
    fn names_roundtrip() {
        let msg = Message::new(
            Payload::Tensor(Tensor::row(vec![0.1, 0.2])),
            vec!["a".into(), "b".into()],
            Meta::default(),
        )
        .unwrap();
        assert_eq!(roundtrip(&JsonCodec, &msg), msg);
        assert_eq!(roundtrip(&MsgPackCodec, &msg), msg);
    }

    #[test]
    fn msgpack_carries_binary_natively() {
        let msg = Message::from_payload(vec![7u8; 16]);
        let bytes = MsgPackCodec.encode(&msg).unwrap();
        // bin8 marker followed by the length, not a base64 string.
        assert!(bytes.windows(2).any(|w| w == [0xc4, 16]));
    }

    #[test]
    fn msgpack_rejects_shapeless_tensor() {
        let wire = json!({"data": {"tensor": {"values": [1.0, 2.0]}}});
        let bytes = rmp_serde::to_vec_named(&wire).unwrap();
        assert!(MsgPackCodec.decode::<Message>(&bytes).is_err());
        let msg: Message = JsonCodec.decode_value(wire).unwrap();
        assert_eq!(msg.payload.as_tensor().unwrap().shape(), &[1, 2]);
    }

    #[test]
    fn oversized_tensor_shape_is_malformed() {
        let wire = json!({"data": {"tensor": {"shape": [4_294_967_296u64, 4_294_967_296u64], "values": []}}});
        let err = JsonCodec.decode_value::<Message>(wire.clone()).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { .. }));
        let bytes = rmp_serde::to_vec_named(&wire).unwrap();
        assert!(matches!(
            MsgPackCodec.decode::<Message>(&bytes),
            Err(CodecError::Malformed { .. })
        ));
    }

    #[test]
    fn malformed_json_is_a_codec_error() {
        let err = JsonCodec.decode::<Message>(b"{not json").unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));
    }

    #[test]
    fn feedback_and_list_roundtrip() {
        let fb = Feedback {
            request: Some(Message::from_payload(Tensor::row(vec![1.0]))),
            response: Some(Message::from_payload("out")),
            reward: 0.5,
            truth: None,
        };
        let bytes = MsgPackCodec.encode(&fb).unwrap();
        assert_eq!(MsgPackCodec.decode::<Feedback>(&bytes).unwrap(), fb);

        let list = MessageList::from(vec![
            Message::from_payload("a"),
            Message::from_payload(Tensor::row(vec![2.0])),
        ]);
        let value = JsonCodec.encode_value(&list).unwrap();
        assert!(value.get("seldonMessages").is_some());
        assert_eq!(JsonCodec.decode_value::<MessageList>(value).unwrap(), list);
        let bytes = MsgPackCodec.encode(&list).unwrap();
        assert_eq!(MsgPackCodec.decode::<MessageList>(&bytes).unwrap(), list);
    }

    fn arb_tensor() -> impl Strategy<Value = Tensor> {
        (1usize..4, 1usize..5).prop_flat_map(|(rows, cols)| {
            prop::collection::vec(-1.0e6f64..1.0e6, rows * cols)
                .prop_map(move |values| Tensor::new(vec![rows, cols], values).unwrap())
        })
    }

    fn arb_payload() -> impl Strategy<Value = Payload> {
        prop_oneof![
            arb_tensor().prop_map(Payload::Tensor),
            prop::collection::vec(any::<u8>(), 0..64).prop_map(Payload::Binary),
            ".{0,32}".prop_map(Payload::Str),
            (any::<i64>(), "[a-z]{1,8}").prop_map(|(n, key)| {
                Payload::Json(Value::Object(std::iter::once((key, json!(n))).collect()))
            }),
        ]
    }

    proptest! {
        #[test]
        fn prop_roundtrip_json(payload in arb_payload(), puid in proptest::option::of("[a-z0-9]{4}")) {
            let meta = Meta { puid, ..Meta::default() };
            let msg = Message::from_payload(payload).with_meta(meta);
            prop_assert_eq!(roundtrip(&JsonCodec, &msg), msg);
        }

        #[test]
        fn prop_roundtrip_msgpack(payload in arb_payload()) {
            let msg = Message::from_payload(payload);
            prop_assert_eq!(roundtrip(&MsgPackCodec, &msg), msg);
        }
    }
}
