use std::io::ErrorKind;

use rmp_serde::decode::Error as DecodeError;

use super::error::CodecError;
use super::messages::Message;

/// Encodes a record as a self-describing MessagePack map.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(message)?)
}

/// Decodes one record from the front of `bytes` without touching the input.
///
/// Records carry no length prefix, so the number of bytes the record used is
/// the length of its re-encoding.
pub fn decode(bytes: &[u8]) -> Result<(Message, usize), CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Truncated);
    }

    let message: Message = rmp_serde::from_read(bytes).map_err(classify)?;
    let consumed = encode(&message)?.len();
    if consumed > bytes.len() {
        return Err(CodecError::Corrupt(format!(
            "record re-encodes to {} bytes but only {} were read",
            consumed,
            bytes.len()
        )));
    }
    Ok((message, consumed))
}

fn classify(err: DecodeError) -> CodecError {
    match &err {
        DecodeError::InvalidMarkerRead(io) | DecodeError::InvalidDataRead(io)
            if io.kind() == ErrorKind::UnexpectedEof =>
        {
            CodecError::Truncated
        }
        _ => CodecError::Corrupt(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{
        Call, CallPayload, Response, ResponsePayload, RoutePoint, Submit,
    };
    use uuid::Uuid;

    fn submit_call() -> Message {
        Message::Call(Call {
            id: 42,
            payload: CallPayload::Submit(Submit {
                uuid: Uuid::new_v4().to_string(),
                start: 1_700_000_000_000,
                route: vec![
                    RoutePoint {
                        timestamp: 0,
                        lat: 60.1,
                        lon: 24.9,
                    },
                    RoutePoint {
                        timestamp: 1000,
                        lat: 60.2,
                        lon: 25.0,
                    },
                ],
            }),
        })
    }

    #[test]
    fn decode_inverts_encode() {
        let messages = vec![
            submit_call(),
            Message::Call(Call {
                id: 1,
                payload: CallPayload::Login {
                    api_key: "secret".into(),
                },
            }),
            Message::Response(Response {
                id: 7,
                payload: ResponsePayload::Login,
            }),
            Message::Response(Response {
                id: 8,
                payload: ResponsePayload::Error {
                    message: "quota exceeded".into(),
                },
            }),
        ];

        for message in messages {
            let bytes = encode(&message).unwrap();
            let (decoded, used) = decode(&bytes).unwrap();
            assert_eq!(decoded, message);
            assert_eq!(used, bytes.len());
        }
    }

    #[test]
    fn every_strict_prefix_is_truncated() {
        let bytes = encode(&submit_call()).unwrap();
        for len in 0..bytes.len() {
            match decode(&bytes[..len]) {
                Err(CodecError::Truncated) => {}
                other => panic!("prefix of {len} bytes gave {other:?}"),
            }
        }
    }

    #[test]
    fn trailing_bytes_are_left_for_the_next_record() {
        let first = Message::Response(Response {
            id: 3,
            payload: ResponsePayload::Submit,
        });
        let mut bytes = encode(&first).unwrap();
        let first_len = bytes.len();
        bytes.extend(encode(&submit_call()).unwrap());

        let (decoded, used) = decode(&bytes).unwrap();
        assert_eq!(decoded, first);
        assert_eq!(used, first_len);
    }

    #[test]
    fn garbage_is_corrupt() {
        let err = decode(&[0xc1, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, CodecError::Corrupt(_)));

        let not_a_message = rmp_serde::to_vec_named(&("hello", 5u8)).unwrap();
        let err = decode(&not_a_message).unwrap_err();
        assert!(matches!(err, CodecError::Corrupt(_)));
    }
}
