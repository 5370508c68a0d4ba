//! The wire protocol codec. Outbound operations (legacy opcodes and OP_MSG) serialize to
//! complete frames; inbound frames are parsed into either an OP_MSG [`Message`] or a
//! legacy [`Reply`] depending on the opcode in the header.

pub(crate) mod header;
pub(crate) mod legacy;
pub(crate) mod message;
pub(crate) mod reply;
pub(crate) mod util;

use std::io::Read;

pub(crate) use self::{
    header::{Header, OpCode},
    message::{DocumentSequence, Message, MessageFlags},
    reply::{Reply, ResponseFlags},
    util::next_request_id,
};
use crate::error::{Error, Result};

/// A parsed inbound frame.
#[derive(Clone, Debug)]
pub(crate) enum ResponseMessage {
    Msg(Message),
    Reply(Reply),
}

impl ResponseMessage {
    /// Parses a complete frame, header included, as produced by the message buffer.
    pub(crate) fn decode(frame: &[u8]) -> Result<Self> {
        let mut reader = frame;
        let header = Header::read_from(&mut reader)?;

        if header.length as usize != frame.len() {
            return Err(Error::invalid_response(format!(
                "header indicated a message of {} bytes but the frame was {} bytes",
                header.length,
                frame.len(),
            )));
        }
        let body_length = frame.len() - Header::LENGTH;

        match header.op_code {
            OpCode::Message => {
                Message::read_body(&mut reader, &header, body_length).map(ResponseMessage::Msg)
            }
            OpCode::Compressed => {
                Message::read_compressed_body(&mut reader, &header).map(ResponseMessage::Msg)
            }
            OpCode::Reply => {
                Reply::read_body(&mut reader, &header, body_length).map(ResponseMessage::Reply)
            }
            other => Err(Error::invalid_response(format!(
                "cannot decode a message with opcode {:?} as a response",
                other
            ))),
        }
    }

    /// The request id of the outbound message this frame answers.
    pub(crate) fn response_to(&self) -> i32 {
        match self {
            ResponseMessage::Msg(message) => message.response_to,
            ResponseMessage::Reply(reply) => reply.response_to,
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{
        legacy::{OpGetMore, OpKillCursors, OpQuery, QueryFlags, DEFAULT_MAX_BSON_OBJECT_SIZE},
        *,
    };
    use crate::bson::{doc, Document};

    fn frame_header(frame: &[u8]) -> Header {
        let mut reader = frame;
        Header::read_from(&mut reader).unwrap()
    }

    #[test]
    fn op_msg_round_trip() {
        let body = doc! { "find": "users", "$db": "app", "filter": { "n": 5_i64 } };
        let sequence = DocumentSequence::new(
            "documents",
            &[doc! { "_id": 1 }, doc! { "_id": 2, "name": "b" }],
        )
        .unwrap();
        let message = Message::new(&body, vec![sequence.clone()], true).unwrap();

        let frame = message.encode(42, DEFAULT_MAX_BSON_OBJECT_SIZE).unwrap();
        let header = frame_header(&frame);
        assert_eq!(header.length as usize, frame.len());
        assert_eq!(header.request_id, 42);
        assert_eq!(header.op_code, OpCode::Message);

        let decoded = match ResponseMessage::decode(&frame).unwrap() {
            ResponseMessage::Msg(message) => message,
            other => panic!("expected OP_MSG, got {:?}", other),
        };
        assert!(decoded.flags.contains(MessageFlags::EXHAUST_ALLOWED));
        assert_eq!(decoded.checksum, None);
        assert_eq!(decoded.single_document().unwrap(), body);
        assert_eq!(decoded.document_sequences, vec![sequence]);
    }

    #[test]
    fn op_msg_rejects_length_mismatch() {
        let message = Message::new(&doc! { "ping": 1 }, Vec::new(), false).unwrap();
        let mut frame = message.encode(1, DEFAULT_MAX_BSON_OBJECT_SIZE).unwrap();

        // Claim one byte more than the frame holds.
        let bogus = (frame.len() as i32 + 1).to_le_bytes();
        frame[..4].copy_from_slice(&bogus);
        assert!(ResponseMessage::decode(&frame).is_err());
    }

    #[test]
    fn op_msg_requires_a_type_zero_section() {
        let sequence = DocumentSequence::new("documents", &[doc! { "x": 1 }]).unwrap();
        let message = Message::new(&doc! { "insert": "c" }, vec![sequence], false).unwrap();
        let frame = message.encode(7, DEFAULT_MAX_BSON_OBJECT_SIZE).unwrap();
        let header = frame_header(&frame);

        // Drop the type 0 section (flag bytes stay, then skip 1 type byte + document).
        let doc_len = message.document_payload.len();
        let mut body = frame[Header::LENGTH..Header::LENGTH + 4].to_vec();
        body.extend_from_slice(&frame[Header::LENGTH + 4 + 1 + doc_len..]);

        let err = Message::read_body(body.as_slice(), &header, body.len()).unwrap_err();
        assert!(err.to_string().contains("payload type 0"));
    }

    #[test]
    fn op_query_round_trip() {
        let namespace = "db.coll".to_string();
        let query = doc! { "isMaster": 1, "helloOk": true };
        let op = OpQuery {
            namespace: namespace.clone(),
            flags: QueryFlags::SLAVE_OK | QueryFlags::TAILABLE_CURSOR,
            number_to_skip: 3,
            number_to_return: -1,
            query: query.clone(),
            projection: Some(doc! { "a": 1 }),
        };

        let frame = op.encode(11, DEFAULT_MAX_BSON_OBJECT_SIZE).unwrap();
        let header = frame_header(&frame);
        assert_eq!(header.length as usize, frame.len());
        assert_eq!(header.op_code, OpCode::Query);

        let mut body = &frame[Header::LENGTH..];
        let body_length = body.len();
        let decoded = OpQuery::decode_body(&mut body, body_length).unwrap();
        assert_eq!(decoded.namespace, namespace);
        assert_eq!(decoded.flags, op.flags);
        assert_eq!(decoded.number_to_skip, 3);
        assert_eq!(decoded.number_to_return, -1);
        assert_eq!(decoded.query, query);
        assert_eq!(decoded.projection, Some(doc! { "a": 1 }));
    }

    #[test]
    fn op_get_more_and_kill_cursors_round_trip() {
        let namespace = "db.coll".to_string();
        let get_more = OpGetMore {
            namespace: namespace.clone(),
            number_to_return: 100,
            cursor_id: 0x0123_4567_89ab_cdef,
        };
        let frame = get_more.encode(5).unwrap();
        assert_eq!(frame_header(&frame).op_code, OpCode::GetMore);
        let decoded = OpGetMore::decode_body(&mut &frame[Header::LENGTH..]).unwrap();
        assert_eq!(decoded.namespace, namespace);
        assert_eq!(decoded.number_to_return, 100);
        assert_eq!(decoded.cursor_id, 0x0123_4567_89ab_cdef);

        let kill = OpKillCursors {
            cursor_ids: vec![1, -2, i64::MAX],
        };
        let frame = kill.encode(6).unwrap();
        assert_eq!(frame_header(&frame).op_code, OpCode::KillCursors);
        let decoded = OpKillCursors::decode_body(&mut &frame[Header::LENGTH..]).unwrap();
        assert_eq!(decoded.cursor_ids, vec![1, -2, i64::MAX]);
    }

    #[test]
    fn op_reply_decode() {
        let docs = [doc! { "a": 1 }, doc! { "b": "two" }];

        let mut body = Vec::new();
        body.extend_from_slice(&(ResponseFlags::AWAIT_CAPABLE.bits()).to_le_bytes());
        body.extend_from_slice(&99_i64.to_le_bytes());
        body.extend_from_slice(&0_i32.to_le_bytes());
        body.extend_from_slice(&2_i32.to_le_bytes());
        for doc in &docs {
            body.extend_from_slice(&crate::bson::to_vec(doc).unwrap());
        }

        let mut frame = Vec::new();
        let header = Header {
            length: (Header::LENGTH + body.len()) as i32,
            request_id: 1,
            response_to: 17,
            op_code: OpCode::Reply,
        };
        header.write_to(&mut frame);
        frame.extend_from_slice(&body);

        let decoded = match ResponseMessage::decode(&frame).unwrap() {
            ResponseMessage::Reply(reply) => reply,
            other => panic!("expected OP_REPLY, got {:?}", other),
        };
        assert_eq!(decoded.response_to, 17);
        assert_eq!(decoded.response_flags, ResponseFlags::AWAIT_CAPABLE);
        assert_eq!(decoded.cursor_id, 99);
        assert_eq!(decoded.number_returned, 2);
        assert_eq!(decoded.documents().unwrap(), docs.to_vec());
        assert_eq!(ResponseMessage::decode(&frame).unwrap().response_to(), 17);
    }

    #[test]
    fn op_reply_rejects_truncated_documents() {
        let mut body = Vec::new();
        body.extend_from_slice(&0_u32.to_le_bytes());
        body.extend_from_slice(&0_i64.to_le_bytes());
        body.extend_from_slice(&0_i32.to_le_bytes());
        body.extend_from_slice(&1_i32.to_le_bytes());
        let doc_bytes = crate::bson::to_vec(&doc! { "a": 1 }).unwrap();
        body.extend_from_slice(&doc_bytes[..doc_bytes.len() - 2]);

        let mut frame = Vec::new();
        let header = Header {
            length: (Header::LENGTH + body.len()) as i32,
            request_id: 1,
            response_to: 0,
            op_code: OpCode::Reply,
        };
        header.write_to(&mut frame);
        frame.extend_from_slice(&body);

        assert!(ResponseMessage::decode(&frame).is_err());
    }

    #[test]
    fn op_msg_rejects_oversized_documents_at_encode_time() {
        let body = doc! { "insert": "c", "padding": "x".repeat(512) };
        let message = Message::new(&body, Vec::new(), false).unwrap();

        let err = message.encode(1, 256).unwrap_err();
        assert!(err.to_string().contains("maximum BSON object size"));

        // A small command body does not excuse an oversized sequence entry.
        let sequence =
            DocumentSequence::new("documents", &[doc! { "blob": "y".repeat(512) }]).unwrap();
        let message = Message::new(&doc! { "insert": "c" }, vec![sequence], false).unwrap();
        let err = message.encode(2, 256).unwrap_err();
        assert!(err.to_string().contains("maximum BSON object size"));

        // At or under the limit still encodes.
        let message = Message::new(&doc! { "ping": 1 }, Vec::new(), false).unwrap();
        assert!(message.encode(3, 256).is_ok());
    }

    #[test]
    fn request_ids_are_strictly_increasing() {
        let first = next_request_id();
        let second = next_request_id();
        assert!(second > first);
    }

    #[test]
    fn empty_document_survives_op_msg() {
        let message = Message::new(&Document::new(), Vec::new(), false).unwrap();
        let frame = message.encode(1, DEFAULT_MAX_BSON_OBJECT_SIZE).unwrap();
        let decoded = match ResponseMessage::decode(&frame).unwrap() {
            ResponseMessage::Msg(message) => message,
            other => panic!("expected OP_MSG, got {:?}", other),
        };
        assert_eq!(decoded.single_document().unwrap(), Document::new());
    }
}
