// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! The typed binary framing spoken to the downstream speech backend.
//!
//! Every outbound message is `[TYPE:1][LENGTH:2 big-endian][PAYLOAD]`. One
//! TCP connection carries exactly one START, any number of AUDIO frames and
//! exactly one END; the connection is closed right after END.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

pub const TYPE_END: u8 = 0x00;
pub const TYPE_START: u8 = 0x01;
pub const TYPE_AUDIO: u8 = 0x12;

/// 320 samples x 2 bytes at 16 kHz = 20 ms per AUDIO frame
pub const AUDIO_FRAME_BYTES: usize = 640;

/// Encode one frame
pub fn frame(frame_type: u8, payload: &[u8]) -> Bytes {
    debug_assert!(payload.len() <= u16::MAX as usize);

    let mut out = BytesMut::with_capacity(3 + payload.len());
    out.put_u8(frame_type);
    out.put_u16(payload.len() as u16);
    out.put_slice(payload);
    out.freeze()
}

/// START payload, sent as UTF-8 JSON. Field order is part of the wire
/// contract; absent call metadata is carried as empty strings.
#[derive(Debug, Serialize)]
pub struct StartPayload<'s> {
    pub call_uuid: &'s str,
    pub agent_extension: &'s str,
    pub agent_username: &'s str,
    pub agent_id: &'s str,
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn frame_layout() {
        let encoded = frame(TYPE_AUDIO, &[0xab; 4]);

        assert_eq!(&encoded[..3], &[0x12, 0x00, 0x04]);
        assert_eq!(&encoded[3..], &[0xab; 4]);
    }

    #[test]
    fn length_is_big_endian() {
        let encoded = frame(TYPE_AUDIO, &[0u8; AUDIO_FRAME_BYTES]);

        assert_eq!(&encoded[..3], &[0x12, 0x02, 0x80]);
    }

    #[test]
    fn end_frame_is_three_bytes() {
        assert_eq!(&frame(TYPE_END, &[])[..], &[0x00, 0x00, 0x00]);
    }

    #[test]
    fn start_payload_field_order() {
        let payload = StartPayload {
            call_uuid: "A1",
            agent_extension: "100",
            agent_username: "",
            agent_id: "",
        };

        assert_eq!(
            serde_json::to_string(&payload).unwrap(),
            r#"{"call_uuid":"A1","agent_extension":"100","agent_username":"","agent_id":""}"#
        );
    }
}
