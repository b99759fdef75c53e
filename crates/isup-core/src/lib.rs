// isup-core: ISUP v5 wire format.
//
// Framing, CRC-16/IBM validation, access-event body decoding, and ACK
// construction for the binary turnstile/controller protocol.

pub mod frame;

pub use frame::{
    AccessEvent, AckFrame, CrcMode, DeviceTimestamp, Frame, FrameError, FrameHeader,
    PassDirection, VerifyMode, crc16, encode_frame, make_ack, make_heartbeat_ack, parse_ack,
    parse_access_event, parse_frame, parse_header, ACK_COMMAND, HEADER_SIZE, MARKER,
};
