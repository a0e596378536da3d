//! Messages queued for sending on a connection
//!
//! Handlers queue a [`ServerMessage`]; the connection's send task encodes it with
//! the connection's byte order once the socket is ready for it.

use std::sync::Arc;

use bytes::Bytes;

use super::subscription::MonitorSubscription;
use crate::{
    data::{BitSet, FieldDesc, PvStructure},
    messages::{
        Command, SearchResponse, Status, ValidationRequest, WireBuffer, flags, subcommand,
    },
};

pub(crate) enum ServerMessage {
    Control {
        command: u8,
        data: u32,
    },
    ValidationRequest(ValidationRequest),
    Validated(Status),
    EchoResponse(Bytes),
    SearchResponse(SearchResponse),
    CreateChannel {
        cid: u32,
        sid: u32,
        status: Status,
    },
    DestroyChannel {
        sid: u32,
        cid: u32,
    },
    AclChange {
        cid: u32,
        writable: bool,
    },
    /// Reply to the INIT of a get, put, monitor or RPC request
    RequestInit {
        command: Command,
        request_id: u32,
        status: Status,
        desc: Option<FieldDesc>,
    },
    /// Reply carrying a status only, e.g. for a completed put
    RequestStatus {
        command: Command,
        request_id: u32,
        subcommand: u8,
        status: Status,
    },
    /// Reply with (part of) a value
    RequestData {
        command: Command,
        request_id: u32,
        subcommand: u8,
        status: Status,
        changes: BitSet,
        value: PvStructure,
    },
    RpcResult {
        request_id: u32,
        subcommand: u8,
        status: Status,
        value: Option<PvStructure>,
    },
    FieldType {
        request_id: u32,
        status: Status,
        desc: Option<FieldDesc>,
    },
    Monitor(Arc<MonitorSubscription>),
}

impl ServerMessage {
    pub fn encode(&self, buffer: &mut WireBuffer) {
        match self {
            ServerMessage::Control { command, data } => {
                buffer.put_control(flags::FROM_SERVER, *command, *data)
            }
            ServerMessage::ValidationRequest(request) => request.write(buffer),
            ServerMessage::Validated(status) => {
                let start = buffer.begin_message(flags::FROM_SERVER, Command::ConnectionValidated);
                status.write(buffer);
                buffer.end_message(start);
            }
            ServerMessage::EchoResponse(payload) => {
                let start = buffer.begin_message(flags::FROM_SERVER, Command::Echo);
                buffer.put_bytes(payload);
                buffer.end_message(start);
            }
            ServerMessage::SearchResponse(response) => response.write(buffer),
            ServerMessage::CreateChannel { cid, sid, status } => {
                let start = buffer.begin_message(flags::FROM_SERVER, Command::CreateChannel);
                buffer.put_u32(*cid);
                buffer.put_u32(*sid);
                status.write(buffer);
                buffer.end_message(start);
            }
            ServerMessage::DestroyChannel { sid, cid } => {
                let start = buffer.begin_message(flags::FROM_SERVER, Command::DestroyChannel);
                buffer.put_u32(*sid);
                buffer.put_u32(*cid);
                buffer.end_message(start);
            }
            ServerMessage::AclChange { cid, writable } => {
                let start = buffer.begin_message(flags::FROM_SERVER, Command::AclChange);
                buffer.put_u32(*cid);
                buffer.put_u8(u8::from(*writable));
                buffer.end_message(start);
            }
            ServerMessage::RequestInit {
                command,
                request_id,
                status,
                desc,
            } => {
                let start = buffer.begin_message(flags::FROM_SERVER, *command);
                buffer.put_u32(*request_id);
                buffer.put_u8(subcommand::INIT);
                status.write(buffer);
                if status.is_ok()
                    && let Some(desc) = desc
                {
                    desc.write(buffer);
                }
                buffer.end_message(start);
            }
            ServerMessage::RequestStatus {
                command,
                request_id,
                subcommand,
                status,
            } => {
                let start = buffer.begin_message(flags::FROM_SERVER, *command);
                buffer.put_u32(*request_id);
                buffer.put_u8(*subcommand);
                status.write(buffer);
                buffer.end_message(start);
            }
            ServerMessage::RequestData {
                command,
                request_id,
                subcommand,
                status,
                changes,
                value,
            } => {
                let start = buffer.begin_message(flags::FROM_SERVER, *command);
                buffer.put_u32(*request_id);
                buffer.put_u8(*subcommand);
                status.write(buffer);
                if status.is_ok() {
                    changes.write(buffer);
                    value.write_changed(changes, buffer);
                }
                buffer.end_message(start);
            }
            ServerMessage::RpcResult {
                request_id,
                subcommand,
                status,
                value,
            } => {
                let start = buffer.begin_message(flags::FROM_SERVER, Command::Rpc);
                buffer.put_u32(*request_id);
                buffer.put_u8(*subcommand);
                status.write(buffer);
                if status.is_ok() {
                    let desc = value.as_ref().map(|v| v.field_desc());
                    FieldDesc::write_optional(desc.as_ref(), buffer);
                    if let Some(value) = value {
                        value.write(buffer);
                    }
                }
                buffer.end_message(start);
            }
            ServerMessage::FieldType {
                request_id,
                status,
                desc,
            } => {
                let start = buffer.begin_message(flags::FROM_SERVER, Command::GetType);
                buffer.put_u32(*request_id);
                status.write(buffer);
                if status.is_ok() {
                    FieldDesc::write_optional(desc.as_ref(), buffer);
                }
                buffer.end_message(start);
            }
            ServerMessage::Monitor(subscription) => subscription.encode(buffer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ByteOrder, PvaHeader, control, parse_u32};

    #[test]
    fn acl_change_layout() {
        let mut buffer = WireBuffer::new(ByteOrder::Little);
        ServerMessage::AclChange {
            cid: 7,
            writable: true,
        }
        .encode(&mut buffer);
        let (payload, header) = PvaHeader::parse(buffer.as_slice()).unwrap();
        assert_eq!(header.command, Command::AclChange as u8);
        assert!(header.is_from_server());
        assert_eq!(header.byte_order(), ByteOrder::Little);
        assert_eq!(payload, &[7, 0, 0, 0, 1]);
    }

    #[test]
    fn failed_init_has_no_type() {
        let mut buffer = WireBuffer::new(ByteOrder::Big);
        ServerMessage::RequestInit {
            command: Command::Get,
            request_id: 3,
            status: Status::error("nope"),
            desc: Some(FieldDesc::Any),
        }
        .encode(&mut buffer);
        let (payload, header) = PvaHeader::parse(buffer.as_slice()).unwrap();
        assert_eq!(header.payload_size as usize, payload.len());
        let (rest, request_id) = parse_u32(ByteOrder::Big, payload).unwrap();
        assert_eq!(request_id, 3);
        assert_eq!(rest[0], subcommand::INIT);
        let (rest, status) = Status::parse(ByteOrder::Big, &rest[1..]).unwrap();
        assert!(!status.is_ok());
        assert!(rest.is_empty());
    }

    #[test]
    fn control_message_has_no_payload() {
        let mut buffer = WireBuffer::new(ByteOrder::Big);
        ServerMessage::Control {
            command: control::SET_BYTE_ORDER,
            data: 0,
        }
        .encode(&mut buffer);
        assert_eq!(buffer.len(), 8);
        let (_, header) = PvaHeader::parse(buffer.as_slice()).unwrap();
        assert!(header.is_control());
        assert_eq!(header.command, control::SET_BYTE_ORDER);
    }
}
