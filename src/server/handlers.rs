//! Handlers for the commands a client sends on a connection
//!
//! [`COMMAND_HANDLERS`] maps each command code to its handler. Handlers decode
//! the payload and queue their replies; a returned error closes the connection.

use std::sync::Arc;

use bytes::Bytes;
use nom::IResult;
use tracing::{debug, trace, warn};

use super::{
    ServerPv,
    replies::ServerMessage,
    tcp::{Request, ServerTcpHandler},
};
use crate::{
    data::{BitSet, DataError, PvStructure},
    messages::{
        ByteOrder, COMMAND_COUNT, Command, MessageError, SearchRequest, Status, ValidationReply,
        parse_string, parse_u8, parse_u16, parse_u32, subcommand,
    },
};

type CommandHandler = fn(&Arc<ServerTcpHandler>, ByteOrder, &[u8]) -> Result<(), MessageError>;

pub(super) const COMMAND_HANDLERS: [Option<CommandHandler>; COMMAND_COUNT] = {
    let mut table: [Option<CommandHandler>; COMMAND_COUNT] = [None; COMMAND_COUNT];
    table[Command::ConnectionValidation as usize] = Some(handle_validation as CommandHandler);
    table[Command::Echo as usize] = Some(handle_echo as CommandHandler);
    table[Command::Search as usize] = Some(handle_search as CommandHandler);
    table[Command::CreateChannel as usize] = Some(handle_create_channel as CommandHandler);
    table[Command::DestroyChannel as usize] = Some(handle_destroy_channel as CommandHandler);
    table[Command::Get as usize] = Some(handle_get as CommandHandler);
    table[Command::Put as usize] = Some(handle_put as CommandHandler);
    table[Command::Monitor as usize] = Some(handle_monitor as CommandHandler);
    table[Command::DestroyRequest as usize] = Some(handle_destroy_request as CommandHandler);
    table[Command::GetType as usize] = Some(handle_get_type as CommandHandler);
    table[Command::Message as usize] = Some(handle_message as CommandHandler);
    table[Command::Rpc as usize] = Some(handle_rpc as CommandHandler);
    table[Command::CancelRequest as usize] = Some(handle_cancel_request as CommandHandler);
    table
};

/// The common start of request messages: sid, request id, and subcommand
fn parse_request(order: ByteOrder, input: &[u8]) -> IResult<&[u8], (u32, u32, u8)> {
    let (input, sid) = parse_u32(order, input)?;
    let (input, request_id) = parse_u32(order, input)?;
    let (input, sub) = parse_u8(input)?;
    Ok((input, (sid, request_id, sub)))
}

/// Find the PV of a request, replying with an error when there is none
fn channel(
    connection: &ServerTcpHandler,
    command: Command,
    sid: u32,
    request_id: u32,
    sub: u8,
) -> Option<Arc<ServerPv>> {
    let pv = connection.context().get_pv_by_sid(sid);
    if pv.is_none() {
        debug!("{:?} request {request_id} for unknown SID {sid}", command);
        connection.send(ServerMessage::RequestStatus {
            command,
            request_id,
            subcommand: sub,
            status: Status::error(format!("No channel with SID {sid}")),
        });
    }
    pv
}

fn handle_validation(
    connection: &Arc<ServerTcpHandler>,
    order: ByteOrder,
    payload: &[u8],
) -> Result<(), MessageError> {
    let reply = ValidationReply::parse(order, payload)?;
    connection.validated(reply);
    Ok(())
}

fn handle_echo(
    connection: &Arc<ServerTcpHandler>,
    _order: ByteOrder,
    payload: &[u8],
) -> Result<(), MessageError> {
    connection.send(ServerMessage::EchoResponse(Bytes::copy_from_slice(payload)));
    Ok(())
}

/// A search sent over an established connection, answered on that connection
fn handle_search(
    connection: &Arc<ServerTcpHandler>,
    order: ByteOrder,
    payload: &[u8],
) -> Result<(), MessageError> {
    let (_, search) = SearchRequest::parse(order, payload)?;
    let context = connection.context();
    let tls = search.tls_requested();
    if search.is_list_servers() {
        context.handle_search_request(
            search.sequence,
            None,
            "",
            connection.peer(),
            tls,
            Some(connection),
        );
        return Ok(());
    }
    for channel in &search.channels {
        context.handle_search_request(
            search.sequence,
            Some(channel.cid),
            &channel.name,
            connection.peer(),
            tls,
            Some(connection),
        );
    }
    Ok(())
}

fn handle_create_channel(
    connection: &Arc<ServerTcpHandler>,
    order: ByteOrder,
    payload: &[u8],
) -> Result<(), MessageError> {
    let (mut input, count) = parse_u16(order, payload)?;
    for _ in 0..count {
        let (rest, cid) = parse_u32(order, input)?;
        let (rest, name) = parse_string(order, rest)?;
        input = rest;
        let Some(pv) = connection.context().get_pv(&name) else {
            warn!("{} asked for unknown channel {name}", connection.peer());
            continue;
        };
        pv.add_client(connection, cid);
        debug!(
            "Channel {name} created for {} as cid {cid}, sid {}",
            connection.peer(),
            pv.sid()
        );
        connection.send(ServerMessage::CreateChannel {
            cid,
            sid: pv.sid(),
            status: Status::ok(),
        });
    }
    Ok(())
}

fn handle_destroy_channel(
    connection: &Arc<ServerTcpHandler>,
    order: ByteOrder,
    payload: &[u8],
) -> Result<(), MessageError> {
    let (rest, sid) = parse_u32(order, payload)?;
    let (_, cid) = parse_u32(order, rest)?;
    match connection.context().get_pv_by_sid(sid) {
        Some(pv) => pv.remove_client(connection, cid),
        None => debug!("{} destroyed unknown channel {sid}", connection.peer()),
    }
    connection.remove_requests_for(sid);
    connection.send(ServerMessage::DestroyChannel { sid, cid });
    Ok(())
}

fn handle_get(
    connection: &Arc<ServerTcpHandler>,
    order: ByteOrder,
    payload: &[u8],
) -> Result<(), MessageError> {
    let (_, (sid, request_id, sub)) = parse_request(order, payload)?;
    let Some(pv) = channel(connection, Command::Get, sid, request_id, sub) else {
        return Ok(());
    };
    // Any requested field selection is ignored; the whole structure is served
    if sub & subcommand::INIT != 0 {
        connection.add_request(
            request_id,
            Request {
                sid,
                command: Command::Get,
            },
        );
        connection.send(ServerMessage::RequestInit {
            command: Command::Get,
            request_id,
            status: Status::ok(),
            desc: Some(pv.get_data().field_desc()),
        });
        return Ok(());
    }
    let value = pv.get_data();
    connection.send(ServerMessage::RequestData {
        command: Command::Get,
        request_id,
        subcommand: sub,
        status: Status::ok(),
        changes: BitSet::all(value.element_count()),
        value,
    });
    if sub & subcommand::DESTROY != 0 {
        connection.remove_request(request_id);
    }
    Ok(())
}

fn handle_put(
    connection: &Arc<ServerTcpHandler>,
    order: ByteOrder,
    payload: &[u8],
) -> Result<(), MessageError> {
    let (rest, (sid, request_id, sub)) = parse_request(order, payload)?;
    let Some(pv) = channel(connection, Command::Put, sid, request_id, sub) else {
        return Ok(());
    };
    if sub & subcommand::INIT != 0 {
        connection.add_request(
            request_id,
            Request {
                sid,
                command: Command::Put,
            },
        );
        connection.send(ServerMessage::RequestInit {
            command: Command::Put,
            request_id,
            status: Status::ok(),
            desc: Some(pv.get_data().field_desc()),
        });
        return Ok(());
    }
    if sub & subcommand::PUT_GET != 0 {
        let value = pv.get_data();
        connection.send(ServerMessage::RequestData {
            command: Command::Put,
            request_id,
            subcommand: sub,
            status: Status::ok(),
            changes: BitSet::all(value.element_count()),
            value,
        });
        return Ok(());
    }

    let status = put(connection, &pv, order, rest);
    connection.send(ServerMessage::RequestStatus {
        command: Command::Put,
        request_id,
        subcommand: sub,
        status,
    });
    if sub & subcommand::DESTROY != 0 {
        connection.remove_request(request_id);
    }
    Ok(())
}

/// Apply the written elements to a copy of the value, and pass it on to the PV
fn put(connection: &ServerTcpHandler, pv: &ServerPv, order: ByteOrder, input: &[u8]) -> Status {
    let authentication = connection.authentication();
    if !pv.is_writable(&authentication) {
        debug!("{authentication} may not write to {}", pv.name());
        return Status::error(format!("No write access to {}", pv.name()));
    }
    let mut written = pv.get_data();
    let changes = {
        let mut types = connection.types();
        let decoded = BitSet::parse(order, input).and_then(|(rest, changes)| {
            written
                .parse_changed(&changes, order, &mut types, rest)
                .map(|_| changes)
        });
        match decoded {
            Ok(changes) => changes,
            Err(e) => {
                warn!("Could not decode write to {}: {e}", pv.name());
                return Status::error(format!("Could not decode written value: {e}"));
            }
        }
    };
    match pv.wrote(&authentication, &changes, written) {
        Ok(()) => Status::ok(),
        Err(e) => {
            debug!("Write to {} failed: {e}", pv.name());
            Status::error(e.to_string())
        }
    }
}

fn handle_monitor(
    connection: &Arc<ServerTcpHandler>,
    order: ByteOrder,
    payload: &[u8],
) -> Result<(), MessageError> {
    let (_, (sid, request_id, sub)) = parse_request(order, payload)?;
    let Some(pv) = channel(connection, Command::Monitor, sid, request_id, sub) else {
        return Ok(());
    };
    if sub & subcommand::DESTROY != 0 {
        pv.unsubscribe(connection.id(), request_id);
        connection.remove_request(request_id);
    } else if sub & subcommand::INIT != 0 {
        connection.add_request(
            request_id,
            Request {
                sid,
                command: Command::Monitor,
            },
        );
        connection.send(ServerMessage::RequestInit {
            command: Command::Monitor,
            request_id,
            status: Status::ok(),
            desc: Some(pv.get_data().field_desc()),
        });
    } else if sub & subcommand::MONITOR_START == subcommand::MONITOR_START {
        debug!("Starting monitor {request_id} on {}", pv.name());
        pv.subscribe(connection, request_id);
    } else if sub & subcommand::MONITOR_STOP != 0 {
        debug!("Stopping monitor {request_id} on {}", pv.name());
        pv.unsubscribe(connection.id(), request_id);
    } else if sub & subcommand::MONITOR_PIPELINE_ACK != 0 {
        trace!("Ignoring pipeline acknowledgement for monitor {request_id}");
    }
    Ok(())
}

fn handle_rpc(
    connection: &Arc<ServerTcpHandler>,
    order: ByteOrder,
    payload: &[u8],
) -> Result<(), MessageError> {
    let (rest, (sid, request_id, sub)) = parse_request(order, payload)?;
    let Some(pv) = channel(connection, Command::Rpc, sid, request_id, sub) else {
        return Ok(());
    };
    if sub & subcommand::INIT != 0 {
        connection.add_request(
            request_id,
            Request {
                sid,
                command: Command::Rpc,
            },
        );
        connection.send(ServerMessage::RequestStatus {
            command: Command::Rpc,
            request_id,
            subcommand: sub,
            status: Status::ok(),
        });
        return Ok(());
    }

    let parameters = {
        let mut types = connection.types();
        let (rest, desc) = types.parse_field_desc(order, rest)?;
        match desc {
            Some(desc) => desc.parse_value(order, &mut types, rest)?.1.into_structure(),
            None => None,
        }
    }
    .unwrap_or_else(|| PvStructure::new(""));

    let (status, value) = match pv.rpc(&parameters) {
        Ok(result) => (Status::ok(), Some(result)),
        Err(e) => {
            debug!("RPC on {} failed: {e}", pv.name());
            (Status::error(e.to_string()), None)
        }
    };
    connection.send(ServerMessage::RpcResult {
        request_id,
        subcommand: sub,
        status,
        value,
    });
    if sub & subcommand::DESTROY != 0 {
        connection.remove_request(request_id);
    }
    Ok(())
}

fn handle_get_type(
    connection: &Arc<ServerTcpHandler>,
    order: ByteOrder,
    payload: &[u8],
) -> Result<(), MessageError> {
    let (rest, sid) = parse_u32(order, payload)?;
    let (rest, request_id) = parse_u32(order, rest)?;
    let (_, field) = parse_string(order, rest)?;
    let Some(pv) = connection.context().get_pv_by_sid(sid) else {
        connection.send(ServerMessage::FieldType {
            request_id,
            status: Status::error(format!("No channel with SID {sid}")),
            desc: None,
        });
        return Ok(());
    };
    let data = pv.get_data();
    let desc = if field.is_empty() {
        Some(data.field_desc())
    } else {
        data.desc().locate(&field).cloned()
    };
    let status = match desc {
        Some(_) => Status::ok(),
        None => Status::error(DataError::UnknownField(field).to_string()),
    };
    connection.send(ServerMessage::FieldType {
        request_id,
        status,
        desc,
    });
    Ok(())
}

fn handle_destroy_request(
    connection: &Arc<ServerTcpHandler>,
    order: ByteOrder,
    payload: &[u8],
) -> Result<(), MessageError> {
    let (rest, sid) = parse_u32(order, payload)?;
    let (_, request_id) = parse_u32(order, rest)?;
    match connection.remove_request(request_id) {
        Some(Request {
            command: Command::Monitor,
            sid,
        }) => {
            if let Some(pv) = connection.context().get_pv_by_sid(sid) {
                pv.unsubscribe(connection.id(), request_id);
            }
        }
        Some(_) => (),
        None => debug!("Destroy of unknown request {request_id} on SID {sid}"),
    }
    Ok(())
}

/// Requests complete as soon as they arrive, so there is nothing to cancel
fn handle_cancel_request(
    connection: &Arc<ServerTcpHandler>,
    order: ByteOrder,
    payload: &[u8],
) -> Result<(), MessageError> {
    let (rest, sid) = parse_u32(order, payload)?;
    let (_, request_id) = parse_u32(order, rest)?;
    debug!(
        "{} cancelled request {request_id} on SID {sid}",
        connection.peer()
    );
    Ok(())
}

fn handle_message(
    connection: &Arc<ServerTcpHandler>,
    order: ByteOrder,
    payload: &[u8],
) -> Result<(), MessageError> {
    let (rest, request_id) = parse_u32(order, payload)?;
    let (rest, kind) = parse_u8(rest)?;
    let (_, text) = parse_string(order, rest)?;
    debug!(
        "Message from {} for request {request_id} (type {kind}): {text}",
        connection.peer()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_commands_have_handlers() {
        for command in [
            Command::ConnectionValidation,
            Command::Echo,
            Command::Search,
            Command::CreateChannel,
            Command::DestroyChannel,
            Command::Get,
            Command::Put,
            Command::Monitor,
            Command::DestroyRequest,
            Command::GetType,
            Command::Rpc,
            Command::CancelRequest,
        ] {
            assert!(COMMAND_HANDLERS[command as usize].is_some(), "{command:?}");
        }
        assert!(COMMAND_HANDLERS[Command::Beacon as usize].is_none());
        assert!(COMMAND_HANDLERS[Command::SearchResponse as usize].is_none());
    }

    #[test]
    fn request_prefix() {
        let payload = [0, 0, 0, 5, 0, 0, 0, 9, 0x08, 0xFF];
        let (rest, (sid, request_id, sub)) = parse_request(ByteOrder::Big, &payload).unwrap();
        assert_eq!((sid, request_id, sub), (5, 9, subcommand::INIT));
        assert_eq!(rest, &[0xFF]);
    }
}
