#![allow(dead_code)]

//! A minimal PVA client speaking the raw protocol, for driving a server in tests

use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use pvars::{
    PvaServer, ServerBuilder,
    data::{
        BitSet, FieldDesc, PvStructure, PvValue, StructureBuilder, StructureDesc, TypeRegistry,
        nt::NtScalar,
    },
    messages::{
        ByteOrder, Command, FrameCodec, RawFrame, SearchChannel, SearchRequest, SearchResponse,
        Status, ValidationReply, ValidationRequest, WireBuffer, control, parse_u8, parse_u32,
        parse_udp_messages, subcommand,
    },
    utils::{PvaSettings, parse_interface_list},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::{TcpStream, UdpSocket},
    time::timeout,
};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::TestWriter;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_writer(TestWriter::new())
        .try_init();
}

/// Settings for a server only reachable on loopback, on free ports
pub fn test_settings() -> PvaSettings {
    PvaSettings {
        tcp_port: 0,
        udp_port: 0,
        tls_port: 0,
        interfaces: parse_interface_list("127.0.0.1"),
        local_multicast: None,
        pvlist: None,
        acf: None,
        ..Default::default()
    }
}

pub async fn start_server() -> PvaServer {
    init_logging();
    ServerBuilder::with_settings(test_settings())
        .start()
        .await
        .unwrap()
}

pub fn scalar(value: f64) -> PvStructure {
    NtScalar::new(PvValue::Double(value))
        .alarm()
        .timestamp()
        .build()
}

/// Poll until `condition` holds, failing the test after a while
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("Condition was never reached");
}

/// Send a search to the server's UDP port, and wait briefly for one reply
pub async fn search(
    port: u16,
    channels: &[(u32, &str)],
    reply_required: bool,
    protocols: &[&str],
) -> Option<SearchResponse> {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let request = SearchRequest {
        sequence: 77,
        reply_required,
        unicast: true,
        response_address: SocketAddr::new(
            Ipv4Addr::UNSPECIFIED.into(),
            socket.local_addr().unwrap().port(),
        ),
        protocols: protocols.iter().map(|p| p.to_string()).collect(),
        channels: channels
            .iter()
            .map(|(cid, name)| SearchChannel {
                cid: *cid,
                name: name.to_string(),
            })
            .collect(),
    };
    let mut buffer = WireBuffer::new(ByteOrder::Little);
    request.write(&mut buffer);
    socket
        .send_to(buffer.as_slice(), (Ipv4Addr::LOCALHOST, port))
        .await
        .unwrap();

    let mut received = vec![0u8; 0xFFFF];
    let (size, _) = timeout(Duration::from_millis(500), socket.recv_from(&mut received))
        .await
        .ok()?
        .unwrap();
    let messages = parse_udp_messages(&received[..size]).unwrap();
    let (header, payload) = messages.first()?;
    assert_eq!(header.command, Command::SearchResponse as u8);
    Some(SearchResponse::parse(header.byte_order(), payload).unwrap().1)
}

/// Decode the common start of a request reply: request id, subcommand, status
pub fn reply_status(frame: &RawFrame) -> (&[u8], u32, u8, Status) {
    let order = frame.byte_order();
    let (rest, request_id) = parse_u32(order, &frame.payload).unwrap();
    let (rest, sub) = parse_u8(rest).unwrap();
    let (rest, status) = Status::parse(order, rest).unwrap();
    (rest, request_id, sub, status)
}

pub struct TestClient<S> {
    reader: FramedRead<ReadHalf<S>, FrameCodec>,
    writer: WriteHalf<S>,
    /// Byte order the server announced
    pub server_order: ByteOrder,
    /// Authentication methods the server offered
    pub auth_methods: Vec<String>,
    pub types: TypeRegistry,
    order: ByteOrder,
}

impl TestClient<TcpStream> {
    pub async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            .await
            .unwrap();
        TestClient::handshake(stream).await
    }
}

impl<S: AsyncRead + AsyncWrite> TestClient<S> {
    /// Read the byte order and validation request the server opens with
    pub async fn handshake(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let mut client = TestClient {
            reader: FramedRead::new(reader, FrameCodec::default()),
            writer,
            server_order: ByteOrder::Big,
            auth_methods: Vec::new(),
            types: TypeRegistry::default(),
            order: ByteOrder::Little,
        };
        let first = client.next_frame().await.expect("Connection closed");
        assert!(first.header.is_control());
        assert_eq!(first.header.command, control::SET_BYTE_ORDER);
        client.server_order = first.byte_order();

        let frame = client.expect(Command::ConnectionValidation).await;
        let (_, request) = ValidationRequest::parse(frame.byte_order(), &frame.payload).unwrap();
        client.auth_methods = request.auth_methods;
        client
    }

    pub async fn next_frame(&mut self) -> Option<RawFrame> {
        timeout(TIMEOUT, self.reader.next())
            .await
            .expect("Timed out waiting for the server")
            .map(|frame| frame.unwrap())
    }

    /// The next application message, which must be `command`
    pub async fn expect(&mut self, command: Command) -> RawFrame {
        loop {
            let frame = self.next_frame().await.expect("Connection closed");
            if frame.header.is_control() {
                continue;
            }
            assert_eq!(
                frame.header.command, command as u8,
                "Expected {command:?}, got command {:#04x}",
                frame.header.command
            );
            return frame;
        }
    }

    /// Wait for the server to drop the connection
    pub async fn assert_closed(&mut self) {
        loop {
            match timeout(TIMEOUT, self.reader.next())
                .await
                .expect("Connection stayed open")
            {
                None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    }

    /// Nothing arrives for a while
    pub async fn assert_quiet(&mut self, wait: Duration) {
        if let Ok(Some(Ok(frame))) = timeout(wait, self.reader.next()).await {
            panic!("Unexpected message {:?}", frame.header);
        }
    }

    pub async fn send(&mut self, command: Command, payload: impl FnOnce(&mut WireBuffer)) {
        let mut buffer = WireBuffer::new(self.order);
        let start = buffer.begin_message(0, command);
        payload(&mut buffer);
        buffer.end_message(start);
        self.send_raw(buffer.as_slice()).await;
    }

    pub async fn send_raw(&mut self, data: &[u8]) {
        self.writer.write_all(data).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn validate(&mut self, method: &str, data: Option<PvStructure>) {
        let reply = ValidationReply {
            buffer_size: 16384,
            registry_size: 0x7FFF,
            qos: 0,
            auth_method: method.to_string(),
            auth_data: data,
        };
        let mut buffer = WireBuffer::new(self.order);
        reply.write(&mut buffer);
        self.send_raw(buffer.as_slice()).await;

        let frame = self.expect(Command::ConnectionValidated).await;
        let (_, status) = Status::parse(frame.byte_order(), &frame.payload).unwrap();
        assert!(status.is_ok(), "Validation failed: {status:?}");
    }

    pub async fn validate_anonymous(&mut self) {
        self.validate("anonymous", None).await;
    }

    pub async fn validate_as(&mut self, user: &str, host: &str) {
        let data = StructureBuilder::new("")
            .add("user", PvValue::String(user.to_string()))
            .add("host", PvValue::String(host.to_string()))
            .build();
        self.validate("ca", Some(data)).await;
    }

    /// Send a create request, without waiting for an answer
    pub async fn request_channel(&mut self, cid: u32, name: &str) {
        self.send(Command::CreateChannel, |b| {
            b.put_u16(1);
            b.put_u32(cid);
            b.put_string(name);
        })
        .await;
    }

    /// Create a channel, returning the sid the server gave it
    pub async fn create_channel(&mut self, cid: u32, name: &str) -> u32 {
        self.request_channel(cid, name).await;
        let frame = self.expect(Command::CreateChannel).await;
        let order = frame.byte_order();
        let (rest, reply_cid) = parse_u32(order, &frame.payload).unwrap();
        let (rest, sid) = parse_u32(order, rest).unwrap();
        let (_, status) = Status::parse(order, rest).unwrap();
        assert_eq!(reply_cid, cid);
        assert!(status.is_ok(), "Could not create {name}: {status:?}");
        sid
    }

    /// Initialise a get, put or monitor request, returning the PV's type
    pub async fn init(
        &mut self,
        command: Command,
        sid: u32,
        request_id: u32,
    ) -> Result<StructureDesc, Status> {
        self.send(command, |b| {
            b.put_u32(sid);
            b.put_u32(request_id);
            b.put_u8(subcommand::INIT);
            let request = PvStructure::new("");
            request.field_desc().write(b);
            request.write(b);
        })
        .await;
        let frame = self.expect(command).await;
        let (rest, reply_id, sub, status) = reply_status(&frame);
        assert_eq!(reply_id, request_id);
        assert_eq!(sub, subcommand::INIT);
        if !status.is_ok() {
            return Err(status);
        }
        match self.types.parse_field_desc(frame.byte_order(), rest).unwrap() {
            (_, Some(FieldDesc::Structure(desc))) => Ok(desc),
            (_, other) => panic!("Expected a structure type, got {other:?}"),
        }
    }

    pub async fn get(
        &mut self,
        sid: u32,
        request_id: u32,
        desc: &StructureDesc,
    ) -> Result<PvStructure, Status> {
        self.send(Command::Get, |b| {
            b.put_u32(sid);
            b.put_u32(request_id);
            b.put_u8(subcommand::EXEC);
        })
        .await;
        let frame = self.expect(Command::Get).await;
        let order = frame.byte_order();
        let (rest, reply_id, _, status) = reply_status(&frame);
        assert_eq!(reply_id, request_id);
        if !status.is_ok() {
            return Err(status);
        }
        let (rest, changes) = BitSet::parse(order, rest).unwrap();
        let mut value = PvStructure::from_desc(desc);
        value
            .parse_changed(&changes, order, &mut self.types, rest)
            .unwrap();
        Ok(value)
    }

    /// Write the elements of `value` selected by `changes`
    pub async fn put(
        &mut self,
        sid: u32,
        request_id: u32,
        changes: &BitSet,
        value: &PvStructure,
    ) -> Status {
        self.send(Command::Put, |b| {
            b.put_u32(sid);
            b.put_u32(request_id);
            b.put_u8(subcommand::EXEC);
            changes.write(b);
            value.write_changed(changes, b);
        })
        .await;
        let frame = self.expect(Command::Put).await;
        let (_, reply_id, _, status) = reply_status(&frame);
        assert_eq!(reply_id, request_id);
        status
    }

    pub async fn monitor_start(&mut self, sid: u32, request_id: u32) {
        self.send(Command::Monitor, |b| {
            b.put_u32(sid);
            b.put_u32(request_id);
            b.put_u8(subcommand::MONITOR_START);
        })
        .await;
    }

    /// Receive a monitor update into `value`, returning the changed and overrun sets
    pub async fn monitor_update(
        &mut self,
        request_id: u32,
        value: &mut PvStructure,
    ) -> (BitSet, BitSet) {
        let frame = self.expect(Command::Monitor).await;
        let order = frame.byte_order();
        let (rest, reply_id) = parse_u32(order, &frame.payload).unwrap();
        let (rest, sub) = parse_u8(rest).unwrap();
        assert_eq!(reply_id, request_id);
        assert_eq!(sub, subcommand::EXEC);
        let (rest, changes) = BitSet::parse(order, rest).unwrap();
        let (rest, _) = value
            .parse_changed(&changes, order, &mut self.types, rest)
            .unwrap();
        let (_, overrun) = BitSet::parse(order, rest).unwrap();
        (changes, overrun)
    }
}
