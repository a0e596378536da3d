// #![warn(missing_docs)]

//! Rust implementation of an EPICS PV Access server.
//!
//! This crate is a pure-rust implementation of the server side of the [PV Access
//! protocol]. It does not depend on the C++ [pvxs] or Java [core-pva] projects.
//!
//! <div class="warning">This is a very early version of this library. Interfaces or
//! structure may be changed around wildly between versions until a comfortable
//! final design is settled upon.</div>
//!
//! PVA values are structures: a PV is typically one of the "normative types", e.g.
//! `NTScalar` with a `value` field plus alarm and timestamp. pvars separates:
//!
//! - Serialization and deserialization of protocol messages, in module [messages].
//! - The structured data model, type descriptors and changed-field bitsets, in
//!   module [data], with builders for normative types in [data::nt].
//! - A [PvaServer] that answers searches, manages connections, and serves [ServerPv]
//!   instances to clients for get, put, monitor and RPC.
//! - Authentication and authorization of clients, in modules [auth] and [access],
//!   optionally over TLS ([tls], [cert_status]).
//!
//! ## Example
//!
//! Serving a single `double`, that any authenticated client may change. Run this and
//! then `pvget DEMO:VALUE` or `pvput DEMO:VALUE 3.2` from anywhere inside the same
//! broadcast network:
//!
//! ```no_run
//! # use std::time::Duration;
//! use pvars::{
//!     ServerBuilder, ServerPv,
//!     data::{BitSet, PvStructure, PvValue, nt::NtScalar},
//!     server::HandlerResult,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = ServerBuilder::new().start().await.unwrap();
//!     let pv = server
//!         .create_writable_pv(
//!             "DEMO:VALUE",
//!             NtScalar::new(PvValue::Double(1.0)).alarm().timestamp().build(),
//!             |pv: &ServerPv, _changes: &BitSet, written: PvStructure| -> HandlerResult<()> {
//!                 pv.update(&written)?;
//!                 Ok(())
//!             },
//!         )
//!         .unwrap();
//!     loop {
//!         tokio::time::sleep(Duration::from_secs(3)).await;
//!         println!("Value is now: {:?}", pv.get_data().get("value"));
//!     }
//! }
//! ```
//!
//! ## Current Status of crate
//!
//! What is currently present:
//! - Replying to UDP searches over IPv4 and IPv6, including multicast groups and
//!   forwarding of unicast searches to other servers on the same host.
//! - Accepting plain and TLS connections, with "anonymous", "ca" and "x509"
//!   authentication.
//! - Get, put, monitor, get-type and RPC requests on structured values, with only the
//!   changed fields sent to monitors.
//! - Access control from "pvlist" and "acf" files, as used by gateways.
//!
//! What this doesn't do (yet):
//! - Work as a client.
//! - Segmented messages, and the array and process requests.
//! - Field selection in requests. The whole structure is always served.
//!
//! [PV Access protocol]:
//!     https://docs.epics-controls.org/en/latest/pv-access/protocol.html
//! [pvxs]: https://github.com/epics-base/pvxs
//! [core-pva]: https://github.com/epics-base/epics-java

pub mod access;
pub mod auth;
pub mod cert_status;
pub mod data;
pub mod guid;
pub mod messages;
pub mod server;
pub mod tls;
pub mod utils;

pub use crate::server::{PvaServer, ServerBuilder, ServerError, ServerPv};
