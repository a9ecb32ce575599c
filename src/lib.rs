//! pump_web - Embeddable HTTP/1.0 and HTTP/1.1 engine
//!
//! An HTTP/1.x engine that works in both server and client roles. The
//! engine accepts or initiates connections, parses wire-format messages,
//! drives a per-connection state machine from `BEGIN` through `COMPLETE`,
//! and pumps packets through a bidirectional pipeline of processing
//! stages implementing chunked transfer encoding, byte-range handling,
//! and protocol upgrade plumbing.
//!
//! # Architecture
//!
//! ```text
//! bytes -> Conn input -> header parser -> Rx
//!       -> incoming queue chain (chunk -> range -> handler)
//!       -> Handler
//!       -> outgoing queue chain (range -> chunk -> connector)
//!       -> socket
//! ```
//!
//! Control flow is driven by the state machine in [`Conn`], re-entered
//! whenever new bytes arrive or the write buffer drains. Queues apply
//! high/low watermark flow control: a producer facing a full downstream
//! queue is disabled and resumed once the consumer drains below 5% of its
//! capacity.
//!
//! # Server
//!
//! ```no_run
//! use pump_web::{Endpoint, Exchange, Handler, Service};
//! use std::sync::Arc;
//!
//! struct Hello;
//!
//! impl Handler for Hello {
//!     fn ready(&self, x: &mut Exchange) {
//!         x.tx.status = 200;
//!         x.set_header("content-type", "text/plain");
//!         let _ = x.write(b"Hello World!");
//!         x.finalize();
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let service = Service::new();
//!     Endpoint::bind(&service, "127.0.0.1:8080", Arc::new(Hello))
//!         .await?
//!         .launch()
//!         .await
//! }
//! ```
//!
//! # Client
//!
//! ```no_run
//! use pump_web::{ClientConn, Service};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = Service::new();
//!     let mut client = ClientConn::connect(&service, "http://127.0.0.1:8080/").await?;
//!     let status = client.fetch("GET").await?;
//!     println!("{} {}", status, String::from_utf8_lossy(&client.content()));
//!     Ok(())
//! }
//! ```
//!
//! # Scope
//!
//! HTTP/1.0 and HTTP/1.1 exactly. Persistent connections default on for
//! HTTP/1.1 unless `Connection: close`, off for HTTP/1.0 unless
//! `Connection: keep-alive`. HTTP/2+, TLS, routing, sessions and content
//! generation belong to the embedding application.

pub(crate) mod chunk;
pub(crate) mod client;
pub(crate) mod conn;
pub(crate) mod connector;
pub(crate) mod endpoint;
pub(crate) mod pipeline;
pub(crate) mod queue;
pub(crate) mod range;
pub(crate) mod rx;
pub(crate) mod service;
pub(crate) mod stage;
pub(crate) mod tx;

pub mod errors;
pub mod limits;
pub mod packet;
pub mod proto;

pub use crate::{
    chunk::{encode as chunk_encode, ChunkState},
    client::ClientConn,
    conn::{Conn, State},
    endpoint::Endpoint,
    errors::{ErrorKind, HttpError, Severity},
    limits::HttpLimits,
    packet::{Packet, PacketFlags},
    pipeline::{Exchange, Role, WriteMode},
    proto::{Method, Version},
    queue::{Dir, Queue, QueueId},
    range::ByteRange,
    rx::{Headers, ParsedUri, Rx},
    service::{Service, ServiceStats},
    stage::{Handler, Stage, StageKind},
    tx::Tx,
};
