//! # bootlease
//!
//! The DHCP front end of a bare-metal provisioning platform.
//!
//! Every request is matched against a hardware inventory. Known machines are
//! answered with the address the inventory holds for them; unknown machines
//! can optionally be provisioned on first contact: an address is leased from
//! a local pool, a hardware record and a default workflow are created, and
//! the machine is answered like any other.
//!
//! ## Features
//!
//! - In-memory lease pool with randomized linear-probe allocation
//! - Relay agent support (Option 82 circuit id)
//! - Concurrent inventory lookups for the same client collapsed into one call
//! - Bounded worker pool; replies sent from detached tasks
//! - Startup with bounded exponential retry
//! - Async/await with Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use bootlease::memory::{Counters, DefaultResponder, IgnoreList, MemoryInventory, MemoryWorkflows};
//! use bootlease::server::UdpReplyWriter;
//! use bootlease::{Config, DhcpServer, Dispatcher, JobLayer, Leases};
//!
//! #[tokio::main]
//! async fn main() -> bootlease::Result<()> {
//!     let config = Config::from_env()?;
//!     let socket = Arc::new(bootlease::supervisor::bind_socket("0.0.0.0:67".parse().unwrap())?);
//!
//!     let jobs = JobLayer::new(
//!         Arc::new(MemoryInventory::new()),
//!         Arc::new(MemoryWorkflows::with_templates(["default"])),
//!         Arc::new(DefaultResponder::new(config.pool.gateway)),
//!     );
//!     let dispatcher = Dispatcher::new(
//!         Arc::new(Leases::new(config.pool)),
//!         jobs,
//!         Arc::new(IgnoreList::default()),
//!         Arc::new(Counters::new()),
//!     );
//!     let writer = Arc::new(UdpReplyWriter::new(Arc::clone(&socket)));
//!     DhcpServer::new(socket, dispatcher, writer, config.workers).run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Config`] - Pool, worker count and switches read from the environment
//! - [`DhcpServer`] - Receive loop feeding a bounded pool of handlers
//! - [`Dispatcher`] - Per-request filter, lookup, provisioning and reply
//! - [`Leases`] - Mutex-guarded lease table
//! - [`job`] - Traits the inventory, workflow store and responder implement
//! - [`singleflight`] - Duplicate call suppression for inventory lookups
//! - [`supervisor`] - Retry with backoff for startup steps
//! - [`DhcpPacket`] - DHCP packet parsing and encoding

pub mod addr;
pub mod config;
pub mod error;
pub mod job;
pub mod lease;
pub mod memory;
pub mod options;
pub mod packet;
pub mod server;
pub mod singleflight;
pub mod supervisor;

pub use config::Config;
pub use error::{Error, JobError, Result};
pub use job::{Discovery, JobLayer, Request};
pub use lease::{Lease, Leases, Pool};
pub use options::{DhcpOption, MessageType, RelayAgentInformation};
pub use packet::DhcpPacket;
pub use server::{DhcpServer, Dispatcher, Handled};
pub use supervisor::{RetryPolicy, Supervisor};
