//! Seams to the provisioning platform.
//!
//! The DHCP front end only decides *whether* a client gets handed to the job
//! layer; inventory lookups, hardware creation, templates, workflows and the
//! actual DHCP reply all live behind the traits in this module. In-process
//! implementations live in [`crate::memory`].

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::error::{JobError, Result};
use crate::options::MessageType;
use crate::packet::DhcpPacket;
use crate::singleflight::Group;

/// What the inventory knows about a piece of hardware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discovery {
    /// Inventory identifier.
    pub id: String,
    pub mac: String,
    pub address: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub hostname: Option<String>,
}

/// Hardware record to create for a client seen for the first time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewHardware {
    pub mac: String,
    pub giaddr: Ipv4Addr,
    pub circuit_id: String,
    pub address: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

/// A decoded request as it moves through the dispatch engine.
#[derive(Debug, Clone)]
pub struct Request {
    pub packet: DhcpPacket,
    /// Client hardware address, `aa:bb:cc:dd:ee:ff`.
    pub mac: String,
    pub giaddr: Ipv4Addr,
    pub message_type: Option<MessageType>,
}

impl Request {
    pub fn new(packet: DhcpPacket) -> Self {
        Self {
            mac: packet.format_mac(),
            giaddr: packet.giaddr,
            message_type: packet.message_type(),
            packet,
        }
    }

    /// Message type label used for logs and metrics.
    pub fn op(&self) -> &'static str {
        self.message_type.map_or("BOOTP", MessageType::label)
    }
}

/// Hardware inventory backend.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Looks up hardware by MAC. Returns [`JobError::NotFound`] when unknown.
    async fn discover_by_client(
        &self,
        mac: &str,
        giaddr: Ipv4Addr,
        circuit_id: &str,
    ) -> std::result::Result<Discovery, JobError>;

    /// Looks up hardware by assigned address.
    async fn discover_by_address(&self, address: Ipv4Addr)
    -> std::result::Result<Discovery, JobError>;

    /// Creates a hardware record for a client the inventory has never seen.
    async fn create_from_client(
        &self,
        hardware: NewHardware,
    ) -> std::result::Result<Discovery, JobError>;
}

/// Template and workflow store.
#[async_trait]
pub trait Workflows: Send + Sync {
    async fn template_id_by_name(&self, name: &str) -> std::result::Result<String, JobError>;

    /// Instantiates `template_id` for the machine `mac`, returning the
    /// workflow id.
    async fn create_workflow(
        &self,
        template_id: &str,
        mac: &str,
    ) -> std::result::Result<String, JobError>;
}

/// Writes a reply for a request back onto the network.
#[async_trait]
pub trait ReplyWriter: Send + Sync {
    async fn send(&self, reply: &DhcpPacket, request: &DhcpPacket) -> Result<()>;
}

/// Protocol half of the job layer: decides whether and how to answer.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Returns `true` if an offer was written.
    async fn respond(
        &self,
        discovery: &Discovery,
        request: &Request,
        writer: &dyn ReplyWriter,
    ) -> bool;
}

/// Clients and relays that must not be served.
pub trait IgnorePolicy: Send + Sync {
    fn ignore_client(&self, mac: &str) -> bool;
    fn ignore_relay(&self, giaddr: &str) -> bool;
}

/// Traffic direction for [`Metrics::dhcp_total`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Recv,
    Send,
}

impl Direction {
    pub fn label(self) -> &'static str {
        match self {
            Self::Recv => "recv",
            Self::Send => "send",
        }
    }
}

/// Fire-and-forget metrics sink.
pub trait Metrics: Send + Sync {
    fn dhcp_total(&self, direction: Direction, op: &str, giaddr: Ipv4Addr);
    /// A job entered processing (in-progress gauge up).
    fn job_started(&self, op: &str);
    /// A job left processing (in-progress gauge down, duration observed).
    fn job_finished(&self, op: &str, elapsed: Duration);
}

/// Tracks one job from intake to completion.
///
/// Dropping the timer reports completion exactly once, wherever the job
/// ends: on a terminal branch of the handler or at the end of the detached
/// response task.
pub struct JobTimer {
    metrics: Arc<dyn Metrics>,
    op: &'static str,
    started: Instant,
}

impl JobTimer {
    pub fn start(metrics: Arc<dyn Metrics>, op: &'static str) -> Self {
        metrics.job_started(op);
        Self {
            metrics,
            op,
            started: Instant::now(),
        }
    }
}

impl Drop for JobTimer {
    fn drop(&mut self) {
        self.metrics.job_finished(self.op, self.started.elapsed());
    }
}

type Lookup = std::result::Result<Discovery, JobError>;

/// Inventory access with concurrent duplicate calls collapsed.
///
/// Discovery by MAC and by address share one group (keys never collide, a
/// MAC is not an address); creation uses its own group so a create is never
/// answered with the result of a lookup.
pub struct Fetcher {
    inventory: Arc<dyn Inventory>,
    discoveries: Group<Lookup>,
    creations: Group<Lookup>,
}

impl Fetcher {
    pub fn new(inventory: Arc<dyn Inventory>) -> Self {
        Self {
            inventory,
            discoveries: Group::new(),
            creations: Group::new(),
        }
    }

    pub async fn discover_by_client(&self, mac: &str, giaddr: Ipv4Addr, circuit_id: &str) -> Lookup {
        self.discoveries
            .work(mac, || {
                debug!(mac, %giaddr, circuit_id, "discovering hardware");
                self.inventory.discover_by_client(mac, giaddr, circuit_id)
            })
            .await
    }

    pub async fn discover_by_address(&self, address: Ipv4Addr) -> Lookup {
        let key = address.to_string();
        self.discoveries
            .work(&key, || self.inventory.discover_by_address(address))
            .await
    }

    pub async fn create_from_client(&self, hardware: NewHardware) -> Lookup {
        let key = hardware.mac.clone();
        self.creations
            .work(&key, || self.inventory.create_from_client(hardware))
            .await
    }
}

/// Everything a dispatch worker calls out to.
pub struct JobLayer {
    pub fetcher: Fetcher,
    pub workflows: Arc<dyn Workflows>,
    pub responder: Arc<dyn Responder>,
}

impl JobLayer {
    pub fn new(
        inventory: Arc<dyn Inventory>,
        workflows: Arc<dyn Workflows>,
        responder: Arc<dyn Responder>,
    ) -> Self {
        Self {
            fetcher: Fetcher::new(inventory),
            workflows,
            responder,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowInventory {
        lookups: AtomicUsize,
        creations: AtomicUsize,
    }

    fn hardware(mac: &str) -> Discovery {
        Discovery {
            id: format!("hw-{}", mac),
            mac: mac.to_string(),
            address: Ipv4Addr::new(10, 0, 0, 5),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(10, 0, 0, 1),
            hostname: None,
        }
    }

    #[async_trait]
    impl Inventory for SlowInventory {
        async fn discover_by_client(&self, mac: &str, _: Ipv4Addr, _: &str) -> Lookup {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(hardware(mac))
        }

        async fn discover_by_address(&self, _: Ipv4Addr) -> Lookup {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err(JobError::NotFound)
        }

        async fn create_from_client(&self, new: NewHardware) -> Lookup {
            self.creations.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(hardware(&new.mac))
        }
    }

    fn inventory() -> Arc<SlowInventory> {
        Arc::new(SlowInventory {
            lookups: AtomicUsize::new(0),
            creations: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_fetcher_collapses_same_mac() {
        let inventory = inventory();
        let fetcher = Arc::new(Fetcher::new(inventory.clone()));

        let mut handles = vec![];
        for _ in 0..5 {
            let fetcher = Arc::clone(&fetcher);
            handles.push(tokio::spawn(async move {
                fetcher
                    .discover_by_client("aa:bb:cc:dd:ee:ff", Ipv4Addr::UNSPECIFIED, "")
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().mac, "aa:bb:cc:dd:ee:ff");
        }
        assert_eq!(inventory.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetcher_address_lookups_share_not_found() {
        let inventory = inventory();
        let fetcher = Arc::new(Fetcher::new(inventory.clone()));
        let address = Ipv4Addr::new(10, 0, 0, 9);

        let (first, second) = tokio::join!(
            fetcher.discover_by_address(address),
            fetcher.discover_by_address(address)
        );
        assert_eq!(first, Err(JobError::NotFound));
        assert_eq!(second, Err(JobError::NotFound));
        assert_eq!(inventory.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_create_is_not_answered_by_lookup() {
        let inventory = inventory();
        let fetcher = Fetcher::new(inventory.clone());
        let mac = "aa:bb:cc:dd:ee:01";

        let new = NewHardware {
            mac: mac.to_string(),
            giaddr: Ipv4Addr::UNSPECIFIED,
            circuit_id: String::new(),
            address: Ipv4Addr::new(10, 0, 0, 5),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(10, 0, 0, 1),
        };
        let (lookup, created) = tokio::join!(
            fetcher.discover_by_client(mac, Ipv4Addr::UNSPECIFIED, ""),
            fetcher.create_from_client(new)
        );
        assert!(lookup.is_ok());
        assert!(created.is_ok());
        assert_eq!(inventory.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(inventory.creations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_request_labels() {
        let packet = DhcpPacket::request(MessageType::Discover, 1, [0, 1, 2, 3, 4, 5]);
        let request = Request::new(packet);
        assert_eq!(request.mac, "00:01:02:03:04:05");
        assert_eq!(request.op(), "DHCPDISCOVER");
    }
}
