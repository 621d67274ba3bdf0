//! In-process collaborators.
//!
//! These back the `run` subcommand when no external inventory is wired in,
//! and they are what the dispatch tests drive. Nothing here is persisted.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::JobError;
use crate::job::{
    Direction, Discovery, IgnorePolicy, Inventory, Metrics, NewHardware, ReplyWriter, Request,
    Responder, Workflows,
};
use crate::options::{DhcpOption, MessageType};
use crate::packet::DhcpPacket;

/// Lease time handed out by [`DefaultResponder`]. Leases never expire on
/// the server side, so this only tells clients when to renew.
pub const DEFAULT_LEASE_TIME: u32 = 86_400;

/// Hardware inventory held in a map keyed by MAC.
#[derive(Debug, Default)]
pub struct MemoryInventory {
    hardware: Mutex<HashMap<String, Discovery>>,
    next_id: AtomicU64,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers known hardware.
    pub fn insert(&self, discovery: Discovery) {
        self.lock().insert(discovery.mac.clone(), discovery);
    }

    pub fn get(&self, mac: &str) -> Option<Discovery> {
        self.lock().get(mac).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Discovery>> {
        self.hardware
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Inventory for MemoryInventory {
    async fn discover_by_client(
        &self,
        mac: &str,
        _giaddr: Ipv4Addr,
        _circuit_id: &str,
    ) -> Result<Discovery, JobError> {
        self.get(mac).ok_or(JobError::NotFound)
    }

    async fn discover_by_address(&self, address: Ipv4Addr) -> Result<Discovery, JobError> {
        self.lock()
            .values()
            .find(|hardware| hardware.address == address)
            .cloned()
            .ok_or(JobError::NotFound)
    }

    async fn create_from_client(&self, new: NewHardware) -> Result<Discovery, JobError> {
        let mut hardware = self.lock();
        if hardware.contains_key(&new.mac) {
            return Err(JobError::Backend(format!(
                "hardware {} already exists",
                new.mac
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let discovery = Discovery {
            id: format!("hw-{}", id),
            mac: new.mac.clone(),
            address: new.address,
            subnet_mask: new.subnet_mask,
            gateway: new.gateway,
            hostname: None,
        };
        debug!(
            mac = %new.mac,
            giaddr = %new.giaddr,
            circuit_id = %new.circuit_id,
            id = %discovery.id,
            "created hardware"
        );
        hardware.insert(new.mac, discovery.clone());
        Ok(discovery)
    }
}

/// Template registry and workflow log.
#[derive(Debug, Default)]
pub struct MemoryWorkflows {
    templates: HashMap<String, String>,
    workflows: Mutex<Vec<Workflow>>,
    next_id: AtomicU64,
}

/// A workflow instantiated by [`MemoryWorkflows`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workflow {
    pub id: String,
    pub template_id: String,
    pub mac: String,
}

impl MemoryWorkflows {
    /// Creates a registry holding one template per name.
    pub fn with_templates<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let templates = names
            .into_iter()
            .map(|name| {
                let name: String = name.into();
                let id = format!("tmpl-{}", name);
                (name, id)
            })
            .collect();
        Self {
            templates,
            ..Self::default()
        }
    }

    pub fn workflows(&self) -> Vec<Workflow> {
        self.workflows
            .lock()
            .map(|workflows| workflows.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Workflows for MemoryWorkflows {
    async fn template_id_by_name(&self, name: &str) -> Result<String, JobError> {
        self.templates.get(name).cloned().ok_or(JobError::NotFound)
    }

    async fn create_workflow(&self, template_id: &str, mac: &str) -> Result<String, JobError> {
        let id = format!("wf-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let mut workflows = self
            .workflows
            .lock()
            .map_err(|_| JobError::Backend("workflow log poisoned".to_string()))?;
        workflows.push(Workflow {
            id: id.clone(),
            template_id: template_id.to_string(),
            mac: mac.to_string(),
        });
        Ok(id)
    }
}

/// Ignore list: MAC prefixes (OUIs) and relay addresses.
#[derive(Debug, Clone, Default)]
pub struct IgnoreList {
    ouis: Vec<String>,
    relays: Vec<String>,
}

impl IgnoreList {
    pub fn new<I, J>(ouis: I, relays: J) -> Self
    where
        I: IntoIterator<Item = String>,
        J: IntoIterator<Item = String>,
    {
        Self {
            ouis: ouis.into_iter().map(|oui| oui.to_ascii_lowercase()).collect(),
            relays: relays.into_iter().collect(),
        }
    }
}

impl IgnorePolicy for IgnoreList {
    fn ignore_client(&self, mac: &str) -> bool {
        let mac = mac.to_ascii_lowercase();
        self.ouis.iter().any(|oui| mac.starts_with(oui.as_str()))
    }

    fn ignore_relay(&self, giaddr: &str) -> bool {
        self.relays.iter().any(|relay| relay == giaddr)
    }
}

#[derive(Debug, Default)]
struct CounterState {
    totals: HashMap<(Direction, String, Ipv4Addr), u64>,
    in_progress: HashMap<String, i64>,
    finished: HashMap<String, u64>,
}

/// Metrics kept in process memory.
#[derive(Debug, Default)]
pub struct Counters {
    state: Mutex<CounterState>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut CounterState) -> R) -> R {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    pub fn total(&self, direction: Direction, op: &str, giaddr: Ipv4Addr) -> u64 {
        self.with(|state| {
            state
                .totals
                .get(&(direction, op.to_string(), giaddr))
                .copied()
                .unwrap_or(0)
        })
    }

    /// Jobs of type `op` currently between intake and completion.
    pub fn in_progress(&self, op: &str) -> i64 {
        self.with(|state| state.in_progress.get(op).copied().unwrap_or(0))
    }

    pub fn finished(&self, op: &str) -> u64 {
        self.with(|state| state.finished.get(op).copied().unwrap_or(0))
    }
}

impl Metrics for Counters {
    fn dhcp_total(&self, direction: Direction, op: &str, giaddr: Ipv4Addr) {
        self.with(|state| {
            *state
                .totals
                .entry((direction, op.to_string(), giaddr))
                .or_default() += 1;
        });
    }

    fn job_started(&self, op: &str) {
        self.with(|state| *state.in_progress.entry(op.to_string()).or_default() += 1);
    }

    fn job_finished(&self, op: &str, elapsed: Duration) {
        self.with(|state| {
            *state.in_progress.entry(op.to_string()).or_default() -= 1;
            *state.finished.entry(op.to_string()).or_default() += 1;
        });
        debug!(op, elapsed_ms = elapsed.as_millis() as u64, "job finished");
    }
}

/// Answers DISCOVER with OFFER and REQUEST with ACK using the address the
/// inventory holds for the machine.
#[derive(Debug, Clone)]
pub struct DefaultResponder {
    server_ip: Ipv4Addr,
    lease_time: u32,
}

impl DefaultResponder {
    pub fn new(server_ip: Ipv4Addr) -> Self {
        Self {
            server_ip,
            lease_time: DEFAULT_LEASE_TIME,
        }
    }

    fn build_options(&self, discovery: &Discovery) -> Vec<DhcpOption> {
        let mut options = vec![
            DhcpOption::ServerIdentifier(self.server_ip),
            DhcpOption::LeaseTime(self.lease_time),
            DhcpOption::SubnetMask(discovery.subnet_mask),
            DhcpOption::Router(vec![discovery.gateway]),
        ];
        if let Some(hostname) = &discovery.hostname {
            options.push(DhcpOption::Hostname(hostname.clone()));
        }
        options
    }
}

#[async_trait]
impl Responder for DefaultResponder {
    async fn respond(
        &self,
        discovery: &Discovery,
        request: &Request,
        writer: &dyn ReplyWriter,
    ) -> bool {
        let reply_type = match request.message_type {
            Some(MessageType::Discover) => MessageType::Offer,
            Some(MessageType::Request) => MessageType::Ack,
            _ => return false,
        };

        let reply = DhcpPacket::create_reply(
            &request.packet,
            reply_type,
            discovery.address,
            self.server_ip,
            self.build_options(discovery),
        );

        match writer.send(&reply, &request.packet).await {
            Ok(()) => {
                debug!(mac = %request.mac, address = %discovery.address, "{} sent", reply_type);
                true
            }
            Err(error) => {
                warn!(mac = %request.mac, %error, "failed to send {}", reply_type);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct Captured {
        replies: AsyncMutex<Vec<DhcpPacket>>,
    }

    #[async_trait]
    impl ReplyWriter for Captured {
        async fn send(&self, reply: &DhcpPacket, _request: &DhcpPacket) -> Result<()> {
            self.replies.lock().await.push(reply.clone());
            Ok(())
        }
    }

    fn discovery() -> Discovery {
        Discovery {
            id: "hw-1".to_string(),
            mac: "aa:bb:cc:dd:ee:ff".to_string(),
            address: Ipv4Addr::new(192, 168, 1, 20),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(192, 168, 1, 1),
            hostname: Some("node-1".to_string()),
        }
    }

    fn new_hardware(mac: &str) -> NewHardware {
        NewHardware {
            mac: mac.to_string(),
            giaddr: Ipv4Addr::UNSPECIFIED,
            circuit_id: "eth0".to_string(),
            address: Ipv4Addr::new(192, 168, 1, 30),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(192, 168, 1, 1),
        }
    }

    #[tokio::test]
    async fn test_inventory_lookup() {
        let inventory = MemoryInventory::new();
        inventory.insert(discovery());

        let found = inventory
            .discover_by_client("aa:bb:cc:dd:ee:ff", Ipv4Addr::UNSPECIFIED, "")
            .await
            .unwrap();
        assert_eq!(found.id, "hw-1");

        let by_address = inventory
            .discover_by_address(Ipv4Addr::new(192, 168, 1, 20))
            .await
            .unwrap();
        assert_eq!(by_address.mac, "aa:bb:cc:dd:ee:ff");

        assert_eq!(
            inventory
                .discover_by_client("00:00:00:00:00:01", Ipv4Addr::UNSPECIFIED, "")
                .await,
            Err(JobError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_inventory_create_assigns_ids() {
        let inventory = MemoryInventory::new();

        let first = inventory
            .create_from_client(new_hardware("aa:00:00:00:00:01"))
            .await
            .unwrap();
        let second = inventory
            .create_from_client(new_hardware("aa:00:00:00:00:02"))
            .await
            .unwrap();

        assert_eq!(first.id, "hw-1");
        assert_eq!(second.id, "hw-2");
        assert_eq!(first.address, Ipv4Addr::new(192, 168, 1, 30));
        assert_eq!(inventory.len(), 2);

        let duplicate = inventory
            .create_from_client(new_hardware("aa:00:00:00:00:01"))
            .await;
        assert!(matches!(duplicate, Err(JobError::Backend(_))));
    }

    #[tokio::test]
    async fn test_workflows() {
        let workflows = MemoryWorkflows::with_templates(["default"]);

        let template = workflows.template_id_by_name("default").await.unwrap();
        assert_eq!(template, "tmpl-default");
        assert_eq!(
            workflows.template_id_by_name("missing").await,
            Err(JobError::NotFound)
        );

        let id = workflows
            .create_workflow(&template, "aa:bb:cc:dd:ee:ff")
            .await
            .unwrap();
        assert_eq!(id, "wf-1");
        assert_eq!(
            workflows.workflows(),
            vec![Workflow {
                id,
                template_id: template,
                mac: "aa:bb:cc:dd:ee:ff".to_string(),
            }]
        );
    }

    #[test]
    fn test_ignore_list() {
        let ignore = IgnoreList::new(
            vec!["AA:BB:CC".to_string()],
            vec!["10.0.0.1".to_string()],
        );

        assert!(ignore.ignore_client("aa:bb:cc:00:11:22"));
        assert!(!ignore.ignore_client("aa:bb:cd:00:11:22"));
        assert!(ignore.ignore_relay("10.0.0.1"));
        assert!(!ignore.ignore_relay("10.0.0.10"));
        assert!(!IgnoreList::default().ignore_client("aa:bb:cc:00:11:22"));
    }

    #[test]
    fn test_counters() {
        let counters = Counters::new();
        let giaddr = Ipv4Addr::new(10, 0, 0, 1);

        counters.dhcp_total(Direction::Recv, "DHCPDISCOVER", giaddr);
        counters.dhcp_total(Direction::Recv, "DHCPDISCOVER", giaddr);
        counters.job_started("DHCPDISCOVER");

        assert_eq!(counters.total(Direction::Recv, "DHCPDISCOVER", giaddr), 2);
        assert_eq!(counters.total(Direction::Send, "DHCPDISCOVER", giaddr), 0);
        assert_eq!(counters.in_progress("DHCPDISCOVER"), 1);

        counters.job_finished("DHCPDISCOVER", Duration::from_millis(3));
        assert_eq!(counters.in_progress("DHCPDISCOVER"), 0);
        assert_eq!(counters.finished("DHCPDISCOVER"), 1);
    }

    #[tokio::test]
    async fn test_default_responder_offers_for_discover() {
        let responder = DefaultResponder::new(Ipv4Addr::new(192, 168, 1, 1));
        let writer = Captured::default();
        let request = Request::new(DhcpPacket::request(
            MessageType::Discover,
            0x1234,
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff],
        ));

        assert!(responder.respond(&discovery(), &request, &writer).await);

        let replies = writer.replies.lock().await;
        assert_eq!(replies.len(), 1);
        let offer = &replies[0];
        assert_eq!(offer.message_type(), Some(MessageType::Offer));
        assert_eq!(offer.yiaddr, Ipv4Addr::new(192, 168, 1, 20));
        assert_eq!(offer.xid, 0x1234);
        assert!(offer.options.contains(&DhcpOption::Router(vec![Ipv4Addr::new(192, 168, 1, 1)])));
        assert!(offer.options.contains(&DhcpOption::Hostname("node-1".to_string())));
    }

    #[tokio::test]
    async fn test_default_responder_acks_request() {
        let responder = DefaultResponder::new(Ipv4Addr::new(192, 168, 1, 1));
        let writer = Captured::default();
        let request = Request::new(DhcpPacket::request(
            MessageType::Request,
            7,
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff],
        ));

        assert!(responder.respond(&discovery(), &request, &writer).await);
        assert_eq!(
            writer.replies.lock().await[0].message_type(),
            Some(MessageType::Ack)
        );
    }

    #[tokio::test]
    async fn test_default_responder_ignores_inform() {
        let responder = DefaultResponder::new(Ipv4Addr::new(192, 168, 1, 1));
        let writer = Captured::default();
        let request = Request::new(DhcpPacket::request(
            MessageType::Inform,
            7,
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff],
        ));

        assert!(!responder.respond(&discovery(), &request, &writer).await);
        assert!(writer.replies.lock().await.is_empty());
    }
}
