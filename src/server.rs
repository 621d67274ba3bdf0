use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::job::{
    Direction, Discovery, IgnorePolicy, JobLayer, JobTimer, Metrics, NewHardware, ReplyWriter,
    Request,
};
use crate::lease::Leases;
use crate::options::MessageType;
use crate::packet::{BOOTREQUEST, DhcpPacket};

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;
const RECV_BUFFER_SIZE: usize = 1500;

/// Template instantiated for machines provisioned on first contact.
pub const DEFAULT_TEMPLATE: &str = "default";

/// How the dispatcher disposed of a request.
#[derive(Debug)]
pub enum Handled {
    IgnoredClient,
    IgnoredRelay,
    /// RELEASE or DECLINE; the client's lease (if any) went back to the pool.
    Released,
    /// Not in the inventory and default workflows are disabled.
    Unknown,
    /// Handed to the responder. The task yields whether a reply was sent.
    Responding(JoinHandle<bool>),
}

/// Per-request state machine: filter, classify, resolve, provision, respond.
pub struct Dispatcher {
    leases: Arc<Leases>,
    jobs: JobLayer,
    ignore: Arc<dyn IgnorePolicy>,
    metrics: Arc<dyn Metrics>,
    default_workflows: bool,
}

impl Dispatcher {
    pub fn new(
        leases: Arc<Leases>,
        jobs: JobLayer,
        ignore: Arc<dyn IgnorePolicy>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            leases,
            jobs,
            ignore,
            metrics,
            default_workflows: false,
        }
    }

    /// Provision unknown clients on first contact.
    pub fn with_default_workflows(mut self, enabled: bool) -> Self {
        self.default_workflows = enabled;
        self
    }

    pub async fn handle(&self, request: Request, writer: Arc<dyn ReplyWriter>) -> Result<Handled> {
        if self.ignore.ignore_client(&request.mac) {
            info!(mac = %request.mac, "Ignoring packet from client on ignore list");
            return Ok(Handled::IgnoredClient);
        }

        if let Some(message_type @ (MessageType::Release | MessageType::Decline)) =
            request.message_type
        {
            match self.leases.release(&request.mac).await {
                Some(address) => info!("{} from {} for {}", message_type, request.mac, address),
                None => debug!(mac = %request.mac, "{} without a lease", message_type),
            }
            return Ok(Handled::Released);
        }

        let giaddr = request.giaddr.to_string();
        if self.ignore.ignore_relay(&giaddr) {
            info!(mac = %request.mac, %giaddr, "Ignoring packet from relay on ignore list");
            return Ok(Handled::IgnoredRelay);
        }

        let op = request.op();
        self.metrics.dhcp_total(Direction::Recv, op, request.giaddr);
        let timer = JobTimer::start(Arc::clone(&self.metrics), op);

        let circuit_id = circuit_id(&request);

        let discovery = match self
            .jobs
            .fetcher
            .discover_by_client(&request.mac, request.giaddr, &circuit_id)
            .await
        {
            Ok(discovery) => discovery,
            Err(lookup) if self.default_workflows => {
                debug!(mac = %request.mac, %lookup, "provisioning unknown client");
                self.provision(&request, &circuit_id).await?
            }
            Err(lookup) => {
                info!(mac = %request.mac, %lookup, "Unknown client, default workflows disabled");
                return Ok(Handled::Unknown);
            }
        };

        let responder = Arc::clone(&self.jobs.responder);
        let metrics = Arc::clone(&self.metrics);
        let task = tokio::spawn(async move {
            let _timer = timer;
            let sent = responder
                .respond(&discovery, &request, writer.as_ref())
                .await;
            if sent {
                metrics.dhcp_total(Direction::Send, MessageType::Offer.label(), request.giaddr);
            }
            sent
        });

        Ok(Handled::Responding(task))
    }

    /// Creates hardware, a lease and a default workflow for a client the
    /// inventory does not know.
    async fn provision(&self, request: &Request, circuit_id: &str) -> Result<Discovery> {
        let mac = request.mac.as_str();

        let Some(offset) = self.leases.allocate_free().await else {
            error!(mac, "No IP addresses left to assign");
            return Err(Error::PoolExhausted);
        };
        let pool = *self.leases.pool();
        let address = pool.address(offset);

        let hardware = NewHardware {
            mac: mac.to_string(),
            giaddr: request.giaddr,
            circuit_id: circuit_id.to_string(),
            address,
            subnet_mask: pool.subnet_mask,
            gateway: pool.gateway,
        };
        let discovery = match self.jobs.fetcher.create_from_client(hardware).await {
            Ok(discovery) => discovery,
            Err(failure) => {
                self.leases.cancel(offset).await;
                error!(mac, %address, error = %failure, "Failed to create hardware");
                return Err(failure.into());
            }
        };

        // A concurrent create for the same MAC may have answered with its own
        // address; the lease follows the inventory.
        self.leases.bind(mac, discovery.address).await;
        if discovery.address != address {
            self.leases.cancel(offset).await;
        }

        let template = self
            .jobs
            .workflows
            .template_id_by_name(DEFAULT_TEMPLATE)
            .await
            .inspect_err(|failure| {
                error!(mac, template = DEFAULT_TEMPLATE, error = %failure, "Failed to find template")
            })?;
        let workflow = self
            .jobs
            .workflows
            .create_workflow(&template, mac)
            .await
            .inspect_err(|failure| error!(mac, error = %failure, "Failed to create workflow"))?;

        info!(
            "Created workflow ({}) for machine ({}) with IP ({})",
            workflow, mac, discovery.address
        );
        Ok(discovery)
    }
}

/// Circuit id from relay agent information, `""` when absent or malformed.
fn circuit_id(request: &Request) -> String {
    match request.packet.circuit_id() {
        Ok(circuit_id) => circuit_id,
        Err(error) => {
            info!(mac = %request.mac, %error, "Could not parse circuit id");
            String::new()
        }
    }
}

/// Where a reply to `request` goes on the wire.
///
/// Relayed requests go back to the relay on the server port. Otherwise NAKs,
/// broadcast-flagged requests and clients without an address are broadcast;
/// everything else is unicast to `ciaddr`.
pub fn reply_destination(reply: &DhcpPacket, request: &DhcpPacket) -> SocketAddr {
    let is_nak = reply.message_type() == Some(MessageType::Nak);

    if request.giaddr != Ipv4Addr::UNSPECIFIED {
        SocketAddr::new(IpAddr::V4(request.giaddr), DHCP_SERVER_PORT)
    } else if is_nak || request.is_broadcast() || request.ciaddr == Ipv4Addr::UNSPECIFIED {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DHCP_CLIENT_PORT)
    } else {
        SocketAddr::new(IpAddr::V4(request.ciaddr), DHCP_CLIENT_PORT)
    }
}

/// Sends replies on the server's own socket.
pub struct UdpReplyWriter {
    socket: Arc<UdpSocket>,
}

impl UdpReplyWriter {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl ReplyWriter for UdpReplyWriter {
    async fn send(&self, reply: &DhcpPacket, request: &DhcpPacket) -> Result<()> {
        let destination = reply_destination(reply, request);
        self.socket.send_to(&reply.encode(), destination).await?;
        Ok(())
    }
}

/// UDP front end: one receive loop feeding a bounded pool of handlers.
pub struct DhcpServer {
    socket: Arc<UdpSocket>,
    dispatcher: Arc<Dispatcher>,
    writer: Arc<dyn ReplyWriter>,
    workers: Arc<Semaphore>,
    worker_count: usize,
}

impl DhcpServer {
    /// `workers` is clamped to at least one.
    pub fn new(
        socket: Arc<UdpSocket>,
        dispatcher: Dispatcher,
        writer: Arc<dyn ReplyWriter>,
        workers: usize,
    ) -> Self {
        let worker_count = workers.max(1);
        Self {
            socket,
            dispatcher: Arc::new(dispatcher),
            writer,
            workers: Arc::new(Semaphore::new(worker_count)),
            worker_count,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        info!(
            address = ?self.socket.local_addr().ok(),
            workers = self.worker_count,
            "DHCP server ready and listening"
        );

        loop {
            let (size, source) = match self.socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(error) => {
                    error!("Error receiving packet: {}", error);
                    continue;
                }
            };

            let packet = match DhcpPacket::parse(&buffer[..size]) {
                Ok(packet) => packet,
                Err(error) => {
                    warn!("Malformed packet from {}: {}", source, error);
                    continue;
                }
            };
            if packet.op != BOOTREQUEST {
                debug!("Dropping non-BOOTREQUEST packet from {}", source);
                continue;
            }

            // Permits are handed out in arrival order.
            let Ok(permit) = Arc::clone(&self.workers).acquire_owned().await else {
                warn!("Worker pool closed, stopping receive loop");
                return Ok(());
            };

            let dispatcher = Arc::clone(&self.dispatcher);
            let writer = Arc::clone(&self.writer);
            tokio::spawn(async move {
                let _permit = permit;
                let request = Request::new(packet);
                info!("{} from {} ({})", request.op(), request.mac, source);
                if let Err(error) = dispatcher.handle(request, writer).await {
                    warn!("Error handling packet from {}: {}", source, error);
                }
            });
        }
    }

    /// Stops accepting new work once in-flight handlers drain.
    pub fn close(&self) {
        self.workers.close();
    }
}
