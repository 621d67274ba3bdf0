//! DHCP packet parsing and encoding per RFC 2131.
//!
//! A DHCP packet consists of a fixed 236-byte BOOTP header followed by a
//! 4-byte magic cookie and variable-length options:
//!
//! ```text
//! op htype hlen hops | xid | secs flags | ciaddr | yiaddr | siaddr | giaddr
//! chaddr (16) | sname (64) | file (128) | 99.130.83.99 | options ... 255
//! ```

use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::options::{DhcpOption, MessageType, OptionCode, OverloadFlag, RelayAgentInformation};

/// DHCP magic cookie that identifies DHCP packets (vs BOOTP).
const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

const CHADDR_OFFSET: usize = 28;
const SNAME_OFFSET: usize = CHADDR_OFFSET + 16;
const FILE_OFFSET: usize = SNAME_OFFSET + 64;
const MAGIC_COOKIE_OFFSET: usize = FILE_OFFSET + 128;

/// Size of the fixed header portion including magic cookie.
const DHCP_FIXED_HEADER_SIZE: usize = MAGIC_COOKIE_OFFSET + DHCP_MAGIC_COOKIE.len();

/// Replies are padded to this size for BOOTP relay compatibility (RFC 2131 §2).
const DHCP_MIN_PACKET_SIZE: usize = 300;

/// Relay loop protection (RFC 2131 §4.1).
const MAX_HOPS: u8 = 16;

/// Operation code for client requests.
pub const BOOTREQUEST: u8 = 1;

/// Operation code for server replies.
pub const BOOTREPLY: u8 = 2;

pub const HTYPE_ETHERNET: u8 = 1;
pub const HLEN_ETHERNET: u8 = 6;

/// Broadcast bit of the `flags` field.
const FLAG_BROADCAST: u16 = 0x8000;

/// A parsed DHCP packet, request or reply.
#[derive(Debug, Clone)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    /// Transaction ID chosen by the client, echoed in replies.
    pub xid: u32,
    pub secs: u16,
    /// Bit 15 is the broadcast flag.
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    /// Relay agent address, zero for directly attached clients.
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: Vec<DhcpOption>,
}

fn addr_at(data: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    )
}

impl DhcpPacket {
    /// Builds a client request carrying only a message type option.
    ///
    /// Used by relays and test clients; the server only parses requests.
    pub fn request(message_type: MessageType, xid: u32, mac: [u8; 6]) -> Self {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&mac);
        Self {
            op: BOOTREQUEST,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid,
            secs: 0,
            flags: FLAG_BROADCAST,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: vec![DhcpOption::MessageType(message_type)],
        }
    }

    /// Parses a DHCP packet from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] if:
    /// - Packet is shorter than 240 bytes (fixed header + magic cookie)
    /// - Magic cookie is invalid
    /// - Hop count exceeds 16
    /// - Hardware length doesn't match an Ethernet hardware type
    /// - Options are malformed (truncated length or data)
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < DHCP_FIXED_HEADER_SIZE {
            return Err(Error::InvalidPacket(format!(
                "Packet too short: {} bytes (minimum {})",
                data.len(),
                DHCP_FIXED_HEADER_SIZE
            )));
        }

        if data[MAGIC_COOKIE_OFFSET..DHCP_FIXED_HEADER_SIZE] != DHCP_MAGIC_COOKIE {
            return Err(Error::InvalidPacket("Invalid magic cookie".to_string()));
        }

        let [op, htype, hlen, hops] = [data[0], data[1], data[2], data[3]];

        if hops > MAX_HOPS {
            return Err(Error::InvalidPacket(format!(
                "Hop count {} exceeds maximum {}",
                hops, MAX_HOPS
            )));
        }

        if htype == HTYPE_ETHERNET && hlen != HLEN_ETHERNET {
            return Err(Error::InvalidPacket(format!(
                "Invalid hlen {} for Ethernet (expected {})",
                hlen, HLEN_ETHERNET
            )));
        }

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[CHADDR_OFFSET..SNAME_OFFSET]);
        let mut sname = [0u8; 64];
        sname.copy_from_slice(&data[SNAME_OFFSET..FILE_OFFSET]);
        let mut file = [0u8; 128];
        file.copy_from_slice(&data[FILE_OFFSET..MAGIC_COOKIE_OFFSET]);

        let mut options = Self::parse_options(&data[DHCP_FIXED_HEADER_SIZE..])?;

        let overload = options.iter().find_map(|opt| match opt {
            DhcpOption::OptionOverload(flag) => Some(*flag),
            _ => None,
        });
        if let Some(flag) = overload {
            if matches!(flag, OverloadFlag::File | OverloadFlag::Both) {
                options.extend(Self::parse_options(&file)?);
            }
            if matches!(flag, OverloadFlag::Sname | OverloadFlag::Both) {
                options.extend(Self::parse_options(&sname)?);
            }
        }

        Ok(Self {
            op,
            htype,
            hlen,
            hops,
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            secs: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: addr_at(data, 12),
            yiaddr: addr_at(data, 16),
            siaddr: addr_at(data, 20),
            giaddr: addr_at(data, 24),
            chaddr,
            sname,
            file,
            options,
        })
    }

    fn parse_options(data: &[u8]) -> Result<Vec<DhcpOption>> {
        let mut options = Vec::new();
        let mut index = 0;

        while index < data.len() {
            let code = data[index];

            if code == OptionCode::Pad as u8 {
                index += 1;
                continue;
            }

            if code == OptionCode::End as u8 {
                break;
            }

            let Some(&length) = data.get(index + 1) else {
                return Err(Error::InvalidPacket("Option length missing".to_string()));
            };

            let start = index + 2;
            let end = start + length as usize;
            let Some(option_data) = data.get(start..end) else {
                return Err(Error::InvalidPacket("Option data truncated".to_string()));
            };

            options.push(DhcpOption::parse(code, option_data)?);
            index = end;
        }

        Ok(options)
    }

    /// Encodes the packet to bytes for transmission, padded to at least
    /// 300 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(576);

        packet.extend_from_slice(&[self.op, self.htype, self.hlen, self.hops]);
        packet.extend_from_slice(&self.xid.to_be_bytes());
        packet.extend_from_slice(&self.secs.to_be_bytes());
        packet.extend_from_slice(&self.flags.to_be_bytes());
        for addr in [self.ciaddr, self.yiaddr, self.siaddr, self.giaddr] {
            packet.extend_from_slice(&addr.octets());
        }
        packet.extend_from_slice(&self.chaddr);
        packet.extend_from_slice(&self.sname);
        packet.extend_from_slice(&self.file);
        packet.extend_from_slice(&DHCP_MAGIC_COOKIE);

        for option in &self.options {
            packet.extend_from_slice(&option.encode());
        }
        packet.push(OptionCode::End as u8);

        if packet.len() < DHCP_MIN_PACKET_SIZE {
            packet.resize(DHCP_MIN_PACKET_SIZE, 0);
        }

        packet
    }

    /// Returns the DHCP message type (Option 53), `None` for plain BOOTP.
    pub fn message_type(&self) -> Option<MessageType> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::MessageType(t) => Some(*t),
            _ => None,
        })
    }

    /// Returns the relay agent information payload (Option 82) if present.
    ///
    /// This is the sub-option chain; see
    /// [`RelayAgentInformation::parse`](crate::options::RelayAgentInformation::parse).
    pub fn relay_agent_info(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::RelayAgentInfo(info) => Some(info.as_slice()),
            _ => None,
        })
    }

    /// Circuit id from relay agent information.
    ///
    /// Empty when option 82 or its circuit-id sub-option is absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedOption`] if the sub-option chain is cut short.
    pub fn circuit_id(&self) -> Result<String> {
        match self.relay_agent_info() {
            Some(payload) => Ok(RelayAgentInformation::parse(payload)?.circuit_id_string()),
            None => Ok(String::new()),
        }
    }

    /// Returns the client hostname (Option 12) if present.
    pub fn hostname(&self) -> Option<&str> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::Hostname(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Returns the client hardware address bytes (respecting hlen).
    pub fn chaddr_bytes(&self) -> &[u8] {
        &self.chaddr[..(self.hlen as usize).min(self.chaddr.len())]
    }

    /// Formats the client hardware address as `aa:bb:cc:dd:ee:ff`.
    pub fn format_mac(&self) -> String {
        self.chaddr_bytes()
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Returns true if the broadcast flag is set.
    pub fn is_broadcast(&self) -> bool {
        (self.flags & FLAG_BROADCAST) != 0
    }

    /// Creates a reply to `request`.
    ///
    /// The message type is added as the first option. `xid`, `flags`,
    /// `giaddr`, `chaddr`, `htype` and `hlen` are copied from the request;
    /// relay agent information is echoed back per RFC 3046 §2.2.
    pub fn create_reply(
        request: &DhcpPacket,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> Self {
        let mut all_options = vec![DhcpOption::MessageType(message_type)];
        all_options.extend(options);
        if let Some(relay_info) = request.relay_agent_info() {
            all_options.push(DhcpOption::RelayAgentInfo(relay_info.to_vec()));
        }

        Self {
            op: BOOTREPLY,
            htype: request.htype,
            hlen: request.hlen,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: your_ip,
            siaddr: server_ip,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: all_options,
        }
    }
}
