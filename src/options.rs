//! DHCP options (RFC 2132) and relay agent information (RFC 3046).
//!
//! Each option is a code byte, a length byte and `length` bytes of data.
//! Only the options the dispatch engine and the default responder look at are
//! decoded; everything else is kept as [`DhcpOption::Unknown`] so replies can
//! forward it untouched.
//!
//! Option 82 carries its own TLV chain of sub-options. [`RelayAgentInformation`]
//! walks that chain and bound-checks every declared length, which is how the
//! relay circuit identifier is extracted.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// DHCP option codes understood by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    Hostname = 12,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    /// `sname`/`file` fields carry options (RFC 2132 §9.3).
    OptionOverload = 52,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    ClientIdentifier = 61,
    /// Relay agent information (RFC 3046).
    RelayAgentInfo = 82,
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Pad,
            1 => Self::SubnetMask,
            3 => Self::Router,
            12 => Self::Hostname,
            50 => Self::RequestedIpAddress,
            51 => Self::LeaseTime,
            52 => Self::OptionOverload,
            53 => Self::MessageType,
            54 => Self::ServerIdentifier,
            55 => Self::ParameterRequestList,
            61 => Self::ClientIdentifier,
            82 => Self::RelayAgentInfo,
            255 => Self::End,
            other => return Err(other),
        })
    }
}

/// DHCP message types (Option 53) as defined in RFC 2132 §9.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl MessageType {
    /// Metric/log label, e.g. `DHCPDISCOVER`.
    pub fn label(self) -> &'static str {
        match self {
            Self::Discover => "DHCPDISCOVER",
            Self::Offer => "DHCPOFFER",
            Self::Request => "DHCPREQUEST",
            Self::Decline => "DHCPDECLINE",
            Self::Ack => "DHCPACK",
            Self::Nak => "DHCPNAK",
            Self::Release => "DHCPRELEASE",
            Self::Inform => "DHCPINFORM",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            other => return Err(other),
        })
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Option overload flags (Option 52).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OverloadFlag {
    File = 1,
    Sname = 2,
    Both = 3,
}

impl TryFrom<u8> for OverloadFlag {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::File),
            2 => Ok(Self::Sname),
            3 => Ok(Self::Both),
            other => Err(other),
        }
    }
}

/// A parsed DHCP option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    /// First address is the default gateway.
    Router(Vec<Ipv4Addr>),
    Hostname(String),
    RequestedIpAddress(Ipv4Addr),
    LeaseTime(u32),
    OptionOverload(OverloadFlag),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    ClientIdentifier(Vec<u8>),
    /// Raw option 82 payload (the sub-option chain, without code and length).
    RelayAgentInfo(Vec<u8>),
    Unknown(u8, Vec<u8>),
}

fn ipv4(data: &[u8], what: &str) -> Result<Ipv4Addr> {
    let octets: [u8; 4] = data
        .try_into()
        .map_err(|_| Error::InvalidPacket(format!("Invalid {} length", what)))?;
    Ok(Ipv4Addr::from(octets))
}

fn seconds(data: &[u8], what: &str) -> Result<u32> {
    let bytes: [u8; 4] = data
        .try_into()
        .map_err(|_| Error::InvalidPacket(format!("Invalid {} length", what)))?;
    Ok(u32::from_be_bytes(bytes))
}

fn tlv(code: u8, data: &[u8]) -> Vec<u8> {
    let len = data.len().min(255);
    let mut result = Vec::with_capacity(len + 2);
    result.push(code);
    result.push(len as u8);
    result.extend_from_slice(&data[..len]);
    result
}

impl DhcpOption {
    /// Returns the option code for this option.
    pub fn option_code(&self) -> u8 {
        let code = match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask,
            Self::Router(_) => OptionCode::Router,
            Self::Hostname(_) => OptionCode::Hostname,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress,
            Self::LeaseTime(_) => OptionCode::LeaseTime,
            Self::OptionOverload(_) => OptionCode::OptionOverload,
            Self::MessageType(_) => OptionCode::MessageType,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList,
            Self::ClientIdentifier(_) => OptionCode::ClientIdentifier,
            Self::RelayAgentInfo(_) => OptionCode::RelayAgentInfo,
            Self::Unknown(code, _) => return *code,
        };
        code as u8
    }

    /// Parses a DHCP option from its code and the bytes following the
    /// length byte.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] if the data length is invalid for
    /// the option type.
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        match OptionCode::try_from(code) {
            Ok(OptionCode::SubnetMask) => Ok(Self::SubnetMask(ipv4(data, "subnet mask")?)),
            Ok(OptionCode::Router) => {
                if data.is_empty() || !data.len().is_multiple_of(4) {
                    return Err(Error::InvalidPacket(
                        "Invalid router option length".to_string(),
                    ));
                }
                Ok(Self::Router(
                    data.chunks_exact(4)
                        .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
                        .collect(),
                ))
            }
            Ok(OptionCode::Hostname) => Ok(Self::Hostname(String::from_utf8_lossy(data).into())),
            Ok(OptionCode::RequestedIpAddress) => Ok(Self::RequestedIpAddress(ipv4(
                data,
                "requested IP address",
            )?)),
            Ok(OptionCode::LeaseTime) => Ok(Self::LeaseTime(seconds(data, "lease time")?)),
            Ok(OptionCode::OptionOverload) => {
                let [value] = data else {
                    return Err(Error::InvalidPacket(
                        "Invalid option overload length".to_string(),
                    ));
                };
                OverloadFlag::try_from(*value)
                    .map(Self::OptionOverload)
                    .map_err(|value| {
                        Error::InvalidPacket(format!("Invalid option overload value: {}", value))
                    })
            }
            Ok(OptionCode::MessageType) => {
                let [value] = data else {
                    return Err(Error::InvalidPacket(
                        "Invalid message type length".to_string(),
                    ));
                };
                MessageType::try_from(*value)
                    .map(Self::MessageType)
                    .map_err(|value| Error::InvalidPacket(format!("Unknown message type: {}", value)))
            }
            Ok(OptionCode::ServerIdentifier) => {
                Ok(Self::ServerIdentifier(ipv4(data, "server identifier")?))
            }
            Ok(OptionCode::ParameterRequestList) => Ok(Self::ParameterRequestList(data.to_vec())),
            Ok(OptionCode::ClientIdentifier) => Ok(Self::ClientIdentifier(data.to_vec())),
            Ok(OptionCode::RelayAgentInfo) => Ok(Self::RelayAgentInfo(data.to_vec())),
            Ok(OptionCode::Pad | OptionCode::End) => Err(Error::InvalidPacket(
                "Pad/End should not be parsed as options".to_string(),
            )),
            Err(unknown_code) => Ok(Self::Unknown(unknown_code, data.to_vec())),
        }
    }

    /// Encodes the option to its wire format (code + length + data).
    pub fn encode(&self) -> Vec<u8> {
        let code = self.option_code();
        match self {
            Self::SubnetMask(addr)
            | Self::RequestedIpAddress(addr)
            | Self::ServerIdentifier(addr) => tlv(code, &addr.octets()),
            Self::Router(addrs) => {
                let data: Vec<u8> = addrs.iter().take(63).flat_map(|a| a.octets()).collect();
                tlv(code, &data)
            }
            Self::Hostname(name) => tlv(code, name.as_bytes()),
            Self::LeaseTime(time) => tlv(code, &time.to_be_bytes()),
            Self::OptionOverload(flag) => tlv(code, &[*flag as u8]),
            Self::MessageType(message_type) => tlv(code, &[*message_type as u8]),
            Self::ParameterRequestList(data)
            | Self::ClientIdentifier(data)
            | Self::RelayAgentInfo(data)
            | Self::Unknown(_, data) => tlv(code, data),
        }
    }
}

/// Relay agent sub-option: Agent Circuit ID (RFC 3046 §2.1).
pub const SUBOPTION_CIRCUIT_ID: u8 = 1;
/// Relay agent sub-option: Agent Remote ID (RFC 3046 §2.2).
pub const SUBOPTION_REMOTE_ID: u8 = 2;

/// Decoded relay agent information (option 82).
///
/// The option payload is a sequence of `[sub-code][len][data...]` entries.
/// Relays commonly send circuit id first, but nothing requires it, so the
/// whole chain is walked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayAgentInformation {
    pub circuit_id: Option<Vec<u8>>,
    pub remote_id: Option<Vec<u8>>,
    /// Sub-options other than circuit and remote id, in order.
    pub other: Vec<(u8, Vec<u8>)>,
}

impl RelayAgentInformation {
    /// Decodes a complete option as it appears on the wire:
    /// `[82][len][sub-options...]`.
    ///
    /// Empty input means the option is absent and yields an empty value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedOption`] if the tag is not 82, the length
    /// byte is missing, the declared length runs past the input, or any
    /// sub-option is truncated.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let code = OptionCode::RelayAgentInfo as u8;
        let Some((&tag, rest)) = raw.split_first() else {
            return Ok(Self::default());
        };
        if tag != code {
            return Err(Error::malformed(code, format!("unexpected tag {}", tag)));
        }
        let Some((&declared, body)) = rest.split_first() else {
            return Err(Error::malformed(code, "missing length byte"));
        };
        let declared = declared as usize;
        if declared > body.len() {
            return Err(Error::malformed(
                code,
                format!("declared length {} exceeds {} available byte(s)", declared, body.len()),
            ));
        }
        Self::parse(&body[..declared])
    }

    /// Parses the option payload (the sub-option chain only).
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedOption`] if a sub-option header or its data
    /// is cut short.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let code = OptionCode::RelayAgentInfo as u8;
        let mut info = Self::default();
        let mut index = 0;

        while index < payload.len() {
            let sub_code = payload[index];
            let Some(&length) = payload.get(index + 1) else {
                return Err(Error::malformed(
                    code,
                    format!("sub-option {} has no length byte", sub_code),
                ));
            };
            let start = index + 2;
            let end = start + length as usize;
            let Some(data) = payload.get(start..end) else {
                return Err(Error::malformed(
                    code,
                    format!(
                        "sub-option {} declares {} byte(s), {} available",
                        sub_code,
                        length,
                        payload.len() - start
                    ),
                ));
            };

            match sub_code {
                SUBOPTION_CIRCUIT_ID if info.circuit_id.is_none() => {
                    info.circuit_id = Some(data.to_vec())
                }
                SUBOPTION_REMOTE_ID if info.remote_id.is_none() => {
                    info.remote_id = Some(data.to_vec())
                }
                _ => info.other.push((sub_code, data.to_vec())),
            }

            index = end;
        }

        Ok(info)
    }

    /// Circuit id as text, or an empty string when the relay did not send one.
    pub fn circuit_id_string(&self) -> String {
        self.circuit_id
            .as_deref()
            .map(|id| String::from_utf8_lossy(id).into_owned())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversions() {
        for value in 1..=8u8 {
            let msg_type = MessageType::try_from(value).unwrap();
            assert_eq!(msg_type as u8, value);
        }
        assert!(MessageType::try_from(0).is_err());
        assert!(MessageType::try_from(9).is_err());
    }

    #[test]
    fn test_message_type_labels() {
        assert_eq!(MessageType::Discover.to_string(), "DHCPDISCOVER");
        assert_eq!(MessageType::Release.to_string(), "DHCPRELEASE");
        assert_eq!(MessageType::Offer.label(), "DHCPOFFER");
    }

    #[test]
    fn test_option_invalid_lengths() {
        assert!(DhcpOption::parse(1, &[255, 255, 255]).is_err());
        assert!(DhcpOption::parse(3, &[]).is_err());
        assert!(DhcpOption::parse(3, &[10, 0, 0]).is_err());
        assert!(DhcpOption::parse(51, &[0, 0, 0]).is_err());
        assert!(DhcpOption::parse(53, &[]).is_err());
        assert!(DhcpOption::parse(53, &[42]).is_err());
    }

    #[test]
    fn test_unknown_option_preserved() {
        let decoded = DhcpOption::parse(100, &[1, 2, 3, 4]).unwrap();
        assert_eq!(decoded, DhcpOption::Unknown(100, vec![1, 2, 3, 4]));
        assert_eq!(decoded.encode(), vec![100, 4, 1, 2, 3, 4]);
    }

    #[test]
    fn test_router_encoding() {
        let option = DhcpOption::Router(vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]);
        assert_eq!(option.encode(), vec![3, 8, 10, 0, 0, 1, 10, 0, 0, 2]);
    }

    #[test]
    fn test_relay_info_circuit_first() {
        let payload = [1, 4, b'e', b't', b'h', b'0', 2, 2, 0xab, 0xcd];
        let info = RelayAgentInformation::parse(&payload).unwrap();
        assert_eq!(info.circuit_id_string(), "eth0");
        assert_eq!(info.remote_id, Some(vec![0xab, 0xcd]));
        assert!(info.other.is_empty());
    }

    #[test]
    fn test_relay_info_circuit_not_first() {
        // Remote id, then a vendor sub-option (9), then the circuit id.
        let payload = [2, 1, 0x01, 9, 3, 0, 0, 1, 1, 6, b'g', b'e', b'-', b'0', b'/', b'1'];
        let info = RelayAgentInformation::parse(&payload).unwrap();
        assert_eq!(info.circuit_id_string(), "ge-0/1");
        assert_eq!(info.other, vec![(9, vec![0, 0, 1])]);
    }

    #[test]
    fn test_relay_info_without_circuit_id() {
        let info = RelayAgentInformation::parse(&[2, 2, 1, 2]).unwrap();
        assert_eq!(info.circuit_id, None);
        assert_eq!(info.circuit_id_string(), "");
    }

    #[test]
    fn test_relay_info_truncated_suboption() {
        let result = RelayAgentInformation::parse(&[1, 10, b'a', b'b']);
        assert!(matches!(
            result,
            Err(Error::MalformedOption { code: 82, .. })
        ));

        let result = RelayAgentInformation::parse(&[1, 2, b'a', b'b', 2]);
        assert!(matches!(result, Err(Error::MalformedOption { .. })));
    }

    #[test]
    fn test_relay_info_decode_absent() {
        let info = RelayAgentInformation::decode(&[]).unwrap();
        assert_eq!(info, RelayAgentInformation::default());
    }

    #[test]
    fn test_relay_info_decode_full_option() {
        let raw = [82, 6, 1, 4, b'p', b'o', b'r', b't'];
        let info = RelayAgentInformation::decode(&raw).unwrap();
        assert_eq!(info.circuit_id_string(), "port");
    }

    #[test]
    fn test_relay_info_decode_declared_length_out_of_bounds() {
        // Declared 12 bytes, only 6 present.
        let raw = [82, 12, 1, 4, b'p', b'o', b'r', b't'];
        assert!(matches!(
            RelayAgentInformation::decode(&raw),
            Err(Error::MalformedOption { .. })
        ));
        assert!(RelayAgentInformation::decode(&[82]).is_err());
        assert!(RelayAgentInformation::decode(&[81, 0]).is_err());
    }

    #[test]
    fn test_relay_info_decode_ignores_trailing_bytes() {
        let raw = [82, 3, 1, 1, b'x', 0xff, 0xff];
        let info = RelayAgentInformation::decode(&raw).unwrap();
        assert_eq!(info.circuit_id_string(), "x");
    }

    #[test]
    fn test_relay_info_zero_length_circuit() {
        let info = RelayAgentInformation::parse(&[1, 0]).unwrap();
        assert_eq!(info.circuit_id, Some(vec![]));
        assert_eq!(info.circuit_id_string(), "");
    }
}
