//! Command frames for privileged requests.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 1 byte: command discriminator
//! - N bytes: payload, where N is fixed by the command kind
//!
//! A frame carries no length prefix: the discriminator alone tells the
//! reader how many payload bytes follow. Anything after the payload belongs
//! to the command's own request/response exchange.
//!
//! # Commands
//!
//! | id | command           | payload                         |
//! |----|-------------------|---------------------------------|
//! | 1  | [`Uninstall`]     | none                            |
//! | 2  | [`RemoveIpAlias`] | IPv4 address                    |
//! | 3  | [`AddIpAlias`]    | IPv4 address, IPv4 netmask      |

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{ProtocolError, Result};

/// Discriminator of [`Uninstall`].
pub const UNINSTALL_ID: u8 = 1;

/// Discriminator of [`RemoveIpAlias`].
pub const REMOVE_IP_ALIAS_ID: u8 = 2;

/// Discriminator of [`AddIpAlias`].
pub const ADD_IP_ALIAS_ID: u8 = 3;

/// Byte written back by the daemon after a command succeeded.
pub const SUCCESS_MARKER: u8 = 0x00;

/// A command with a fixed-size wire payload.
///
/// Implementors only describe their payload; the discriminator byte is
/// handled by the provided frame methods.
pub trait WireCommand: Sized {
    /// Discriminator byte identifying this command on the wire.
    const ID: u8;

    /// Exact number of payload bytes following the discriminator.
    const PAYLOAD_LEN: usize;

    /// Append the payload to `buf`.
    fn encode_payload(&self, buf: &mut BytesMut);

    /// Decode the payload. `payload` must be exactly `PAYLOAD_LEN` bytes.
    fn decode_payload(payload: &[u8]) -> Result<Self>;

    /// Encode discriminator and payload into a complete frame.
    fn encode_frame(&self) -> Vec<u8> {
        let mut output = BytesMut::with_capacity(1 + Self::PAYLOAD_LEN);
        output.put_u8(Self::ID);
        self.encode_payload(&mut output);
        output.to_vec()
    }

    /// Decode a complete frame, checking the discriminator.
    fn decode_frame(data: &[u8]) -> Result<Self> {
        let Some((&id, payload)) = data.split_first() else {
            return Err(ProtocolError::Truncated {
                expected: 1 + Self::PAYLOAD_LEN,
                got: 0,
            });
        };
        if id != Self::ID {
            return Err(ProtocolError::DiscriminatorMismatch {
                expected: Self::ID,
                got: id,
            });
        }
        Self::decode_payload(payload)
    }
}

fn expect_len(payload: &[u8], expected: usize) -> Result<()> {
    if payload.len() != expected {
        return Err(ProtocolError::Truncated {
            expected,
            got: payload.len(),
        });
    }
    Ok(())
}

/// Convert a contiguous netmask into its prefix length.
///
/// ```rust
/// use cfdevd_protocol::framing::prefix_len;
/// use std::net::Ipv4Addr;
///
/// assert_eq!(prefix_len(Ipv4Addr::new(255, 255, 255, 0)).unwrap(), 24);
/// assert!(prefix_len(Ipv4Addr::new(255, 0, 255, 0)).is_err());
/// ```
pub fn prefix_len(netmask: Ipv4Addr) -> Result<u8> {
    let bits = u32::from(netmask);
    let ones = bits.leading_ones();
    if bits.checked_shl(ones).unwrap_or(0) != 0 {
        return Err(ProtocolError::InvalidNetmask(netmask));
    }
    Ok(ones as u8)
}

/// Ask the daemon to remove its own service registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Uninstall;

impl WireCommand for Uninstall {
    const ID: u8 = UNINSTALL_ID;
    const PAYLOAD_LEN: usize = 0;

    fn encode_payload(&self, _buf: &mut BytesMut) {}

    fn decode_payload(payload: &[u8]) -> Result<Self> {
        expect_len(payload, Self::PAYLOAD_LEN)?;
        Ok(Self)
    }
}

/// Remove an address alias from the loopback interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveIpAlias {
    /// Alias address to remove.
    pub address: Ipv4Addr,
}

impl RemoveIpAlias {
    /// Create a new remove request.
    pub fn new(address: Ipv4Addr) -> Self {
        Self { address }
    }
}

impl WireCommand for RemoveIpAlias {
    const ID: u8 = REMOVE_IP_ALIAS_ID;
    const PAYLOAD_LEN: usize = 4;

    fn encode_payload(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.address.octets());
    }

    fn decode_payload(payload: &[u8]) -> Result<Self> {
        expect_len(payload, Self::PAYLOAD_LEN)?;
        let mut buf = payload;
        Ok(Self {
            address: Ipv4Addr::from(buf.get_u32()),
        })
    }
}

/// Add an address alias to the loopback interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddIpAlias {
    /// Alias address to add.
    pub address: Ipv4Addr,
    /// Netmask of the alias. Always contiguous.
    pub netmask: Ipv4Addr,
}

impl AddIpAlias {
    /// Create a new add request, validating the netmask.
    pub fn new(address: Ipv4Addr, netmask: Ipv4Addr) -> Result<Self> {
        prefix_len(netmask)?;
        Ok(Self { address, netmask })
    }

    /// Prefix length of the netmask.
    pub fn prefix_len(&self) -> u8 {
        // The constructor and decoder both reject non-contiguous masks.
        prefix_len(self.netmask).unwrap_or(32)
    }
}

impl WireCommand for AddIpAlias {
    const ID: u8 = ADD_IP_ALIAS_ID;
    const PAYLOAD_LEN: usize = 8;

    fn encode_payload(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.address.octets());
        buf.put_slice(&self.netmask.octets());
    }

    fn decode_payload(payload: &[u8]) -> Result<Self> {
        expect_len(payload, Self::PAYLOAD_LEN)?;
        let mut buf = payload;
        let address = Ipv4Addr::from(buf.get_u32());
        let netmask = Ipv4Addr::from(buf.get_u32());
        Self::new(address, netmask)
    }
}
