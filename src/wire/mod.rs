/*! Low-level segment access and construction.

The `wire` module deals with the segment *representation*. It provides two levels
of functionality.

 * First, it provides functions to extract fields from sequences of octets,
   and to insert fields into sequences of octets. This happens in the [TcpPacket]
   structure.
 * Second, in cases where the space of valid field values is much smaller than the space
   of possible field values, it provides a compact, high-level representation
   of segment data that can be parsed from and emitted into a sequence of octets.
   This happens through [TcpRepr].

[TcpPacket]: struct.TcpPacket.html
[TcpRepr]: struct.TcpRepr.html

The `Packet` family of data structures guarantees that, if the `Packet::check_len()` method
returned `Ok(())`, then no accessor or setter method will panic; however, the guarantee
provided by `Packet::check_len()` may no longer hold after changing certain fields,
which are listed in the documentation for the specific packet.

The `Packet::new_checked` method is a shorthand for a combination of `Packet::new_unchecked`
and `Packet::check_len`.
When parsing untrusted input, it is *necessary* to use `Packet::new_checked()`;
so long as the buffer is not modified, no accessor will fail.

In the `Repr` family of data structures, the `Repr::parse()` method never panics
as long as `Packet::new_checked()` (or `Packet::check_len()`) has succeeded, and
the `Repr::emit()` method never panics as long as the underlying buffer is exactly
`Repr::buffer_len()` octets long.
*/

mod field {
    pub type Field = ::core::ops::Range<usize>;
    pub type Rest = ::core::ops::RangeFrom<usize>;
}

mod tcp;

use core::fmt;

pub use self::tcp::{
    Flags as TcpFlags, HEADER_LEN as TCP_HEADER_LEN, Packet as TcpPacket, Repr as TcpRepr,
    SeqNumber as TcpSeqNumber,
};

/// An internetworking address.
pub type IpAddress = core::net::IpAddr;

/// The error type for the wire layer.
///
/// Returned when a buffer is too short for the fields it claims to hold,
/// or when a header field carries a value that cannot be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Error;

impl core::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "wire::Error")
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// An internet endpoint address.
///
/// `Endpoint` always fully specifies both the address and the port.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct IpEndpoint {
    pub addr: IpAddress,
    pub port: u16,
}

impl IpEndpoint {
    /// Create an endpoint address from given address and port.
    pub const fn new(addr: IpAddress, port: u16) -> IpEndpoint {
        IpEndpoint { addr, port }
    }
}

impl fmt::Display for IpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.addr {
            IpAddress::V4(addr) => write!(f, "{}:{}", addr, self.port),
            IpAddress::V6(addr) => write!(f, "[{}]:{}", addr, self.port),
        }
    }
}

impl<T: Into<IpAddress>> From<(T, u16)> for IpEndpoint {
    fn from((addr, port): (T, u16)) -> IpEndpoint {
        IpEndpoint {
            addr: addr.into(),
            port,
        }
    }
}

/// An internet endpoint address for listening.
///
/// In contrast with [`IpEndpoint`], `IpListenEndpoint` allows not specifying the address,
/// in order to listen on a given port at all our addresses.
///
/// An endpoint can be constructed from a port, in which case the address is unspecified.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct IpListenEndpoint {
    pub addr: Option<IpAddress>,
    pub port: u16,
}

impl IpListenEndpoint {
    /// Query whether the endpoint has a specified address and port.
    pub const fn is_specified(&self) -> bool {
        self.addr.is_some() && self.port != 0
    }

    /// Query whether `endpoint` is one this listen endpoint accepts.
    pub fn accepts(&self, endpoint: &IpEndpoint) -> bool {
        self.port == endpoint.port && self.addr.is_none_or(|addr| addr == endpoint.addr)
    }
}

impl fmt::Display for IpListenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(addr) = self.addr {
            write!(f, "{}", IpEndpoint::new(addr, self.port))
        } else {
            write!(f, "*:{}", self.port)
        }
    }
}

impl From<u16> for IpListenEndpoint {
    fn from(port: u16) -> IpListenEndpoint {
        IpListenEndpoint { addr: None, port }
    }
}

impl From<IpEndpoint> for IpListenEndpoint {
    fn from(endpoint: IpEndpoint) -> IpListenEndpoint {
        IpListenEndpoint {
            addr: Some(endpoint.addr),
            port: endpoint.port,
        }
    }
}

impl<T: Into<IpAddress>> From<(T, u16)> for IpListenEndpoint {
    fn from((addr, port): (T, u16)) -> IpListenEndpoint {
        IpListenEndpoint {
            addr: Some(addr.into()),
            port,
        }
    }
}

/// Serializes the address octets of `addr` into `buf`, returning the octet count.
pub(crate) fn write_address(addr: &IpAddress, buf: &mut [u8]) -> usize {
    match addr {
        IpAddress::V4(addr) => {
            buf[..4].copy_from_slice(&addr.octets());
            4
        }
        IpAddress::V6(addr) => {
            buf[..16].copy_from_slice(&addr.octets());
            16
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::net::Ipv4Addr;

    #[test]
    fn test_listen_endpoint_accepts() {
        let remote = IpEndpoint::new(IpAddress::V4(Ipv4Addr::new(10, 0, 0, 1)), 80);
        assert!(IpListenEndpoint::from(80).accepts(&remote));
        assert!(IpListenEndpoint::from(remote).accepts(&remote));
        assert!(!IpListenEndpoint::from(81).accepts(&remote));
        let other = IpListenEndpoint::from((Ipv4Addr::new(10, 0, 0, 2), 80));
        assert!(!other.accepts(&remote));
    }

    #[test]
    fn test_endpoint_display() {
        let endpoint = IpEndpoint::new(IpAddress::V4(Ipv4Addr::new(192, 168, 1, 1)), 49500);
        assert_eq!(format!("{}", endpoint), "192.168.1.1:49500");
        assert_eq!(format!("{}", IpListenEndpoint::from(80)), "*:80");
    }
}
