use core::{cmp, fmt, ops};

use bitflags::bitflags;
use byteorder::{ByteOrder, NetworkEndian};

use super::{Error, Result};

/// A TCP sequence number.
///
/// A sequence number is a monotonically advancing integer modulo 2<sup>32</sup>.
/// Sequence numbers do not have a discontiguity when compared pairwise across a signed overflow.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct SeqNumber(pub u32);

impl SeqNumber {
    /// `self <= other` in sequence space.
    pub fn lower_or_equal(self, other: SeqNumber) -> bool {
        (self.0.wrapping_sub(other.0) as i32) <= 0
    }

    /// `self < other` in sequence space.
    pub fn lower_than(self, other: SeqNumber) -> bool {
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    /// `self > other` in sequence space.
    pub fn greater_than(self, other: SeqNumber) -> bool {
        (self.0.wrapping_sub(other.0) as i32) > 0
    }

    pub fn max(self, rhs: Self) -> Self {
        if self > rhs { self } else { rhs }
    }

    pub fn min(self, rhs: Self) -> Self {
        if self < rhs { self } else { rhs }
    }

    /// Number of sequence slots from `earlier` up to `self`.
    ///
    /// Saturates at zero when `earlier` is ahead of `self`.
    pub fn distance(self, earlier: SeqNumber) -> u32 {
        if self.lower_than(earlier) {
            0
        } else {
            self.0.wrapping_sub(earlier.0)
        }
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ops::Add<u32> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: u32) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(rhs))
    }
}

impl ops::Sub<u32> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: u32) -> SeqNumber {
        SeqNumber(self.0.wrapping_sub(rhs))
    }
}

impl ops::AddAssign<u32> for SeqNumber {
    fn add_assign(&mut self, rhs: u32) {
        *self = *self + rhs;
    }
}

impl cmp::PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &SeqNumber) -> Option<cmp::Ordering> {
        (self.0.wrapping_sub(other.0) as i32).partial_cmp(&0)
    }
}

bitflags! {
    /// The control bits of a TCP header.
    #[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
    pub struct Flags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "-");
        }
        for (i, (name, _)) in self.iter_names().enumerate() {
            if i > 0 {
                write!(f, "|")?;
            }
            write!(f, "{}", name)?;
        }
        Ok(())
    }
}

/// A read/write wrapper around a Transmission Control Protocol packet buffer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

mod field {
    #![allow(non_snake_case)]

    use crate::wire::field::*;

    pub const SRC_PORT: Field = 0..2;
    pub const DST_PORT: Field = 2..4;
    pub const SEQ_NUM: Field = 4..8;
    pub const ACK_NUM: Field = 8..12;
    pub const FLAGS: Field = 12..14;
    pub const WIN_SIZE: Field = 14..16;
    pub const CHECKSUM: Field = 16..18;
    pub const URGENT: Field = 18..20;

    pub const fn OPTIONS(length: u8) -> Field {
        URGENT.end..(length as usize)
    }

    pub const FLG_FIN: u16 = 0x001;
    pub const FLG_SYN: u16 = 0x002;
    pub const FLG_RST: u16 = 0x004;
    pub const FLG_PSH: u16 = 0x008;
    pub const FLG_ACK: u16 = 0x010;
    pub const FLG_URG: u16 = 0x020;

    pub const OPT_END: u8 = 0x00;
    pub const OPT_NOP: u8 = 0x01;
    pub const OPT_MSS: u8 = 0x02;
}

pub const HEADER_LEN: usize = field::URGENT.end;

/// Length of an encoded MSS option.
const MSS_OPTION_LEN: usize = 4;

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with TCP packet structure.
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic if called.
    /// Returns `Err(Error)` if the buffer is too short.
    /// Returns `Err(Error)` if the header length field has a value smaller
    /// than the minimal header length.
    ///
    /// The result of this check is invalidated by calling [set_header_len].
    ///
    /// [set_header_len]: #method.set_header_len
    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < field::URGENT.end {
            Err(Error)
        } else {
            let header_len = self.header_len() as usize;
            if len < header_len || header_len < field::URGENT.end {
                Err(Error)
            } else {
                Ok(())
            }
        }
    }

    /// Consume the packet, returning the underlying buffer.
    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the source port field.
    #[inline]
    pub fn src_port(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::SRC_PORT])
    }

    /// Return the destination port field.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::DST_PORT])
    }

    /// Return the sequence number field.
    #[inline]
    pub fn seq_number(&self) -> SeqNumber {
        let data = self.buffer.as_ref();
        SeqNumber(NetworkEndian::read_u32(&data[field::SEQ_NUM]))
    }

    /// Return the acknowledgement number field.
    #[inline]
    pub fn ack_number(&self) -> SeqNumber {
        let data = self.buffer.as_ref();
        SeqNumber(NetworkEndian::read_u32(&data[field::ACK_NUM]))
    }

    /// Return the control bits.
    #[inline]
    pub fn flags(&self) -> Flags {
        let data = self.buffer.as_ref();
        let raw = NetworkEndian::read_u16(&data[field::FLAGS]);
        let mut flags = Flags::empty();
        flags.set(Flags::FIN, raw & field::FLG_FIN != 0);
        flags.set(Flags::SYN, raw & field::FLG_SYN != 0);
        flags.set(Flags::RST, raw & field::FLG_RST != 0);
        flags.set(Flags::PSH, raw & field::FLG_PSH != 0);
        flags.set(Flags::ACK, raw & field::FLG_ACK != 0);
        flags.set(Flags::URG, raw & field::FLG_URG != 0);
        flags
    }

    /// Return the header length, in octets.
    #[inline]
    pub fn header_len(&self) -> u8 {
        let data = self.buffer.as_ref();
        let raw = NetworkEndian::read_u16(&data[field::FLAGS]);
        ((raw >> 12) * 4) as u8
    }

    /// Return the window size field.
    #[inline]
    pub fn window_len(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::WIN_SIZE])
    }

    /// Return the checksum field.
    #[inline]
    pub fn checksum(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::CHECKSUM])
    }

    /// Return the urgent pointer field.
    #[inline]
    pub fn urgent_at(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::URGENT])
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Packet<&'a T> {
    /// Return a pointer to the options.
    #[inline]
    pub fn options(&self) -> &'a [u8] {
        let header_len = self.header_len();
        let data = self.buffer.as_ref();
        &data[field::OPTIONS(header_len)]
    }

    /// Return a pointer to the payload.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        let header_len = self.header_len() as usize;
        let data = self.buffer.as_ref();
        &data[header_len..]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    /// Set the source port field.
    #[inline]
    pub fn set_src_port(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::SRC_PORT], value)
    }

    /// Set the destination port field.
    #[inline]
    pub fn set_dst_port(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::DST_PORT], value)
    }

    /// Set the sequence number field.
    #[inline]
    pub fn set_seq_number(&mut self, value: SeqNumber) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u32(&mut data[field::SEQ_NUM], value.0)
    }

    /// Set the acknowledgement number field.
    #[inline]
    pub fn set_ack_number(&mut self, value: SeqNumber) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u32(&mut data[field::ACK_NUM], value.0)
    }

    /// Set the header length and control bits at once.
    #[inline]
    pub fn set_header_len_and_flags(&mut self, header_len: u8, flags: Flags) {
        let data = self.buffer.as_mut();
        let raw = ((header_len as u16 / 4) << 12) | flags.bits() as u16;
        NetworkEndian::write_u16(&mut data[field::FLAGS], raw)
    }

    /// Set the window size field.
    #[inline]
    pub fn set_window_len(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::WIN_SIZE], value)
    }

    /// Set the checksum field.
    #[inline]
    pub fn set_checksum(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::CHECKSUM], value)
    }

    /// Set the urgent pointer field.
    #[inline]
    pub fn set_urgent_at(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::URGENT], value)
    }

    /// Return a mutable pointer to the options.
    #[inline]
    pub fn options_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len();
        let data = self.buffer.as_mut();
        &mut data[field::OPTIONS(header_len)]
    }

    /// Return a mutable pointer to the payload data.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len() as usize;
        let data = self.buffer.as_mut();
        &mut data[header_len..]
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Packet<T> {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

/// A high-level representation of a Transmission Control Protocol packet.
///
/// The checksum is not part of the representation. It covers the IP
/// pseudo-header and is filled in by the layer that frames the datagram.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: Flags,
    pub seq_number: SeqNumber,
    pub ack_number: Option<SeqNumber>,
    pub window_len: u16,
    pub max_seg_size: Option<u16>,
    pub payload: &'a [u8],
}

impl<'a> Repr<'a> {
    /// Parse a Transmission Control Protocol packet and return a high-level representation.
    pub fn parse<T>(packet: &Packet<&'a T>) -> Result<Repr<'a>>
    where
        T: AsRef<[u8]> + ?Sized,
    {
        packet.check_len()?;

        // Source and destination ports must be present.
        if packet.src_port() == 0 || packet.dst_port() == 0 {
            return Err(Error);
        }

        let flags = packet.flags();
        let ack_number = if flags.contains(Flags::ACK) {
            Some(packet.ack_number())
        } else {
            None
        };

        let mut max_seg_size = None;
        let mut options = packet.options();
        while let Some((&kind, rest)) = options.split_first() {
            match kind {
                field::OPT_END => break,
                field::OPT_NOP => options = rest,
                _ => {
                    let length = *rest.first().ok_or(Error)? as usize;
                    if length < 2 || length > options.len() {
                        return Err(Error);
                    }
                    if kind == field::OPT_MSS {
                        if length != MSS_OPTION_LEN {
                            return Err(Error);
                        }
                        max_seg_size = Some(NetworkEndian::read_u16(&options[2..4]));
                    }
                    options = &options[length..];
                }
            }
        }

        Ok(Repr {
            src_port: packet.src_port(),
            dst_port: packet.dst_port(),
            flags,
            seq_number: packet.seq_number(),
            ack_number,
            window_len: packet.window_len(),
            max_seg_size,
            payload: packet.payload(),
        })
    }

    /// Return the length of a header that will be emitted from this high-level representation.
    pub fn header_len(&self) -> usize {
        let mut length = field::URGENT.end;
        if self.max_seg_size.is_some() {
            length += MSS_OPTION_LEN;
        }
        length
    }

    /// Return the length of a packet that will be emitted from this high-level representation.
    pub fn buffer_len(&self) -> usize {
        self.header_len() + self.payload.len()
    }

    /// Return the length of the segment, in terms of sequence space.
    pub fn segment_len(&self) -> usize {
        self.payload.len() + self.flags.intersection(Flags::SYN | Flags::FIN).bits().count_ones() as usize
    }

    /// Emit a high-level representation into a Transmission Control Protocol packet.
    pub fn emit<T>(&self, packet: &mut Packet<&mut T>)
    where
        T: AsRef<[u8]> + AsMut<[u8]> + ?Sized,
    {
        packet.set_src_port(self.src_port);
        packet.set_dst_port(self.dst_port);
        packet.set_seq_number(self.seq_number);
        packet.set_ack_number(self.ack_number.unwrap_or(SeqNumber(0)));
        packet.set_window_len(self.window_len);

        let mut flags = self.flags;
        flags.set(Flags::ACK, self.ack_number.is_some());
        packet.set_header_len_and_flags(self.header_len() as u8, flags);
        packet.set_urgent_at(0);
        packet.set_checksum(0);

        if let Some(value) = self.max_seg_size {
            let options = packet.options_mut();
            options[0] = field::OPT_MSS;
            options[1] = MSS_OPTION_LEN as u8;
            NetworkEndian::write_u16(&mut options[2..4], value);
        }
        packet.payload_mut()[..self.payload.len()].copy_from_slice(self.payload);
    }
}

impl fmt::Display for Repr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "TCP src={} dst={} {} seq={}",
            self.src_port, self.dst_port, self.flags, self.seq_number
        )?;
        if let Some(ack_number) = self.ack_number {
            write!(f, " ack={}", ack_number)?;
        }
        write!(f, " win={}", self.window_len)?;
        if !self.payload.is_empty() {
            write!(f, " len={}", self.payload.len())?;
        }
        if let Some(max_seg_size) = self.max_seg_size {
            write!(f, " mss={}", max_seg_size)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    static SYN_PACKET_BYTES: [u8; 28] = [
        0xbf, 0x00, 0x00, 0x50, 0x01, 0x23, 0x45, 0x67, 0x00, 0x00, 0x00, 0x00, 0x60, 0x02,
        0x01, 0x23, 0x00, 0x00, 0x00, 0x00, 0x02, 0x04, 0x05, 0xb4, 0xaa, 0x00, 0x00, 0xff,
    ];

    static PAYLOAD_BYTES: [u8; 4] = [0xaa, 0x00, 0x00, 0xff];

    fn syn_repr() -> Repr<'static> {
        Repr {
            src_port: 48896,
            dst_port: 80,
            flags: Flags::SYN,
            seq_number: SeqNumber(0x01234567),
            ack_number: None,
            window_len: 0x0123,
            max_seg_size: Some(1460),
            payload: &PAYLOAD_BYTES,
        }
    }

    #[test]
    fn test_seq_number_wrapping_compare() {
        let a = SeqNumber(u32::MAX - 1);
        let b = a + 3;
        assert_eq!(b, SeqNumber(1));
        assert!(a.lower_than(b));
        assert!(a.lower_or_equal(b));
        assert!(b.greater_than(a));
        assert!(a.lower_or_equal(a));
        assert!(!a.lower_than(a));
        assert!(a < b);
        assert_eq!(b.distance(a), 3);
        assert_eq!(a.distance(b), 0);
        assert_eq!(a.max(b), b);
        assert_eq!(a.min(b), a);
    }

    #[test]
    fn test_seq_number_half_space() {
        let a = SeqNumber(0);
        assert!(a.lower_than(SeqNumber(0x7fff_ffff)));
        assert!(a.greater_than(SeqNumber(0x8000_0001)));
    }

    #[test]
    fn test_deconstruct() {
        let packet = Packet::new_checked(&SYN_PACKET_BYTES[..]).unwrap();
        assert_eq!(packet.src_port(), 48896);
        assert_eq!(packet.dst_port(), 80);
        assert_eq!(packet.seq_number(), SeqNumber(0x01234567));
        assert_eq!(packet.header_len(), 24);
        assert_eq!(packet.flags(), Flags::SYN);
        assert_eq!(packet.window_len(), 0x0123);
        assert_eq!(packet.options(), &[0x02, 0x04, 0x05, 0xb4]);
        assert_eq!(packet.payload(), &PAYLOAD_BYTES[..]);
    }

    #[test]
    fn test_parse() {
        let packet = Packet::new_checked(&SYN_PACKET_BYTES[..]).unwrap();
        let repr = Repr::parse(&packet).unwrap();
        assert_eq!(repr, syn_repr());
        assert_eq!(repr.segment_len(), 5);
    }

    #[test]
    fn test_emit() {
        let repr = syn_repr();
        let mut bytes = [0xa5; 28];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        repr.emit(&mut packet);
        assert_eq!(&bytes[..], &SYN_PACKET_BYTES[..]);
    }

    #[test]
    fn test_truncated() {
        assert_eq!(Packet::new_checked(&SYN_PACKET_BYTES[..23]), Err(Error));
    }

    #[test]
    fn test_bad_data_offset() {
        let mut bytes = SYN_PACKET_BYTES;
        bytes[12] = 0x40;
        assert_eq!(Packet::new_checked(&bytes[..]), Err(Error));
    }

    #[test]
    fn test_malformed_mss_option() {
        let mut bytes = SYN_PACKET_BYTES;
        bytes[21] = 0x03;
        let packet = Packet::new_checked(&bytes[..]).unwrap();
        assert_eq!(Repr::parse(&packet), Err(Error));
    }

    #[test]
    fn test_flags_display() {
        assert_eq!(format!("{}", Flags::SYN | Flags::ACK), "SYN|ACK");
        assert_eq!(format!("{}", Flags::empty()), "-");
    }
}
