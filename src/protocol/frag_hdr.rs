use std::io::Cursor;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};

use super::{
    iphc::{IPHC_DISPATCH, IPHC_DISPATCH_MASK, IPV6_DISPATCH},
    DecodingError,
};
use crate::utils::MAX_SEQ;

pub const FRAG1_DISPATCH: u8 = 0xc0;
pub const FRAGN_DISPATCH: u8 = 0xe0;
const FRAG_DISPATCH_MASK: u8 = 0xf8;
pub const RFRAG_DISPATCH: u8 = 0xe8;
pub const RFRAG_ACK_DISPATCH: u8 = 0xea;
const RFRAG_DISPATCH_MASK: u8 = 0xfe;
const RFRAG_ACK_REQUEST: u8 = 0x01;

pub const FRAG1_HDR_LEN: usize = 4;
pub const FRAGN_HDR_LEN: usize = 5;
pub const RFRAG_HDR_LEN: usize = 6;

/// Largest datagram size the 11-bit size field can carry.
pub const MAX_DATAGRAM_LEN: usize = 0x7ff;

/// Kind of frame, told apart by its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Iphc,
    Ipv6,
    Frag1,
    FragN,
    RFrag,
    RFragAck,
    Unsupported,
}

#[must_use]
pub fn classify(b: u8) -> Dispatch {
    if b & IPHC_DISPATCH_MASK == IPHC_DISPATCH {
        Dispatch::Iphc
    } else if b == IPV6_DISPATCH {
        Dispatch::Ipv6
    } else if b & FRAG_DISPATCH_MASK == FRAG1_DISPATCH {
        Dispatch::Frag1
    } else if b & FRAG_DISPATCH_MASK == FRAGN_DISPATCH {
        Dispatch::FragN
    } else if b & RFRAG_DISPATCH_MASK == RFRAG_DISPATCH {
        Dispatch::RFrag
    } else if b & RFRAG_DISPATCH_MASK == RFRAG_ACK_DISPATCH {
        Dispatch::RFragAck
    } else {
        Dispatch::Unsupported
    }
}

/// Fragment header flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragVariant {
    /// FRAG1/FRAGN without acknowledgments.
    Rfc4944,
    /// RFRAG with sequence numbers and selective acknowledgment.
    SelectiveAck,
}

impl FragVariant {
    #[must_use]
    pub fn first_hdr_len(&self) -> usize {
        match self {
            FragVariant::Rfc4944 => FRAG1_HDR_LEN,
            FragVariant::SelectiveAck => RFRAG_HDR_LEN,
        }
    }

    #[must_use]
    pub fn subsequent_hdr_len(&self) -> usize {
        match self {
            FragVariant::Rfc4944 => FRAGN_HDR_LEN,
            FragVariant::SelectiveAck => RFRAG_HDR_LEN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentDescriptor {
    variant: FragVariant,
    size: u16,
    tag: u16,
    offset: u8,
    seq: u8,
    ack_request: bool,
}

pub struct FragmentDescriptorBuilder {
    pub variant: FragVariant,
    /// Uncompressed datagram size
    pub size: u16,
    pub tag: u16,
    /// In 8-byte units of the uncompressed datagram
    pub offset: u8,
    pub seq: u8,
    pub ack_request: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Size,
    Seq,
    Flags,
}

impl FragmentDescriptorBuilder {
    pub fn build(self) -> Result<FragmentDescriptor, Error> {
        if self.size as usize > MAX_DATAGRAM_LEN {
            return Err(Error::Size);
        }
        if self.seq > MAX_SEQ {
            return Err(Error::Seq);
        }
        match self.variant {
            FragVariant::Rfc4944 => {
                if self.seq != 0 || self.ack_request {
                    return Err(Error::Flags);
                }
            }
            FragVariant::SelectiveAck => {
                if self.seq == 0 && self.offset != 0 {
                    return Err(Error::Flags);
                }
            }
        }
        let this = FragmentDescriptor {
            variant: self.variant,
            size: self.size,
            tag: self.tag,
            offset: self.offset,
            seq: self.seq,
            ack_request: self.ack_request,
        };
        this.check_rep();
        Ok(this)
    }
}

impl FragmentDescriptor {
    #[inline]
    fn check_rep(&self) {
        assert!(self.size as usize <= MAX_DATAGRAM_LEN);
        assert!(self.seq <= MAX_SEQ);
    }

    #[must_use]
    pub fn is_first(&self) -> bool {
        match self.variant {
            FragVariant::Rfc4944 => self.offset == 0,
            FragVariant::SelectiveAck => self.seq == 0,
        }
    }

    #[must_use]
    pub fn hdr_len(&self) -> usize {
        if self.is_first() {
            self.variant.first_hdr_len()
        } else {
            self.variant.subsequent_hdr_len()
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let size_hi = (self.size >> 8) as u8 & 0x07;
        let mut hdr = vec![0; self.hdr_len()];
        match self.variant {
            FragVariant::Rfc4944 => {
                hdr[0] = if self.is_first() {
                    FRAG1_DISPATCH
                } else {
                    FRAGN_DISPATCH
                } | size_hi;
                hdr[1] = self.size as u8;
                BigEndian::write_u16(&mut hdr[2..4], self.tag);
                if !self.is_first() {
                    hdr[4] = self.offset;
                }
            }
            FragVariant::SelectiveAck => {
                hdr[0] = RFRAG_DISPATCH;
                if self.ack_request {
                    hdr[0] |= RFRAG_ACK_REQUEST;
                }
                hdr[1] = self.offset;
                BigEndian::write_u16(&mut hdr[2..4], self.tag);
                hdr[4] = (self.seq << 3) | size_hi;
                hdr[5] = self.size as u8;
            }
        }
        hdr
    }

    /// Parses a fragment header off the front of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodingError> {
        let mut rdr = Cursor::new(bytes);
        let dispatch = rdr
            .read_u8()
            .map_err(|_e| DecodingError::Decoding { field: "dispatch" })?;
        let this = match classify(dispatch) {
            Dispatch::Frag1 | Dispatch::FragN => {
                let size_lo = rdr
                    .read_u8()
                    .map_err(|_e| DecodingError::Decoding { field: "size" })?;
                let tag = rdr
                    .read_u16::<BigEndian>()
                    .map_err(|_e| DecodingError::Decoding { field: "tag" })?;
                let offset = if classify(dispatch) == Dispatch::FragN {
                    let offset = rdr
                        .read_u8()
                        .map_err(|_e| DecodingError::Decoding { field: "offset" })?;
                    if offset == 0 {
                        return Err(DecodingError::Decoding { field: "offset" });
                    }
                    offset
                } else {
                    0
                };
                FragmentDescriptor {
                    variant: FragVariant::Rfc4944,
                    size: (((dispatch & 0x07) as u16) << 8) | size_lo as u16,
                    tag,
                    offset,
                    seq: 0,
                    ack_request: false,
                }
            }
            Dispatch::RFrag => {
                let offset = rdr
                    .read_u8()
                    .map_err(|_e| DecodingError::Decoding { field: "offset" })?;
                let tag = rdr
                    .read_u16::<BigEndian>()
                    .map_err(|_e| DecodingError::Decoding { field: "tag" })?;
                let seq_size = rdr
                    .read_u8()
                    .map_err(|_e| DecodingError::Decoding { field: "seq" })?;
                let size_lo = rdr
                    .read_u8()
                    .map_err(|_e| DecodingError::Decoding { field: "size" })?;
                let seq = seq_size >> 3;
                if seq == 0 && offset != 0 {
                    return Err(DecodingError::Decoding { field: "offset" });
                }
                FragmentDescriptor {
                    variant: FragVariant::SelectiveAck,
                    size: (((seq_size & 0x07) as u16) << 8) | size_lo as u16,
                    tag,
                    offset,
                    seq,
                    ack_request: dispatch & RFRAG_ACK_REQUEST != 0,
                }
            }
            _ => return Err(DecodingError::Decoding { field: "dispatch" }),
        };
        this.check_rep();
        Ok(this)
    }

    #[must_use]
    #[inline]
    pub fn variant(&self) -> FragVariant {
        self.variant
    }

    #[must_use]
    #[inline]
    pub fn size(&self) -> u16 {
        self.size
    }

    #[must_use]
    #[inline]
    pub fn tag(&self) -> u16 {
        self.tag
    }

    #[must_use]
    #[inline]
    pub fn offset(&self) -> u8 {
        self.offset
    }

    #[must_use]
    #[inline]
    pub fn seq(&self) -> u8 {
        self.seq
    }

    #[must_use]
    #[inline]
    pub fn ack_request(&self) -> bool {
        self.ack_request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(variant: FragVariant, offset: u8, seq: u8, ack_request: bool) -> FragmentDescriptor {
        FragmentDescriptorBuilder {
            variant,
            size: 348,
            tag: 0xbeef,
            offset,
            seq,
            ack_request,
        }
        .build()
        .unwrap()
    }

    #[test]
    fn test_frag1() {
        let hdr = descriptor(FragVariant::Rfc4944, 0, 0, false);
        let bytes = hdr.to_bytes();
        assert_eq!(
            bytes,
            vec![
                0xc1, // dispatch, size high bits
                0x5c, // size
                0xbe, 0xef, // tag
            ]
        );
        assert_eq!(FragmentDescriptor::from_bytes(&bytes).unwrap(), hdr);
        assert!(hdr.is_first());
    }

    #[test]
    fn test_fragn() {
        let hdr = descriptor(FragVariant::Rfc4944, 9, 0, false);
        let bytes = hdr.to_bytes();
        assert_eq!(
            bytes,
            vec![
                0xe1, // dispatch, size high bits
                0x5c, // size
                0xbe, 0xef, // tag
                9,    // offset
            ]
        );
        assert_eq!(FragmentDescriptor::from_bytes(&bytes).unwrap(), hdr);
        assert!(!hdr.is_first());
    }

    #[test]
    fn test_rfrag() {
        let hdr = descriptor(FragVariant::SelectiveAck, 14, 3, true);
        let bytes = hdr.to_bytes();
        assert_eq!(
            bytes,
            vec![
                0xe9, // dispatch, ack request
                14,   // offset
                0xbe, 0xef, // tag
                0x19, // seq, size high bits
                0x5c, // size
            ]
        );
        assert_eq!(FragmentDescriptor::from_bytes(&bytes).unwrap(), hdr);
        assert_eq!(hdr.hdr_len(), RFRAG_HDR_LEN);
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(0x7e), Dispatch::Iphc);
        assert_eq!(classify(0x41), Dispatch::Ipv6);
        assert_eq!(classify(0xc7), Dispatch::Frag1);
        assert_eq!(classify(0xe7), Dispatch::FragN);
        assert_eq!(classify(0xe8), Dispatch::RFrag);
        assert_eq!(classify(0xe9), Dispatch::RFrag);
        assert_eq!(classify(0xea), Dispatch::RFragAck);
        assert_eq!(classify(0xeb), Dispatch::RFragAck);
        assert_eq!(classify(0x80), Dispatch::Unsupported);
        assert_eq!(classify(0x00), Dispatch::Unsupported);
    }

    #[test]
    fn test_invalid() {
        let result = FragmentDescriptorBuilder {
            variant: FragVariant::SelectiveAck,
            size: 100,
            tag: 0,
            offset: 0,
            seq: 32,
            ack_request: false,
        }
        .build();
        assert_eq!(result.unwrap_err(), Error::Seq);
        let result = FragmentDescriptorBuilder {
            variant: FragVariant::Rfc4944,
            size: 2048,
            tag: 0,
            offset: 0,
            seq: 0,
            ack_request: false,
        }
        .build();
        assert_eq!(result.unwrap_err(), Error::Size);
        assert_eq!(
            FragmentDescriptor::from_bytes(&[0xe0, 0x10, 0, 1]).unwrap_err(),
            DecodingError::Decoding { field: "offset" }
        );
        assert_eq!(
            FragmentDescriptor::from_bytes(&[0xe8, 0x01, 0, 1, 0x00, 0x10]).unwrap_err(),
            DecodingError::Decoding { field: "offset" }
        );
    }
}
