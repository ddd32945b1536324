use std::io::Cursor;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};

use super::{
    frag_hdr::{classify, Dispatch, RFRAG_ACK_DISPATCH},
    DecodingError,
};
use crate::utils::AckBitmap;

pub const RFRAG_ACK_LEN: usize = 7;
const RFRAG_ACK_ECN: u8 = 0x01;

/// Selective acknowledgment for one fragmented datagram.
///
/// An empty bitmap tells the sender to abort the datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckHeader {
    tag: u16,
    bitmap: AckBitmap,
    ecn: bool,
}

pub struct AckHeaderBuilder {
    pub tag: u16,
    pub bitmap: AckBitmap,
    pub ecn: bool,
}

impl AckHeaderBuilder {
    #[must_use]
    pub fn build(self) -> AckHeader {
        AckHeader {
            tag: self.tag,
            bitmap: self.bitmap,
            ecn: self.ecn,
        }
    }
}

impl AckHeader {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; RFRAG_ACK_LEN] {
        let mut hdr = [0; RFRAG_ACK_LEN];
        hdr[0] = RFRAG_ACK_DISPATCH;
        if self.ecn {
            hdr[0] |= RFRAG_ACK_ECN;
        }
        BigEndian::write_u16(&mut hdr[1..3], self.tag);
        BigEndian::write_u32(&mut hdr[3..7], self.bitmap.to_wire());
        hdr
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodingError> {
        let mut rdr = Cursor::new(bytes);
        let dispatch = rdr
            .read_u8()
            .map_err(|_e| DecodingError::Decoding { field: "dispatch" })?;
        if classify(dispatch) != Dispatch::RFragAck {
            return Err(DecodingError::Decoding { field: "dispatch" });
        }
        let tag = rdr
            .read_u16::<BigEndian>()
            .map_err(|_e| DecodingError::Decoding { field: "tag" })?;
        let bitmap = rdr
            .read_u32::<BigEndian>()
            .map_err(|_e| DecodingError::Decoding { field: "bitmap" })?;
        Ok(AckHeader {
            tag,
            bitmap: AckBitmap::from_wire(bitmap),
            ecn: dispatch & RFRAG_ACK_ECN != 0,
        })
    }

    #[must_use]
    #[inline]
    pub fn tag(&self) -> u16 {
        self.tag
    }

    #[must_use]
    #[inline]
    pub fn bitmap(&self) -> AckBitmap {
        self.bitmap
    }

    #[must_use]
    #[inline]
    pub fn ecn(&self) -> bool {
        self.ecn
    }

    #[must_use]
    #[inline]
    pub fn is_abort(&self) -> bool {
        self.bitmap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_bytes() {
        let mut bitmap = AckBitmap::new();
        bitmap.set(0);
        bitmap.set(1);
        bitmap.set(4);
        let hdr = AckHeaderBuilder {
            tag: 0x0102,
            bitmap,
            ecn: false,
        }
        .build();
        let bytes = hdr.to_bytes();
        assert_eq!(
            bytes.to_vec(),
            vec![
                0xea, // dispatch
                0x01, 0x02, // tag
                0xc8, 0x00, 0x00, 0x00, // bitmap
            ]
        );
        let hdr2 = AckHeader::from_bytes(&bytes).unwrap();
        assert_eq!(hdr, hdr2);
        assert!(!hdr2.is_abort());
    }

    #[test]
    fn test_abort_with_ecn() {
        let bytes = [0xeb, 0, 7, 0, 0, 0, 0];
        let hdr = AckHeader::from_bytes(&bytes).unwrap();
        assert!(hdr.ecn());
        assert!(hdr.is_abort());
        assert_eq!(hdr.tag(), 7);
    }

    #[test]
    fn test_truncated() {
        let err = AckHeader::from_bytes(&[0xea, 0, 7, 0, 0]).unwrap_err();
        assert_eq!(err, DecodingError::Decoding { field: "bitmap" });
        let err = AckHeader::from_bytes(&[0xe8, 0, 7, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err, DecodingError::Decoding { field: "dispatch" });
    }
}
