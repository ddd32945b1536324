use crate::protocol::EncodingError;

/// Writer for one outgoing link frame.
///
/// The body is appended first; headers are prepended into the room reserved
/// in front, so the frame never grows beyond `max_len`.
#[derive(Debug)]
pub struct FrameWtr {
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl FrameWtr {
    #[inline]
    fn check_rep(&self) {
        assert!(self.start <= self.end);
        assert!(self.end <= self.buf.len());
    }

    pub fn new(max_len: usize, header_room: usize) -> Self {
        let header_room = std::cmp::min(header_room, max_len);
        let this = Self {
            buf: vec![0; max_len],
            start: header_room,
            end: header_room,
        };
        this.check_rep();
        this
    }

    #[must_use]
    #[inline]
    pub fn data_len(&self) -> usize {
        self.end - self.start
    }

    #[must_use]
    #[inline]
    pub fn front_len(&self) -> usize {
        self.start
    }

    #[must_use]
    #[inline]
    pub fn back_len(&self) -> usize {
        self.buf.len() - self.end
    }

    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data_len() == 0
    }

    #[must_use]
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    pub fn append(&mut self, n: &[u8]) -> Result<(), EncodingError> {
        if self.back_len() < n.len() {
            return Err(EncodingError::NotEnoughSpace);
        }
        self.buf[self.end..self.end + n.len()].copy_from_slice(n);
        self.end += n.len();
        self.check_rep();
        Ok(())
    }

    pub fn prepend(&mut self, n: &[u8]) -> Result<(), EncodingError> {
        if self.front_len() < n.len() {
            return Err(EncodingError::NotEnoughSpace);
        }
        self.start -= n.len();
        self.buf[self.start..self.start + n.len()].copy_from_slice(n);
        self.check_rep();
        Ok(())
    }

    #[must_use]
    pub fn into_vec(mut self) -> Vec<u8> {
        self.buf.truncate(self.end);
        self.buf.drain(..self.start);
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepend_after_append() {
        let mut wtr = FrameWtr::new(8, 3);
        wtr.append(&[1, 2, 3]).unwrap();
        wtr.prepend(&[4, 5, 6]).unwrap();
        assert_eq!(wtr.data(), vec![4, 5, 6, 1, 2, 3]);
        assert_eq!(wtr.into_vec(), vec![4, 5, 6, 1, 2, 3]);
    }

    #[test]
    fn test_bounds() {
        let mut wtr = FrameWtr::new(4, 1);
        assert_eq!(wtr.append(&[0; 4]).unwrap_err(), EncodingError::NotEnoughSpace);
        wtr.append(&[0; 3]).unwrap();
        assert_eq!(wtr.prepend(&[0; 2]).unwrap_err(), EncodingError::NotEnoughSpace);
        wtr.prepend(&[9]).unwrap();
        assert_eq!(wtr.data_len(), 4);
    }
}
