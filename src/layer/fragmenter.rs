use std::time::Instant;

use log::trace;

use crate::{
    protocol::{
        addr::LinkAddr,
        frag_hdr::{FragVariant, FragmentDescriptorBuilder},
    },
    utils::{AckBitmap, BufferArena, BufferHandle, FrameWtr, RttEstimator, MAX_SEQ},
};

use super::{
    retransmit::{AckOutcome, RetransmitState, TimeoutOutcome},
    ResponseCode,
};

/// Where each fragment of a datagram starts in its compressed stream.
///
/// The stream is the compressed header, then the inline headers, then the
/// payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    stream_len: usize,
    first_len: usize,
    block: usize,
    last_seq: u8,
    single: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    FrameTooSmall,
    TooManyFragments,
}

impl Layout {
    pub fn new(
        stream_len: usize,
        compressed_len: usize,
        variant: FragVariant,
        max_frame: usize,
    ) -> Result<Self, LayoutError> {
        if stream_len <= max_frame {
            return Ok(Layout {
                stream_len,
                first_len: stream_len,
                block: 0,
                last_seq: 0,
                single: true,
            });
        }
        let avail = max_frame
            .checked_sub(variant.first_hdr_len())
            .ok_or(LayoutError::FrameTooSmall)?;
        if avail < compressed_len {
            return Err(LayoutError::FrameTooSmall);
        }
        let first_len = compressed_len + ((avail - compressed_len) & !7);
        let block = max_frame.saturating_sub(variant.subsequent_hdr_len()) & !7;
        if block == 0 {
            return Err(LayoutError::FrameTooSmall);
        }
        let rest = stream_len - first_len;
        let count = 1 + (rest + block - 1) / block;
        if count > MAX_SEQ as usize + 1 {
            return Err(LayoutError::TooManyFragments);
        }
        Ok(Layout {
            stream_len,
            first_len,
            block,
            last_seq: (count - 1) as u8,
            single: false,
        })
    }

    /// Stream range of fragment `seq`.
    #[must_use]
    pub fn range(&self, seq: u8) -> (usize, usize) {
        assert!(seq <= self.last_seq);
        if seq == 0 {
            return (0, self.first_len);
        }
        let start = self.first_len + (seq as usize - 1) * self.block;
        let end = usize::min(start + self.block, self.stream_len);
        (start, end)
    }

    #[must_use]
    #[inline]
    pub fn last_seq(&self) -> u8 {
        self.last_seq
    }

    #[must_use]
    #[inline]
    pub fn is_single(&self) -> bool {
        self.single
    }

    #[must_use]
    #[inline]
    pub fn fragments(&self) -> usize {
        self.last_seq as usize + 1
    }
}

#[derive(Debug)]
pub enum FragmentError {
    FrameTooSmall,
    Arena,
}

/// One frame ready for the link.
#[derive(Debug)]
pub struct Fragment {
    pub seq: u8,
    pub bytes: Vec<u8>,
    /// Sent before in an earlier round.
    pub retransmission: bool,
    /// This frame ends a round and carries the ack request.
    pub round_complete: bool,
}

/// Send-side state of one datagram.
#[derive(Debug)]
pub struct OutboundDatagram {
    id: u64,
    tag: u16,
    variant: FragVariant,
    dst_link: LinkAddr,
    size: u16,
    head: Vec<u8>,
    savings: usize,
    payload: BufferHandle,
    payload_dropped: usize,
    layout: Layout,
    pending: AckBitmap,
    sent: AckBitmap,
    retransmit: Option<RetransmitState>,
}

pub struct OutboundDatagramBuilder {
    pub id: u64,
    pub tag: u16,
    pub variant: FragVariant,
    pub dst_link: LinkAddr,
    /// Uncompressed datagram size
    pub size: u16,
    /// Compressed header followed by the inline headers
    pub head: Vec<u8>,
    pub savings: usize,
    pub payload: BufferHandle,
    pub layout: Layout,
    pub max_rounds: u32,
    pub estimator: RttEstimator,
}

impl OutboundDatagramBuilder {
    #[must_use]
    pub fn build(self) -> OutboundDatagram {
        let tracked = self.variant == FragVariant::SelectiveAck && !self.layout.is_single();
        let retransmit = if tracked {
            Some(RetransmitState::new(
                self.layout.last_seq(),
                self.max_rounds,
                self.estimator,
            ))
        } else {
            None
        };
        let this = OutboundDatagram {
            id: self.id,
            tag: self.tag,
            variant: self.variant,
            dst_link: self.dst_link,
            size: self.size,
            head: self.head,
            savings: self.savings,
            payload: self.payload,
            payload_dropped: 0,
            pending: AckBitmap::through(self.layout.last_seq()),
            sent: AckBitmap::new(),
            layout: self.layout,
            retransmit,
        };
        this.check_rep();
        this
    }
}

impl OutboundDatagram {
    #[inline]
    fn check_rep(&self) {
        assert!(self.head.len() <= self.layout.stream_len);
        assert!(self.pending.bits() & !AckBitmap::through(self.layout.last_seq()).bits() == 0);
    }

    /// Builds the frame for the lowest fragment still to be sent.
    pub fn next_fragment(
        &mut self,
        arena: &mut BufferArena,
        max_frame: usize,
    ) -> Result<Option<Fragment>, FragmentError> {
        let seq = match self.pending.lowest() {
            Some(x) => x,
            None => return Ok(None),
        };
        let (start, end) = self.layout.range(seq);
        self.pending.clear(seq);
        let round_complete = self.pending.is_empty();

        let hdr_bytes = if self.layout.is_single() {
            Vec::new()
        } else {
            let offset = if seq == 0 {
                0
            } else {
                ((start + self.savings) / 8) as u8
            };
            let hdr = FragmentDescriptorBuilder {
                variant: self.variant,
                size: self.size,
                tag: self.tag,
                offset,
                seq: match self.variant {
                    FragVariant::Rfc4944 => 0,
                    FragVariant::SelectiveAck => seq,
                },
                ack_request: self.variant == FragVariant::SelectiveAck && round_complete,
            }
            .build()
            .map_err(|_e| FragmentError::FrameTooSmall)?;
            hdr.to_bytes()
        };

        let mut wtr = FrameWtr::new(max_frame, hdr_bytes.len());
        let head_len = self.head.len();
        if start < head_len {
            wtr.append(&self.head[start..usize::min(end, head_len)])
                .map_err(|_e| FragmentError::FrameTooSmall)?;
        }
        let payload_start = start.max(head_len) - head_len;
        let payload_end = end.max(head_len) - head_len;
        if payload_start < payload_end {
            let data = arena.data(&self.payload);
            let from = payload_start
                .checked_sub(self.payload_dropped)
                .ok_or(FragmentError::Arena)?;
            let to = payload_end - self.payload_dropped;
            let body = data.get(from..to).ok_or(FragmentError::Arena)?;
            wtr.append(body).map_err(|_e| FragmentError::FrameTooSmall)?;
        }
        wtr.prepend(&hdr_bytes)
            .map_err(|_e| FragmentError::FrameTooSmall)?;

        if self.variant == FragVariant::Rfc4944 && payload_start < payload_end {
            // fragments go out in order and are never sent again
            let n = payload_end - self.payload_dropped;
            arena
                .shrink_front(&self.payload, n)
                .map_err(|_e| FragmentError::Arena)?;
            self.payload_dropped += n;
        }

        let retransmission = self.sent.is_set(seq);
        self.sent.set(seq);
        trace!(
            "fragment; tag: {}, seq: {}, stream: {}..{}, len: {}",
            self.tag,
            seq,
            start,
            end,
            wtr.data_len()
        );
        self.check_rep();
        Ok(Some(Fragment {
            seq,
            bytes: wtr.into_vec(),
            retransmission,
            round_complete,
        }))
    }

    /// Link-layer outcome for fragment `seq`.
    ///
    /// Returns the final outcome once the datagram is decided.
    pub fn response(&mut self, seq: u8, success: bool) -> Option<ResponseCode> {
        if self.layout.is_single() {
            return Some(if success {
                ResponseCode::Success
            } else {
                ResponseCode::LinkFailure
            });
        }
        if !success {
            // the fragment carrying the header is never retried on its own
            if seq == 0 {
                return Some(ResponseCode::LinkFailure);
            }
            return match self.variant {
                FragVariant::Rfc4944 => Some(ResponseCode::LinkFailure),
                FragVariant::SelectiveAck => {
                    let acked = self
                        .retransmit
                        .as_ref()
                        .map(|rt| rt.acked().is_set(seq))
                        .unwrap_or(false);
                    if !acked {
                        self.pending.set(seq);
                    }
                    self.check_rep();
                    None
                }
            };
        }
        match self.variant {
            FragVariant::Rfc4944 if seq == self.layout.last_seq() => Some(ResponseCode::Success),
            _ => None,
        }
    }

    /// Returns the deadline of the retransmission timer, if tracked.
    pub fn start_round(&mut self, now: Instant) -> Option<Instant> {
        self.retransmit.as_mut().map(|rt| rt.start_round(now))
    }

    pub fn on_ack(&mut self, bitmap: AckBitmap, now: Instant) -> Option<ResponseCode> {
        let rt = self.retransmit.as_mut()?;
        let code = match rt.on_ack(bitmap, now) {
            AckOutcome::Complete => Some(ResponseCode::Success),
            AckOutcome::Aborted => Some(ResponseCode::Aborted),
            AckOutcome::RetriesExhausted => Some(ResponseCode::RetriesExhausted),
            AckOutcome::Resend(missing) => {
                self.pending = missing;
                None
            }
            AckOutcome::Progress => {
                self.pending.remove(bitmap);
                if self.pending.is_empty() {
                    // the ack request must still go out
                    self.pending = rt.acked().missing_through(self.layout.last_seq());
                }
                None
            }
        };
        self.check_rep();
        code
    }

    pub fn on_timeout(&mut self) -> Option<ResponseCode> {
        let rt = self.retransmit.as_mut()?;
        let code = match rt.on_timeout() {
            TimeoutOutcome::RetriesExhausted => Some(ResponseCode::RetriesExhausted),
            TimeoutOutcome::Resend(bits) => {
                self.pending.merge(bits);
                None
            }
        };
        self.check_rep();
        code
    }

    /// Gives the payload range back.
    #[must_use]
    pub fn into_payload(self) -> BufferHandle {
        self.payload
    }

    #[must_use]
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    #[inline]
    pub fn tag(&self) -> u16 {
        self.tag
    }

    #[must_use]
    #[inline]
    pub fn dst_link(&self) -> LinkAddr {
        self.dst_link
    }

    #[must_use]
    #[inline]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    #[must_use]
    #[inline]
    pub fn pending(&self) -> AckBitmap {
        self.pending
    }

    #[must_use]
    #[inline]
    pub fn is_tracked(&self) -> bool {
        self.retransmit.is_some()
    }

    #[must_use]
    #[inline]
    pub fn retransmit(&self) -> Option<&RetransmitState> {
        self.retransmit.as_ref()
    }
}
