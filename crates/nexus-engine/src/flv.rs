//! FLV tag framing for the producer-to-distributor pipe.
//!
//! Producers write an FLV stream to stdout. Splicing two of them into one
//! distributor, or starting a new distributor mid-stream, is only valid at
//! tag boundaries and only after the decoder has seen the stream header,
//! metadata and codec sequence headers. This module splits the byte stream
//! into [`FlvUnit`]s and keeps the init units a late joiner needs.
//!
//! ```text
//! | Header(9) | PrevTagSize0(4) | Tag | PrevTagSize(4) | Tag | ...
//!
//! Tag: | Type(1) | DataSize(3) | Timestamp(3) | TimestampExt(1) | StreamId(3) | Data |
//! ```

use bytes::{Bytes, BytesMut};

use crate::error::FlvError;

const SIGNATURE: &[u8; 3] = b"FLV";
const MIN_HEADER_LEN: usize = 9;
const TAG_HEADER_LEN: usize = 11;
const PREV_TAG_SIZE_LEN: usize = 4;

const TAG_AUDIO: u8 = 8;
const TAG_VIDEO: u8 = 9;
const TAG_SCRIPT: u8 = 18;

const FRAME_TYPE_KEY: u8 = 1;
const CODEC_AVC: u8 = 7;
const CODEC_HEVC: u8 = 12;
const SOUND_FORMAT_AAC: u8 = 10;
const PACKET_SEQUENCE_HEADER: u8 = 0;

/// AMF0 string "onMetaData" as it opens a metadata script tag.
const ON_METADATA: &[u8] = b"\x02\x00\x0aonMetaData";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Audio,
    Video,
    Script,
    Other(u8),
}

impl From<u8> for TagKind {
    fn from(raw: u8) -> Self {
        // The upper bits carry the filter flag and reserved bits.
        match raw & 0x1f {
            TAG_AUDIO => Self::Audio,
            TAG_VIDEO => Self::Video,
            TAG_SCRIPT => Self::Script,
            other => Self::Other(other),
        }
    }
}

/// One complete tag including its trailing previous-tag-size field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    bytes: Bytes,
}

impl Tag {
    pub fn kind(&self) -> TagKind {
        TagKind::from(self.bytes[0])
    }

    /// Decode timestamp in milliseconds.
    pub fn timestamp(&self) -> u32 {
        let b = &self.bytes;
        u32::from_be_bytes([b[7], b[4], b[5], b[6]])
    }

    /// Copy of this tag stamped with `timestamp`.
    pub fn with_timestamp(&self, timestamp: u32) -> Tag {
        let [ext, hi, mid, lo] = timestamp.to_be_bytes();
        let mut bytes = BytesMut::from(&self.bytes[..]);
        bytes[4] = hi;
        bytes[5] = mid;
        bytes[6] = lo;
        bytes[7] = ext;
        Tag {
            bytes: bytes.freeze(),
        }
    }

    fn data(&self) -> &[u8] {
        &self.bytes[TAG_HEADER_LEN..self.bytes.len() - PREV_TAG_SIZE_LEN]
    }

    /// A video frame a decoder can start from.
    pub fn is_keyframe(&self) -> bool {
        self.kind() == TagKind::Video
            && !self.is_sequence_header()
            && self.data().first().is_some_and(|b| b >> 4 == FRAME_TYPE_KEY)
    }

    /// AVC/HEVC decoder configuration or AAC audio specific config.
    pub fn is_sequence_header(&self) -> bool {
        let data = self.data();
        let (Some(&flags), Some(&packet_type)) = (data.first(), data.get(1)) else {
            return false;
        };
        match self.kind() {
            TagKind::Video => {
                matches!(flags & 0x0f, CODEC_AVC | CODEC_HEVC)
                    && packet_type == PACKET_SEQUENCE_HEADER
            }
            TagKind::Audio => {
                flags >> 4 == SOUND_FORMAT_AAC && packet_type == PACKET_SEQUENCE_HEADER
            }
            _ => false,
        }
    }

    pub fn is_metadata(&self) -> bool {
        self.kind() == TagKind::Script && self.data().starts_with(ON_METADATA)
    }

    /// Audio or video payload, as opposed to init.
    pub fn is_media(&self) -> bool {
        matches!(self.kind(), TagKind::Audio | TagKind::Video) && !self.is_sequence_header()
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }
}

/// A unit that can be written to a distributor without splitting a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlvUnit {
    /// File header plus `PreviousTagSize0`.
    Header(Bytes),
    Tag(Tag),
}

impl FlvUnit {
    pub fn as_bytes(&self) -> &Bytes {
        match self {
            Self::Header(bytes) => bytes,
            Self::Tag(tag) => tag.as_bytes(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    pub fn tag(&self) -> Option<&Tag> {
        match self {
            Self::Header(_) => None,
            Self::Tag(tag) => Some(tag),
        }
    }
}

/// Incremental splitter for one producer's stdout.
#[derive(Debug, Default)]
pub struct FlvDemuxer {
    buf: BytesMut,
    header_done: bool,
}

impl FlvDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete unit, or `None` until more bytes arrive.
    pub fn next_unit(&mut self) -> Result<Option<FlvUnit>, FlvError> {
        if !self.header_done {
            return self.next_header();
        }
        if self.buf.len() < TAG_HEADER_LEN {
            return Ok(None);
        }
        let data_len = u32::from_be_bytes([0, self.buf[1], self.buf[2], self.buf[3]]) as usize;
        let total = TAG_HEADER_LEN + data_len + PREV_TAG_SIZE_LEN;
        if self.buf.len() < total {
            return Ok(None);
        }
        let bytes = self.buf.split_to(total).freeze();
        Ok(Some(FlvUnit::Tag(Tag { bytes })))
    }

    fn next_header(&mut self) -> Result<Option<FlvUnit>, FlvError> {
        let checked = self.buf.len().min(SIGNATURE.len());
        if self.buf[..checked] != SIGNATURE[..checked] {
            return Err(FlvError::BadSignature);
        }
        if self.buf.len() < MIN_HEADER_LEN {
            return Ok(None);
        }
        let b = &self.buf;
        let offset = u32::from_be_bytes([b[5], b[6], b[7], b[8]]) as usize;
        if offset < MIN_HEADER_LEN {
            return Err(FlvError::BadHeaderLength(offset));
        }
        let total = offset + PREV_TAG_SIZE_LEN;
        if self.buf.len() < total {
            return Ok(None);
        }
        self.header_done = true;
        Ok(Some(FlvUnit::Header(self.buf.split_to(total).freeze())))
    }
}

/// The newest header, metadata and sequence headers seen on a stream.
#[derive(Debug, Default, Clone)]
pub struct InitCache {
    header: Option<Bytes>,
    metadata: Option<Tag>,
    video: Option<Tag>,
    audio: Option<Tag>,
}

impl InitCache {
    /// Remember `unit` if it belongs to the stream init.
    pub fn observe(&mut self, unit: &FlvUnit) {
        match unit {
            FlvUnit::Header(bytes) => self.header = Some(bytes.clone()),
            FlvUnit::Tag(tag) if tag.is_metadata() => self.metadata = Some(tag.clone()),
            FlvUnit::Tag(tag) if tag.is_sequence_header() => match tag.kind() {
                TagKind::Video => self.video = Some(tag.clone()),
                _ => self.audio = Some(tag.clone()),
            },
            FlvUnit::Tag(_) => {}
        }
    }

    pub fn header(&self) -> Option<&Bytes> {
        self.header.as_ref()
    }

    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    /// Metadata then sequence headers, in the order a decoder wants them.
    pub fn tags(&self) -> impl Iterator<Item = &Tag> {
        [&self.metadata, &self.video, &self.audio]
            .into_iter()
            .flatten()
    }

    /// Whether a joiner can start at `tag`: the first keyframe, or the first
    /// media tag of a stream without video.
    pub fn is_join_point(&self, tag: &Tag) -> bool {
        if self.has_video() {
            tag.is_keyframe()
        } else {
            tag.is_media()
        }
    }
}
