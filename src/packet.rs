//! Heartbeat and ACK wire format.
//!
//! Every probe datagram starts with a fixed 56-byte heartbeat header followed by
//! opaque padding up to the configured message size. All multi-byte integers are
//! big-endian and fields are packed with no alignment padding.
//!
//! # Heartbeat Layout
//!
//! ```text
//! offset  size  field
//!      0     1  msg_type        always 3 for heartbeats
//!      1     1  code            0 = echo, 1 = ack, 2 = record only
//!      2     2  header_size     56
//!      4     2  data_size       total datagram length
//!      6     4  node_id
//!     10     4  sequence        starts at 1
//!     14     4  ts_sec          sender wall clock
//!     18     4  ts_nsec
//!     22     2  time_source
//!     24     4  latitude        i32
//!     28     4  longitude       i32
//!     32     4  elevation       i32
//!     36     4  velocity        i32
//!     40     4  lat_error       i32
//!     44     4  lon_error       i32
//!     48     4  signal_quality  i32
//!     52     4  rssi            i32
//! ```
//!
//! # ACK Layout
//!
//! ```text
//! | sequence (4) | ts_sec (4) | ts_nsec (4) |
//! ```
//!
//! # Examples
//!
//! ```
//! use rudpping::clock::Timestamp;
//! use rudpping::packet::{decode, encode, Heartbeat, HEADER_SIZE};
//!
//! let header = Heartbeat::probe(42, 0, 100, Timestamp::new(1_700_000_000, 5));
//! let bytes = encode(&header, &[0u8; 100 - HEADER_SIZE]).unwrap();
//! assert_eq!(bytes.len(), 100);
//!
//! let message = decode(&bytes).unwrap();
//! assert_eq!(message.header.sequence, 42);
//! assert_eq!(message.payload.len(), 100 - HEADER_SIZE);
//! ```

use crate::clock::Timestamp;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `msg_type` carried by every heartbeat.
pub const HEARTBEAT_MSG_TYPE: u8 = 3;

/// Packed heartbeat header size in bytes.
pub const HEADER_SIZE: usize = 56;

/// Packed ACK size in bytes.
pub const ACK_SIZE: usize = 12;

/// Largest payload a single IPv4 UDP datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Reasons a datagram is rejected by the decoder.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram too short: {len} bytes, need at least {needed}")]
    TooShort { len: usize, needed: usize },

    #[error("unexpected header size {0}")]
    BadHeaderSize(u16),

    #[error("data size {data_size} smaller than header size {header_size}")]
    DataSizeTooSmall { data_size: u16, header_size: u16 },

    #[error("truncated datagram: header claims {data_size} bytes, received {received}")]
    Truncated { data_size: u16, received: usize },
}

/// Optional metadata a client may attach to its heartbeats.
///
/// Values are carried verbatim; the probe never interprets them beyond
/// averaging `signal_quality` and `rssi` on the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeExtras {
    pub node_id: u32,
    pub time_source: u16,
    pub latitude: i32,
    pub longitude: i32,
    pub elevation: i32,
    pub velocity: i32,
    pub lat_error: i32,
    pub lon_error: i32,
    pub signal_quality: i32,
    pub rssi: i32,
}

/// Fixed heartbeat header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Heartbeat {
    pub msg_type: u8,
    pub code: u8,
    pub header_size: u16,
    pub data_size: u16,
    pub node_id: u32,
    pub sequence: u32,
    pub ts_sec: u32,
    pub ts_nsec: u32,
    pub time_source: u16,
    pub latitude: i32,
    pub longitude: i32,
    pub elevation: i32,
    pub velocity: i32,
    pub lat_error: i32,
    pub lon_error: i32,
    pub signal_quality: i32,
    pub rssi: i32,
}

impl Heartbeat {
    pub const SIZE: usize = HEADER_SIZE;

    /// Builds a probe header for a datagram of `datagram_len` total bytes.
    ///
    /// # Arguments
    ///
    /// * `sequence` - Probe sequence number, starting at 1
    /// * `code` - Reply mode requested from the server
    /// * `datagram_len` - Total datagram size; clamped to at least the header size
    /// * `sent_at` - Sender wall-clock time
    pub fn probe(sequence: u32, code: u8, datagram_len: usize, sent_at: Timestamp) -> Self {
        let (ts_sec, ts_nsec) = sent_at.to_wire();
        let data_size = datagram_len.clamp(HEADER_SIZE, usize::from(u16::MAX)) as u16;
        Self {
            msg_type: HEARTBEAT_MSG_TYPE,
            code,
            header_size: HEADER_SIZE as u16,
            data_size,
            sequence,
            ts_sec,
            ts_nsec,
            ..Default::default()
        }
    }

    /// Copies the optional metadata fields into this header.
    pub fn with_extras(mut self, extras: &ProbeExtras) -> Self {
        self.node_id = extras.node_id;
        self.time_source = extras.time_source;
        self.latitude = extras.latitude;
        self.longitude = extras.longitude;
        self.elevation = extras.elevation;
        self.velocity = extras.velocity;
        self.lat_error = extras.lat_error;
        self.lon_error = extras.lon_error;
        self.signal_quality = extras.signal_quality;
        self.rssi = extras.rssi;
        self
    }

    pub fn timestamp(&self) -> Timestamp {
        Timestamp::from_wire(self.ts_sec, self.ts_nsec)
    }

    pub fn set_timestamp(&mut self, ts: Timestamp) {
        let (sec, nsec) = ts.to_wire();
        self.ts_sec = sec;
        self.ts_nsec = nsec;
    }

    /// Serializes the header to bytes (big-endian).
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = self.msg_type;
        bytes[1] = self.code;
        bytes[2..4].copy_from_slice(&self.header_size.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.data_size.to_be_bytes());
        bytes[6..10].copy_from_slice(&self.node_id.to_be_bytes());
        bytes[10..14].copy_from_slice(&self.sequence.to_be_bytes());
        bytes[14..18].copy_from_slice(&self.ts_sec.to_be_bytes());
        bytes[18..22].copy_from_slice(&self.ts_nsec.to_be_bytes());
        bytes[22..24].copy_from_slice(&self.time_source.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.latitude.to_be_bytes());
        bytes[28..32].copy_from_slice(&self.longitude.to_be_bytes());
        bytes[32..36].copy_from_slice(&self.elevation.to_be_bytes());
        bytes[36..40].copy_from_slice(&self.velocity.to_be_bytes());
        bytes[40..44].copy_from_slice(&self.lat_error.to_be_bytes());
        bytes[44..48].copy_from_slice(&self.lon_error.to_be_bytes());
        bytes[48..52].copy_from_slice(&self.signal_quality.to_be_bytes());
        bytes[52..56].copy_from_slice(&self.rssi.to_be_bytes());
        bytes
    }

    /// Parses and validates a header, returning it with the payload slice.
    ///
    /// Bytes beyond `data_size` are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        if bytes.len() < Self::SIZE {
            return Err(DecodeError::TooShort {
                len: bytes.len(),
                needed: Self::SIZE,
            });
        }

        let header = Self {
            msg_type: bytes[0],
            code: bytes[1],
            header_size: be_u16(bytes, 2),
            data_size: be_u16(bytes, 4),
            node_id: be_u32(bytes, 6),
            sequence: be_u32(bytes, 10),
            ts_sec: be_u32(bytes, 14),
            ts_nsec: be_u32(bytes, 18),
            time_source: be_u16(bytes, 22),
            latitude: be_i32(bytes, 24),
            longitude: be_i32(bytes, 28),
            elevation: be_i32(bytes, 32),
            velocity: be_i32(bytes, 36),
            lat_error: be_i32(bytes, 40),
            lon_error: be_i32(bytes, 44),
            signal_quality: be_i32(bytes, 48),
            rssi: be_i32(bytes, 52),
        };

        if usize::from(header.header_size) != Self::SIZE {
            return Err(DecodeError::BadHeaderSize(header.header_size));
        }
        if header.data_size < header.header_size {
            return Err(DecodeError::DataSizeTooSmall {
                data_size: header.data_size,
                header_size: header.header_size,
            });
        }
        let data_size = usize::from(header.data_size);
        if bytes.len() < data_size {
            return Err(DecodeError::Truncated {
                data_size: header.data_size,
                received: bytes.len(),
            });
        }

        Ok((header, &bytes[Self::SIZE..data_size]))
    }

    /// Overwrites the first [`HEADER_SIZE`] bytes of `buf`, leaving the payload untouched.
    pub fn write_into(&self, buf: &mut [u8]) -> Result<(), DecodeError> {
        if buf.len() < Self::SIZE {
            return Err(DecodeError::TooShort {
                len: buf.len(),
                needed: Self::SIZE,
            });
        }
        buf[..Self::SIZE].copy_from_slice(&self.to_bytes());
        Ok(())
    }
}

/// A decoded heartbeat with an owned copy of its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeMessage {
    pub header: Heartbeat,
    pub payload: Vec<u8>,
}

/// Server acknowledgement sent in ack mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ack {
    pub sequence: u32,
    pub ts_sec: u32,
    pub ts_nsec: u32,
}

impl Ack {
    pub const SIZE: usize = ACK_SIZE;

    pub fn new(sequence: u32, ts: Timestamp) -> Self {
        let (ts_sec, ts_nsec) = ts.to_wire();
        Self {
            sequence,
            ts_sec,
            ts_nsec,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        Timestamp::from_wire(self.ts_sec, self.ts_nsec)
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.sequence.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.ts_sec.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.ts_nsec.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < Self::SIZE {
            return Err(DecodeError::TooShort {
                len: bytes.len(),
                needed: Self::SIZE,
            });
        }
        Ok(Self {
            sequence: be_u32(bytes, 0),
            ts_sec: be_u32(bytes, 4),
            ts_nsec: be_u32(bytes, 8),
        })
    }
}

/// Encodes a full heartbeat datagram: header then payload.
///
/// `header.data_size` must equal `HEADER_SIZE + payload.len()`.
pub fn encode(header: &Heartbeat, payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let total = Heartbeat::SIZE + payload.len();
    if usize::from(header.data_size) != total {
        return Err(DecodeError::Truncated {
            data_size: header.data_size,
            received: total,
        });
    }
    let mut datagram = Vec::with_capacity(total);
    datagram.extend_from_slice(&header.to_bytes());
    datagram.extend_from_slice(payload);
    Ok(datagram)
}

/// Decodes a heartbeat datagram, copying at most `data_size - HEADER_SIZE` payload bytes.
pub fn decode(bytes: &[u8]) -> Result<ProbeMessage, DecodeError> {
    let (header, payload) = Heartbeat::from_bytes(bytes)?;
    Ok(ProbeMessage {
        header,
        payload: payload.to_vec(),
    })
}

/// Rewrites only the header of a received datagram in place, e.g. to refresh
/// the timestamp before echoing it back.
pub fn encode_header_into(header: &Heartbeat, datagram: &mut [u8]) -> Result<(), DecodeError> {
    header.write_into(datagram)
}

fn be_u16(b: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([b[at], b[at + 1]])
}

fn be_u32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn be_i32(b: &[u8], at: usize) -> i32 {
    i32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header(len: usize) -> Heartbeat {
        Heartbeat::probe(7, 1, len, Timestamp::new(1_700_000_000, 999_999_999)).with_extras(
            &ProbeExtras {
                node_id: 0xdead_beef,
                time_source: 2,
                latitude: -33_000_000,
                longitude: 151_000_000,
                elevation: -12,
                velocity: 30,
                lat_error: 5,
                lon_error: 6,
                signal_quality: 42,
                rssi: -71,
            },
        )
    }

    #[test]
    fn test_header_serialization() {
        let header = sample_header(HEADER_SIZE);
        let bytes = header.to_bytes();
        let (parsed, payload) = Heartbeat::from_bytes(&bytes).expect("Failed to parse header");
        assert_eq!(parsed, header);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_wire_layout_is_big_endian() {
        let header = sample_header(100);
        let bytes = header.to_bytes();
        assert_eq!(bytes[0], HEARTBEAT_MSG_TYPE);
        assert_eq!(bytes[1], 1);
        assert_eq!(&bytes[2..4], &[0, 56]);
        assert_eq!(&bytes[4..6], &[0, 100]);
        assert_eq!(&bytes[6..10], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&bytes[10..14], &[0, 0, 0, 7]);
        assert_eq!(&bytes[52..56], &(-71i32).to_be_bytes());
    }

    #[test]
    fn test_full_datagram_roundtrip() {
        let header = sample_header(200);
        let payload: Vec<u8> = (0..(200 - HEADER_SIZE) as u8).collect();
        let bytes = encode(&header, &payload).unwrap();
        assert_eq!(bytes.len(), 200);

        let message = decode(&bytes).unwrap();
        assert_eq!(message.header, header);
        assert_eq!(message.payload, payload);
    }

    #[test]
    fn test_short_packet() {
        let short = vec![0u8; 10];
        assert_eq!(
            decode(&short),
            Err(DecodeError::TooShort {
                len: 10,
                needed: HEADER_SIZE
            })
        );
    }

    #[test]
    fn test_bad_header_size() {
        let mut bytes = sample_header(HEADER_SIZE).to_bytes();
        bytes[2..4].copy_from_slice(&44u16.to_be_bytes());
        assert_eq!(decode(&bytes), Err(DecodeError::BadHeaderSize(44)));
    }

    #[test]
    fn test_data_size_smaller_than_header() {
        let mut bytes = sample_header(HEADER_SIZE).to_bytes();
        bytes[4..6].copy_from_slice(&20u16.to_be_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::DataSizeTooSmall { data_size: 20, .. })
        ));
    }

    #[test]
    fn test_truncated_datagram() {
        let header = sample_header(1000);
        let bytes = header.to_bytes();
        assert_eq!(
            decode(&bytes),
            Err(DecodeError::Truncated {
                data_size: 1000,
                received: HEADER_SIZE
            })
        );
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let header = sample_header(60);
        let mut bytes = encode(&header, &[1, 2, 3, 4]).unwrap();
        bytes.extend_from_slice(&[9, 9, 9]);
        let message = decode(&bytes).unwrap();
        assert_eq!(message.payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_encode_rejects_mismatched_length() {
        let header = sample_header(100);
        assert!(encode(&header, &[0u8; 3]).is_err());
    }

    #[test]
    fn test_encode_header_into_preserves_payload() {
        let header = sample_header(64);
        let mut datagram = encode(&header, &[0xab; 8]).unwrap();

        let mut refreshed = header;
        refreshed.set_timestamp(Timestamp::new(5, 6));
        encode_header_into(&refreshed, &mut datagram).unwrap();

        let message = decode(&datagram).unwrap();
        assert_eq!(message.header.timestamp(), Timestamp::new(5, 6));
        assert_eq!(message.payload, vec![0xab; 8]);
    }

    #[test]
    fn test_probe_clamps_small_sizes() {
        let header = Heartbeat::probe(1, 0, 10, Timestamp::ZERO);
        assert_eq!(usize::from(header.data_size), HEADER_SIZE);
    }

    #[test]
    fn test_ack_roundtrip() {
        let ack = Ack::new(99, Timestamp::new(1_700_000_001, 42));
        let bytes = ack.to_bytes();
        assert_eq!(bytes.len(), ACK_SIZE);
        let parsed = Ack::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, ack);
        assert_eq!(parsed.timestamp(), Timestamp::new(1_700_000_001, 42));
    }

    #[test]
    fn test_ack_too_short() {
        assert!(Ack::from_bytes(&[0u8; 11]).is_err());
    }

    // ============================================================
    // Property-Based Tests
    // ============================================================

    #[cfg(test)]
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: any well-formed heartbeat survives encode/decode unchanged
            #[test]
            fn prop_heartbeat_roundtrip(
                code in 0u8..=2,
                sequence in any::<u32>(),
                ts_sec in any::<u32>(),
                ts_nsec in 0u32..1_000_000_000,
                signal_quality in any::<i32>(),
                rssi in any::<i32>(),
                payload in proptest::collection::vec(any::<u8>(), 0..1500),
            ) {
                let len = HEADER_SIZE + payload.len();
                let header = Heartbeat::probe(sequence, code, len, Timestamp::from_wire(ts_sec, ts_nsec))
                    .with_extras(&ProbeExtras { signal_quality, rssi, ..Default::default() });
                let bytes = encode(&header, &payload).unwrap();
                let message = decode(&bytes).unwrap();
                prop_assert_eq!(message.header, header);
                prop_assert_eq!(message.payload, payload);
            }

            /// Property: the decoder never panics on arbitrary input
            #[test]
            fn prop_decode_arbitrary_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
                let _ = decode(&bytes);
                let _ = Ack::from_bytes(&bytes);
            }
        }
    }
}
