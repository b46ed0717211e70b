//! ANN index contract
//!
//! The production index library is an external collaborator consumed through
//! the capability set {add, remove, contains, search, reserve, serialize,
//! deserialize}; freeing is `Drop`. The trait is the seam that lets the
//! domain, checkpoint, and handle layers run against any implementation —
//! the workspace ships one exact-scan implementation for real use in tests
//! and small deployments.
//!
//! Metric and scalar kinds are tagged variants with stable wire
//! discriminants, persisted inside the 44-byte init options record.

use crate::bytes;
use crate::error::{Error, Result};

/// Distance metric used to rank search results (lower distance is better;
/// similarity metrics are folded into distance form).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// 1 − cosine similarity
    Cosine,
    /// Negated inner product
    InnerProduct,
    /// Squared Euclidean distance
    L2Sq,
    /// Count of differing components (bits for binary vectors)
    Hamming,
}

impl MetricKind {
    /// Wire discriminant.
    pub fn as_u32(self) -> u32 {
        match self {
            MetricKind::Cosine => 1,
            MetricKind::InnerProduct => 2,
            MetricKind::L2Sq => 3,
            MetricKind::Hamming => 4,
        }
    }

    /// Decode a wire discriminant.
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            1 => Ok(MetricKind::Cosine),
            2 => Ok(MetricKind::InnerProduct),
            3 => Ok(MetricKind::L2Sq),
            4 => Ok(MetricKind::Hamming),
            other => Err(Error::Corruption(format!("unknown metric kind {other}"))),
        }
    }
}

/// Scalar encoding of stored vector components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
    /// 16-bit float
    F16,
    /// Signed 8-bit integer, scaled to [-1, 1]
    I8,
    /// One bit per component, packed MSB-first
    B1,
}

impl ScalarKind {
    /// Wire discriminant.
    pub fn as_u32(self) -> u32 {
        match self {
            ScalarKind::F32 => 1,
            ScalarKind::F64 => 2,
            ScalarKind::F16 => 3,
            ScalarKind::I8 => 4,
            ScalarKind::B1 => 5,
        }
    }

    /// Decode a wire discriminant.
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            1 => Ok(ScalarKind::F32),
            2 => Ok(ScalarKind::F64),
            3 => Ok(ScalarKind::F16),
            4 => Ok(ScalarKind::I8),
            5 => Ok(ScalarKind::B1),
            other => Err(Error::Corruption(format!("unknown scalar kind {other}"))),
        }
    }

    /// Encoded byte length of one vector with `dimensions` components.
    pub fn vector_bytes(self, dimensions: u64) -> usize {
        let dims = dimensions as usize;
        match self {
            ScalarKind::F32 => dims * 4,
            ScalarKind::F64 => dims * 8,
            ScalarKind::F16 => dims * 2,
            ScalarKind::I8 => dims,
            ScalarKind::B1 => (dims + 7) / 8,
        }
    }
}

/// Fixed length of the persisted init options record.
pub const INIT_OPTIONS_LEN: usize = 44;

/// Current init options record format version.
pub const INIT_OPTIONS_VERSION: u8 = 1;

/// Index construction parameters, persisted once per domain under the `init`
/// meta key and required before the first activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexOptions {
    /// Distance metric
    pub metric: MetricKind,
    /// Scalar encoding of stored vectors
    pub scalar: ScalarKind,
    /// Components per vector
    pub dimensions: u64,
    /// Graph connectivity (HNSW construction knob; opaque to flat indexes)
    pub connectivity: u64,
    /// Expansion factor during insertion
    pub expansion_add: u64,
    /// Expansion factor during search
    pub expansion_search: u64,
    /// Whether a key may hold multiple vectors
    pub multi: bool,
}

impl IndexOptions {
    /// Encode into the 44-byte record.
    pub fn encode(&self) -> [u8; INIT_OPTIONS_LEN] {
        let mut buf = [0u8; INIT_OPTIONS_LEN];
        buf[0] = INIT_OPTIONS_VERSION;
        buf[1] = self.multi as u8;
        // buf[2..4] reserved
        bytes::put_u32(&mut buf, 4, self.metric.as_u32());
        bytes::put_u32(&mut buf, 8, self.scalar.as_u32());
        bytes::put_u64(&mut buf, 12, self.dimensions);
        bytes::put_u64(&mut buf, 20, self.connectivity);
        bytes::put_u64(&mut buf, 28, self.expansion_add);
        bytes::put_u64(&mut buf, 36, self.expansion_search);
        buf
    }

    /// Decode and validate the 44-byte record.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        bytes::expect_len(buf, INIT_OPTIONS_LEN, "init options")?;
        if buf[0] != INIT_OPTIONS_VERSION {
            return Err(Error::Corruption(format!("init options version {}", buf[0])));
        }
        Ok(IndexOptions {
            metric: MetricKind::from_u32(bytes::get_u32(buf, 4))?,
            scalar: ScalarKind::from_u32(bytes::get_u32(buf, 8))?,
            dimensions: bytes::get_u64(buf, 12),
            connectivity: bytes::get_u64(buf, 20),
            expansion_add: bytes::get_u64(buf, 28),
            expansion_search: bytes::get_u64(buf, 36),
            multi: buf[1] != 0,
        })
    }
}

/// Capability surface of one in-memory ANN index.
pub trait VectorIndex: Send {
    /// Construction parameters this index was built with.
    fn options(&self) -> &IndexOptions;

    /// Insert a vector. When the index is not `multi`, an existing key is
    /// rejected with [`Error::AlreadyExists`] and the caller decides whether
    /// to fall back to remove-then-add.
    fn add(&mut self, key: u64, vector: &[u8]) -> Result<()>;

    /// Remove all vectors for a key. Returns whether the key was present.
    fn remove(&mut self, key: u64) -> Result<bool>;

    /// Whether the key holds at least one vector.
    fn contains(&self, key: u64) -> bool;

    /// Number of stored vectors.
    fn len(&self) -> usize;

    /// Whether the index is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grow reserved capacity to at least `capacity` vectors.
    fn reserve(&mut self, capacity: usize) -> Result<()>;

    /// K-nearest search. Returns `(key, distance)` pairs ordered by
    /// `(distance asc, key asc)`.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(u64, f32)>>;

    /// Serialize the full index state into a contiguous byte buffer.
    fn serialize(&self) -> Result<Vec<u8>>;

    /// Replace this index's state from a serialized buffer produced by
    /// [`VectorIndex::serialize`] under the same options.
    fn deserialize(&mut self, buf: &[u8]) -> Result<()>;
}

/// Constructor seam for fresh indexes, mirroring how the handle layer builds
/// one from persisted init options at activation.
pub trait IndexFactory: Send + Sync {
    /// Build an empty index for the given options.
    fn create(&self, options: &IndexOptions) -> Result<Box<dyn VectorIndex>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_options() -> IndexOptions {
        IndexOptions {
            metric: MetricKind::Cosine,
            scalar: ScalarKind::F32,
            dimensions: 4,
            connectivity: 16,
            expansion_add: 128,
            expansion_search: 64,
            multi: false,
        }
    }

    #[test]
    fn test_init_options_roundtrip() {
        let options = sample_options();
        let encoded = options.encode();
        assert_eq!(encoded.len(), INIT_OPTIONS_LEN);
        assert_eq!(IndexOptions::decode(&encoded).unwrap(), options);
    }

    #[test]
    fn test_init_options_multi_flag() {
        let mut options = sample_options();
        options.multi = true;
        let decoded = IndexOptions::decode(&options.encode()).unwrap();
        assert!(decoded.multi);
    }

    #[test]
    fn test_init_options_rejects_bad_version() {
        let mut encoded = sample_options().encode();
        encoded[0] = 2;
        assert!(IndexOptions::decode(&encoded).unwrap_err().is_corruption());
    }

    #[test]
    fn test_init_options_rejects_wrong_length() {
        let encoded = sample_options().encode();
        assert!(IndexOptions::decode(&encoded[..43]).unwrap_err().is_corruption());
    }

    #[test]
    fn test_vector_bytes() {
        assert_eq!(ScalarKind::F32.vector_bytes(4), 16);
        assert_eq!(ScalarKind::F64.vector_bytes(4), 32);
        assert_eq!(ScalarKind::F16.vector_bytes(4), 8);
        assert_eq!(ScalarKind::I8.vector_bytes(4), 4);
        assert_eq!(ScalarKind::B1.vector_bytes(4), 1);
        assert_eq!(ScalarKind::B1.vector_bytes(9), 2);
    }

    #[test]
    fn test_kind_discriminants_roundtrip() {
        for metric in [MetricKind::Cosine, MetricKind::InnerProduct, MetricKind::L2Sq, MetricKind::Hamming] {
            assert_eq!(MetricKind::from_u32(metric.as_u32()).unwrap(), metric);
        }
        for scalar in [ScalarKind::F32, ScalarKind::F64, ScalarKind::F16, ScalarKind::I8, ScalarKind::B1] {
            assert_eq!(ScalarKind::from_u32(scalar.as_u32()).unwrap(), scalar);
        }
        assert!(MetricKind::from_u32(0).is_err());
        assert!(ScalarKind::from_u32(99).is_err());
    }
}
