//! Flat exact-scan index
//!
//! The reference implementation of the index contract: O(n) scan over every
//! stored vector with deterministic `(distance asc, key asc)` ordering.
//! Sufficient for tests and small deployments; a graph-based library slots
//! in through the same trait without touching the persistence layers.
//!
//! Vectors are held in their wire encoding and decoded per scalar kind at
//! search time. HNSW construction knobs in the options (connectivity,
//! expansions) are carried but not interpreted here.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use annex_core::bytes;
use annex_core::error::{Error, Result};
use annex_core::index::{IndexFactory, IndexOptions, MetricKind, ScalarKind, VectorIndex};

/// Serialization format version.
const FLAT_FORMAT_VERSION: u8 = 1;

/// Serialization header: version, scalar, reserved, count, dimensions.
const FLAT_HEADER_LEN: usize = 16;

/// Exact-scan vector index.
pub struct FlatIndex {
    options: IndexOptions,
    vector_len: usize,
    vectors: BTreeMap<u64, Vec<Vec<u8>>>,
    count: usize,
    reserved: usize,
}

impl FlatIndex {
    /// Create an empty index.
    pub fn new(options: IndexOptions) -> Result<Self> {
        if options.dimensions == 0 {
            return Err(Error::InvalidArgument("index dimensions must be nonzero"));
        }
        let vector_len = options.scalar.vector_bytes(options.dimensions);
        Ok(FlatIndex { options, vector_len, vectors: BTreeMap::new(), count: 0, reserved: 0 })
    }

    /// Reserved capacity in vectors.
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    fn decode_components(&self, vector: &[u8]) -> Vec<f32> {
        let dims = self.options.dimensions as usize;
        match self.options.scalar {
            ScalarKind::F32 => {
                (0..dims).map(|i| f32::from_bits(bytes::get_u32(vector, i * 4))).collect()
            }
            ScalarKind::F64 => (0..dims)
                .map(|i| f64::from_bits(bytes::get_u64(vector, i * 8)) as f32)
                .collect(),
            ScalarKind::F16 => {
                (0..dims).map(|i| half_to_f32(bytes::get_u16(vector, i * 2))).collect()
            }
            ScalarKind::I8 => vector.iter().map(|&b| b as i8 as f32 / 127.0).collect(),
            ScalarKind::B1 => (0..dims)
                .map(|i| {
                    let bit = (vector[i / 8] >> (7 - (i % 8))) & 1;
                    bit as f32
                })
                .collect(),
        }
    }

    fn distance(&self, query: &[f32], stored: &[f32]) -> f32 {
        match self.options.metric {
            MetricKind::Cosine => {
                let mut dot = 0.0f32;
                let mut norm_q = 0.0f32;
                let mut norm_s = 0.0f32;
                for (q, s) in query.iter().zip(stored) {
                    dot += q * s;
                    norm_q += q * q;
                    norm_s += s * s;
                }
                if norm_q == 0.0 || norm_s == 0.0 {
                    1.0
                } else {
                    1.0 - dot / (norm_q.sqrt() * norm_s.sqrt())
                }
            }
            MetricKind::InnerProduct => {
                -query.iter().zip(stored).map(|(q, s)| q * s).sum::<f32>()
            }
            MetricKind::L2Sq => {
                query.iter().zip(stored).map(|(q, s)| (q - s) * (q - s)).sum()
            }
            MetricKind::Hamming => {
                query.iter().zip(stored).filter(|(q, s)| q != s).count() as f32
            }
        }
    }
}

/// IEEE 754 half-precision to single-precision conversion.
fn half_to_f32(bits: u16) -> f32 {
    let sign = (bits >> 15) as u32;
    let exponent = ((bits >> 10) & 0x1F) as u32;
    let mantissa = (bits & 0x3FF) as u32;
    let f32_bits = match (exponent, mantissa) {
        (0, 0) => sign << 31,
        (0, _) => {
            // Subnormal half: renormalize.
            let mut exponent = 127 - 15 + 1;
            let mut mantissa = mantissa;
            while mantissa & 0x400 == 0 {
                mantissa <<= 1;
                exponent -= 1;
            }
            (sign << 31) | ((exponent as u32) << 23) | ((mantissa & 0x3FF) << 13)
        }
        (0x1F, 0) => (sign << 31) | 0x7F80_0000,
        (0x1F, _) => (sign << 31) | 0x7FC0_0000,
        _ => (sign << 31) | ((exponent + 127 - 15) << 23) | (mantissa << 13),
    };
    f32::from_bits(f32_bits)
}

impl VectorIndex for FlatIndex {
    fn options(&self) -> &IndexOptions {
        &self.options
    }

    fn add(&mut self, key: u64, vector: &[u8]) -> Result<()> {
        if vector.len() != self.vector_len {
            return Err(Error::InvalidArgument("vector byte length does not match index options"));
        }
        let slot = self.vectors.entry(key).or_default();
        if !slot.is_empty() && !self.options.multi {
            return Err(Error::AlreadyExists(key));
        }
        slot.push(vector.to_vec());
        self.count += 1;
        Ok(())
    }

    fn remove(&mut self, key: u64) -> Result<bool> {
        match self.vectors.remove(&key) {
            Some(slot) => {
                self.count -= slot.len();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn contains(&self, key: u64) -> bool {
        self.vectors.contains_key(&key)
    }

    fn len(&self) -> usize {
        self.count
    }

    fn reserve(&mut self, capacity: usize) -> Result<()> {
        if capacity > self.reserved {
            self.reserved = capacity;
        }
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(u64, f32)>> {
        if query.len() != self.options.dimensions as usize {
            return Err(Error::InvalidArgument("query dimension does not match index options"));
        }
        if k == 0 || self.count == 0 {
            return Ok(Vec::new());
        }
        let mut results: Vec<(u64, f32)> = Vec::with_capacity(self.count);
        for (&key, slot) in &self.vectors {
            for vector in slot {
                let stored = self.decode_components(vector);
                results.push((key, self.distance(query, &stored)));
            }
        }
        // Deterministic: distance ascending, key ascending on ties.
        results.sort_by(|(key_a, dist_a), (key_b, dist_b)| {
            dist_a
                .partial_cmp(dist_b)
                .unwrap_or(Ordering::Equal)
                .then_with(|| key_a.cmp(key_b))
        });
        results.truncate(k);
        Ok(results)
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        if self.count > u32::MAX as usize {
            return Err(Error::InvalidArgument("index too large to serialize"));
        }
        let mut buf = Vec::with_capacity(FLAT_HEADER_LEN + self.count * (8 + self.vector_len));
        buf.extend_from_slice(&[0u8; FLAT_HEADER_LEN]);
        buf[0] = FLAT_FORMAT_VERSION;
        buf[1] = self.options.scalar.as_u32() as u8;
        // buf[2..4] reserved
        bytes::put_u32(&mut buf, 4, self.count as u32);
        bytes::put_u64(&mut buf, 8, self.options.dimensions);
        for (&key, slot) in &self.vectors {
            for vector in slot {
                let mut key_buf = [0u8; 8];
                bytes::put_u64(&mut key_buf, 0, key);
                buf.extend_from_slice(&key_buf);
                buf.extend_from_slice(vector);
            }
        }
        Ok(buf)
    }

    fn deserialize(&mut self, buf: &[u8]) -> Result<()> {
        if buf.len() < FLAT_HEADER_LEN {
            return Err(Error::Corruption(format!(
                "serialized index truncated at {} bytes",
                buf.len()
            )));
        }
        if buf[0] != FLAT_FORMAT_VERSION {
            return Err(Error::Corruption(format!("serialized index version {}", buf[0])));
        }
        if buf[1] as u32 != self.options.scalar.as_u32() {
            return Err(Error::Corruption("serialized index scalar kind mismatch".into()));
        }
        let count = bytes::get_u32(buf, 4) as usize;
        let dimensions = bytes::get_u64(buf, 8);
        if dimensions != self.options.dimensions {
            return Err(Error::Corruption(format!(
                "serialized index has {dimensions} dimensions, options say {}",
                self.options.dimensions
            )));
        }
        let entry_len = 8 + self.vector_len;
        if buf.len() != FLAT_HEADER_LEN + count * entry_len {
            return Err(Error::Corruption(format!(
                "serialized index is {} bytes, header declares {}",
                buf.len(),
                FLAT_HEADER_LEN + count * entry_len
            )));
        }
        let mut vectors: BTreeMap<u64, Vec<Vec<u8>>> = BTreeMap::new();
        for entry in 0..count {
            let offset = FLAT_HEADER_LEN + entry * entry_len;
            let key = bytes::get_u64(buf, offset);
            let vector = buf[offset + 8..offset + entry_len].to_vec();
            let slot = vectors.entry(key).or_default();
            if !slot.is_empty() && !self.options.multi {
                return Err(Error::Corruption(format!(
                    "serialized index repeats key {key} without multi"
                )));
            }
            slot.push(vector);
        }
        self.vectors = vectors;
        self.count = count;
        Ok(())
    }
}

/// Factory building [`FlatIndex`] instances; the default index seam for a
/// domain.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatIndexFactory;

impl IndexFactory for FlatIndexFactory {
    fn create(&self, options: &IndexOptions) -> Result<Box<dyn VectorIndex>> {
        Ok(Box::new(FlatIndex::new(*options)?))
    }
}

/// Encode a slice of f32 components into F32 wire bytes.
pub fn encode_f32_vector(components: &[f32]) -> Vec<u8> {
    let mut buf = vec![0u8; components.len() * 4];
    for (i, component) in components.iter().enumerate() {
        bytes::put_u32(&mut buf, i * 4, component.to_bits());
    }
    buf
}
