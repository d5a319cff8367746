//! BIP37 bloom filters and the per-peer rolling known-inventory set.

use bchd_consensus::protocol::{
    MAX_BLOOM_FILTER_SIZE, MAX_BLOOM_HASH_FUNCS, MAX_SCRIPT_ELEMENT_SIZE,
};
use bchd_primitives::{DecodeError, Decoder, Encoder, Transaction};

pub const BLOOM_UPDATE_NONE: u8 = 0;
pub const BLOOM_UPDATE_ALL: u8 = 1;
pub const BLOOM_UPDATE_P2PUBKEY_ONLY: u8 = 2;
pub const BLOOM_UPDATE_MASK: u8 = 3;

const LN2_SQUARED: f64 = 0.480_453_013_918_201_4;
const LN2: f64 = 0.693_147_180_559_945_3;

fn rotl32(x: u32, r: u32) -> u32 {
    x.rotate_left(r)
}

/// MurmurHash3 (x86, 32-bit), the hash BIP37 specifies.
pub fn murmur3_32(seed: u32, data: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h1 = seed;
    let blocks = data.len() / 4;
    for i in 0..blocks {
        let mut k1 = u32::from_le_bytes([
            data[i * 4],
            data[i * 4 + 1],
            data[i * 4 + 2],
            data[i * 4 + 3],
        ]);
        k1 = k1.wrapping_mul(C1);
        k1 = rotl32(k1, 15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
        h1 = rotl32(h1, 13);
        h1 = h1.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = &data[blocks * 4..];
    let mut k1 = 0u32;
    if tail.len() >= 3 {
        k1 ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        k1 ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        k1 ^= tail[0] as u32;
        k1 = k1.wrapping_mul(C1);
        k1 = rotl32(k1, 15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85eb_ca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2_ae35);
    h1 ^= h1 >> 16;
    h1
}

/// Iterate data pushes in a script, skipping opcodes.
fn script_data_pushes(script: &[u8]) -> Vec<&[u8]> {
    let mut pushes = Vec::new();
    let mut pos = 0usize;
    while pos < script.len() {
        let opcode = script[pos];
        pos += 1;
        let len = match opcode {
            1..=75 => opcode as usize,
            76 => {
                // OP_PUSHDATA1
                let Some(byte) = script.get(pos) else { break };
                pos += 1;
                *byte as usize
            }
            77 => {
                // OP_PUSHDATA2
                if pos + 2 > script.len() {
                    break;
                }
                let len = u16::from_le_bytes([script[pos], script[pos + 1]]) as usize;
                pos += 2;
                len
            }
            78 => {
                // OP_PUSHDATA4
                if pos + 4 > script.len() {
                    break;
                }
                let len = u32::from_le_bytes([
                    script[pos],
                    script[pos + 1],
                    script[pos + 2],
                    script[pos + 3],
                ]) as usize;
                pos += 4;
                len
            }
            _ => continue,
        };
        if pos + len > script.len() {
            break;
        }
        if len > 0 {
            pushes.push(&script[pos..pos + len]);
        }
        pos += len;
    }
    pushes
}

/// A BIP37 transaction filter as loaded by an SPV peer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BloomFilter {
    data: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
    flags: u8,
}

impl BloomFilter {
    /// Accept-all filter (what `filterclear` resets to).
    pub fn match_all() -> Self {
        Self {
            data: Vec::new(),
            hash_funcs: 0,
            tweak: 0,
            flags: BLOOM_UPDATE_NONE,
        }
    }

    pub fn new(elements: usize, fp_rate: f64, tweak: u32, flags: u8) -> Self {
        let elements = elements.max(1) as f64;
        let bytes = (-1.0 / LN2_SQUARED * elements * fp_rate.ln() / 8.0) as usize;
        let bytes = bytes.clamp(1, MAX_BLOOM_FILTER_SIZE);
        let funcs = ((bytes * 8) as f64 / elements * LN2) as u32;
        Self {
            data: vec![0u8; bytes],
            hash_funcs: funcs.clamp(1, MAX_BLOOM_HASH_FUNCS),
            tweak,
            flags,
        }
    }

    pub fn from_parts(data: Vec<u8>, hash_funcs: u32, tweak: u32, flags: u8) -> Self {
        Self {
            data,
            hash_funcs,
            tweak,
            flags,
        }
    }

    pub fn is_within_size_constraints(&self) -> bool {
        self.data.len() <= MAX_BLOOM_FILTER_SIZE && self.hash_funcs <= MAX_BLOOM_HASH_FUNCS
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn bit_index(&self, n: u32, data: &[u8]) -> usize {
        let seed = n.wrapping_mul(0xfba4_c795).wrapping_add(self.tweak);
        murmur3_32(seed, data) as usize % (self.data.len() * 8)
    }

    pub fn insert(&mut self, element: &[u8]) {
        if self.data.is_empty() {
            return;
        }
        for n in 0..self.hash_funcs {
            let index = self.bit_index(n, element);
            self.data[index / 8] |= 1 << (index % 8);
        }
    }

    pub fn contains(&self, element: &[u8]) -> bool {
        // an empty filter matches everything
        if self.data.is_empty() {
            return true;
        }
        for n in 0..self.hash_funcs {
            let index = self.bit_index(n, element);
            if self.data[index / 8] & (1 << (index % 8)) == 0 {
                return false;
            }
        }
        true
    }

    /// BIP37 relevance test: txid, output data pushes (inserting matched
    /// outpoints when the update flags ask for it), prevouts, and input
    /// data pushes.
    pub fn is_relevant_and_update(&mut self, tx: &Transaction) -> bool {
        let txid = tx.txid();
        let mut found = self.contains(&txid);

        for (vout, output) in tx.outputs.iter().enumerate() {
            let mut matched = false;
            for push in script_data_pushes(&output.script_pubkey) {
                if push.len() <= MAX_SCRIPT_ELEMENT_SIZE && self.contains(push) {
                    matched = true;
                    break;
                }
            }
            if matched {
                found = true;
                let update = self.flags & BLOOM_UPDATE_MASK;
                if update == BLOOM_UPDATE_ALL
                    || (update == BLOOM_UPDATE_P2PUBKEY_ONLY
                        && is_pubkey_script(&output.script_pubkey))
                {
                    let outpoint =
                        bchd_primitives::OutPoint::new(txid, vout as u32).to_bytes();
                    self.insert(&outpoint);
                }
            }
        }
        if found {
            return true;
        }

        for input in &tx.inputs {
            if self.contains(&input.prevout.to_bytes()) {
                return true;
            }
            for push in script_data_pushes(&input.script_sig) {
                if push.len() <= MAX_SCRIPT_ELEMENT_SIZE && self.contains(push) {
                    return true;
                }
            }
        }
        false
    }

    pub fn consensus_encode_to(&self, encoder: &mut Encoder) {
        encoder.write_var_bytes(&self.data);
        encoder.write_u32_le(self.hash_funcs);
        encoder.write_u32_le(self.tweak);
        encoder.write_u8(self.flags);
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        // tolerate an oversized filter here; the handler charges
        // misbehavior via is_within_size_constraints
        let data = decoder.read_var_bytes(MAX_BLOOM_FILTER_SIZE * 4)?;
        Ok(Self {
            data,
            hash_funcs: decoder.read_u32_le()?,
            tweak: decoder.read_u32_le()?,
            flags: decoder.read_u8()?,
        })
    }
}

fn is_pubkey_script(script: &[u8]) -> bool {
    // bare pubkey or bare multisig
    if script.last() == Some(&0xac) {
        // OP_CHECKSIG
        return true;
    }
    script.last() == Some(&0xae) // OP_CHECKMULTISIG
}

/// A generational probabilistic set used for per-peer known inventory and
/// known addresses. Old entries age out as new generations fill.
#[derive(Debug)]
pub struct RollingBloom {
    generations: [Vec<u64>; 2],
    current: usize,
    capacity: usize,
    sets: [std::collections::HashSet<u64>; 2],
}

impl RollingBloom {
    pub fn new(capacity: usize) -> Self {
        Self {
            generations: [Vec::new(), Vec::new()],
            current: 0,
            capacity: capacity.max(2) / 2,
            sets: [
                std::collections::HashSet::new(),
                std::collections::HashSet::new(),
            ],
        }
    }

    fn key(element: &[u8]) -> u64 {
        let low = murmur3_32(0x5bd1_e995, element) as u64;
        let high = murmur3_32(0x9e37_79b9, element) as u64;
        high << 32 | low
    }

    pub fn insert(&mut self, element: &[u8]) {
        let key = Self::key(element);
        if self.sets[self.current].contains(&key) {
            return;
        }
        if self.sets[self.current].len() >= self.capacity {
            self.current ^= 1;
            self.sets[self.current].clear();
            self.generations[self.current].clear();
        }
        self.sets[self.current].insert(key);
        self.generations[self.current].push(key);
    }

    pub fn contains(&self, element: &[u8]) -> bool {
        let key = Self::key(element);
        self.sets[0].contains(&key) || self.sets[1].contains(&key)
    }

    pub fn clear(&mut self) {
        for set in &mut self.sets {
            set.clear();
        }
        for generation in &mut self.generations {
            generation.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bchd_primitives::{OutPoint, TxIn, TxOut};

    #[test]
    fn murmur3_reference_vectors() {
        // vectors from the MurmurHash3 reference implementation
        assert_eq!(murmur3_32(0, b""), 0);
        assert_eq!(murmur3_32(1, b""), 0x514e28b7);
        assert_eq!(murmur3_32(0, b"Hello, world!"), 0xc0363e43);
        assert_eq!(murmur3_32(0, b"test"), 0xba6bd213);
    }

    #[test]
    fn filter_insert_and_contains() {
        let mut filter = BloomFilter::new(3, 0.01, 2147483649, BLOOM_UPDATE_ALL);
        let a = [0x99u8; 20];
        let b = [0x11u8; 20];
        filter.insert(&a);
        assert!(filter.contains(&a));
        assert!(!filter.contains(&b));
        assert!(filter.is_within_size_constraints());
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = BloomFilter::match_all();
        assert!(filter.contains(&[1, 2, 3]));
    }

    #[test]
    fn relevance_by_txid_and_outpoint_update() {
        let tx = Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint::new([7u8; 32], 0),
                script_sig: Vec::new(),
                sequence: 0,
            }],
            outputs: vec![TxOut {
                value: 1,
                script_pubkey: vec![0x14; 21], // one 20-byte push
            }],
            lock_time: 0,
        };
        let mut filter = BloomFilter::new(10, 0.000001, 0, BLOOM_UPDATE_ALL);
        filter.insert(&tx.txid());
        assert!(filter.is_relevant_and_update(&tx));

        // matching an output data push inserts the outpoint
        let mut filter = BloomFilter::new(10, 0.000001, 0, BLOOM_UPDATE_ALL);
        filter.insert(&[0x14; 20]);
        assert!(filter.is_relevant_and_update(&tx));
        let outpoint = OutPoint::new(tx.txid(), 0).to_bytes();
        assert!(filter.contains(&outpoint));
    }

    #[test]
    fn rolling_bloom_ages_out_old_entries() {
        let mut rolling = RollingBloom::new(8);
        for i in 0..64u32 {
            rolling.insert(&i.to_le_bytes());
        }
        assert!(rolling.contains(&63u32.to_le_bytes()));
        assert!(!rolling.contains(&0u32.to_le_bytes()));
    }
}
