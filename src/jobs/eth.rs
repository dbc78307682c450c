use {
    super::*,
    primitive_types::{H160, H256, U256},
    rlp::{DecoderError, Rlp, RlpStream},
    sha3::{Digest, Keccak256},
};

/// Job ids of fake jobs start with this 48-byte prefix, followed by an
/// 8-byte big-endian timestamp.
const FAKE_JOB_PREFIX: [u8; 48] = {
    let mut prefix = [0u8; 48];
    prefix[0] = 0xfa;
    prefix[1] = 0x6e;
    prefix[2] = 0x07;
    prefix[3] = 0x0b;
    prefix
};

/// An Ethereum job from the pool: opaque little-endian job id, the seed hash
/// for the DAG epoch, the RLP-encoded proof-of-work block header and an
/// optional EIP-1559 base fee.
#[derive(Debug, Clone)]
pub(crate) struct JobEth {
    pub(crate) job_id: Vec<u8>,
    pub(crate) seed_hash: Vec<u8>,
    pub(crate) header: Vec<u8>,
    pub(crate) base_fee: Vec<u8>,
    pub(crate) is_clean: bool,
}

impl JobEth {
    /// Params in order: job id, seed hash, header hash, clean; the header
    /// itself travels out of band next to the params.
    pub(crate) fn from_notify(
        params: &Value,
        header: Option<&str>,
        basefee: Option<&str>,
    ) -> Result<Self> {
        let header = header.context("notify missing field header")?;
        let header = utils::hex_to_bin(header).context("failed to decode header")?;

        let base_fee = match basefee {
            Some(basefee) => utils::hex_to_bin(basefee).context("failed to decode base fee")?,
            None => Vec::new(),
        };

        let params = params
            .as_array()
            .context("notify params is not an array")?;

        if params.len() < 4 {
            bail!(
                "notify missing fields, should be 4 fields but only {}",
                params.len()
            );
        }

        let job_id = params[0].as_str().context("job id is not a string")?;
        let job_id = utils::hex_to_bin(job_id).context("failed to decode job id")?;

        let seed_hash = params[1].as_str().context("seed hash is not a string")?;
        let seed_hash = utils::hex_to_bin(seed_hash).context("failed to decode seed hash")?;

        let is_clean = params[3].as_bool().unwrap_or(false);

        Ok(Self {
            job_id,
            seed_hash,
            header,
            base_fee,
            is_clean,
        })
    }

    pub(crate) fn is_fake(&self) -> bool {
        self.job_id.starts_with(&FAKE_JOB_PREFIX)
    }

    /// The hash a miner grinds on for a given extra nonce. Fake jobs have no
    /// real header, so their job id doubles as the pow hash; that is what
    /// lets submissions against them be recognised later.
    pub(crate) fn pow_hash(&self, extra_nonce: u32) -> Result<String> {
        if self.is_fake() {
            return Ok(hex::encode(&self.job_id));
        }

        let header = PowHeader::decode(&self.header)?;
        Ok(hex::encode(header.pow_hash(extra_nonce)?))
    }

    pub(crate) fn height(&self) -> u64 {
        PowHeader::decode(&self.header)
            .map(|header| header.number.low_u64())
            .unwrap_or(0)
    }

    pub(crate) fn seed_hash_hex(&self) -> String {
        hex::encode(&self.seed_hash)
    }

    pub(crate) fn to_fake(&mut self, now: u64) {
        self.header = now.to_be_bytes().to_vec();
        self.job_id = FAKE_JOB_PREFIX.to_vec();
        self.job_id.extend_from_slice(&self.header);
    }
}

/// A submitted pow hash that points at a fake job: the 48-byte prefix plus
/// 16 hex chars of timestamp.
pub(crate) fn is_fake_pow_hash(pow_hash: &str) -> bool {
    let pow_hash = utils::hex_remove_prefix(pow_hash);
    pow_hash.len() == FAKE_JOB_PREFIX.len() * 2 + 16
        && pow_hash[..FAKE_JOB_PREFIX.len() * 2]
            .eq_ignore_ascii_case(&hex::encode(FAKE_JOB_PREFIX))
}

/// Per-miner share target for a pool difficulty, as 64 hex chars.
pub(crate) fn diff_to_target_eth(diff: u64) -> String {
    format!("{:064x}", U256::MAX / U256::from(diff.max(1)))
}

/// The proof-of-work portion of an Ethereum block header. The pool leaves a
/// nonce-sized hole at the tail of the extra data; each miner's assigned
/// extra nonce is written there before hashing, which is what gives every
/// miner a distinct pow hash for the same job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PowHeader {
    pub(crate) parent_hash: H256,
    pub(crate) uncle_hash: H256,
    pub(crate) coinbase: H160,
    pub(crate) root: H256,
    pub(crate) tx_hash: H256,
    pub(crate) receipt_hash: H256,
    pub(crate) bloom: Vec<u8>,
    pub(crate) difficulty: U256,
    pub(crate) number: U256,
    pub(crate) gas_limit: u64,
    pub(crate) gas_used: u64,
    pub(crate) time: u64,
    pub(crate) extra: Vec<u8>,
    pub(crate) base_fee: Option<U256>,
}

impl PowHeader {
    pub(crate) fn decode(bin: &[u8]) -> Result<Self> {
        Ok(rlp::decode(bin)?)
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut stream = RlpStream::new();
        self.rlp_append(&mut stream);
        stream.out().to_vec()
    }

    fn rlp_append(&self, stream: &mut RlpStream) {
        stream.begin_list(if self.base_fee.is_some() { 14 } else { 13 });
        stream.append(&self.parent_hash);
        stream.append(&self.uncle_hash);
        stream.append(&self.coinbase);
        stream.append(&self.root);
        stream.append(&self.tx_hash);
        stream.append(&self.receipt_hash);
        stream.append(&self.bloom);
        stream.append(&self.difficulty);
        stream.append(&self.number);
        stream.append(&self.gas_limit);
        stream.append(&self.gas_used);
        stream.append(&self.time);
        stream.append(&self.extra);
        if let Some(base_fee) = &self.base_fee {
            stream.append(base_fee);
        }
    }

    fn extra_with_nonce(&self, extra_nonce: u32) -> Result<Vec<u8>> {
        let nonce = extra_nonce.to_be_bytes();

        let pos = self
            .extra
            .len()
            .checked_sub(nonce.len())
            .context("header extra data too small for an extra nonce")?;

        let mut extra = self.extra.clone();
        extra[pos..].copy_from_slice(&nonce);
        Ok(extra)
    }

    pub(crate) fn pow_hash(&self, extra_nonce: u32) -> Result<[u8; 32]> {
        let patched = Self {
            extra: self.extra_with_nonce(extra_nonce)?,
            ..self.clone()
        };

        Ok(Keccak256::digest(patched.encode()).into())
    }
}

impl rlp::Decodable for PowHeader {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self {
            parent_hash: rlp.val_at(0)?,
            uncle_hash: rlp.val_at(1)?,
            coinbase: rlp.val_at(2)?,
            root: rlp.val_at(3)?,
            tx_hash: rlp.val_at(4)?,
            receipt_hash: rlp.val_at(5)?,
            bloom: rlp.val_at(6)?,
            difficulty: rlp.val_at(7)?,
            number: rlp.val_at(8)?,
            gas_limit: rlp.val_at(9)?,
            gas_used: rlp.val_at(10)?,
            time: rlp.val_at(11)?,
            extra: rlp.val_at(12)?,
            base_fee: if rlp.item_count()? > 13 {
                Some(rlp.val_at(13)?)
            } else {
                None
            },
        })
    }
}

/// Bounded ring mapping the pow hashes recently shown to one miner back to
/// the opaque pool job ids they came from. Miners submit pow hashes, the
/// pool wants job ids.
#[derive(Debug)]
pub(crate) struct JobIdRing {
    entries: Vec<Option<(String, Vec<u8>)>>,
    pos: usize,
}

impl JobIdRing {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            entries: (0..size).map(|_| None).collect(),
            pos: 0,
        }
    }

    pub(crate) fn add(&mut self, pow_hash: String, job_id: Vec<u8>) {
        self.entries[self.pos] = Some((pow_hash, job_id));
        self.pos = (self.pos + 1) % self.entries.len();
    }

    /// Newest first, so a resubmitted pow hash resolves to its latest job.
    pub(crate) fn find(&self, pow_hash: &str) -> Option<&[u8]> {
        let len = self.entries.len();

        for age in 1..=len {
            if let Some((hash, job_id)) = &self.entries[(self.pos + len - age) % len]
                && hash == pow_hash
            {
                return Some(job_id);
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    fn header() -> PowHeader {
        PowHeader {
            parent_hash: H256::repeat_byte(0x11),
            uncle_hash: H256::repeat_byte(0x22),
            coinbase: H160::repeat_byte(0x33),
            root: H256::repeat_byte(0x44),
            tx_hash: H256::repeat_byte(0x55),
            receipt_hash: H256::repeat_byte(0x66),
            bloom: vec![0u8; 256],
            difficulty: U256::from(0x0f4240u64),
            number: U256::from(14_000_000u64),
            gas_limit: 30_000_000,
            gas_used: 21_000,
            time: 0x61f2a9c0,
            extra: vec![0u8; 8],
            base_fee: Some(U256::from(7u64)),
        }
    }

    fn job(header: &PowHeader) -> JobEth {
        JobEth {
            job_id: vec![0x1d, 0x0f, 0x00, 0x00],
            seed_hash: vec![0xab; 32],
            header: header.encode(),
            base_fee: Vec::new(),
            is_clean: false,
        }
    }

    #[test]
    fn header_rlp_roundtrip() {
        let header = header();
        assert_eq!(PowHeader::decode(&header.encode()).unwrap(), header);

        let legacy = PowHeader {
            base_fee: None,
            ..header
        };
        assert_eq!(PowHeader::decode(&legacy.encode()).unwrap(), legacy);
    }

    #[test]
    fn pow_hash_depends_on_extra_nonce() {
        let job = job(&header());

        let a = job.pow_hash(1).unwrap();
        let b = job.pow_hash(2).unwrap();

        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert_eq!(a, job.pow_hash(1).unwrap());
    }

    #[test]
    fn pow_hash_writes_nonce_into_extra_tail() {
        let header = header();
        let extra = header.extra_with_nonce(0x01020304).unwrap();
        assert_eq!(&extra[4..], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&extra[..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn pow_hash_rejects_short_extra() {
        let header = PowHeader {
            extra: vec![0; 2],
            ..header()
        };
        assert!(header.pow_hash(1).is_err());
    }

    #[test]
    fn from_notify_parses_fields() {
        let header = header();
        let job = JobEth::from_notify(
            &json!(["1d0f0000", "abab", "cdcd", true]),
            Some(&hex::encode(header.encode())),
            Some("07"),
        )
        .unwrap();

        assert_eq!(job.job_id, vec![0x1d, 0x0f, 0x00, 0x00]);
        assert_eq!(job.seed_hash, vec![0xab, 0xab]);
        assert_eq!(job.base_fee, vec![0x07]);
        assert!(job.is_clean);
        assert_eq!(job.height(), 14_000_000);
    }

    #[test]
    fn from_notify_requires_header() {
        assert!(JobEth::from_notify(&json!(["1d", "ab", "cd", false]), None, None).is_err());
    }

    #[test]
    fn fake_job_uses_prefixed_id() {
        let mut job = job(&header());
        job.to_fake(0x5f5e0f00);

        assert!(job.is_fake());
        assert_eq!(job.job_id.len(), 56);

        let pow_hash = job.pow_hash(42).unwrap();
        assert_eq!(pow_hash.len(), 112);
        assert!(is_fake_pow_hash(&pow_hash));
        assert!(is_fake_pow_hash(&utils::hex_add_prefix(&pow_hash)));
    }

    #[test]
    fn real_pow_hash_is_not_fake() {
        let job = job(&header());
        assert!(!is_fake_pow_hash(&job.pow_hash(0).unwrap()));
    }

    #[test]
    fn targets() {
        assert_eq!(diff_to_target_eth(1), "f".repeat(64));
        assert_eq!(
            diff_to_target_eth(2),
            format!("7{}", "f".repeat(63))
        );
        // Zero difficulty cannot divide; it degrades to the easiest target.
        assert_eq!(diff_to_target_eth(0), "f".repeat(64));
    }

    #[test]
    fn ring_finds_newest_first() {
        let mut ring = JobIdRing::new(4);
        ring.add("hash-a".into(), vec![1]);
        ring.add("hash-b".into(), vec![2]);
        ring.add("hash-a".into(), vec![3]);

        assert_eq!(ring.find("hash-a"), Some(&[3u8][..]));
        assert_eq!(ring.find("hash-b"), Some(&[2u8][..]));
        assert_eq!(ring.find("hash-c"), None);
    }

    #[test]
    fn ring_evicts_oldest() {
        let mut ring = JobIdRing::new(2);
        ring.add("a".into(), vec![1]);
        ring.add("b".into(), vec![2]);
        ring.add("c".into(), vec![3]);

        assert_eq!(ring.find("a"), None);
        assert_eq!(ring.find("b"), Some(&[2u8][..]));
        assert_eq!(ring.find("c"), Some(&[3u8][..]));
    }
}
