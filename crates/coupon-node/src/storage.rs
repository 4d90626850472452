//! RocksDB-backed persistent code pool and cooldown ledger.
//!
//! Implements [`CouponStore`] using RocksDB column families for codes, the
//! value index, the FIFO availability index, cooldown entries and metadata.
//! All mutations use an atomic [`WriteBatch`]; read-modify-write sequences
//! are serialized by a write lock so a claim and a sweep never act on the
//! same code.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};

use coupon_core::error::CouponError;
use coupon_core::store::CouponStore;
use coupon_core::types::{Code, CodeStatus, CooldownEntry, PoolStats};

// --- Column family names ---

const CF_CODES: &str = "codes";
const CF_CODE_INDEX: &str = "code_index";
const CF_AVAILABLE: &str = "available";
const CF_COOLDOWNS: &str = "cooldowns";
const CF_METADATA: &str = "metadata";

/// All column family names.
const ALL_CFS: &[&str] = &[CF_CODES, CF_CODE_INDEX, CF_AVAILABLE, CF_COOLDOWNS, CF_METADATA];

// --- Metadata keys ---

const META_NEXT_SEQ: &[u8] = b"next_seq";

/// On-disk form of a [`Code`]. Timestamps are unix milliseconds.
#[derive(bincode::Encode, bincode::Decode)]
struct CodeRecord {
    value: String,
    claimed: bool,
    claimed_by: Option<String>,
    claimed_at_ms: Option<i64>,
    created_at_ms: i64,
}

impl CodeRecord {
    fn from_code(code: &Code) -> Self {
        Self {
            value: code.value.clone(),
            claimed: code.status == CodeStatus::Claimed,
            claimed_by: code.claimed_by.clone(),
            claimed_at_ms: code.claimed_at.map(|at| at.timestamp_millis()),
            created_at_ms: code.created_at.timestamp_millis(),
        }
    }

    fn into_code(self, seq: u64) -> Result<Code, CouponError> {
        let claimed_at = self.claimed_at_ms.map(from_millis).transpose()?;
        Ok(Code {
            seq,
            value: self.value,
            status: if self.claimed { CodeStatus::Claimed } else { CodeStatus::Available },
            claimed_by: self.claimed_by,
            claimed_at,
            created_at: from_millis(self.created_at_ms)?,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, CouponError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| CouponError::Storage(format!("timestamp out of range: {ms}")))
}

/// RocksDB-backed persistent store.
///
/// Codes live under their big-endian sequence number so iteration follows
/// insertion order. The `available` family holds one empty value per
/// available code, which makes "first available" a single seek.
pub struct RocksStore {
    db: DB,
    /// Held across every read-modify-write of codes, cooldown clears and
    /// sequence allocation.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a RocksDB database at the given path.
    ///
    /// Creates the directory and all column families if they don't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CouponError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        std::fs::create_dir_all(path.as_ref()).map_err(|e| CouponError::Storage(e.to_string()))?;
        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| CouponError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    /// Flush all in-memory buffers to disk.
    pub fn flush(&self) -> Result<(), CouponError> {
        self.db
            .flush()
            .map_err(|e| CouponError::Storage(e.to_string()))
    }

    /// Get a column family handle.
    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, CouponError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| CouponError::Storage(format!("missing column family: {name}")))
    }

    /// Encode a sequence number as big-endian bytes for ordered iteration.
    fn seq_key(seq: u64) -> [u8; 8] {
        seq.to_be_bytes()
    }

    fn decode_seq(bytes: &[u8]) -> Result<u64, CouponError> {
        let array: [u8; 8] = bytes
            .try_into()
            .map_err(|_| CouponError::Storage("invalid sequence key length".into()))?;
        Ok(u64::from_be_bytes(array))
    }

    fn encode_record(code: &Code) -> Result<Vec<u8>, CouponError> {
        bincode::encode_to_vec(CodeRecord::from_code(code), bincode::config::standard())
            .map_err(|e| CouponError::Storage(e.to_string()))
    }

    fn decode_record(seq: u64, bytes: &[u8]) -> Result<Code, CouponError> {
        let (record, _): (CodeRecord, usize) =
            bincode::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| CouponError::Storage(e.to_string()))?;
        record.into_code(seq)
    }

    fn next_seq(&self) -> Result<u64, CouponError> {
        let cf = self.cf_handle(CF_METADATA)?;
        match self
            .db
            .get_cf(&cf, META_NEXT_SEQ)
            .map_err(|e| CouponError::Storage(e.to_string()))?
        {
            Some(bytes) => Self::decode_seq(&bytes),
            None => Ok(0),
        }
    }

    fn load_code(&self, seq: u64) -> Result<Option<Code>, CouponError> {
        let cf = self.cf_handle(CF_CODES)?;
        self.db
            .get_cf(&cf, Self::seq_key(seq))
            .map_err(|e| CouponError::Storage(e.to_string()))?
            .map(|bytes| Self::decode_record(seq, &bytes))
            .transpose()
    }

    /// Every code in sequence order.
    fn scan_codes(&self) -> Result<Vec<Code>, CouponError> {
        let cf = self.cf_handle(CF_CODES)?;
        let mut codes = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| CouponError::Storage(e.to_string()))?;
            codes.push(Self::decode_record(Self::decode_seq(&key)?, &value)?);
        }
        Ok(codes)
    }

    fn has_codes(&self) -> Result<bool, CouponError> {
        let cf = self.cf_handle(CF_CODES)?;
        match self.db.iterator_cf(&cf, IteratorMode::Start).next() {
            Some(item) => item
                .map(|_| true)
                .map_err(|e| CouponError::Storage(e.to_string())),
            None => Ok(false),
        }
    }

    /// Stage insertion of a new code. Caller holds the write lock.
    fn stage_insert(
        &self,
        batch: &mut WriteBatch,
        seq: u64,
        value: &str,
        at: DateTime<Utc>,
    ) -> Result<Code, CouponError> {
        let code = Code::new(seq, value, at);
        let key = Self::seq_key(seq);
        batch.put_cf(self.cf_handle(CF_CODES)?, key, Self::encode_record(&code)?);
        batch.put_cf(self.cf_handle(CF_CODE_INDEX)?, value.as_bytes(), key);
        batch.put_cf(self.cf_handle(CF_AVAILABLE)?, key, b"");
        Ok(code)
    }

    /// Stage the release of `code`. Caller holds the write lock.
    fn stage_release(&self, batch: &mut WriteBatch, code: &mut Code) -> Result<(), CouponError> {
        code.release();
        let key = Self::seq_key(code.seq);
        batch.put_cf(self.cf_handle(CF_CODES)?, key, Self::encode_record(code)?);
        batch.put_cf(self.cf_handle(CF_AVAILABLE)?, key, b"");
        Ok(())
    }

    /// Release every claimed code matching `pred` in one batch.
    fn release_where(&self, pred: impl Fn(&Code) -> bool) -> Result<usize, CouponError> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();
        let mut released = 0usize;
        for mut code in self.scan_codes()? {
            if code.status == CodeStatus::Claimed && pred(&code) {
                self.stage_release(&mut batch, &mut code)?;
                released += 1;
            }
        }
        if released > 0 {
            self.db
                .write(batch)
                .map_err(|e| CouponError::Storage(e.to_string()))?;
        }
        Ok(released)
    }
}

impl CouponStore for RocksStore {
    fn insert_code(&self, value: &str, at: DateTime<Utc>) -> Result<Code, CouponError> {
        let _guard = self.write_lock.lock();
        let cf_index = self.cf_handle(CF_CODE_INDEX)?;
        if self
            .db
            .get_cf(&cf_index, value.as_bytes())
            .map_err(|e| CouponError::Storage(e.to_string()))?
            .is_some()
        {
            return Err(CouponError::DuplicateCode(value.to_string()));
        }

        let seq = self.next_seq()?;
        let mut batch = WriteBatch::default();
        let code = self.stage_insert(&mut batch, seq, value, at)?;
        batch.put_cf(self.cf_handle(CF_METADATA)?, META_NEXT_SEQ, Self::seq_key(seq + 1));
        self.db
            .write(batch)
            .map_err(|e| CouponError::Storage(e.to_string()))?;
        Ok(code)
    }

    fn seed_if_empty(&self, values: &[String], at: DateTime<Utc>) -> Result<usize, CouponError> {
        let _guard = self.write_lock.lock();
        if self.has_codes()? {
            return Ok(0);
        }

        let mut seq = self.next_seq()?;
        let mut batch = WriteBatch::default();
        let mut seen = std::collections::HashSet::new();
        for value in values {
            if seen.insert(value.as_str()) {
                self.stage_insert(&mut batch, seq, value, at)?;
                seq += 1;
            }
        }
        batch.put_cf(self.cf_handle(CF_METADATA)?, META_NEXT_SEQ, Self::seq_key(seq));
        self.db
            .write(batch)
            .map_err(|e| CouponError::Storage(e.to_string()))?;
        Ok(seen.len())
    }

    fn get_code(&self, value: &str) -> Result<Option<Code>, CouponError> {
        let cf_index = self.cf_handle(CF_CODE_INDEX)?;
        match self
            .db
            .get_cf(&cf_index, value.as_bytes())
            .map_err(|e| CouponError::Storage(e.to_string()))?
        {
            Some(seq_bytes) => self.load_code(Self::decode_seq(&seq_bytes)?),
            None => Ok(None),
        }
    }

    fn list_codes(&self) -> Result<Vec<Code>, CouponError> {
        self.scan_codes()
    }

    fn stats(&self) -> Result<PoolStats, CouponError> {
        let codes = self.scan_codes()?;
        let available = codes.iter().filter(|c| c.is_available()).count();
        Ok(PoolStats {
            total: codes.len(),
            available,
            claimed: codes.len() - available,
        })
    }

    fn claim_first_available(
        &self,
        claimant: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Code>, CouponError> {
        let _guard = self.write_lock.lock();
        let cf_available = self.cf_handle(CF_AVAILABLE)?;
        let seq = match self.db.iterator_cf(&cf_available, IteratorMode::Start).next() {
            Some(item) => {
                let (key, _) = item.map_err(|e| CouponError::Storage(e.to_string()))?;
                Self::decode_seq(&key)?
            }
            None => return Ok(None),
        };

        let mut code = self
            .load_code(seq)?
            .ok_or_else(|| CouponError::Storage(format!("available index points at missing code {seq}")))?;
        code.claim(claimant, at);

        let key = Self::seq_key(seq);
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_available, key);
        batch.put_cf(self.cf_handle(CF_CODES)?, key, Self::encode_record(&code)?);
        self.db
            .write(batch)
            .map_err(|e| CouponError::Storage(e.to_string()))?;
        Ok(Some(code))
    }

    fn release_claimed_before(&self, threshold: DateTime<Utc>) -> Result<usize, CouponError> {
        self.release_where(|code| code.claimed_before(threshold))
    }

    fn release_all_claimed(&self) -> Result<usize, CouponError> {
        self.release_where(|_| true)
    }

    fn get_cooldown(&self, key: &str) -> Result<Option<CooldownEntry>, CouponError> {
        let cf = self.cf_handle(CF_COOLDOWNS)?;
        match self
            .db
            .get_cf(&cf, key.as_bytes())
            .map_err(|e| CouponError::Storage(e.to_string()))?
        {
            Some(bytes) if bytes.len() == 8 => {
                let mut array = [0u8; 8];
                array.copy_from_slice(&bytes);
                Ok(Some(CooldownEntry {
                    key: key.to_string(),
                    last_claim_at: from_millis(i64::from_le_bytes(array))?,
                }))
            }
            Some(_) => Err(CouponError::Storage("invalid cooldown value length".into())),
            None => Ok(None),
        }
    }

    fn upsert_cooldowns(&self, keys: &[String], at: DateTime<Utc>) -> Result<(), CouponError> {
        let cf = self.cf_handle(CF_COOLDOWNS)?;
        let millis = at.timestamp_millis().to_le_bytes();
        let mut batch = WriteBatch::default();
        for key in keys {
            batch.put_cf(cf, key.as_bytes(), millis);
        }
        self.db
            .write(batch)
            .map_err(|e| CouponError::Storage(e.to_string()))
    }

    fn clear_cooldowns(&self) -> Result<usize, CouponError> {
        let _guard = self.write_lock.lock();
        let cf = self.cf_handle(CF_COOLDOWNS)?;
        let mut batch = WriteBatch::default();
        let mut cleared = 0usize;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| CouponError::Storage(e.to_string()))?;
            batch.delete_cf(cf, key);
            cleared += 1;
        }
        self.db
            .write(batch)
            .map_err(|e| CouponError::Storage(e.to_string()))?;
        Ok(cleared)
    }
}
