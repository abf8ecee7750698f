use crate::{Result, StorageError};
use plexus_core::bundle::{decode_full_votes, encode_full_votes};
use plexus_core::{Hash, PbftBlock, PbftPeriod, PbftRound, PeriodData, Vote};
use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Column family names
const CF_PBFT_HEAD: &str = "pbft_head";
const CF_PERIOD_DATA: &str = "period_data";
const CF_MGR_FIELD: &str = "pbft_mgr_field";
const CF_MGR_STATUS: &str = "pbft_mgr_status";
const CF_MGR_VOTED_VALUE: &str = "pbft_mgr_voted_value";
const CF_NEXT_VOTES: &str = "next_votes";
const CF_PBFT_2T1: &str = "pbft_2t1";
const CF_SOFT_VOTES: &str = "soft_votes";
const CF_CERT_VOTED_BLOCK: &str = "pbft_cert_voted_block";
const CF_VERIFIED_VOTES: &str = "verified_votes";
const CF_DAG_PERIOD: &str = "dag_period";
const CF_BLOCK_PERIOD: &str = "pbft_block_period";

const HEAD_KEY: &[u8] = b"head";

/// PBFT manager crash-recovery scalar fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgrField {
    Round,
    Step,
    PreviousRoundSortitionThreshold,
    PreviousRoundTotalStake,
}

/// PBFT manager crash-recovery boolean flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgrStatus {
    ExecutedInRound,
    NextVotedNullBlockHash,
    NextVotedSoftValue,
    SoftVotedBlockInRound,
    ExecutedBlock,
}

/// PBFT manager crash-recovery voted values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgrVotedValue {
    OwnStartingValueInRound,
    SoftVotedBlockHashInRound,
    LastCertVotedValue,
}

impl MgrField {
    fn key(self) -> &'static [u8] {
        match self {
            MgrField::Round => b"round",
            MgrField::Step => b"step",
            MgrField::PreviousRoundSortitionThreshold => b"prev_sortition_threshold",
            MgrField::PreviousRoundTotalStake => b"prev_total_stake",
        }
    }
}

impl MgrStatus {
    fn key(self) -> &'static [u8] {
        match self {
            MgrStatus::ExecutedInRound => b"executed_in_round",
            MgrStatus::NextVotedNullBlockHash => b"next_voted_null",
            MgrStatus::NextVotedSoftValue => b"next_voted_soft",
            MgrStatus::SoftVotedBlockInRound => b"soft_voted_block_in_round",
            MgrStatus::ExecutedBlock => b"executed_block",
        }
    }
}

impl MgrVotedValue {
    fn key(self) -> &'static [u8] {
        match self {
            MgrVotedValue::OwnStartingValueInRound => b"own_starting_value",
            MgrVotedValue::SoftVotedBlockHashInRound => b"soft_voted_block_hash",
            MgrVotedValue::LastCertVotedValue => b"last_cert_voted_value",
        }
    }
}

/// JSON descriptor of the chain tip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PbftHead {
    pub block_hash: String,
    pub period: PbftPeriod,
    pub prev_block_hash: String,
}

impl PbftHead {
    pub fn new(block_hash: &Hash, period: PbftPeriod, prev_block_hash: &Hash) -> Self {
        Self {
            block_hash: hex::encode(block_hash),
            period,
            prev_block_hash: hex::encode(prev_block_hash),
        }
    }
}

/// Consensus database over RocksDB column families.
pub struct ConsensusDb {
    db: Arc<DB>,
}

impl ConsensusDb {
    /// Open (creating if missing) the consensus database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(10000);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let cfs = [
            CF_PBFT_HEAD,
            CF_PERIOD_DATA,
            CF_MGR_FIELD,
            CF_MGR_STATUS,
            CF_MGR_VOTED_VALUE,
            CF_NEXT_VOTES,
            CF_PBFT_2T1,
            CF_SOFT_VOTES,
            CF_CERT_VOTED_BLOCK,
            CF_VERIFIED_VOTES,
            CF_DAG_PERIOD,
            CF_BLOCK_PERIOD,
        ]
        .iter()
        .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
        .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Start an atomic write batch.
    pub fn batch(&self) -> WriteBatch {
        WriteBatch::default()
    }

    /// Commit an atomic write batch.
    pub fn commit(&self, batch: WriteBatch) -> Result<()> {
        self.db.write(batch)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Database(format!("column family {name} not found")))
    }

    // ── chain head ──────────────────────────────────────────────────────

    pub fn put_head(&self, batch: &mut WriteBatch, head: &PbftHead) -> Result<()> {
        let bytes = serde_json::to_vec(head)?;
        batch.put_cf(self.cf(CF_PBFT_HEAD)?, HEAD_KEY, bytes);
        Ok(())
    }

    pub fn head(&self) -> Result<Option<PbftHead>> {
        match self.db.get_cf(self.cf(CF_PBFT_HEAD)?, HEAD_KEY)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    // ── period data ─────────────────────────────────────────────────────

    pub fn put_period_data(
        &self,
        batch: &mut WriteBatch,
        period: PbftPeriod,
        data: &PeriodData,
    ) -> Result<()> {
        let bytes = data.rlp()?;
        batch.put_cf(self.cf(CF_PERIOD_DATA)?, period.to_be_bytes(), bytes);
        batch.put_cf(
            self.cf(CF_BLOCK_PERIOD)?,
            data.pbft_block.hash(),
            period.to_be_bytes(),
        );
        Ok(())
    }

    pub fn period_data(&self, period: PbftPeriod) -> Result<Option<PeriodData>> {
        match self.db.get_cf(self.cf(CF_PERIOD_DATA)?, period.to_be_bytes())? {
            Some(bytes) => Ok(Some(PeriodData::from_rlp(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The period a finalized PBFT block was committed in, if any.
    pub fn block_period(&self, block_hash: &Hash) -> Result<Option<PbftPeriod>> {
        match self.db.get_cf(self.cf(CF_BLOCK_PERIOD)?, block_hash)? {
            Some(bytes) => Ok(Some(decode_period(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_dag_period(
        &self,
        batch: &mut WriteBatch,
        dag_block_hash: &Hash,
        period: PbftPeriod,
    ) -> Result<()> {
        batch.put_cf(self.cf(CF_DAG_PERIOD)?, dag_block_hash, period.to_be_bytes());
        Ok(())
    }

    pub fn dag_period(&self, dag_block_hash: &Hash) -> Result<Option<PbftPeriod>> {
        match self.db.get_cf(self.cf(CF_DAG_PERIOD)?, dag_block_hash)? {
            Some(bytes) => Ok(Some(decode_period(&bytes)?)),
            None => Ok(None),
        }
    }

    // ── PBFT manager crash-recovery state ───────────────────────────────

    pub fn put_mgr_field(&self, batch: &mut WriteBatch, field: MgrField, value: u64) -> Result<()> {
        batch.put_cf(self.cf(CF_MGR_FIELD)?, field.key(), value.to_be_bytes());
        Ok(())
    }

    pub fn mgr_field(&self, field: MgrField) -> Result<Option<u64>> {
        match self.db.get_cf(self.cf(CF_MGR_FIELD)?, field.key())? {
            Some(bytes) => Ok(Some(decode_period(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_mgr_status(
        &self,
        batch: &mut WriteBatch,
        status: MgrStatus,
        value: bool,
    ) -> Result<()> {
        batch.put_cf(self.cf(CF_MGR_STATUS)?, status.key(), [value as u8]);
        Ok(())
    }

    pub fn mgr_status(&self, status: MgrStatus) -> Result<bool> {
        match self.db.get_cf(self.cf(CF_MGR_STATUS)?, status.key())? {
            Some(bytes) => Ok(bytes.first() == Some(&1)),
            None => Ok(false),
        }
    }

    pub fn put_mgr_voted_value(
        &self,
        batch: &mut WriteBatch,
        field: MgrVotedValue,
        value: &Hash,
    ) -> Result<()> {
        batch.put_cf(self.cf(CF_MGR_VOTED_VALUE)?, field.key(), value);
        Ok(())
    }

    pub fn mgr_voted_value(&self, field: MgrVotedValue) -> Result<Option<Hash>> {
        match self.db.get_cf(self.cf(CF_MGR_VOTED_VALUE)?, field.key())? {
            Some(bytes) => {
                let hash: Hash = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::Corrupt("voted value width".into()))?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    // ── per-round vote groups ───────────────────────────────────────────

    pub fn put_next_votes(
        &self,
        batch: &mut WriteBatch,
        round: PbftRound,
        votes: &[Arc<Vote>],
    ) -> Result<()> {
        batch.put_cf(self.cf(CF_NEXT_VOTES)?, round.to_be_bytes(), encode_full_votes(votes));
        Ok(())
    }

    pub fn next_votes(&self, round: PbftRound) -> Result<Vec<Arc<Vote>>> {
        match self.db.get_cf(self.cf(CF_NEXT_VOTES)?, round.to_be_bytes())? {
            Some(bytes) => Ok(decode_full_votes(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn remove_next_votes(&self, batch: &mut WriteBatch, round: PbftRound) -> Result<()> {
        batch.delete_cf(self.cf(CF_NEXT_VOTES)?, round.to_be_bytes());
        Ok(())
    }

    pub fn put_two_t_plus_one(
        &self,
        batch: &mut WriteBatch,
        round: PbftRound,
        value: u64,
    ) -> Result<()> {
        batch.put_cf(self.cf(CF_PBFT_2T1)?, round.to_be_bytes(), value.to_be_bytes());
        Ok(())
    }

    pub fn two_t_plus_one(&self, round: PbftRound) -> Result<Option<u64>> {
        match self.db.get_cf(self.cf(CF_PBFT_2T1)?, round.to_be_bytes())? {
            Some(bytes) => Ok(Some(decode_period(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_soft_votes(
        &self,
        batch: &mut WriteBatch,
        round: PbftRound,
        votes: &[Arc<Vote>],
    ) -> Result<()> {
        batch.put_cf(self.cf(CF_SOFT_VOTES)?, round.to_be_bytes(), encode_full_votes(votes));
        Ok(())
    }

    pub fn soft_votes(&self, round: PbftRound) -> Result<Vec<Arc<Vote>>> {
        match self.db.get_cf(self.cf(CF_SOFT_VOTES)?, round.to_be_bytes())? {
            Some(bytes) => Ok(decode_full_votes(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn remove_soft_votes(&self, batch: &mut WriteBatch, round: PbftRound) -> Result<()> {
        batch.delete_cf(self.cf(CF_SOFT_VOTES)?, round.to_be_bytes());
        Ok(())
    }

    // ── cert-voted block (resume) ───────────────────────────────────────

    pub fn put_cert_voted_block(&self, batch: &mut WriteBatch, block: &PbftBlock) -> Result<()> {
        batch.put_cf(self.cf(CF_CERT_VOTED_BLOCK)?, block.hash(), block.rlp(true));
        Ok(())
    }

    pub fn cert_voted_block(&self, hash: &Hash) -> Result<Option<PbftBlock>> {
        match self.db.get_cf(self.cf(CF_CERT_VOTED_BLOCK)?, hash)? {
            Some(bytes) => Ok(Some(PbftBlock::from_rlp(&bytes)?)),
            None => Ok(None),
        }
    }

    // ── verified votes (warm restart) ───────────────────────────────────

    pub fn put_verified_vote(&self, vote: &Vote) -> Result<()> {
        self.db
            .put_cf(self.cf(CF_VERIFIED_VOTES)?, vote.hash(), vote.rlp(true, true))?;
        Ok(())
    }

    pub fn verified_votes(&self) -> Result<Vec<Arc<Vote>>> {
        let mut votes = Vec::new();
        for entry in self.db.iterator_cf(self.cf(CF_VERIFIED_VOTES)?, rocksdb::IteratorMode::Start)
        {
            let (_, value) = entry?;
            votes.push(Arc::new(Vote::from_rlp(&value)?));
        }
        Ok(votes)
    }

    pub fn clear_verified_votes(&self) -> Result<()> {
        let keys: Vec<Box<[u8]>> = self
            .db
            .iterator_cf(self.cf(CF_VERIFIED_VOTES)?, rocksdb::IteratorMode::Start)
            .map(|entry| entry.map(|(key, _)| key))
            .collect::<std::result::Result<_, _>>()?;
        let mut batch = WriteBatch::default();
        for key in keys {
            batch.delete_cf(self.cf(CF_VERIFIED_VOTES)?, key);
        }
        self.db.write(batch)?;
        Ok(())
    }
}

fn decode_period(bytes: &[u8]) -> Result<u64> {
    let fixed: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StorageError::Corrupt("u64 key width".into()))?;
    Ok(u64::from_be_bytes(fixed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_core::vote::{SortitionMessage, VoteType};
    use plexus_core::{DagBlock, Transaction, VrfSortition};
    use plexus_crypto::vrf::VrfKeypair;
    use plexus_crypto::KeyPair;
    use tempfile::TempDir;

    fn make_vote(seed: u8, block_hash: Hash, period: u64, round: u64, step: u64) -> Arc<Vote> {
        let keypair = KeyPair::from_secret(&[seed; 32]).unwrap();
        let vrf = VrfKeypair::from_seed(&[seed; 32]);
        let message = SortitionMessage::new(VoteType::from_step(step), period, round, step);
        let sortition = VrfSortition::generate(&vrf, message);
        Arc::new(Vote::new(&keypair, sortition, block_hash).unwrap())
    }

    fn make_period_data(period: u64) -> PeriodData {
        let keypair = KeyPair::generate();
        let block = Arc::new(
            PbftBlock::new([1; 32], [2; 32], [3; 32], period, [4; 20], 1000, &keypair).unwrap(),
        );
        let cert_votes = if period > 1 {
            vec![make_vote(1, [9; 32], period - 1, 1, 3)]
        } else {
            vec![]
        };
        PeriodData::new(
            block,
            cert_votes,
            vec![DagBlock::new([2; 32], 1, vec![], vec![])],
            vec![Transaction::new(0, b"x".to_vec())],
            None,
        )
    }

    #[test]
    fn test_open_and_head_round_trip() {
        let dir = TempDir::new().unwrap();
        let db = ConsensusDb::open(dir.path()).unwrap();
        assert!(db.head().unwrap().is_none());

        let head = PbftHead::new(&[5; 32], 7, &[4; 32]);
        let mut batch = db.batch();
        db.put_head(&mut batch, &head).unwrap();
        db.commit(batch).unwrap();

        assert_eq!(db.head().unwrap(), Some(head));
    }

    #[test]
    fn test_period_data_round_trip() {
        let dir = TempDir::new().unwrap();
        let db = ConsensusDb::open(dir.path()).unwrap();

        let data = make_period_data(3);
        let block_hash = *data.pbft_block.hash();
        let mut batch = db.batch();
        db.put_period_data(&mut batch, 3, &data).unwrap();
        db.commit(batch).unwrap();

        let loaded = db.period_data(3).unwrap().unwrap();
        assert_eq!(loaded, data);
        assert_eq!(db.block_period(&block_hash).unwrap(), Some(3));
        assert!(db.period_data(4).unwrap().is_none());
    }

    #[test]
    fn test_mgr_state_round_trip() {
        let dir = TempDir::new().unwrap();
        let db = ConsensusDb::open(dir.path()).unwrap();

        let mut batch = db.batch();
        db.put_mgr_field(&mut batch, MgrField::Round, 12).unwrap();
        db.put_mgr_status(&mut batch, MgrStatus::NextVotedSoftValue, true).unwrap();
        db.put_mgr_voted_value(&mut batch, MgrVotedValue::LastCertVotedValue, &[8; 32])
            .unwrap();
        db.commit(batch).unwrap();

        assert_eq!(db.mgr_field(MgrField::Round).unwrap(), Some(12));
        assert_eq!(db.mgr_field(MgrField::Step).unwrap(), None);
        assert!(db.mgr_status(MgrStatus::NextVotedSoftValue).unwrap());
        assert!(!db.mgr_status(MgrStatus::ExecutedBlock).unwrap());
        assert_eq!(
            db.mgr_voted_value(MgrVotedValue::LastCertVotedValue).unwrap(),
            Some([8; 32])
        );
    }

    #[test]
    fn test_next_votes_round_trip_and_remove() {
        let dir = TempDir::new().unwrap();
        let db = ConsensusDb::open(dir.path()).unwrap();

        let votes = vec![make_vote(1, [0; 32], 1, 2, 5), make_vote(2, [7; 32], 1, 2, 5)];
        let mut batch = db.batch();
        db.put_next_votes(&mut batch, 2, &votes).unwrap();
        db.put_two_t_plus_one(&mut batch, 2, 3).unwrap();
        db.commit(batch).unwrap();

        let loaded = db.next_votes(2).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].hash(), votes[0].hash());
        assert_eq!(db.two_t_plus_one(2).unwrap(), Some(3));

        let mut batch = db.batch();
        db.remove_next_votes(&mut batch, 2).unwrap();
        db.commit(batch).unwrap();
        assert!(db.next_votes(2).unwrap().is_empty());
    }

    #[test]
    fn test_cert_voted_block_round_trip() {
        let dir = TempDir::new().unwrap();
        let db = ConsensusDb::open(dir.path()).unwrap();

        let keypair = KeyPair::generate();
        let block =
            PbftBlock::new([1; 32], [2; 32], [3; 32], 5, [4; 20], 99, &keypair).unwrap();

        let mut batch = db.batch();
        db.put_cert_voted_block(&mut batch, &block).unwrap();
        db.commit(batch).unwrap();

        let loaded = db.cert_voted_block(block.hash()).unwrap().unwrap();
        assert_eq!(&loaded, &block);
    }

    #[test]
    fn test_verified_votes_warm_restart_set() {
        let dir = TempDir::new().unwrap();
        let db = ConsensusDb::open(dir.path()).unwrap();

        let a = make_vote(1, [0xaa; 32], 1, 1, 2);
        a.calculate_weight(5, 10, 5).unwrap();
        let b = make_vote(2, [0xbb; 32], 1, 1, 3);
        b.calculate_weight(5, 10, 5).unwrap();

        db.put_verified_vote(&a).unwrap();
        db.put_verified_vote(&b).unwrap();

        let loaded = db.verified_votes().unwrap();
        assert_eq!(loaded.len(), 2);
        // Weights persisted alongside the votes
        for vote in &loaded {
            assert!(vote.weight().is_some());
        }

        db.clear_verified_votes().unwrap();
        assert!(db.verified_votes().unwrap().is_empty());
    }
}
