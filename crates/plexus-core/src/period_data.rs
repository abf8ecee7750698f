//! Period data: everything a peer needs to replay one finalized period.

use crate::bundle::{decode_votes_bundle_from, encode_votes_bundle};
use crate::dag::{DagBlock, Transaction};
use crate::pillar::PillarVote;
use crate::rlp::{append_bytes, append_list, wrap_list, RlpCursor};
use crate::vote::Vote;
use crate::{CoreError, Hash, PbftBlock, Result};
use std::sync::Arc;

/// The unit of PBFT sync: a finalized block, the 2t+1 cert votes that
/// finalized it, its DAG block closure and transactions, and (since the
/// checkpoint fork) the pillar votes observed for the period.
#[derive(Debug, Clone)]
pub struct PeriodData {
    pub pbft_block: Arc<PbftBlock>,
    pub cert_votes: Vec<Arc<Vote>>,
    pub dag_blocks: Vec<DagBlock>,
    pub transactions: Vec<Transaction>,
    pub pillar_votes: Option<Vec<PillarVote>>,
}

impl PeriodData {
    pub fn new(
        pbft_block: Arc<PbftBlock>,
        cert_votes: Vec<Arc<Vote>>,
        dag_blocks: Vec<DagBlock>,
        transactions: Vec<Transaction>,
        pillar_votes: Option<Vec<PillarVote>>,
    ) -> Self {
        Self { pbft_block, cert_votes, dag_blocks, transactions, pillar_votes }
    }

    /// RLP: [pbft_block, cert_votes_bundle | "", [dag_blocks], [txs]] with
    /// an optional fifth item of pillar votes.
    pub fn rlp(&self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();

        payload.extend_from_slice(&self.pbft_block.rlp(true));

        // The first period is bootstrapped without certifying votes
        if self.pbft_block.period() > 1 && !self.cert_votes.is_empty() {
            payload.extend_from_slice(&encode_votes_bundle(&self.cert_votes)?);
        } else {
            append_bytes(&mut payload, &[]);
        }

        let mut dag_payload = Vec::new();
        for dag_block in &self.dag_blocks {
            dag_payload.extend_from_slice(&dag_block.rlp());
        }
        append_list(&mut payload, &dag_payload);

        let mut txs_payload = Vec::new();
        for tx in &self.transactions {
            txs_payload.extend_from_slice(&tx.rlp());
        }
        append_list(&mut payload, &txs_payload);

        if let Some(pillar_votes) = &self.pillar_votes {
            let mut pillar_payload = Vec::new();
            for vote in pillar_votes {
                pillar_payload.extend_from_slice(&vote.rlp(true));
            }
            append_list(&mut payload, &pillar_payload);
        }

        Ok(wrap_list(&payload))
    }

    pub fn from_rlp(bytes: &[u8]) -> Result<Self> {
        let mut cursor = RlpCursor::from_encoded(bytes)?;
        let item_count = cursor.remaining_items()?;
        if item_count != 4 && item_count != 5 {
            return Err(CoreError::Rlp(format!("period data has {item_count} items")));
        }

        let mut block_cursor = cursor.next_list()?;
        let pbft_block = Arc::new(PbftBlock::rlp_decode(&mut block_cursor)?);

        // Cert votes item is a bundle list for periods past 1, the empty
        // string otherwise
        let raw_votes = cursor.next_raw()?;
        let cert_votes =
            if pbft_block.period() > 1 && raw_votes.first().is_some_and(|b| *b >= 0xc0) {
                let mut votes_cursor = RlpCursor::from_encoded(raw_votes)?;
                decode_votes_bundle_from(&mut votes_cursor)?
            } else {
                Vec::new()
            };

        let mut dag_cursor = cursor.next_list()?;
        let mut dag_blocks = Vec::new();
        while !dag_cursor.is_empty() {
            let mut one = dag_cursor.next_list()?;
            dag_blocks.push(DagBlock::rlp_decode(&mut one)?);
        }

        let mut txs_cursor = cursor.next_list()?;
        let mut transactions = Vec::new();
        while !txs_cursor.is_empty() {
            let mut one = txs_cursor.next_list()?;
            transactions.push(Transaction::rlp_decode(&mut one)?);
        }

        let pillar_votes = if item_count == 5 {
            let mut pillar_cursor = cursor.next_list()?;
            let mut votes = Vec::new();
            while !pillar_cursor.is_empty() {
                let mut one = pillar_cursor.next_list()?;
                votes.push(PillarVote::rlp_decode(&mut one)?);
            }
            Some(votes)
        } else {
            None
        };

        Ok(Self { pbft_block, cert_votes, dag_blocks, transactions, pillar_votes })
    }

    /// Hashes of the DAG blocks in declared order.
    pub fn dag_block_hashes(&self) -> Vec<Hash> {
        self.dag_blocks.iter().map(|b| b.hash()).collect()
    }

    /// Hashes of the carried transactions in declared order.
    pub fn transaction_hashes(&self) -> Vec<Hash> {
        self.transactions.iter().map(|t| t.hash()).collect()
    }
}

impl PartialEq for PeriodData {
    fn eq(&self, other: &Self) -> bool {
        self.pbft_block == other.pbft_block
            && self.cert_votes == other.cert_votes
            && self.dag_blocks == other.dag_blocks
            && self.transactions == other.transactions
            && self.pillar_votes == other.pillar_votes
    }
}

impl Eq for PeriodData {}
