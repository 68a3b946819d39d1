//! Model database
//!
//! Append-only log of model transactions with a cumulative BLAKE3 hash after
//! each entry. Clients present the hash they last saw and receive only the
//! transactions appended after it.

use serde::{Deserialize, Serialize};

use super::tx::Tx;
use super::{Ref, Timestamp};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadModelResponse {
    /// `true` when the client hash was unknown and the whole model is sent
    pub full: bool,
    pub hash: String,
    pub transactions: Vec<Tx>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelDb {
    txes: Vec<Tx>,
    /// `hashes[i]` covers `txes[..=i]`
    hashes: Vec<String>,
}

impl ModelDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_txes(txes: impl IntoIterator<Item = Tx>) -> Self {
        let mut db = Self::new();
        for tx in txes {
            db.add(tx);
        }
        db
    }

    /// Append a model tx. Returns false if a tx with that id is already known.
    pub fn add(&mut self, tx: Tx) -> bool {
        if self.contains(&tx.id) {
            return false;
        }
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.hash().as_bytes());
        hasher.update(tx.id.as_bytes());
        self.hashes.push(hasher.finalize().to_hex().to_string());
        self.txes.push(tx);
        true
    }

    pub fn contains(&self, id: &Ref) -> bool {
        self.txes.iter().any(|t| &t.id == id)
    }

    /// Hash of the whole log, empty string for an empty model
    pub fn hash(&self) -> String {
        self.hashes.last().cloned().unwrap_or_default()
    }

    pub fn txes(&self) -> &[Tx] {
        &self.txes
    }

    pub fn len(&self) -> usize {
        self.txes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txes.is_empty()
    }

    pub fn last_modified(&self) -> Timestamp {
        self.txes.iter().map(|t| t.modified_on).max().unwrap_or(0)
    }

    /// Answer a `loadModel` request.
    ///
    /// With a known `hash` only the suffix after it is returned. An unknown
    /// hash yields the full model. Without a hash, transactions newer than
    /// `last` are returned.
    pub fn load_model(&self, last: Timestamp, hash: Option<&str>) -> LoadModelResponse {
        let current = self.hash();
        match hash {
            Some(h) if h == current => LoadModelResponse {
                full: false,
                hash: current,
                transactions: Vec::new(),
            },
            Some(h) => match self.hashes.iter().position(|x| x == h) {
                Some(pos) => LoadModelResponse {
                    full: false,
                    hash: current,
                    transactions: self.txes[pos + 1..].to_vec(),
                },
                None => LoadModelResponse {
                    full: true,
                    hash: current,
                    transactions: self.txes.clone(),
                },
            },
            None => LoadModelResponse {
                full: last <= 0,
                hash: current,
                transactions: self
                    .txes
                    .iter()
                    .filter(|t| t.modified_on > last)
                    .cloned()
                    .collect(),
            },
        }
    }
}

#[cfg(test)]
mod model_db_tests {
    use super::*;
    use crate::model::{classes, spaces, TxFactory};
    use serde_json::Map;

    fn txes(n: usize) -> Vec<Tx> {
        let f = TxFactory::new("core:account:System");
        (0..n)
            .map(|i| f.create_doc(classes::CLASS, spaces::MODEL, &format!("c{}", i), Map::new()))
            .collect()
    }

    #[test]
    fn test_delta_after_known_hash() {
        let all = txes(5);
        let mut db = ModelDb::from_txes(all[..3].to_vec());
        let client_hash = db.hash();
        for tx in &all[3..] {
            db.add(tx.clone());
        }

        let resp = db.load_model(0, Some(&client_hash));
        assert!(!resp.full);
        assert_eq!(resp.transactions.len(), 2);
        assert_eq!(resp.transactions[0].object_id, "c3");
        assert_eq!(resp.hash, db.hash());
    }

    #[test]
    fn test_unknown_hash_sends_full_model() {
        let db = ModelDb::from_txes(txes(4));
        let resp = db.load_model(0, Some("bogus"));
        assert!(resp.full);
        assert_eq!(resp.transactions.len(), 4);
    }

    #[test]
    fn test_current_hash_sends_nothing() {
        let db = ModelDb::from_txes(txes(2));
        let resp = db.load_model(0, Some(&db.hash()));
        assert!(resp.transactions.is_empty());
    }

    #[test]
    fn test_duplicate_add_ignored() {
        let all = txes(1);
        let mut db = ModelDb::new();
        assert!(db.add(all[0].clone()));
        let hash = db.hash();
        assert!(!db.add(all[0].clone()));
        assert_eq!(db.hash(), hash);
        assert_eq!(db.len(), 1);
    }
}
