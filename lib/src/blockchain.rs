use std::{
    path::Path,
    sync::{
        Mutex, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use sled::{
    Tree,
    transaction::{ConflictableTransactionError, TransactionError},
};
use tracing::{debug, info, warn};

use crate::{
    error::{ChainError, Result},
    sha256::Hash,
    types::{Block, Transaction},
};

pub const BLOCKS_TREE: &str = "blocks";
/// Key of the tip pointer inside the blocks tree.
pub const TIP_KEY: &[u8] = b"l";
/// Key of the ledger's difficulty, fixed at creation.
pub const TARGET_BITS_KEY: &[u8] = b"bits";

/// Append-only chain of blocks persisted in sled, plus the tip pointer.
///
/// Every commit (`mine_block`, `add_block`) runs under `commit_lock` and writes the
/// block and the new tip in one sled transaction that first re-checks the stored
/// tip, so two commits can never both extend the same parent.
pub struct Blockchain {
    db: sled::Db,
    blocks: Tree,
    tip: RwLock<Hash>,
    height: AtomicU64,
    commit_lock: Mutex<()>,
    target_bits: u32,
}

impl Blockchain {
    pub fn exists(path: impl AsRef<Path>) -> bool {
        path.as_ref().exists()
    }

    /// Creates a new ledger whose genesis block pays the reward to `reward_address`.
    pub fn create(path: impl AsRef<Path>, reward_address: &str, target_bits: u32) -> Result<Self> {
        let path = path.as_ref();
        if Self::exists(path) {
            return Err(ChainError::AlreadyExists(path.to_path_buf()));
        }

        let (db, blocks) = open_store(path)?;

        let coinbase = Transaction::coinbase(reward_address, crate::GENESIS_COINBASE_DATA)?;
        let genesis = Block::mine(None, vec![coinbase], target_bits)?;
        let bytes = genesis.to_bytes()?;
        let key = genesis.hash.as_bytes();

        blocks
            .transaction(|tx| {
                tx.insert(&key[..], bytes.as_slice())?;
                tx.insert(TIP_KEY, &key[..])?;
                tx.insert(TARGET_BITS_KEY, &target_bits.to_be_bytes()[..])?;
                Ok::<_, ConflictableTransactionError<ChainError>>(())
            })
            .map_err(commit_error)?;
        db.flush()?;

        info!(hash = %genesis.hash, path = %path.display(), "created ledger");

        Ok(Self {
            db,
            blocks,
            tip: RwLock::new(genesis.hash),
            height: AtomicU64::new(0),
            commit_lock: Mutex::new(()),
            target_bits,
        })
    }

    /// Opens an existing ledger with the difficulty it was created with.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !Self::exists(path) {
            return Err(ChainError::NotFound(format!("ledger at {}", path.display())));
        }

        let (db, blocks) = open_store(path)?;
        let tip = read_tip(&blocks)?;
        let target_bits = read_target_bits(&blocks)?;

        let chain = Self {
            db,
            blocks,
            tip: RwLock::new(tip),
            height: AtomicU64::new(0),
            commit_lock: Mutex::new(()),
            target_bits,
        };

        let mut count = 0u64;
        for block in chain.iter() {
            block?;
            count += 1;
        }
        chain.height.store(count.saturating_sub(1), Ordering::SeqCst);

        info!(tip = %tip, height = count.saturating_sub(1), target_bits, "opened ledger");
        Ok(chain)
    }

    pub fn tip(&self) -> Hash {
        *self.tip.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of blocks above genesis.
    pub fn height(&self) -> u64 {
        self.height.load(Ordering::SeqCst)
    }

    pub fn target_bits(&self) -> u32 {
        self.target_bits
    }

    /// Mines a block of `transactions` on top of the current tip and commits it.
    ///
    /// Calls are serialized; if the stored tip still moves underneath the search the
    /// block is mined again on the new tip.
    pub fn mine_block(&self, transactions: Vec<Transaction>) -> Result<Block> {
        let _guard = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            let tip = read_tip(&self.blocks)?;
            match self.mine_locked(tip, transactions.clone()) {
                Err(ChainError::StaleTip(moved)) => {
                    warn!(expected = %tip, found = %moved, "tip moved while mining, retrying");
                }
                result => return result,
            }
        }
    }

    /// Mines `transactions` on top of `parent` only. Fails with `StaleTip`
    /// if the chain has moved past `parent`, so transactions validated
    /// against that tip are never committed on a different one.
    pub fn mine_block_on(&self, parent: Hash, transactions: Vec<Transaction>) -> Result<Block> {
        let _guard = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let tip = read_tip(&self.blocks)?;
        if tip != parent {
            return Err(ChainError::StaleTip(tip));
        }
        self.mine_locked(parent, transactions)
    }

    fn mine_locked(&self, parent: Hash, transactions: Vec<Transaction>) -> Result<Block> {
        let block = Block::mine(Some(parent), transactions, self.target_bits)?;
        self.commit(&block, parent)?;
        info!(hash = %block.hash, nonce = block.nonce, txs = block.transactions.len(), "mined block");
        Ok(block)
    }

    /// Appends a block received from a peer. Returns `false` when the block is
    /// already stored; only blocks extending the current tip are accepted.
    pub fn add_block(&self, block: Block) -> Result<bool> {
        if !block.is_valid(self.target_bits)? {
            return Err(ChainError::InvalidBlock {
                hash: block.hash,
                reason: "hash does not match contents or target".into(),
            });
        }

        let _guard = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if self.blocks.contains_key(block.hash.as_bytes())? {
            debug!(hash = %block.hash, "block already stored");
            return Ok(false);
        }

        let tip = read_tip(&self.blocks)?;
        if block.prev_block_hash != Some(tip) {
            return Err(ChainError::InvalidBlock {
                hash: block.hash,
                reason: format!("does not extend tip {tip}"),
            });
        }

        self.commit(&block, tip).map_err(|e| match e {
            ChainError::StaleTip(_) => ChainError::InvalidBlock {
                hash: block.hash,
                reason: "tip moved during commit".into(),
            },
            e => e,
        })?;
        info!(hash = %block.hash, "added block");
        Ok(true)
    }

    fn commit(&self, block: &Block, expected_tip: Hash) -> Result<()> {
        let bytes = block.to_bytes()?;
        let key = block.hash.as_bytes();
        let expected = expected_tip.as_bytes();

        self.blocks
            .transaction(|tx| {
                let current = tx.get(TIP_KEY)?;
                if current.as_deref() != Some(&expected[..]) {
                    let found = match current {
                        Some(bytes) => Hash::from_slice(&bytes),
                        None => Ok(Hash::zero()),
                    };
                    let err = match found {
                        Ok(hash) => ChainError::StaleTip(hash),
                        Err(e) => e,
                    };
                    return Err(ConflictableTransactionError::Abort(err));
                }
                tx.insert(&key[..], bytes.as_slice())?;
                tx.insert(TIP_KEY, &key[..])?;
                Ok(())
            })
            .map_err(commit_error)?;
        self.db.flush()?;

        *self.tip.write().unwrap_or_else(PoisonError::into_inner) = block.hash;
        self.height.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Iterates from the tip captured now back to genesis.
    pub fn iter(&self) -> BlockIter {
        self.iter_from(self.tip())
    }

    /// Iterates from `hash` back to genesis.
    pub fn iter_from(&self, hash: Hash) -> BlockIter {
        BlockIter {
            blocks: self.blocks.clone(),
            next: Some(hash),
        }
    }

    pub fn get_block(&self, hash: &Hash) -> Result<Block> {
        load_block(&self.blocks, hash)
    }

    pub fn contains(&self, hash: &Hash) -> Result<bool> {
        Ok(self.blocks.contains_key(hash.as_bytes())?)
    }

    /// Hashes of every block, tip first.
    pub fn block_hashes(&self) -> Result<Vec<Hash>> {
        self.iter().map(|block| block.map(|b| b.hash)).collect()
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Backward walk over the chain. Yields an error once and stops if a block
/// cannot be loaded.
pub struct BlockIter {
    blocks: Tree,
    next: Option<Hash>,
}

impl Iterator for BlockIter {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.next.take()?;
        match load_block(&self.blocks, &hash) {
            Ok(block) => {
                self.next = block.prev_block_hash;
                Some(Ok(block))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

fn open_store(path: &Path) -> Result<(sled::Db, Tree)> {
    let db = sled::open(path)
        .map_err(|e| ChainError::StoreFatal(format!("{}: {e}", path.display())))?;
    let blocks = db
        .open_tree(BLOCKS_TREE)
        .map_err(|e| ChainError::StoreFatal(format!("tree {BLOCKS_TREE}: {e}")))?;
    Ok((db, blocks))
}

fn read_tip(blocks: &Tree) -> Result<Hash> {
    let Some(tip) = blocks.get(TIP_KEY)? else {
        return Err(ChainError::CorruptData("ledger has no tip pointer".into()));
    };
    Hash::from_slice(&tip)
}

fn read_target_bits(blocks: &Tree) -> Result<u32> {
    let Some(bytes) = blocks.get(TARGET_BITS_KEY)? else {
        return Err(ChainError::CorruptData("ledger has no difficulty entry".into()));
    };
    let bytes: [u8; 4] = bytes
        .as_ref()
        .try_into()
        .map_err(|_| ChainError::CorruptData("malformed difficulty entry".into()))?;
    Ok(u32::from_be_bytes(bytes))
}

fn load_block(blocks: &Tree, hash: &Hash) -> Result<Block> {
    let Some(bytes) = blocks.get(hash.as_bytes())? else {
        return Err(ChainError::NotFound(format!("block {hash}")));
    };
    Block::from_bytes(&bytes)
}

fn commit_error(e: TransactionError<ChainError>) -> ChainError {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => ChainError::StoreIo(e),
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, thread};

    use tempfile::TempDir;

    use super::*;

    const TEST_BITS: u32 = 8;

    fn new_chain() -> (TempDir, Blockchain) {
        let dir = TempDir::new().unwrap();
        let chain = Blockchain::create(dir.path().join("chain"), "alice", TEST_BITS).unwrap();
        (dir, chain)
    }

    fn coinbase() -> Vec<Transaction> {
        vec![Transaction::coinbase("miner", "").unwrap()]
    }

    #[test]
    fn create_refuses_existing_ledger_and_open_requires_one() {
        let (dir, chain) = new_chain();
        drop(chain);

        let path = dir.path().join("chain");
        assert!(matches!(
            Blockchain::create(&path, "bob", TEST_BITS),
            Err(ChainError::AlreadyExists(_))
        ));
        assert!(matches!(
            Blockchain::open(dir.path().join("missing")),
            Err(ChainError::NotFound(_))
        ));
    }

    #[test]
    fn k_blocks_link_back_to_genesis() {
        let (_dir, chain) = new_chain();
        let k = 4;
        for _ in 0..k {
            chain.mine_block(coinbase()).unwrap();
        }

        let blocks: Vec<Block> = chain.iter().collect::<Result<_>>().unwrap();
        assert_eq!(blocks.len(), k + 1);
        assert_eq!(chain.height(), k as u64);
        assert_eq!(blocks[0].hash, chain.tip());
        for pair in blocks.windows(2) {
            assert_eq!(pair[0].prev_block_hash, Some(pair[1].hash));
        }
        assert!(blocks.last().unwrap().is_genesis());

        for block in &blocks {
            assert!(block.is_valid(TEST_BITS).unwrap());
        }
    }

    #[test]
    fn reopen_restores_tip_and_height() {
        let (dir, chain) = new_chain();
        let mined = chain.mine_block(coinbase()).unwrap();
        drop(chain);

        let chain = Blockchain::open(dir.path().join("chain")).unwrap();
        assert_eq!(chain.target_bits(), TEST_BITS);
        assert_eq!(chain.tip(), mined.hash);
        assert_eq!(chain.height(), 1);
        assert_eq!(chain.get_block(&mined.hash).unwrap(), mined);
    }

    #[test]
    fn missing_and_corrupt_blocks_fail_loudly() {
        let (_dir, chain) = new_chain();
        let missing = Hash::digest(b"nowhere").unwrap();
        assert!(matches!(chain.get_block(&missing), Err(ChainError::NotFound(_))));

        chain.blocks.insert(missing.as_bytes(), &b"garbage"[..]).unwrap();
        assert!(matches!(chain.get_block(&missing), Err(ChainError::CorruptData(_))));
    }

    #[test]
    fn iterator_keeps_its_snapshot_tip() {
        let (_dir, chain) = new_chain();
        let iter = chain.iter();
        chain.mine_block(coinbase()).unwrap();

        assert_eq!(iter.count(), 1);
        assert_eq!(chain.iter().count(), 2);
    }

    #[test]
    fn concurrent_mining_never_forks() {
        let (_dir, chain) = new_chain();
        let chain = Arc::new(chain);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let chain = chain.clone();
                thread::spawn(move || chain.mine_block(coinbase()).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let blocks: Vec<Block> = chain.iter().collect::<Result<_>>().unwrap();
        assert_eq!(blocks.len(), 5);
        let parents: HashSet<_> = blocks.iter().map(|b| b.prev_block_hash).collect();
        assert_eq!(parents.len(), blocks.len());
    }

    #[test]
    fn add_block_accepts_only_linear_extensions() {
        let (_dir, chain) = new_chain();
        let (_other_dir, other) = new_chain();

        let tip = chain.tip();
        let next = Block::mine(Some(tip), coinbase(), TEST_BITS).unwrap();
        assert!(chain.add_block(next.clone()).unwrap());
        assert!(!chain.add_block(next.clone()).unwrap());
        assert_eq!(chain.tip(), next.hash);

        let foreign = other.mine_block(coinbase()).unwrap();
        assert!(matches!(
            chain.add_block(foreign),
            Err(ChainError::InvalidBlock { .. })
        ));

        let mut forged = Block::mine(Some(next.hash), coinbase(), TEST_BITS).unwrap();
        forged.nonce += 1;
        assert!(matches!(
            chain.add_block(forged),
            Err(ChainError::InvalidBlock { .. })
        ));
    }

    #[test]
    fn mining_on_a_stale_parent_is_refused() {
        let (_dir, chain) = new_chain();
        let genesis = chain.tip();
        let moved = chain.mine_block(coinbase()).unwrap();

        assert!(matches!(
            chain.mine_block_on(genesis, coinbase()),
            Err(ChainError::StaleTip(tip)) if tip == moved.hash
        ));
        assert_eq!(chain.height(), 1);

        let next = chain.mine_block_on(moved.hash, coinbase()).unwrap();
        assert_eq!(next.prev_block_hash, Some(moved.hash));
        assert_eq!(chain.tip(), next.hash);
    }

    #[test]
    fn block_hashes_run_tip_to_genesis() {
        let (_dir, chain) = new_chain();
        let mined = chain.mine_block(coinbase()).unwrap();
        let hashes = chain.block_hashes().unwrap();

        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0], mined.hash);
        assert_eq!(Some(hashes[1]), mined.prev_block_hash);
        assert!(chain.contains(&mined.hash).unwrap());
        assert!(!chain.contains(&Hash::zero()).unwrap());
    }
}
