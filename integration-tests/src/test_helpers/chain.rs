use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::Transaction;
use custody_engine::chain::ChainService;

/// Chain service that records submissions instead of gossiping them.
pub struct TestChain {
    accept: AtomicBool,
    height: AtomicU32,
    submitted: Mutex<Vec<Transaction>>,
}

impl TestChain {
    pub fn new(accept: bool, height: u32) -> Self {
        Self {
            accept: AtomicBool::new(accept),
            height: AtomicU32::new(height),
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn submitted(&self) -> Vec<Transaction> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn set_height(&self, height: u32) {
        self.height.store(height, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChainService for TestChain {
    async fn submit_transaction(&self, tx: &Transaction) -> eyre::Result<()> {
        if !self.accept.load(Ordering::SeqCst) {
            return Err(eyre::eyre!("no peers connected"));
        }
        self.submitted.lock().unwrap().push(tx.clone());
        Ok(())
    }

    async fn best_block_height(&self) -> eyre::Result<u32> {
        Ok(self.height.load(Ordering::SeqCst))
    }
}
