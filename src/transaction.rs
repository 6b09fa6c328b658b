use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::Error;

/// A store that can take part in a transaction.
#[async_trait]
pub trait Transactional: Send + Sync {
    /// Begins a transaction.
    async fn begin_transaction(&self) -> Result<(), Error>;

    /// Commits the current transaction.
    async fn commit_transaction(&self) -> Result<(), Error>;

    /// Discards every change made since the beginning of the current transaction.
    async fn rollback_transaction(&self) -> Result<(), Error>;
}

/// Spans a transaction over several stores.
///
/// Transactions can be nested: only the outermost [begin](Self::begin) and
/// [commit](Self::commit) reach the stores. A [rollback](Self::rollback) at any level rolls
/// everything back.
pub struct TransactionManager {
    participants: Vec<Arc<dyn Transactional>>,
    level: AtomicUsize,
}

impl TransactionManager {
    /// Creates a manager for the given stores.
    pub fn new(participants: Vec<Arc<dyn Transactional>>) -> Self {
        Self {
            participants,
            level: AtomicUsize::new(0),
        }
    }

    /// Whether a transaction is in progress.
    pub fn in_transaction(&self) -> bool {
        self.level.load(Ordering::SeqCst) > 0
    }

    /// Begins a transaction, or enters a nested one.
    pub async fn begin(&self) -> Result<(), Error> {
        if self.level.fetch_add(1, Ordering::SeqCst) > 0 {
            return Ok(());
        }
        for (index, participant) in self.participants.iter().enumerate() {
            if let Err(error) = participant.begin_transaction().await {
                for begun in &self.participants[..index] {
                    if let Err(rollback_error) = begun.rollback_transaction().await {
                        log::error!("Could not roll back a begun transaction: {rollback_error}");
                    }
                }
                self.level.store(0, Ordering::SeqCst);
                return Err(Error::transaction(error));
            }
        }
        Ok(())
    }

    /// Leaves the current transaction, committing the stores when leaving the outermost one.
    pub async fn commit(&self) -> Result<(), Error> {
        match self.level.load(Ordering::SeqCst) {
            0 => Err(no_transaction()),
            1 => {
                self.level.store(0, Ordering::SeqCst);
                for participant in &self.participants {
                    participant
                        .commit_transaction()
                        .await
                        .map_err(Error::transaction)?;
                }
                Ok(())
            }
            _ => {
                self.level.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    /// Rolls back every store and leaves all nested transactions.
    pub async fn rollback(&self) -> Result<(), Error> {
        if self.level.swap(0, Ordering::SeqCst) == 0 {
            return Err(no_transaction());
        }
        let mut result = Ok(());
        for participant in &self.participants {
            if let Err(error) = participant.rollback_transaction().await {
                log::error!("Could not roll back a transaction: {error}");
                result = Err(Error::transaction(error));
            }
        }
        result
    }
}

pub(crate) fn no_transaction() -> Error {
    Error::transaction(Error::Storage("No transaction in progress".into()))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Journal {
        calls: Mutex<Vec<&'static str>>,
        fail_on_begin: bool,
    }

    impl Journal {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transactional for Journal {
        async fn begin_transaction(&self) -> Result<(), Error> {
            if self.fail_on_begin {
                return Err(Error::Storage("unavailable".into()));
            }
            self.calls.lock()?.push("begin");
            Ok(())
        }

        async fn commit_transaction(&self) -> Result<(), Error> {
            self.calls.lock()?.push("commit");
            Ok(())
        }

        async fn rollback_transaction(&self) -> Result<(), Error> {
            self.calls.lock()?.push("rollback");
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_nested_transactions_commit_once() {
        let journal = Arc::new(Journal::default());
        let manager = TransactionManager::new(vec![journal.clone() as Arc<dyn Transactional>]);

        manager.begin().await.unwrap();
        manager.begin().await.unwrap();
        manager.commit().await.unwrap();
        assert!(manager.in_transaction());
        manager.commit().await.unwrap();

        assert!(!manager.in_transaction());
        assert_eq!(journal.calls(), vec!["begin", "commit"]);
    }

    #[tokio::test]
    async fn test_rollback_leaves_every_level() {
        let journal = Arc::new(Journal::default());
        let manager = TransactionManager::new(vec![journal.clone() as Arc<dyn Transactional>]);

        manager.begin().await.unwrap();
        manager.begin().await.unwrap();
        manager.rollback().await.unwrap();

        assert!(!manager.in_transaction());
        assert_eq!(journal.calls(), vec!["begin", "rollback"]);
        assert!(manager.commit().await.is_err());
    }

    #[tokio::test]
    async fn test_failed_begin_rolls_back_begun_participants() {
        let first = Arc::new(Journal::default());
        let second = Arc::new(Journal {
            fail_on_begin: true,
            ..Default::default()
        });
        let manager =
            TransactionManager::new(vec![first.clone() as Arc<dyn Transactional>, second]);

        let error = manager.begin().await.unwrap_err();

        assert!(matches!(error, Error::Transaction(_)));
        assert!(!manager.in_transaction());
        assert_eq!(first.calls(), vec!["begin", "rollback"]);
    }
}
