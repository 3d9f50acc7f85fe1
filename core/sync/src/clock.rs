//! Logical clock built on the node's tick facts.

use edgesync_common::{facts, Error, Result, SyncTick};
use edgesync_store::db::INITIAL_SYNC_TICK;
use edgesync_store::Database;

/// Reads and advances the tick facts of one node.
#[derive(Clone)]
pub struct TickClock {
    db: Database,
}

impl TickClock {
    /// Create a clock over the database's tick store.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Read a tick fact.
    pub async fn get(&self, name: &'static str) -> Result<Option<SyncTick>> {
        self.db.get_fact(name).await
    }

    /// Overwrite a tick fact.
    pub async fn set(&self, name: &'static str, tick: SyncTick) -> Result<()> {
        self.db.set_fact(name, tick).await
    }

    /// The tick new local writes are stamped with.
    pub async fn current(&self) -> Result<SyncTick> {
        Ok(self
            .get(facts::CURRENT_SYNC_TICK)
            .await?
            .unwrap_or(INITIAL_SYNC_TICK))
    }

    /// Replace the current tick with `new_tick` and return the one it replaced.
    ///
    /// The read and the write happen in one transaction, so no local write
    /// can observe a tick between them.
    pub async fn bump_current(&self, new_tick: SyncTick) -> Result<SyncTick> {
        let store = self.db.facts();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let stored = store.get(&tx, facts::CURRENT_SYNC_TICK)?;
                if !store.compare_and_set(&tx, facts::CURRENT_SYNC_TICK, stored, new_tick)? {
                    return Err(Error::Conflict(
                        "current sync tick changed while it was being bumped".to_string(),
                    ));
                }
                tx.commit()?;
                Ok(stored.unwrap_or(INITIAL_SYNC_TICK))
            })
            .await
    }

    /// Advance the current tick by two and return `(tick, tock)`.
    ///
    /// The odd `tick` is handed to peers; the even `tock` stamps this node's
    /// own writes, which therefore always sort after anything a peer was
    /// told it is caught up to.
    pub async fn tick_tock(&self) -> Result<(SyncTick, SyncTick)> {
        let store = self.db.facts();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let tock = store.increment(&tx, facts::CURRENT_SYNC_TICK, 2)?;
                tx.commit()?;
                Ok((tock.advance(-1), tock))
            })
            .await
    }

    /// Advance a cursor fact, never moving it backwards.
    ///
    /// Returns the value the cursor holds afterwards.
    pub async fn advance_cursor(&self, name: &'static str, to: SyncTick) -> Result<SyncTick> {
        let store = self.db.facts();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current = store.get(&tx, name)?;
                let next = current.map_or(to, |c| c.max(to));
                store.set(&tx, name, next)?;
                tx.commit()?;
                Ok(next)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> TickClock {
        TickClock::new(Database::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_bump_returns_old_tick() {
        let clock = clock();
        assert_eq!(clock.bump_current(SyncTick::new(11)).await.unwrap(), INITIAL_SYNC_TICK);
        assert_eq!(clock.bump_current(SyncTick::new(15)).await.unwrap(), SyncTick::new(11));
        assert_eq!(clock.current().await.unwrap(), SyncTick::new(15));
    }

    #[tokio::test]
    async fn test_tick_tock_advances_by_two() {
        let clock = clock();
        assert_eq!(
            clock.tick_tock().await.unwrap(),
            (SyncTick::new(1), SyncTick::new(2))
        );
        assert_eq!(
            clock.tick_tock().await.unwrap(),
            (SyncTick::new(3), SyncTick::new(4))
        );
        assert_eq!(clock.current().await.unwrap(), SyncTick::new(4));
    }

    #[tokio::test]
    async fn test_cursor_never_moves_backwards() {
        let clock = clock();
        let name = facts::LAST_SUCCESSFUL_SYNC_PUSH;
        assert_eq!(clock.advance_cursor(name, SyncTick::new(9)).await.unwrap(), SyncTick::new(9));
        assert_eq!(clock.advance_cursor(name, SyncTick::new(4)).await.unwrap(), SyncTick::new(9));
        assert_eq!(clock.get(name).await.unwrap(), Some(SyncTick::new(9)));
    }
}
