/// `capabilities/points.rs` — `pointslib`, per-user point balances
///
/// `take` never drives a balance negative: it either debits the full amount
/// or leaves the balance alone and returns `false`.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use mlua::{Lua, Table};

use crate::error::{HubError, HubResult};

use super::Capability;

#[async_trait]
pub trait PointsLedger: Send + Sync {
    /// Unknown users have a balance of 0.
    async fn get(&self, user_id: &str) -> HubResult<i64>;
    async fn set(&self, user_id: &str, amount: i64) -> HubResult<()>;
    /// Returns the new balance.
    async fn add(&self, user_id: &str, amount: i64) -> HubResult<i64>;
    async fn take(&self, user_id: &str, amount: i64) -> HubResult<bool>;
}

/// Balances kept in memory; used when no database is configured.
#[derive(Default)]
pub struct MemoryLedger {
    balances: Mutex<HashMap<String, i64>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PointsLedger for MemoryLedger {
    async fn get(&self, user_id: &str) -> HubResult<i64> {
        Ok(self
            .balances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .copied()
            .unwrap_or(0))
    }

    async fn set(&self, user_id: &str, amount: i64) -> HubResult<()> {
        self.balances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_string(), amount);
        Ok(())
    }

    async fn add(&self, user_id: &str, amount: i64) -> HubResult<i64> {
        let mut balances = self.balances.lock().unwrap_or_else(PoisonError::into_inner);
        let balance = balances.entry(user_id.to_string()).or_insert(0);
        *balance = balance.saturating_add(amount);
        Ok(*balance)
    }

    async fn take(&self, user_id: &str, amount: i64) -> HubResult<bool> {
        let mut balances = self.balances.lock().unwrap_or_else(PoisonError::into_inner);
        match balances.get_mut(user_id) {
            Some(balance) if *balance >= amount => {
                *balance -= amount;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

pub struct PointsLib {
    ledger: Arc<dyn PointsLedger>,
}

impl PointsLib {
    pub fn new(ledger: Arc<dyn PointsLedger>) -> Self {
        Self { ledger }
    }
}

impl Capability for PointsLib {
    fn name(&self) -> &'static str {
        "pointslib"
    }

    fn build(&self, lua: &Lua) -> mlua::Result<Table> {
        let tbl = lua.create_table()?;

        let ledger = Arc::clone(&self.ledger);
        tbl.set(
            "get",
            lua.create_async_function(move |_, user_id: String| {
                let ledger = Arc::clone(&ledger);
                async move {
                    let balance = ledger.get(&user_id).await.map_err(HubError::into_lua)?;
                    log::debug!("[points] get {} -> {}", user_id, balance);
                    Ok(balance)
                }
            })?,
        )?;
        let ledger = Arc::clone(&self.ledger);
        tbl.set(
            "set",
            lua.create_async_function(move |_, (user_id, amount): (String, i64)| {
                let ledger = Arc::clone(&ledger);
                async move {
                    ledger.set(&user_id, amount).await.map_err(HubError::into_lua)?;
                    log::debug!("[points] set {} -> {}", user_id, amount);
                    Ok(())
                }
            })?,
        )?;
        let ledger = Arc::clone(&self.ledger);
        tbl.set(
            "add",
            lua.create_async_function(move |_, (user_id, amount): (String, i64)| {
                let ledger = Arc::clone(&ledger);
                async move {
                    let balance = ledger.add(&user_id, amount).await.map_err(HubError::into_lua)?;
                    log::debug!("[points] add {} {} -> {}", user_id, amount, balance);
                    Ok(balance)
                }
            })?,
        )?;
        let ledger = Arc::clone(&self.ledger);
        tbl.set(
            "take",
            lua.create_async_function(move |_, (user_id, amount): (String, i64)| {
                let ledger = Arc::clone(&ledger);
                async move {
                    let taken = ledger.take(&user_id, amount).await.map_err(HubError::into_lua)?;
                    log::debug!("[points] take {} {} -> {}", user_id, amount, taken);
                    Ok(taken)
                }
            })?,
        )?;

        Ok(tbl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn take_never_goes_negative() {
        let ledger = MemoryLedger::new();
        assert!(!ledger.take("ghost", 1).await.unwrap());
        ledger.set("alice", 10).await.unwrap();
        assert!(ledger.take("alice", 10).await.unwrap());
        assert!(!ledger.take("alice", 1).await.unwrap());
        assert_eq!(ledger.get("alice").await.unwrap(), 0);
        assert_eq!(ledger.add("bob", 5).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn script_surface_awaits_the_ledger() {
        let lua = Lua::new();
        let lib = PointsLib::new(Arc::new(MemoryLedger::new()));
        lua.globals().set("pointslib", lib.build(&lua).unwrap()).unwrap();

        let (after_add, took, denied, balance): (i64, bool, bool, i64) = lua
            .load(
                r#"
                pointslib.set("alice", 100)
                local after_add = pointslib.add("alice", 50)
                local took = pointslib.take("alice", 120)
                local denied = pointslib.take("alice", 31)
                return after_add, took, denied, pointslib.get("alice")
                "#,
            )
            .eval_async()
            .await
            .unwrap();
        assert_eq!((after_add, took, denied, balance), (150, true, false, 30));
    }
}
