//! SQLite position ledger
//!
//! Two tables: `positions` holds one row per position with its open/closed
//! status, `position_events` is an append-only BUY/SELL history. Every query
//! taking a pool list filters on `pool_name` when the list is non-empty and
//! considers all pools otherwise.

use chrono::Utc;
use parking_lot::Mutex;
use pubsub_core::Operation;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{Result, UnknownStatus};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS positions (
        id TEXT PRIMARY KEY,
        purchase_price REAL NOT NULL,
        number_of_tokens REAL NOT NULL,
        expected_sale_price REAL NOT NULL,
        next_purchase_price REAL NOT NULL,
        variations TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        status TEXT NOT NULL,
        pair TEXT NOT NULL,
        pool_name TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS position_events (
        event_id INTEGER PRIMARY KEY AUTOINCREMENT,
        position_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        timestamp DATETIME DEFAULT CURRENT_TIMESTAMP NOT NULL,
        FOREIGN KEY (position_id) REFERENCES positions(id)
    );
    CREATE INDEX IF NOT EXISTS idx_positions_timestamp ON positions (timestamp DESC);
    CREATE INDEX IF NOT EXISTS idx_positions_status ON positions (status);
    CREATE INDEX IF NOT EXISTS idx_positions_pool_name ON positions (pool_name);
"#;

const POSITION_COLUMNS: &str = "id, purchase_price, number_of_tokens, expected_sale_price, \
     next_purchase_price, variations, timestamp, status, pair, pool_name";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    #[default]
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "open" => Ok(PositionStatus::Open),
            "closed" => Ok(PositionStatus::Closed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// One trading position as exchanged on the fabric and stored in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub purchase_price: f64,
    pub number_of_tokens: f64,
    pub expected_sale_price: f64,
    pub next_purchase_price: f64,
    /// Price variations, kept as JSON text
    #[serde(deserialize_with = "json_text")]
    pub variations: String,
    pub timestamp: String,
    #[serde(default)]
    pub status: PositionStatus,
    pub pair: String,
    pub pool_name: String,
}

/// Producers send variations either pre-encoded or as a JSON value
fn json_text<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(text) => text,
        other => other.to_string(),
    })
}

impl Position {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(7)?;
        let status = status
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;
        Ok(Position {
            id: row.get(0)?,
            purchase_price: row.get(1)?,
            number_of_tokens: row.get(2)?,
            expected_sale_price: row.get(3)?,
            next_purchase_price: row.get(4)?,
            variations: row.get(5)?,
            timestamp: row.get(6)?,
            status,
            pair: row.get(8)?,
            pool_name: row.get(9)?,
        })
    }
}

/// Entry of the BUY/SELL history
#[derive(Debug, Clone, PartialEq)]
pub struct PositionEvent {
    pub event_id: i64,
    pub position_id: String,
    pub operation: Operation,
    pub timestamp: String,
}

pub struct PositionStore {
    conn: Mutex<Connection>,
}

impl PositionStore {
    /// Open (or create) the ledger at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        log::info!("Position ledger opened at {}", path.display());
        Self::with_connection(conn)
    }

    /// Volatile ledger, gone when the store is dropped
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert `position` as open and record its BUY event
    pub fn add_position(&self, position: &Position) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO positions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                POSITION_COLUMNS
            ),
            params![
                position.id,
                position.purchase_price,
                position.number_of_tokens,
                position.expected_sale_price,
                position.next_purchase_price,
                position.variations,
                position.timestamp,
                PositionStatus::Open.as_str(),
                position.pair,
                position.pool_name,
            ],
        )?;
        insert_event(&tx, &position.id, Operation::Buy)?;
        tx.commit()?;
        Ok(())
    }

    /// Close the position and record its SELL event.
    /// Returns false if no position has this id.
    pub fn sell_position(&self, position_id: &str) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE positions SET status = ?1 WHERE id = ?2",
            params![PositionStatus::Closed.as_str(), position_id],
        )?;
        insert_event(&tx, position_id, Operation::Sell)?;
        tx.commit()?;
        Ok(updated > 0)
    }

    /// Append a SELL event for every recorded BUY event
    pub fn cancel_events(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT INTO position_events (position_id, event_type, timestamp)
             SELECT position_id, ?1, CURRENT_TIMESTAMP
             FROM position_events
             WHERE event_type = ?2",
            params![Operation::Sell.as_str(), Operation::Buy.as_str()],
        )?;
        Ok(inserted)
    }

    /// Close every open position
    pub fn close_open_positions(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let closed = conn.execute(
            "UPDATE positions SET status = ?1 WHERE status = ?2",
            params![PositionStatus::Closed.as_str(), PositionStatus::Open.as_str()],
        )?;
        Ok(closed)
    }

    /// Purchase price of the most recent open position, 0.0 if none
    pub fn last_purchase_price(&self, pools: &[String]) -> Result<f64> {
        let sql = format!(
            "SELECT purchase_price FROM positions WHERE status = 'open'{} \
             ORDER BY timestamp DESC LIMIT 1",
            pool_filter(pools)
        );
        let conn = self.conn.lock();
        let price: Option<f64> = conn
            .query_row(&sql, params_from_iter(pools), |row| row.get(0))
            .optional()?;
        Ok(price.unwrap_or(0.0))
    }

    /// Open positions, oldest first
    pub fn opened_positions(&self, pools: &[String]) -> Result<Vec<Position>> {
        let sql = format!(
            "SELECT {} FROM positions WHERE status = 'open'{} ORDER BY timestamp ASC",
            POSITION_COLUMNS,
            pool_filter(pools)
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let positions = stmt
            .query_map(params_from_iter(pools), Position::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(positions)
    }

    pub fn count_opened(&self, pools: &[String]) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM positions WHERE status = 'open'{}",
            pool_filter(pools)
        );
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(&sql, params_from_iter(pools), |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Highest expected sale price among open positions, 0.0 if none
    pub fn max_sale_price(&self, pools: &[String]) -> Result<f64> {
        let sql = format!(
            "SELECT MAX(expected_sale_price) FROM positions WHERE status = 'open'{}",
            pool_filter(pools)
        );
        let conn = self.conn.lock();
        let max: Option<f64> = conn.query_row(&sql, params_from_iter(pools), |row| row.get(0))?;
        Ok(max.unwrap_or(0.0))
    }

    /// Every position regardless of status, oldest first
    pub fn all_positions(&self) -> Result<Vec<Position>> {
        let sql = format!(
            "SELECT {} FROM positions ORDER BY timestamp ASC",
            POSITION_COLUMNS
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let positions = stmt
            .query_map([], Position::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(positions)
    }

    pub fn purchase_price(&self, position_id: &str) -> Result<Option<f64>> {
        let conn = self.conn.lock();
        let price = conn
            .query_row(
                "SELECT purchase_price FROM positions WHERE id = ?1",
                params![position_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(price)
    }

    /// Set the expected sale price. Returns false if no position has this id.
    pub fn update_sell_price(&self, position_id: &str, new_sell_price: f64) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE positions SET expected_sale_price = ?1 WHERE id = ?2",
            params![new_sell_price, position_id],
        )?;
        Ok(updated > 0)
    }

    /// BUY/SELL history of one position, in insertion order
    pub fn events(&self, position_id: &str) -> Result<Vec<PositionEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT event_id, position_id, event_type, timestamp
             FROM position_events WHERE position_id = ?1 ORDER BY event_id ASC",
        )?;
        let events = stmt
            .query_map(params![position_id], |row| {
                let operation: String = row.get(2)?;
                let operation = operation.parse().map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e))
                })?;
                Ok(PositionEvent {
                    event_id: row.get(0)?,
                    position_id: row.get(1)?,
                    operation,
                    timestamp: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }
}

fn insert_event(conn: &Connection, position_id: &str, operation: Operation) -> Result<()> {
    conn.execute(
        "INSERT INTO position_events (position_id, event_type, timestamp) VALUES (?1, ?2, ?3)",
        params![position_id, operation.as_str(), Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// `AND pool_name IN (?, ...)` clause for a non-empty pool list
fn pool_filter(pools: &[String]) -> String {
    if pools.is_empty() {
        return String::new();
    }
    let placeholders = vec!["?"; pools.len()].join(", ");
    format!(" AND pool_name IN ({})", placeholders)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(id: &str, pool: &str, timestamp: &str, purchase: f64, sale: f64) -> Position {
        Position {
            id: id.to_string(),
            purchase_price: purchase,
            number_of_tokens: 2.5,
            expected_sale_price: sale,
            next_purchase_price: purchase * 0.95,
            variations: "[0.01, -0.02]".to_string(),
            timestamp: timestamp.to_string(),
            status: PositionStatus::Open,
            pair: "BTC/USDT".to_string(),
            pool_name: pool.to_string(),
        }
    }

    fn pools(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn seeded() -> PositionStore {
        let store = PositionStore::in_memory().unwrap();
        store
            .add_position(&position("p1", "grid", "2024-05-01T10:00:00", 100.0, 110.0))
            .unwrap();
        store
            .add_position(&position("p2", "dca", "2024-05-01T11:00:00", 95.0, 120.0))
            .unwrap();
        store
            .add_position(&position("p3", "grid", "2024-05-01T12:00:00", 90.0, 99.0))
            .unwrap();
        store
    }

    #[test]
    fn test_empty_ledger_defaults() {
        let store = PositionStore::in_memory().unwrap();
        assert_eq!(store.last_purchase_price(&[]).unwrap(), 0.0);
        assert_eq!(store.max_sale_price(&[]).unwrap(), 0.0);
        assert_eq!(store.count_opened(&[]).unwrap(), 0);
        assert!(store.opened_positions(&[]).unwrap().is_empty());
        assert!(store.all_positions().unwrap().is_empty());
        assert_eq!(store.purchase_price("missing").unwrap(), None);
    }

    #[test]
    fn test_add_position_records_buy_event() {
        let store = seeded();

        let opened = store.opened_positions(&[]).unwrap();
        let ids: Vec<&str> = opened.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["p1", "p2", "p3"]);
        assert_eq!(opened[0], position("p1", "grid", "2024-05-01T10:00:00", 100.0, 110.0));

        let events = store.events("p1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, Operation::Buy);
        assert_eq!(events[0].position_id, "p1");
    }

    #[test]
    fn test_duplicate_id_rejected_without_extra_event() {
        let store = seeded();
        let duplicate = position("p1", "grid", "2024-05-02T10:00:00", 1.0, 2.0);

        assert!(store.add_position(&duplicate).is_err());
        assert_eq!(store.events("p1").unwrap().len(), 1);
    }

    #[test]
    fn test_pool_filters() {
        let store = seeded();
        let grid = pools(&["grid"]);

        assert_eq!(store.last_purchase_price(&[]).unwrap(), 90.0);
        assert_eq!(store.last_purchase_price(&pools(&["dca"])).unwrap(), 95.0);
        assert_eq!(store.count_opened(&grid).unwrap(), 2);
        assert_eq!(store.count_opened(&pools(&["grid", "dca"])).unwrap(), 3);
        assert_eq!(store.count_opened(&pools(&["unknown"])).unwrap(), 0);
        assert_eq!(store.max_sale_price(&[]).unwrap(), 120.0);
        assert_eq!(store.max_sale_price(&grid).unwrap(), 110.0);

        let ids: Vec<String> = store
            .opened_positions(&grid)
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, ["p1", "p3"]);
    }

    #[test]
    fn test_sell_position_closes_and_records_sell() {
        let store = seeded();

        assert!(store.sell_position("p3").unwrap());
        assert_eq!(store.count_opened(&[]).unwrap(), 2);
        assert_eq!(store.last_purchase_price(&[]).unwrap(), 95.0);

        let operations: Vec<Operation> = store
            .events("p3")
            .unwrap()
            .into_iter()
            .map(|event| event.operation)
            .collect();
        assert_eq!(operations, [Operation::Buy, Operation::Sell]);

        let all = store.all_positions().unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].status, PositionStatus::Closed);

        assert!(!store.sell_position("missing").unwrap());
    }

    #[test]
    fn test_cancel_events_mirrors_buys() {
        let store = seeded();
        store.sell_position("p1").unwrap();

        assert_eq!(store.cancel_events().unwrap(), 3);
        let operations: Vec<Operation> = store
            .events("p1")
            .unwrap()
            .into_iter()
            .map(|event| event.operation)
            .collect();
        assert_eq!(operations, [Operation::Buy, Operation::Sell, Operation::Sell]);
    }

    #[test]
    fn test_close_open_positions() {
        let store = seeded();
        store.sell_position("p2").unwrap();

        assert_eq!(store.close_open_positions().unwrap(), 2);
        assert_eq!(store.count_opened(&[]).unwrap(), 0);
        assert_eq!(store.close_open_positions().unwrap(), 0);
    }

    #[test]
    fn test_update_sell_price() {
        let store = seeded();

        assert!(store.update_sell_price("p2", 130.0).unwrap());
        assert_eq!(store.max_sale_price(&[]).unwrap(), 130.0);
        assert_eq!(store.purchase_price("p2").unwrap(), Some(95.0));
        assert!(!store.update_sell_price("missing", 1.0).unwrap());
    }

    #[test]
    fn test_variations_accept_json_values() {
        let position: Position = serde_json::from_value(serde_json::json!({
            "id": "p9",
            "purchase_price": 1.0,
            "number_of_tokens": 1.0,
            "expected_sale_price": 1.1,
            "next_purchase_price": 0.9,
            "variations": [0.5, 0.25],
            "timestamp": "2024-05-01T10:00:00",
            "pair": "ETH/USDT",
            "pool_name": "grid"
        }))
        .unwrap();

        assert_eq!(position.variations, "[0.5,0.25]");
        assert_eq!(position.status, PositionStatus::Open);
    }

    #[test]
    fn test_ledger_persists_across_reopen() {
        let path = std::env::temp_dir().join(format!(
            "pubsub-positions-{}.sqlite",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        {
            let store = PositionStore::open(&path).unwrap();
            store
                .add_position(&position("p1", "grid", "2024-05-01T10:00:00", 100.0, 110.0))
                .unwrap();
        }
        let reopened = PositionStore::open(&path).unwrap();
        let count = reopened.count_opened(&[]).unwrap();
        drop(reopened);
        std::fs::remove_file(&path).unwrap();

        assert_eq!(count, 1);
    }
}
