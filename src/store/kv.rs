//! Small keyed state: deploy config, go-env list, startID handoff,
//! auth failure counters. One table, JSON values.

use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use super::pager::Store;

#[derive(Clone)]
pub struct KvStore {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn kv(&self) -> KvStore {
        {
            let conn = self.conn.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS kv_cache (
                     key TEXT PRIMARY KEY,
                     value TEXT NOT NULL,
                     updated_at INTEGER DEFAULT (strftime('%s', 'now'))
                 );",
            )
            .expect("create kv table");
        }
        KvStore {
            conn: self.conn.clone(),
        }
    }
}

impl KvStore {
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let data = serde_json::to_string(value)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO kv_cache (key, value, updated_at)
             VALUES (?1, ?2, strftime('%s', 'now'))",
            rusqlite::params![key, data],
        )?;
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM kv_cache WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM kv_cache WHERE key = ?1", [key])?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Opts {
        repo: String,
        auto: bool,
    }

    #[test]
    fn test_set_get_roundtrip() {
        let kv = Store::in_memory().unwrap().kv();
        let opts = Opts {
            repo: "git@example.com:a/b.git".into(),
            auto: true,
        };
        kv.set("cfg", &opts).unwrap();
        assert_eq!(kv.get::<Opts>("cfg").unwrap().unwrap(), opts);
    }

    #[test]
    fn test_missing_key() {
        let kv = Store::in_memory().unwrap().kv();
        assert!(kv.get::<String>("nope").unwrap().is_none());
    }

    #[test]
    fn test_overwrite_and_delete() {
        let kv = Store::in_memory().unwrap().kv();
        kv.set("k", &1i64).unwrap();
        kv.set("k", &2i64).unwrap();
        assert_eq!(kv.get::<i64>("k").unwrap(), Some(2));
        assert!(kv.delete("k").unwrap());
        assert!(!kv.delete("k").unwrap());
        assert!(kv.get::<i64>("k").unwrap().is_none());
    }
}
