use crate::pseudonym::KeyValueStore;
use anyhow::Context;
use chrono::Utc;
use parking_lot::Mutex;
use sqlite::{Connection, State};
use std::path::Path;

/// [KeyValueStore] persisted in a sqlite database.
///
/// The `records` table keeps the column names used by earlier
/// deployments so that existing databases can be opened as-is.
pub struct SqliteStore {
    db: Mutex<Option<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let mut db = Connection::open(path)
            .with_context(|| format!("failed to open store database {}", path.display()))?;

        db.set_busy_timeout(60_000)?;

        let query = r#"
CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mail_id TEXT NOT NULL UNIQUE,
    from_addr TEXT NOT NULL,
    created_at DATETIME NOT NULL
);
    "#;
        db.execute(query).context("creating records table")?;

        Ok(Self {
            db: Mutex::new(Some(db)),
        })
    }

    fn with_db<T>(&self, func: impl FnOnce(&Connection) -> anyhow::Result<T>) -> anyhow::Result<T> {
        let db = self.db.lock();
        match db.as_ref() {
            Some(db) => func(db),
            None => anyhow::bail!("store is closed"),
        }
    }
}

fn read_value(db: &Connection, key: &str) -> anyhow::Result<Option<String>> {
    let mut stmt = db
        .prepare("SELECT from_addr FROM records WHERE mail_id = $key")
        .context("prepare")?;
    stmt.bind(("$key", key)).context("bind $key")?;
    if stmt.next()? == State::Row {
        let value: String = stmt.read(0)?;
        return Ok(Some(value));
    }
    Ok(None)
}

fn now() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.with_db(|db| read_value(db, key))
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.with_db(|db| {
            let mut stmt = db
                .prepare(
                    "INSERT INTO records (mail_id, from_addr, created_at)
                        values ($key, $value, $now)
                        on conflict (mail_id)
                        do update set from_addr=$value",
                )
                .context("prepare")?;
            let now = now();
            stmt.bind(("$key", key)).context("bind $key")?;
            stmt.bind(("$value", value)).context("bind $value")?;
            stmt.bind(("$now", now.as_str())).context("bind $now")?;
            stmt.next()?;
            Ok(())
        })
    }

    fn insert_if_absent(&self, key: &str, value: &str) -> anyhow::Result<String> {
        self.with_db(|db| {
            let mut stmt = db
                .prepare(
                    "INSERT INTO records (mail_id, from_addr, created_at)
                        values ($key, $value, $now)
                        on conflict (mail_id) do nothing",
                )
                .context("prepare")?;
            let now = now();
            stmt.bind(("$key", key)).context("bind $key")?;
            stmt.bind(("$value", value)).context("bind $value")?;
            stmt.bind(("$now", now.as_str())).context("bind $now")?;
            stmt.next()?;
            drop(stmt);

            read_value(db, key)?
                .ok_or_else(|| anyhow::anyhow!("record for {key} vanished after insert"))
        })
    }

    fn close(&self) -> anyhow::Result<()> {
        if self.db.lock().take().is_some() {
            tracing::debug!("store closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pseudonym::PseudonymStore;
    use k9::assert_equal;
    use std::sync::Arc;

    #[test]
    fn get_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("store.db")).unwrap();

        assert_equal!(store.get("bob@example.com").unwrap(), None);
        store.set("bob@example.com", "sales@example.jp").unwrap();
        assert_equal!(
            store.get("bob@example.com").unwrap(),
            Some("sales@example.jp".to_string())
        );
        store.set("bob@example.com", "support@example.jp").unwrap();
        assert_equal!(
            store.get("bob@example.com").unwrap(),
            Some("support@example.jp".to_string())
        );

        assert_equal!(
            store.insert_if_absent("bob@example.com", "si-abcd@example.jp").unwrap(),
            "support@example.jp"
        );
        assert_equal!(
            store.insert_if_absent("carol@example.com", "si-abcd@example.jp").unwrap(),
            "si-abcd@example.jp"
        );

        store.close().unwrap();
        assert!(store.get("bob@example.com").is_err());
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        let first = {
            let store = PseudonymStore::new(Arc::new(SqliteStore::open(&path).unwrap()));
            let (pseudonym, existed) = store.resolve("dave@example.com", "example.jp").await.unwrap();
            assert!(!existed);
            store.close().await.unwrap();
            pseudonym
        };

        let store = PseudonymStore::new(Arc::new(SqliteStore::open(&path).unwrap()));
        let (pseudonym, existed) = store.resolve("dave@example.com", "example.jp").await.unwrap();
        assert!(existed);
        assert_equal!(pseudonym, first);
    }
}
