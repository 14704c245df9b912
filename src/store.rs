use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, warn};

use crate::error::Result;
use crate::net;

/// One set of SSH credentials plus its observed liveness state.
#[derive(Debug, Clone, FromRow)]
pub struct Ssh {
    pub id: i64,
    pub ip: String,
    pub username: String,
    pub password: String,
    pub ssh_port: u16,
    pub is_live: bool,
    /// Port this SSH is currently reserved for, if any
    pub port_id: Option<i64>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_modified: DateTime<Utc>,
}

/// One managed local listening port awaiting or carrying a SOCKS5 tunnel.
#[derive(Debug, Clone, FromRow)]
pub struct Port {
    pub id: i64,
    pub port_number: u16,
    pub auto_connect: bool,
    pub is_connected: bool,
    pub public_ip: String,
    pub time_connected: Option<DateTime<Utc>>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_modified: DateTime<Utc>,
}

impl Port {
    /// SOCKS5 address clients of this port connect to
    pub fn proxy_address(&self) -> String {
        format!("socks5://{}:{}", net::local_ipv4(), self.port_number)
    }
}

/// An SSH record parsed from user input or the external feed, not yet stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NewSsh {
    pub ip: String,
    pub username: String,
    pub password: String,
    pub ssh_port: u16,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS port (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    port_number    INTEGER NOT NULL UNIQUE CHECK(port_number BETWEEN 1024 AND 65353),
    auto_connect   INTEGER NOT NULL DEFAULT 1,
    is_connected   INTEGER NOT NULL DEFAULT 0,
    public_ip      TEXT NOT NULL DEFAULT '',
    time_connected TEXT,
    last_checked   TEXT,
    last_modified  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS ssh (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    ip            TEXT NOT NULL,
    username      TEXT NOT NULL DEFAULT '',
    password      TEXT NOT NULL DEFAULT '',
    ssh_port      INTEGER NOT NULL DEFAULT 22,
    is_live       INTEGER NOT NULL DEFAULT 0,
    port_id       INTEGER REFERENCES port(id) ON DELETE SET NULL,
    last_checked  TEXT,
    last_modified TEXT NOT NULL,
    UNIQUE(ip, username, password)
);
CREATE TABLE IF NOT EXISTS port_used_ssh (
    port_id INTEGER NOT NULL REFERENCES port(id) ON DELETE CASCADE,
    ssh_id  INTEGER NOT NULL REFERENCES ssh(id)  ON DELETE CASCADE,
    PRIMARY KEY (port_id, ssh_id)
);
"#;

const SSH_COLUMNS: &str =
    "id, ip, username, password, ssh_port, is_live, port_id, last_checked, last_modified";
const PORT_COLUMNS: &str = "id, port_number, auto_connect, is_connected, public_ip, \
                            time_connected, last_checked, last_modified";

/// Single source of truth for SSHs, Ports and their relationships.
///
/// All cross-entity mutations (reserve, detach) are single statements or
/// transactions, so the uniqueness invariants hold under concurrent
/// per-entity tasks. Every mutation bumps `last_modified`.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the single-file store at `path`.
    ///
    /// A file that cannot be read with the expected schema is deleted and
    /// recreated empty; nothing irreplaceable lives here.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match Self::try_open(path).await {
            Ok(store) => Ok(store),
            Err(err) => {
                warn!(
                    "Store at {} is unreadable ({err}), recreating it empty",
                    path.display()
                );
                let _ = std::fs::remove_file(path);
                Self::try_open(path).await
            }
        }
    }

    async fn try_open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        store.schema_check().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Probe every column the engine reads, so a file written by an older or
    /// foreign schema fails here instead of deep inside a check loop.
    async fn schema_check(&self) -> Result<()> {
        sqlx::query_as::<_, Ssh>(&format!("SELECT {SSH_COLUMNS} FROM ssh LIMIT 1"))
            .fetch_optional(&self.pool)
            .await?;
        sqlx::query_as::<_, Port>(&format!("SELECT {PORT_COLUMNS} FROM port LIMIT 1"))
            .fetch_optional(&self.pool)
            .await?;
        sqlx::query("SELECT port_id, ssh_id FROM port_used_ssh LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(())
    }

    // --- id listings (supervisor reconciliation) ---

    pub async fn list_ssh_ids(&self) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar("SELECT id FROM ssh ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    pub async fn list_port_ids(&self) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar("SELECT id FROM port ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    // --- loads ---

    pub async fn get_ssh(&self, id: i64) -> Result<Option<Ssh>> {
        let ssh = sqlx::query_as(&format!("SELECT {SSH_COLUMNS} FROM ssh WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(ssh)
    }

    pub async fn get_port(&self, id: i64) -> Result<Option<Port>> {
        let port = sqlx::query_as(&format!("SELECT {PORT_COLUMNS} FROM port WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(port)
    }

    /// The SSH currently reserved for `port_id`, if any (the back-reference
    /// of the assignment).
    pub async fn assigned_ssh(&self, port_id: i64) -> Result<Option<Ssh>> {
        let ssh = sqlx::query_as(&format!("SELECT {SSH_COLUMNS} FROM ssh WHERE port_id = ?1"))
            .bind(port_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(ssh)
    }

    /// Ids of every SSH this port has used before
    pub async fn used_ssh_ids(&self, port_id: i64) -> Result<Vec<i64>> {
        let ids =
            sqlx::query_scalar("SELECT ssh_id FROM port_used_ssh WHERE port_id = ?1 ORDER BY ssh_id")
                .bind(port_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }

    // --- creation / deletion ---

    /// Insert one SSH record. Returns its id, or `None` when an identical
    /// `(ip, username, password)` row already exists.
    pub async fn create_ssh(&self, record: &NewSsh) -> Result<Option<i64>> {
        let id = sqlx::query_scalar(
            "INSERT OR IGNORE INTO ssh (ip, username, password, ssh_port, last_modified) \
             VALUES (?1, ?2, ?3, ?4, ?5) RETURNING id",
        )
        .bind(&record.ip)
        .bind(&record.username)
        .bind(&record.password)
        .bind(record.ssh_port)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    /// Insert a batch of SSH records, skipping those already present.
    /// Returns how many rows were actually new.
    pub async fn insert_ssh_batch(&self, records: &[NewSsh]) -> Result<usize> {
        let mut inserted = 0;
        for record in records {
            if self.create_ssh(record).await?.is_some() {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    pub async fn create_port(&self, port_number: u16, auto_connect: bool) -> Result<i64> {
        let id = sqlx::query_scalar(
            "INSERT INTO port (port_number, auto_connect, last_modified) \
             VALUES (?1, ?2, ?3) RETURNING id",
        )
        .bind(port_number)
        .bind(auto_connect)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn delete_ssh(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM ssh WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete the SSH only if it is still marked dead.
    /// Returns whether a row was removed.
    pub async fn delete_ssh_if_dead(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM ssh WHERE id = ?1 AND is_live = 0")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_port(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM port WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- assignment policy ---

    /// Atomically reserve one SSH for `port_id`.
    ///
    /// Eligible rows are live and unassigned; with `unique` they must also
    /// never have been used by this port before. The pick is uniformly
    /// random so dead credentials clustered at the head of an ordered feed
    /// do not dominate. The single UPDATE guarantees no two ports can
    /// reserve the same SSH.
    pub async fn reserve_ssh_for_port(&self, port_id: i64, unique: bool) -> Result<Option<Ssh>> {
        let reserved = sqlx::query_as::<_, Ssh>(&format!(
            "UPDATE ssh SET port_id = ?1, last_modified = ?2 \
             WHERE id = ( \
                 SELECT s.id FROM ssh s \
                 WHERE s.is_live = 1 AND s.port_id IS NULL \
                   AND (?3 = 0 OR s.id NOT IN \
                        (SELECT ssh_id FROM port_used_ssh WHERE port_id = ?1)) \
                 ORDER BY RANDOM() LIMIT 1 \
             ) \
             RETURNING {SSH_COLUMNS}"
        ))
        .bind(port_id)
        .bind(Utc::now())
        .bind(unique)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(ssh) = &reserved {
            debug!("Reserved SSH {} ({}) for port {port_id}", ssh.id, ssh.ip);
        }
        Ok(reserved)
    }

    /// Release the SSH assigned to `port_id` and clear the port's connection
    /// state. With `remove_from_used` the pairing is also erased from the
    /// used set, as if it never happened.
    pub async fn detach_ssh_from_port(&self, port_id: i64, remove_from_used: bool) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        if remove_from_used {
            sqlx::query(
                "DELETE FROM port_used_ssh WHERE port_id = ?1 \
                 AND ssh_id IN (SELECT id FROM ssh WHERE port_id = ?1)",
            )
            .bind(port_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE ssh SET port_id = NULL, last_modified = ?2 WHERE port_id = ?1")
            .bind(port_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE port SET is_connected = 0, time_connected = NULL, public_ip = '', \
             last_modified = ?2 WHERE id = ?1",
        )
        .bind(port_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // --- check-cycle writers ---

    /// Record a verified tunnel on `port_id`: flags it connected, stamps the
    /// connection time and adds the SSH to the port's used set.
    pub async fn mark_port_connected(&self, port_id: i64, ssh_id: i64) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT OR IGNORE INTO port_used_ssh (port_id, ssh_id) VALUES (?1, ?2)")
            .bind(port_id)
            .bind(ssh_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE port SET is_connected = 1, time_connected = ?2, last_modified = ?2 \
             WHERE id = ?1",
        )
        .bind(port_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Write the outcome of one liveness check. A no-op when the SSH was
    /// deleted mid-check.
    pub async fn finish_ssh_check(&self, id: i64, is_live: bool) -> Result<()> {
        sqlx::query("UPDATE ssh SET is_live = ?2, last_checked = ?3, last_modified = ?3 WHERE id = ?1")
            .bind(id)
            .bind(is_live)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Write the outcome of one egress probe. A no-op when the port was
    /// deleted mid-check.
    pub async fn finish_port_check(&self, id: i64, public_ip: &str) -> Result<()> {
        sqlx::query(
            "UPDATE port SET public_ip = ?2, last_checked = ?3, last_modified = ?3 WHERE id = ?1",
        )
        .bind(id)
        .bind(public_ip)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_ssh_live(&self, id: i64, is_live: bool) -> Result<()> {
        sqlx::query("UPDATE ssh SET is_live = ?2, last_modified = ?3 WHERE id = ?1")
            .bind(id)
            .bind(is_live)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Discard all connection state left over from a previous run: no tunnel
    /// survives a restart, so every port starts disconnected and every SSH
    /// starts unassigned.
    pub async fn reset_runtime_state(&self) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE port SET is_connected = 0, public_ip = '', time_connected = NULL, \
             last_checked = NULL, last_modified = ?1",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE ssh SET port_id = NULL, last_checked = NULL, last_modified = ?1 \
             WHERE port_id IS NOT NULL OR last_checked IS NOT NULL",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("Runtime state reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.db")).await.unwrap();
        (dir, store)
    }

    fn sample_ssh(ip: &str) -> NewSsh {
        NewSsh {
            ip: ip.to_string(),
            username: "user".to_string(),
            password: "pass".to_string(),
            ssh_port: 22,
        }
    }

    #[tokio::test]
    async fn test_open_recreates_unreadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.db");
        std::fs::write(&path, "this is not a database").unwrap();

        let store = Store::open(&path).await.unwrap();
        assert!(store.list_ssh_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_ssh_insert_is_skipped() {
        let (_dir, store) = open_test_store().await;

        let first = store.create_ssh(&sample_ssh("1.2.3.4")).await.unwrap();
        let second = store.create_ssh(&sample_ssh("1.2.3.4")).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(store.list_ssh_ids().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_insert_reports_new_rows_only() {
        let (_dir, store) = open_test_store().await;
        let records = vec![sample_ssh("1.1.1.1"), sample_ssh("2.2.2.2")];

        assert_eq!(store.insert_ssh_batch(&records).await.unwrap(), 2);
        assert_eq!(store.insert_ssh_batch(&records).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_port_number_range_is_enforced() {
        let (_dir, store) = open_test_store().await;

        assert!(store.create_port(80, true).await.is_err());
        assert!(store.create_port(30000, true).await.is_ok());
        // Duplicate port number rejected
        assert!(store.create_port(30000, true).await.is_err());
    }

    #[tokio::test]
    async fn test_reserve_requires_live_ssh() {
        let (_dir, store) = open_test_store().await;
        let port_id = store.create_port(30000, true).await.unwrap();
        store.create_ssh(&sample_ssh("1.2.3.4")).await.unwrap();

        // Not live yet
        assert!(store.reserve_ssh_for_port(port_id, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reserve_is_exclusive_across_ports() {
        let (_dir, store) = open_test_store().await;
        let port_a = store.create_port(30000, true).await.unwrap();
        let port_b = store.create_port(30001, true).await.unwrap();
        let ssh_id = store.create_ssh(&sample_ssh("1.2.3.4")).await.unwrap().unwrap();
        store.set_ssh_live(ssh_id, true).await.unwrap();

        let (first, second) = tokio::join!(
            store.reserve_ssh_for_port(port_a, false),
            store.reserve_ssh_for_port(port_b, false),
        );

        // Exactly one port wins the only live SSH
        let winners = [first.unwrap(), second.unwrap()];
        assert_eq!(winners.iter().flatten().count(), 1);
    }

    #[tokio::test]
    async fn test_unique_mode_excludes_used_ssh() {
        let (_dir, store) = open_test_store().await;
        let port_id = store.create_port(30000, true).await.unwrap();
        let ssh_id = store.create_ssh(&sample_ssh("1.2.3.4")).await.unwrap().unwrap();
        store.set_ssh_live(ssh_id, true).await.unwrap();

        let reserved = store.reserve_ssh_for_port(port_id, true).await.unwrap().unwrap();
        store.mark_port_connected(port_id, reserved.id).await.unwrap();
        store.detach_ssh_from_port(port_id, false).await.unwrap();

        // Already in the used set, so unique mode never hands it back
        assert!(store.reserve_ssh_for_port(port_id, true).await.unwrap().is_none());
        // Non-unique mode still may
        assert!(store.reserve_ssh_for_port(port_id, false).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_connect_failure_erases_pairing() {
        let (_dir, store) = open_test_store().await;
        let port_id = store.create_port(30000, true).await.unwrap();
        let ssh_id = store.create_ssh(&sample_ssh("1.2.3.4")).await.unwrap().unwrap();
        store.set_ssh_live(ssh_id, true).await.unwrap();

        let reserved = store.reserve_ssh_for_port(port_id, true).await.unwrap().unwrap();
        store.mark_port_connected(port_id, reserved.id).await.unwrap();
        store.detach_ssh_from_port(port_id, true).await.unwrap();

        // Used set was purged, so the SSH is eligible again even in unique mode
        assert!(store.used_ssh_ids(port_id).await.unwrap().is_empty());
        assert!(store.reserve_ssh_for_port(port_id, true).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_mark_connected_sets_connection_state() {
        let (_dir, store) = open_test_store().await;
        let port_id = store.create_port(30000, true).await.unwrap();
        let ssh_id = store.create_ssh(&sample_ssh("1.2.3.4")).await.unwrap().unwrap();
        store.set_ssh_live(ssh_id, true).await.unwrap();

        let reserved = store.reserve_ssh_for_port(port_id, false).await.unwrap().unwrap();
        store.mark_port_connected(port_id, reserved.id).await.unwrap();

        let port = store.get_port(port_id).await.unwrap().unwrap();
        assert!(port.is_connected);
        assert!(port.time_connected.is_some());
        assert_eq!(store.used_ssh_ids(port_id).await.unwrap(), vec![ssh_id]);
        assert_eq!(
            store.assigned_ssh(port_id).await.unwrap().unwrap().id,
            ssh_id
        );
    }

    #[tokio::test]
    async fn test_reset_runtime_state_clears_connections() {
        let (_dir, store) = open_test_store().await;
        let port_id = store.create_port(30000, true).await.unwrap();
        let ssh_id = store.create_ssh(&sample_ssh("1.2.3.4")).await.unwrap().unwrap();
        store.set_ssh_live(ssh_id, true).await.unwrap();
        let reserved = store.reserve_ssh_for_port(port_id, false).await.unwrap().unwrap();
        store.mark_port_connected(port_id, reserved.id).await.unwrap();
        store.finish_port_check(port_id, "1.2.3.4").await.unwrap();

        store.reset_runtime_state().await.unwrap();

        let port = store.get_port(port_id).await.unwrap().unwrap();
        assert!(!port.is_connected);
        assert!(port.time_connected.is_none());
        assert!(port.public_ip.is_empty());
        assert!(store.assigned_ssh(port_id).await.unwrap().is_none());
        // Used set survives a restart
        assert_eq!(store.used_ssh_ids(port_id).await.unwrap(), vec![ssh_id]);
    }

    #[tokio::test]
    async fn test_delete_ssh_if_dead_spares_live_ssh() {
        let (_dir, store) = open_test_store().await;
        let ssh_id = store.create_ssh(&sample_ssh("1.2.3.4")).await.unwrap().unwrap();

        store.set_ssh_live(ssh_id, true).await.unwrap();
        assert!(!store.delete_ssh_if_dead(ssh_id).await.unwrap());

        store.set_ssh_live(ssh_id, false).await.unwrap();
        assert!(store.delete_ssh_if_dead(ssh_id).await.unwrap());
        assert!(store.get_ssh(ssh_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_port_releases_its_ssh() {
        let (_dir, store) = open_test_store().await;
        let port_id = store.create_port(30000, true).await.unwrap();
        let ssh_id = store.create_ssh(&sample_ssh("1.2.3.4")).await.unwrap().unwrap();
        store.set_ssh_live(ssh_id, true).await.unwrap();
        store.reserve_ssh_for_port(port_id, false).await.unwrap().unwrap();

        store.delete_port(port_id).await.unwrap();

        let ssh = store.get_ssh(ssh_id).await.unwrap().unwrap();
        assert!(ssh.port_id.is_none());
    }

    #[tokio::test]
    async fn test_finish_check_on_deleted_ssh_is_noop() {
        let (_dir, store) = open_test_store().await;
        let ssh_id = store.create_ssh(&sample_ssh("1.2.3.4")).await.unwrap().unwrap();
        store.delete_ssh(ssh_id).await.unwrap();

        // Deletion mid-check: the late write must not fail or resurrect
        store.finish_ssh_check(ssh_id, true).await.unwrap();
        assert!(store.get_ssh(ssh_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_proxy_address_format() {
        let (_dir, store) = open_test_store().await;
        let port_id = store.create_port(30000, true).await.unwrap();
        let port = store.get_port(port_id).await.unwrap().unwrap();

        let address = port.proxy_address();
        assert!(address.starts_with("socks5://"));
        assert!(address.ends_with(":30000"));
    }
}
