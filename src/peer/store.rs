//! Persistence boundary for the peer registry

use crate::peer::error::{PeerError, PeerResult};
use crate::peer::types::{PeerId, PeerIdentity};
use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::{Row, SqlitePool};
use std::sync::atomic::{AtomicBool, Ordering};

/// Where peer records survive restarts
#[async_trait]
pub trait PeerStore: Send + Sync {
    async fn load_peers(&self) -> PeerResult<Vec<PeerIdentity>>;

    /// Replace the stored table with `peers`
    async fn save_peers(&self, peers: &[PeerIdentity]) -> PeerResult<()>;
}

pub struct SqlitePeerStore {
    pool: SqlitePool,
}

impl SqlitePeerStore {
    /// Open (or create) a SQLite peer database
    pub async fn new(db_url: &str) -> PeerResult<Self> {
        let pool = SqlitePool::connect(db_url).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS peers (
                peer_id TEXT PRIMARY KEY,
                display_name TEXT,
                favorite INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                addresses TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_peers_favorite ON peers(favorite)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// In-memory database (for testing)
    pub async fn new_in_memory() -> PeerResult<Self> {
        Self::new("sqlite::memory:").await
    }

    fn row_to_peer(row: &sqlx::sqlite::SqliteRow) -> PeerResult<PeerIdentity> {
        let id: String = row.try_get("peer_id")?;
        let id: PeerId = id.parse().map_err(PeerError::SerializationError)?;
        let favorite: i64 = row.try_get("favorite")?;

        Ok(PeerIdentity {
            id,
            display_name: row.try_get("display_name")?,
            favorite: favorite != 0,
            last_seen: row.try_get("last_seen")?,
            addresses: serde_json::from_str(&row.try_get::<String, _>("addresses")?)?,
            stale: false,
        })
    }
}

#[async_trait]
impl PeerStore for SqlitePeerStore {
    async fn load_peers(&self) -> PeerResult<Vec<PeerIdentity>> {
        let rows = sqlx::query("SELECT * FROM peers ORDER BY last_seen DESC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_peer).collect()
    }

    async fn save_peers(&self, peers: &[PeerIdentity]) -> PeerResult<()> {
        let mut tx = self.pool.begin().await?;

        for peer in peers {
            let addresses = serde_json::to_string(&peer.addresses)?;
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO peers
                (peer_id, display_name, favorite, last_seen, addresses)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(peer.id.to_hex())
            .bind(peer.display_name.clone())
            .bind(peer.favorite as i64)
            .bind(peer.last_seen)
            .bind(addresses)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

/// Store kept in process memory; can be told to fail for degradation tests
#[derive(Default)]
pub struct MemoryPeerStore {
    peers: Mutex<Vec<PeerIdentity>>,
    failing: AtomicBool,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    fn check(&self) -> PeerResult<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(PeerError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                "peer store unavailable",
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerStore for MemoryPeerStore {
    async fn load_peers(&self) -> PeerResult<Vec<PeerIdentity>> {
        self.check()?;
        Ok(self.peers.lock().clone())
    }

    async fn save_peers(&self, peers: &[PeerIdentity]) -> PeerResult<()> {
        self.check()?;
        *self.peers.lock() = peers.to_vec();
        Ok(())
    }
}
