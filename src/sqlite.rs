//! # SQLite Area Store
//!
//! Durable [`AreaStore`] for user profiles and unveiled areas.
//!
//! ## Layout
//!
//! - `users`: one row per user with the active region
//! - `unveiled_areas`: one row per (user, region); geometry and covered id
//!   sets are MessagePack blobs, area is kept as a plain column for queries
//!
//! Each `save_area` is a single `INSERT OR REPLACE`, so a record is replaced
//! whole or not at all.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use geo::MultiPolygon;
use log::info;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, UnveilError};
use crate::merge::UnveiledArea;
use crate::store::AreaStore;
use crate::{OwnerId, UserProfile};

pub struct SqliteAreaStore {
    conn: Mutex<Connection>,
}

impl SqliteAreaStore {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        info!("[SqliteAreaStore] Opened {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- One active region per user
            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                region_id INTEGER,
                created_at INTEGER NOT NULL
            );

            -- Cumulative explored geometry per (user, region)
            CREATE TABLE IF NOT EXISTS unveiled_areas (
                user_id TEXT NOT NULL,
                region_id INTEGER NOT NULL,
                geometry BLOB NOT NULL,
                covered_streets BLOB NOT NULL,
                covered_blocks BLOB NOT NULL,
                area_m2 REAL NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, region_id)
            );

            CREATE INDEX IF NOT EXISTS idx_areas_region ON unveiled_areas(region_id);
        "#,
        )?;
        Ok(())
    }

    fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec(value).map_err(|e| UnveilError::Persistence {
        message: format!("encode: {}", e),
    })
}

fn decode<T: DeserializeOwned>(blob: &[u8]) -> Result<T> {
    rmp_serde::from_slice(blob).map_err(|e| UnveilError::Persistence {
        message: format!("decode: {}", e),
    })
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| UnveilError::Persistence {
        message: format!("timestamp out of range: {}", ms),
    })
}

/// Raw columns of one `unveiled_areas` row.
type AreaRow = (String, u32, Vec<u8>, Vec<u8>, Vec<u8>, f64, i64);

fn area_from_row(row: AreaRow) -> Result<UnveiledArea> {
    let (user_id, region_id, geometry, streets, blocks, area_m2, updated_at) = row;
    Ok(UnveiledArea {
        owner: OwnerId::new(user_id, region_id),
        geometry: decode::<MultiPolygon<f64>>(&geometry)?,
        covered_street_ids: decode::<BTreeSet<String>>(&streets)?,
        covered_block_ids: decode::<BTreeSet<String>>(&blocks)?,
        area_m2,
        updated_at: from_millis(updated_at)?,
    })
}

fn read_area_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AreaRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

const AREA_COLUMNS: &str =
    "user_id, region_id, geometry, covered_streets, covered_blocks, area_m2, updated_at";

impl AreaStore for SqliteAreaStore {
    fn load_user(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let conn = self.connection();
        let row: Option<(Option<u32>, i64)> = conn
            .query_row(
                "SELECT region_id, created_at FROM users WHERE user_id = ?",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(|(region_id, created_at)| {
            Ok(UserProfile {
                user_id: user_id.to_string(),
                region_id,
                created_at: from_millis(created_at)?,
            })
        })
        .transpose()
    }

    fn save_user(&self, profile: &UserProfile) -> Result<()> {
        self.connection().execute(
            "INSERT OR REPLACE INTO users (user_id, region_id, created_at) VALUES (?, ?, ?)",
            params![
                profile.user_id,
                profile.region_id,
                profile.created_at.timestamp_millis()
            ],
        )?;
        Ok(())
    }

    fn load_area(&self, owner: &OwnerId) -> Result<Option<UnveiledArea>> {
        let conn = self.connection();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM unveiled_areas WHERE user_id = ? AND region_id = ?",
                    AREA_COLUMNS
                ),
                params![owner.user_id, owner.region_id],
                read_area_row,
            )
            .optional()?;
        row.map(area_from_row).transpose()
    }

    fn save_area(&self, area: &UnveiledArea) -> Result<()> {
        let geometry = encode(&area.geometry)?;
        let streets = encode(&area.covered_street_ids)?;
        let blocks = encode(&area.covered_block_ids)?;

        self.connection().execute(
            &format!(
                "INSERT OR REPLACE INTO unveiled_areas ({}) VALUES (?, ?, ?, ?, ?, ?, ?)",
                AREA_COLUMNS
            ),
            params![
                area.owner.user_id,
                area.owner.region_id,
                geometry,
                streets,
                blocks,
                area.area_m2,
                area.updated_at.timestamp_millis()
            ],
        )?;
        Ok(())
    }

    fn list_areas_for_user(&self, user_id: &str) -> Result<Vec<UnveiledArea>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM unveiled_areas WHERE user_id = ? ORDER BY region_id",
            AREA_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![user_id], read_area_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(area_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    fn sample_area() -> UnveiledArea {
        let mut area = UnveiledArea::empty(OwnerId::new("u-1", 3));
        area.geometry = MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0),
            (x: 10.0, y: 0.0),
            (x: 10.0, y: 10.0),
            (x: 0.0, y: 10.0),
        ]]);
        area.area_m2 = 100.0;
        area.covered_street_ids.insert("s-1".to_string());
        area.covered_block_ids.insert("b-9".to_string());
        // Millisecond precision survives storage
        area.updated_at = from_millis(1_700_000_000_123).unwrap();
        area
    }

    #[test]
    fn test_area_round_trip() {
        let store = SqliteAreaStore::in_memory().unwrap();
        let area = sample_area();
        store.save_area(&area).unwrap();

        assert_eq!(store.load_area(&area.owner).unwrap(), Some(area.clone()));
        assert!(store.load_area(&OwnerId::new("u-1", 4)).unwrap().is_none());
        assert_eq!(store.list_areas_for_user("u-1").unwrap(), vec![area]);
    }

    #[test]
    fn test_save_area_replaces() {
        let store = SqliteAreaStore::in_memory().unwrap();
        let mut area = sample_area();
        store.save_area(&area).unwrap();
        area.area_m2 = 150.0;
        store.save_area(&area).unwrap();

        let loaded = store.list_areas_for_user("u-1").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].area_m2, 150.0);
    }

    #[test]
    fn test_user_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fog.db");

        let mut profile = UserProfile::new("u-7");
        profile.region_id = Some(2);
        profile.created_at = from_millis(1_700_000_000_000).unwrap();
        SqliteAreaStore::open(&path).unwrap().save_user(&profile).unwrap();

        let reopened = SqliteAreaStore::open(&path).unwrap();
        assert_eq!(reopened.load_user("u-7").unwrap(), Some(profile));
        assert!(reopened.load_user("nobody").unwrap().is_none());
    }
}
