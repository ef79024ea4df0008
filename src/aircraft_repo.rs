//! Aircraft reference data: last-seen tracking rows, hex→registration
//! lookups, and photo records.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::db::{fmt_ts, parse_ts, DbPool};

#[derive(Debug, Clone, Serialize)]
pub struct TrackedAircraft {
    pub identifier: String,
    pub hex: Option<String>,
    pub flight: Option<String>,
    pub tail: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub message_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationRecord {
    pub hex: String,
    pub registration: String,
    pub aircraft_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhotoRecord {
    pub id: String,
    pub registration: String,
    pub filepath: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AircraftRepository {
    pool: DbPool,
}

impl AircraftRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Aircraft with persisted messages, most recently heard first.
    pub async fn get_active_aircraft(&self, limit: usize) -> Result<Vec<TrackedAircraft>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT identifier, hex, flight, tail, last_seen, message_count
                 FROM aircraft_tracking
                 ORDER BY last_seen DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, u64>(5)?,
                ))
            })?;

            let mut aircraft = Vec::new();
            for row in rows {
                let (identifier, hex, flight, tail, last_seen, message_count) = row?;
                aircraft.push(TrackedAircraft {
                    identifier,
                    hex,
                    flight,
                    tail,
                    last_seen: parse_ts(&last_seen)?,
                    message_count,
                });
            }
            Ok(aircraft)
        })
        .await?
    }

    /// Resolve an ICAO 24-bit hex to a registration.
    pub async fn lookup_registration(&self, hex: &str) -> Result<Option<RegistrationRecord>> {
        let pool = self.pool.clone();
        let hex = hex.trim().to_uppercase();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let record = conn
                .query_row(
                    "SELECT hex, registration, aircraft_type
                     FROM hex_to_registration WHERE hex = ?1",
                    [&hex],
                    |row| {
                        Ok(RegistrationRecord {
                            hex: row.get(0)?,
                            registration: row.get(1)?,
                            aircraft_type: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(record)
        })
        .await?
    }

    /// Bulk-load the hex→registration table (boot-time seeding).
    pub async fn seed_registrations(&self, records: Vec<RegistrationRecord>) -> Result<usize> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let tx = conn.transaction()?;
            let mut loaded = 0usize;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO hex_to_registration (hex, registration, aircraft_type)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT (hex) DO UPDATE SET
                         registration = excluded.registration,
                         aircraft_type = excluded.aircraft_type",
                )?;
                for record in &records {
                    stmt.execute(params![
                        record.hex.to_uppercase(),
                        record.registration,
                        record.aircraft_type
                    ])?;
                    loaded += 1;
                }
            }
            tx.commit()?;
            Ok(loaded)
        })
        .await?
    }

    pub async fn save_photo(&self, registration: &str, id: &str, filepath: &str) -> Result<()> {
        let pool = self.pool.clone();
        let (registration, id, filepath) = (
            registration.to_uppercase(),
            id.to_string(),
            filepath.to_string(),
        );
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            conn.execute(
                "INSERT OR REPLACE INTO aircraft_photos (id, registration, filepath, fetched_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, registration, filepath, fmt_ts(Utc::now())],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn get_photos(&self, registration: &str) -> Result<Vec<PhotoRecord>> {
        let pool = self.pool.clone();
        let registration = registration.to_uppercase();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT id, registration, filepath, fetched_at
                 FROM aircraft_photos WHERE registration = ?1
                 ORDER BY fetched_at DESC",
            )?;
            let rows = stmt.query_map([&registration], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;
            let mut photos = Vec::new();
            for row in rows {
                let (id, registration, filepath, fetched_at) = row?;
                photos.push(PhotoRecord {
                    id,
                    registration,
                    filepath,
                    fetched_at: parse_ts(&fetched_at)?,
                });
            }
            Ok(photos)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_pool;

    #[tokio::test]
    async fn test_registration_lookup_is_case_insensitive() {
        let (_dir, pool) = temp_pool();
        let repo = AircraftRepository::new(pool);
        repo.seed_registrations(vec![RegistrationRecord {
            hex: "adfeb4".into(),
            registration: "73-1677".into(),
            aircraft_type: Some("E-4B".into()),
        }])
        .await
        .unwrap();

        let hit = repo.lookup_registration("ADFEB4").await.unwrap().unwrap();
        assert_eq!(hit.registration, "73-1677");
        assert_eq!(hit.aircraft_type.as_deref(), Some("E-4B"));
        assert!(repo.lookup_registration("000000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_photo_round_trip() {
        let (_dir, pool) = temp_pool();
        let repo = AircraftRepository::new(pool);
        repo.save_photo("N900WN", "p1", "data/photos/N900WN_p1.jpg")
            .await
            .unwrap();
        let photos = repo.get_photos("n900wn").await.unwrap();
        assert_eq!(photos.len(), 1);
        assert_eq!(photos[0].filepath, "data/photos/N900WN_p1.jpg");
    }
}
