use std::path::Path;

use anyhow::{Context, Result};
use chrono::Local;
use rusqlite::{Connection, params, params_from_iter};

use crate::matching::{keyword_tokens, normalize_name, rank_by_shared_tokens};
use crate::models::{
    CacheEntry, CorrectionSample, FoodEstimate, LoggedEstimate, NewCacheEntry,
    NewNutritionRecord, NutritionRecord, NutritionStats, Provenance, UpdateNutritionRecord,
};

const NUTRITION_COLUMNS: &str =
    "id, name, normalized_name, carbs_per_100g, provenance, category, created_at, updated_at";

const LOGGED_COLUMNS: &str = "id, user_id, analysis_id, food_name, weight_g, carbs_per_100g, total_carbs_g,
     confidence, rationale, corrected_weight_g, corrected_carbs_g, created_at, updated_at";

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS nutrition_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    normalized_name TEXT NOT NULL,
                    carbs_per_100g REAL NOT NULL,
                    provenance TEXT NOT NULL,
                    category TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS correction_samples (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL,
                    food_name TEXT NOT NULL,
                    weight_ratio REAL NOT NULL,
                    carbs_ratio REAL NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS analysis_cache (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL,
                    fingerprint TEXT NOT NULL,
                    estimates_json TEXT NOT NULL,
                    context TEXT,
                    captured_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_nutrition_normalized ON nutrition_records(normalized_name);
                CREATE INDEX IF NOT EXISTS idx_corrections_user_food ON correction_samples(user_id, food_name);
                CREATE INDEX IF NOT EXISTS idx_cache_user ON analysis_cache(user_id);

                PRAGMA user_version = 1;",
            )?;
        }

        if version < 2 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS logged_estimates (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL,
                    analysis_id TEXT NOT NULL,
                    food_name TEXT NOT NULL,
                    weight_g REAL NOT NULL,
                    carbs_per_100g REAL NOT NULL,
                    total_carbs_g REAL NOT NULL,
                    confidence REAL NOT NULL,
                    rationale TEXT NOT NULL DEFAULT '',
                    corrected_weight_g REAL,
                    corrected_carbs_g REAL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_logged_user ON logged_estimates(user_id);

                PRAGMA user_version = 2;",
            )?;
        }

        Ok(())
    }

    // --- Row mapping helpers ---

    fn nutrition_from_row(row: &rusqlite::Row) -> rusqlite::Result<NutritionRecord> {
        let provenance: String = row.get(4)?;
        Ok(NutritionRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            normalized_name: row.get(2)?,
            carbs_per_100g: row.get(3)?,
            provenance: provenance.parse().unwrap_or(Provenance::Manual),
            category: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn correction_from_row(row: &rusqlite::Row) -> rusqlite::Result<CorrectionSample> {
        Ok(CorrectionSample {
            id: row.get(0)?,
            user_id: row.get(1)?,
            food_name: row.get(2)?,
            weight_ratio: row.get(3)?,
            carbs_ratio: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn cache_entry_from_row(row: &rusqlite::Row) -> rusqlite::Result<CacheEntry> {
        let json: String = row.get(3)?;
        let estimates = serde_json::from_str(&json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(CacheEntry {
            id: row.get(0)?,
            user_id: row.get(1)?,
            fingerprint: row.get(2)?,
            estimates,
            context: row.get(4)?,
            captured_at: row.get(5)?,
        })
    }

    fn logged_estimate_from_row(row: &rusqlite::Row) -> rusqlite::Result<LoggedEstimate> {
        Ok(LoggedEstimate {
            id: row.get(0)?,
            user_id: row.get(1)?,
            analysis_id: row.get(2)?,
            food_name: row.get(3)?,
            weight_g: row.get(4)?,
            carbs_per_100g: row.get(5)?,
            total_carbs_g: row.get(6)?,
            confidence: row.get(7)?,
            rationale: row.get(8)?,
            corrected_weight_g: row.get(9)?,
            corrected_carbs_g: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    // --- Nutrition dictionary ---

    pub fn insert_nutrition(&self, record: &NewNutritionRecord) -> Result<NutritionRecord> {
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO nutrition_records (name, normalized_name, carbs_per_100g, provenance, category, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.name.trim(),
                normalize_name(&record.name),
                record.carbs_per_100g,
                record.provenance.as_str(),
                record.category,
                now,
                now,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_nutrition(id)
    }

    pub fn upsert_nutrition_by_name(&self, record: &NewNutritionRecord) -> Result<NutritionRecord> {
        if let Some(existing) = self.find_nutrition_by_name(&record.name)? {
            return Ok(existing);
        }
        self.insert_nutrition(record)
    }

    pub fn get_nutrition(&self, id: i64) -> Result<NutritionRecord> {
        self.conn
            .query_row(
                &format!("SELECT {NUTRITION_COLUMNS} FROM nutrition_records WHERE id = ?1"),
                params![id],
                Self::nutrition_from_row,
            )
            .context("Nutrition record not found")
    }

    /// Exact lookup on the normalized form of `name`.
    pub fn find_nutrition_by_name(&self, name: &str) -> Result<Option<NutritionRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {NUTRITION_COLUMNS} FROM nutrition_records WHERE normalized_name = ?1 ORDER BY id LIMIT 1"
        ))?;
        let mut rows = stmt.query(params![normalize_name(name)])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::nutrition_from_row(row)?))
        } else {
            Ok(None)
        }
    }

    /// Candidates sharing at least one keyword with `query`, ranked.
    pub fn search_nutrition(&self, query: &str, limit: usize) -> Result<Vec<NutritionRecord>> {
        let tokens = keyword_tokens(query);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let clauses = (1..=tokens.len())
            .map(|i| format!("normalized_name LIKE ?{i} ESCAPE '\\'"))
            .collect::<Vec<_>>()
            .join(" OR ");
        let patterns = tokens.iter().map(|t| {
            let escaped = t
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_");
            format!("%{escaped}%")
        });

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {NUTRITION_COLUMNS} FROM nutrition_records WHERE {clauses}"
        ))?;
        let candidates = stmt
            .query_map(params_from_iter(patterns), Self::nutrition_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rank_by_shared_tokens(query, candidates, limit))
    }

    pub fn list_nutrition(&self, search: Option<&str>, limit: usize) -> Result<Vec<NutritionRecord>> {
        if let Some(query) = search {
            return self.search_nutrition(query, limit);
        }
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {NUTRITION_COLUMNS} FROM nutrition_records ORDER BY normalized_name LIMIT ?1"
        ))?;
        let records = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], Self::nutrition_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn update_nutrition(&self, id: i64, update: &UpdateNutritionRecord) -> Result<NutritionRecord> {
        // Verify existence
        self.get_nutrition(id)?;

        let now = Local::now().to_rfc3339();
        if let Some(carbs) = update.carbs_per_100g {
            self.conn.execute(
                "UPDATE nutrition_records SET carbs_per_100g = ?1, updated_at = ?2 WHERE id = ?3",
                params![carbs, now, id],
            )?;
        }
        if let Some(ref category) = update.category {
            self.conn.execute(
                "UPDATE nutrition_records SET category = ?1, updated_at = ?2 WHERE id = ?3",
                params![category, now, id],
            )?;
        }

        self.get_nutrition(id)
    }

    pub fn nutrition_stats(&self) -> Result<NutritionStats> {
        let mut stats = NutritionStats {
            total: 0,
            curated: 0,
            public_lookup: 0,
            manual: 0,
        };
        let mut stmt = self
            .conn
            .prepare("SELECT provenance, COUNT(*) FROM nutrition_records GROUP BY provenance")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        for (provenance, count) in rows {
            stats.total += count;
            match provenance.parse() {
                Ok(Provenance::Curated) => stats.curated += count,
                Ok(Provenance::PublicLookup) => stats.public_lookup += count,
                Ok(Provenance::Manual) | Err(_) => stats.manual += count,
            }
        }
        Ok(stats)
    }

    // --- Correction samples ---

    pub fn insert_correction(
        &self,
        user_id: i64,
        food_name: &str,
        weight_ratio: f64,
        carbs_ratio: f64,
    ) -> Result<CorrectionSample> {
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO correction_samples (user_id, food_name, weight_ratio, carbs_ratio, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, normalize_name(food_name), weight_ratio, carbs_ratio, now],
        )?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, user_id, food_name, weight_ratio, carbs_ratio, created_at
                 FROM correction_samples WHERE id = ?1",
                params![id],
                Self::correction_from_row,
            )
            .context("Correction sample not found")
    }

    pub fn recent_corrections(
        &self,
        user_id: i64,
        normalized_food: &str,
        limit: usize,
    ) -> Result<Vec<CorrectionSample>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, food_name, weight_ratio, carbs_ratio, created_at
             FROM correction_samples
             WHERE user_id = ?1 AND food_name = ?2
             ORDER BY id DESC
             LIMIT ?3",
        )?;
        let samples = stmt
            .query_map(
                params![user_id, normalized_food, i64::try_from(limit).unwrap_or(i64::MAX)],
                Self::correction_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(samples)
    }

    pub fn list_corrections(&self, user_id: i64) -> Result<Vec<CorrectionSample>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, food_name, weight_ratio, carbs_ratio, created_at
             FROM correction_samples
             WHERE user_id = ?1
             ORDER BY id DESC",
        )?;
        let samples = stmt
            .query_map(params![user_id], Self::correction_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(samples)
    }

    // --- Analysis cache ---

    pub fn insert_cache_entry(&self, entry: &NewCacheEntry) -> Result<CacheEntry> {
        let now = Local::now().to_rfc3339();
        let json = serde_json::to_string(&entry.estimates)?;
        self.conn.execute(
            "INSERT INTO analysis_cache (user_id, fingerprint, estimates_json, context, captured_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![entry.user_id, entry.fingerprint, json, entry.context, now],
        )?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, user_id, fingerprint, estimates_json, context, captured_at
                 FROM analysis_cache WHERE id = ?1",
                params![id],
                Self::cache_entry_from_row,
            )
            .context("Cache entry not found")
    }

    pub fn cache_entries_for_user(&self, user_id: i64) -> Result<Vec<CacheEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, fingerprint, estimates_json, context, captured_at
             FROM analysis_cache
             WHERE user_id = ?1
             ORDER BY id DESC",
        )?;
        let entries = stmt
            .query_map(params![user_id], Self::cache_entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // --- Logged estimates ---

    pub fn insert_logged_estimate(
        &self,
        user_id: i64,
        analysis_id: &str,
        estimate: &FoodEstimate,
    ) -> Result<LoggedEstimate> {
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO logged_estimates (user_id, analysis_id, food_name, weight_g, carbs_per_100g, total_carbs_g, confidence, rationale, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                user_id,
                analysis_id,
                estimate.food_name,
                estimate.weight_g,
                estimate.carbs_per_100g,
                estimate.total_carbs_g,
                estimate.confidence,
                estimate.rationale,
                now,
                now,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_logged_estimate(id)
    }

    pub fn get_logged_estimate(&self, id: i64) -> Result<LoggedEstimate> {
        self.conn
            .query_row(
                &format!("SELECT {LOGGED_COLUMNS} FROM logged_estimates WHERE id = ?1"),
                params![id],
                Self::logged_estimate_from_row,
            )
            .context("Logged estimate not found")
    }

    pub fn list_logged_estimates(&self, user_id: i64, limit: usize) -> Result<Vec<LoggedEstimate>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LOGGED_COLUMNS} FROM logged_estimates WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2"
        ))?;
        let entries = stmt
            .query_map(
                params![user_id, i64::try_from(limit).unwrap_or(i64::MAX)],
                Self::logged_estimate_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn set_logged_correction(
        &self,
        id: i64,
        corrected_weight_g: f64,
        corrected_carbs_g: f64,
    ) -> Result<LoggedEstimate> {
        let now = Local::now().to_rfc3339();
        let rows = self.conn.execute(
            "UPDATE logged_estimates SET corrected_weight_g = ?1, corrected_carbs_g = ?2, updated_at = ?3 WHERE id = ?4",
            params![corrected_weight_g, corrected_carbs_g, now, id],
        )?;
        if rows == 0 {
            anyhow::bail!("Logged estimate not found");
        }
        self.get_logged_estimate(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, carbs: f64, provenance: Provenance) -> NewNutritionRecord {
        NewNutritionRecord {
            name: name.to_string(),
            carbs_per_100g: carbs,
            provenance,
            category: None,
        }
    }

    #[test]
    fn test_insert_and_get_nutrition() {
        let db = Database::open_in_memory().unwrap();
        let rec = db
            .insert_nutrition(&NewNutritionRecord {
                category: Some("féculents".to_string()),
                ..record("  Pâtes cuites ", 25.0, Provenance::Curated)
            })
            .unwrap();

        assert_eq!(rec.name, "Pâtes cuites");
        assert_eq!(rec.normalized_name, "pates cuites");
        assert_eq!(rec.provenance, Provenance::Curated);
        assert_eq!(rec.category.as_deref(), Some("féculents"));

        let fetched = db.get_nutrition(rec.id).unwrap();
        assert_eq!(fetched.name, rec.name);
        assert!(db.get_nutrition(999).is_err());
    }

    #[test]
    fn test_upsert_nutrition_by_name() {
        let db = Database::open_in_memory().unwrap();
        let a = db
            .upsert_nutrition_by_name(&record("Riz blanc", 28.0, Provenance::PublicLookup))
            .unwrap();
        let b = db
            .upsert_nutrition_by_name(&record("riz  BLANC", 30.0, Provenance::PublicLookup))
            .unwrap();

        // Same normalized name: the first record wins
        assert_eq!(a.id, b.id);
        assert!((b.carbs_per_100g - 28.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_search_nutrition_ranks_by_tokens() {
        let db = Database::open_in_memory().unwrap();
        db.insert_nutrition(&record("Riz au lait", 20.0, Provenance::Curated)).unwrap();
        db.insert_nutrition(&record("Riz blanc cuit", 28.0, Provenance::Curated)).unwrap();
        db.insert_nutrition(&record("Pâtes cuites", 25.0, Provenance::Curated)).unwrap();

        let results = db.search_nutrition("riz blanc", 5).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "Riz blanc cuit");

        let results = db.search_nutrition("Pâte", 5).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "Pâtes cuites");

        assert!(db.search_nutrition("chocolat", 5).unwrap().is_empty());
        assert!(db.search_nutrition("de", 5).unwrap().is_empty());
    }

    #[test]
    fn test_search_escapes_like_wildcards() {
        let db = Database::open_in_memory().unwrap();
        db.insert_nutrition(&record("Riz", 28.0, Provenance::Curated)).unwrap();
        assert!(db.search_nutrition("%%%_", 5).unwrap().is_empty());
    }

    #[test]
    fn test_update_nutrition() {
        let db = Database::open_in_memory().unwrap();
        let rec = db.insert_nutrition(&record("Pain", 50.0, Provenance::Manual)).unwrap();

        let updated = db
            .update_nutrition(
                rec.id,
                &UpdateNutritionRecord {
                    carbs_per_100g: Some(48.5),
                    category: Some(Some("boulangerie".to_string())),
                },
            )
            .unwrap();
        assert!((updated.carbs_per_100g - 48.5).abs() < f64::EPSILON);
        assert_eq!(updated.category.as_deref(), Some("boulangerie"));

        let cleared = db
            .update_nutrition(
                rec.id,
                &UpdateNutritionRecord {
                    carbs_per_100g: None,
                    category: Some(None),
                },
            )
            .unwrap();
        assert!(cleared.category.is_none());
        assert!(db.update_nutrition(42, &UpdateNutritionRecord::default()).is_err());
    }

    #[test]
    fn test_nutrition_stats() {
        let db = Database::open_in_memory().unwrap();
        db.insert_nutrition(&record("Pain", 50.0, Provenance::Curated)).unwrap();
        db.insert_nutrition(&record("Riz", 28.0, Provenance::Curated)).unwrap();
        db.insert_nutrition(&record("Nutella", 57.5, Provenance::PublicLookup)).unwrap();

        let stats = db.nutrition_stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.curated, 2);
        assert_eq!(stats.public_lookup, 1);
        assert_eq!(stats.manual, 0);
    }

    #[test]
    fn test_recent_corrections_newest_first_and_bounded() {
        let db = Database::open_in_memory().unwrap();
        for i in 1..=12 {
            db.insert_correction(1, "Riz", f64::from(i), 1.0).unwrap();
        }
        db.insert_correction(2, "riz", 9.0, 1.0).unwrap();
        db.insert_correction(1, "pâtes", 9.0, 1.0).unwrap();

        let samples = db.recent_corrections(1, "riz", 10).unwrap();
        assert_eq!(samples.len(), 10);
        assert!((samples[0].weight_ratio - 12.0).abs() < f64::EPSILON);
        assert!((samples[9].weight_ratio - 3.0).abs() < f64::EPSILON);
        assert!(samples.iter().all(|s| s.user_id == 1 && s.food_name == "riz"));

        assert_eq!(db.list_corrections(1).unwrap().len(), 13);
    }

    #[test]
    fn test_cache_entries_round_trip_estimates() {
        let db = Database::open_in_memory().unwrap();
        let estimates = vec![FoodEstimate::new("riz", 150.0, 28.0, 0.8, "bol")];
        db.insert_cache_entry(&NewCacheEntry {
            user_id: 7,
            fingerprint: "ab".repeat(32),
            estimates: estimates.clone(),
            context: Some("cantine".to_string()),
        })
        .unwrap();

        let entries = db.cache_entries_for_user(7).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].estimates, estimates);
        assert_eq!(entries[0].context.as_deref(), Some("cantine"));
        assert!(db.cache_entries_for_user(8).unwrap().is_empty());
    }

    #[test]
    fn test_logged_estimate_correction() {
        let db = Database::open_in_memory().unwrap();
        let estimate = FoodEstimate::new("pâtes", 200.0, 30.0, 0.7, "");
        let logged = db.insert_logged_estimate(3, "analysis-1", &estimate).unwrap();
        assert!(logged.corrected_carbs_g.is_none());
        assert!((logged.total_carbs_g - 60.0).abs() < f64::EPSILON);

        let corrected = db.set_logged_correction(logged.id, 180.0, 45.0).unwrap();
        assert_eq!(corrected.corrected_weight_g, Some(180.0));
        assert!((corrected.effective_carbs_g() - 45.0).abs() < f64::EPSILON);

        assert_eq!(db.list_logged_estimates(3, 50).unwrap().len(), 1);
        assert!(db.set_logged_correction(999, 1.0, 1.0).is_err());
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("glucimiam.db");
        {
            let db = Database::open(&path).unwrap();
            db.insert_nutrition(&record("Pain", 50.0, Provenance::Curated)).unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.nutrition_stats().unwrap().total, 1);
    }
}
