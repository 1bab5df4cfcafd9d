use std::sync::{Mutex, PoisonError};

use anyhow::Result;

use crate::db::Database;
use crate::models::{CacheEntry, CorrectionSample, NewCacheEntry, NewNutritionRecord, NutritionRecord};

/// Persistence the analysis pipeline reads and writes.
///
/// Every method is a single independent operation; implementations must not
/// expect a caller to hold anything between calls.
pub trait AnalysisStore: Send + Sync {
    /// Dictionary matches for `query`, best first.
    fn search_nutrition(&self, query: &str, limit: usize) -> Result<Vec<NutritionRecord>>;
    /// Persist a record unless one with the same normalized name exists, in
    /// which case the existing record is returned.
    fn insert_nutrition(&self, record: &NewNutritionRecord) -> Result<NutritionRecord>;
    /// Most recent samples for a user and normalized food name, newest first.
    fn recent_corrections(
        &self,
        user_id: i64,
        normalized_food: &str,
        limit: usize,
    ) -> Result<Vec<CorrectionSample>>;
    fn cache_entries(&self, user_id: i64) -> Result<Vec<CacheEntry>>;
    fn insert_cache_entry(&self, entry: &NewCacheEntry) -> Result<CacheEntry>;
}

impl AnalysisStore for Mutex<Database> {
    fn search_nutrition(&self, query: &str, limit: usize) -> Result<Vec<NutritionRecord>> {
        let db = self.lock().unwrap_or_else(PoisonError::into_inner);
        db.search_nutrition(query, limit)
    }

    fn insert_nutrition(&self, record: &NewNutritionRecord) -> Result<NutritionRecord> {
        let db = self.lock().unwrap_or_else(PoisonError::into_inner);
        db.upsert_nutrition_by_name(record)
    }

    fn recent_corrections(
        &self,
        user_id: i64,
        normalized_food: &str,
        limit: usize,
    ) -> Result<Vec<CorrectionSample>> {
        let db = self.lock().unwrap_or_else(PoisonError::into_inner);
        db.recent_corrections(user_id, normalized_food, limit)
    }

    fn cache_entries(&self, user_id: i64) -> Result<Vec<CacheEntry>> {
        let db = self.lock().unwrap_or_else(PoisonError::into_inner);
        db.cache_entries_for_user(user_id)
    }

    fn insert_cache_entry(&self, entry: &NewCacheEntry) -> Result<CacheEntry> {
        let db = self.lock().unwrap_or_else(PoisonError::into_inner);
        db.insert_cache_entry(entry)
    }
}
