//! Column-name coalescing for dynamic result rows (spec.md §9): different
//! backends return driver-native column casing (camelCase as declared in
//! the schema vs. lowercase folding some backends apply), so every read
//! path goes through these helpers rather than indexing a row by a single
//! spelling.

use blockdb_common::model::Hash;
use sqlx::any::AnyRow;
use sqlx::Row;
use std::str::FromStr;

use crate::core::error::{BlockchainError, BlockchainResult};

fn col_err(name: &str) -> BlockchainError {
    BlockchainError::Other(format!("column `{name}` missing from result row (checked original and lowercase spelling)"))
}

pub fn get_text(row: &AnyRow, name: &str) -> BlockchainResult<String> {
    row.try_get::<String, _>(name)
        .or_else(|_| row.try_get::<String, _>(name.to_lowercase().as_str()))
        .map_err(|_| col_err(name))
}

pub fn get_opt_text(row: &AnyRow, name: &str) -> BlockchainResult<Option<String>> {
    if let Ok(v) = row.try_get::<Option<String>, _>(name) {
        return Ok(v);
    }
    row.try_get::<Option<String>, _>(name.to_lowercase().as_str()).map_err(|_| col_err(name))
}

pub fn get_blob(row: &AnyRow, name: &str) -> BlockchainResult<Vec<u8>> {
    row.try_get::<Vec<u8>, _>(name)
        .or_else(|_| row.try_get::<Vec<u8>, _>(name.to_lowercase().as_str()))
        .map_err(|_| col_err(name))
}

pub fn get_i64(row: &AnyRow, name: &str) -> BlockchainResult<i64> {
    row.try_get::<i64, _>(name)
        .or_else(|_| row.try_get::<i64, _>(name.to_lowercase().as_str()))
        .map_err(|_| col_err(name))
}

pub fn get_opt_i64(row: &AnyRow, name: &str) -> BlockchainResult<Option<i64>> {
    if let Ok(v) = row.try_get::<Option<i64>, _>(name) {
        return Ok(v);
    }
    row.try_get::<Option<i64>, _>(name.to_lowercase().as_str()).map_err(|_| col_err(name))
}

pub fn get_f64(row: &AnyRow, name: &str) -> BlockchainResult<f64> {
    row.try_get::<f64, _>(name)
        .or_else(|_| row.try_get::<f64, _>(name.to_lowercase().as_str()))
        .map_err(|_| col_err(name))
}

pub fn get_bool(row: &AnyRow, name: &str) -> BlockchainResult<bool> {
    row.try_get::<bool, _>(name)
        .or_else(|_| row.try_get::<bool, _>(name.to_lowercase().as_str()))
        .map_err(|_| col_err(name))
}

pub fn get_hash(row: &AnyRow, name: &str) -> BlockchainResult<Hash> {
    let text = get_text(row, name)?;
    Hash::from_str(&text).map_err(|_| BlockchainError::Other(format!("column `{name}` held a malformed hash")))
}
