// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable key-value storage scoped by table name.
//!
//! Values are opaque strings (the telemetry batcher stores JSON arrays).
//! Writes to the same key are serialized; a write is never lost mid-flight.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::error::Result;

/// Durable key-value capability.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Read a value. `None` if the key is absent.
    async fn get(&self, table: &str, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one.
    async fn set(&self, table: &str, key: &str, value: &str) -> Result<()>;

    /// Remove a key. Removing an absent key succeeds.
    async fn delete(&self, table: &str, key: &str) -> Result<()>;

    /// Remove every key of a table.
    async fn reset(&self, table: &str) -> Result<()>;
}

/// In-process store, for tests and for titles without local storage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys in `table`.
    pub fn len(&self, table: &str) -> usize {
        self.tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(table)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<String>> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tables.get(table).and_then(|t| t.get(key)).cloned())
    }

    async fn set(&self, table: &str, key: &str, value: &str) -> Result<()> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, table: &str, key: &str) -> Result<()> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(t) = tables.get_mut(table) {
            t.remove(key);
        }
        Ok(())
    }

    async fn reset(&self, table: &str) -> Result<()> {
        self.tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(table);
        Ok(())
    }
}

/// Bytes escaped in path segments. Only `[A-Za-z0-9_-]` pass through, so
/// `.` and `/` never appear in an encoded segment.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

/// File-backed store: one file per key under `<root>/<table>/`.
///
/// Table and key names are percent-encoded into path segments, so distinct
/// names never share a file. Writes go to a temporary file that is then
/// renamed over the target. Writers of the same key take a per-key lock,
/// and `reset` excludes every other operation while it runs.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    tables: RwLock<()>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
            tables: RwLock::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_dir(&self, table: &str) -> PathBuf {
        table
            .split('/')
            .filter(|s| !s.is_empty())
            .fold(self.root.clone(), |dir, segment| {
                dir.join(encode_segment(segment))
            })
    }

    fn key_path(&self, table: &str, key: &str) -> PathBuf {
        self.table_dir(table).join(encode_segment(key))
    }

    fn key_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }
}

fn encode_segment(segment: &str) -> String {
    if segment.is_empty() {
        // "%" alone is never produced by the encoder.
        return "%".to_string();
    }
    utf8_percent_encode(segment, SEGMENT).to_string()
}

#[async_trait]
impl DurableStore for FileStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<String>> {
        let _tables = self.tables.read().await;
        let path = self.key_path(table, key);
        let lock = self.key_lock(&path);
        let _guard = lock.lock().await;
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, value), fields(len = value.len()))]
    async fn set(&self, table: &str, key: &str, value: &str) -> Result<()> {
        let _tables = self.tables.read().await;
        let path = self.key_path(table, key);
        let lock = self.key_lock(&path);
        let _guard = lock.lock().await;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Encoded keys never contain '.', so this cannot name another key.
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), "durable value written");
        Ok(())
    }

    async fn delete(&self, table: &str, key: &str) -> Result<()> {
        let _tables = self.tables.read().await;
        let path = self.key_path(table, key);
        let lock = self.key_lock(&path);
        let _guard = lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn reset(&self, table: &str) -> Result<()> {
        let _tables = self.tables.write().await;
        let dir = self.table_dir(table);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
