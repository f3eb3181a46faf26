//! # Store
//!
//! JSON document store on the local filesystem.
//!
//! ```text
//! DATA_DIR/
//!   users.json          map of username -> User
//!   products.json       [Product]
//!   collections.json    [Collection]
//!   quizzes.json        [Quiz]
//!   <username>/
//!     diet.json         [DietEntry]
//!     water.json        [WaterDay]
//!     grants.json       [AccessGrant]
//! ```
//!
//! Each file is rewritten whole through a temp file in the same directory and
//! renamed over the target, so readers never observe a half written document.
//! Read-modify-write cycles are serialized by a single mutex; closures passed to
//! [`Store::update`] must not call back into the store.
use std::{
    fs::{self, create_dir_all},
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use serde::{Serialize, de::DeserializeOwned};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::AppError;

pub const USERS_FILE: &str = "users.json";
pub const PRODUCTS_FILE: &str = "products.json";
pub const COLLECTIONS_FILE: &str = "collections.json";
pub const QUIZZES_FILE: &str = "quizzes.json";
pub const DIET_FILE: &str = "diet.json";
pub const WATER_FILE: &str = "water.json";
pub const GRANTS_FILE: &str = "grants.json";

pub struct Store {
    root: PathBuf,
    lock: Mutex<()>,
}

impl Store {
    /// Opens the store, creating the root directory if it does not exist.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, AppError> {
        let root = root.into();
        if !root.exists() {
            info!("Creating data directory {}", root.display());
            create_dir_all(&root)?;
        }

        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative path of a per-user document.
    pub fn user_file(username: &str, file: &str) -> String {
        format!("{username}/{file}")
    }

    /// Reads a document, returning `T::default()` when the file does not exist yet.
    pub fn read<T: DeserializeOwned + Default>(&self, relative: &str) -> Result<T, AppError> {
        let _guard = self.guard()?;
        self.read_unlocked(relative)
    }

    /// Replaces a document.
    pub fn write<T: Serialize>(&self, relative: &str, value: &T) -> Result<(), AppError> {
        let _guard = self.guard()?;
        self.write_unlocked(relative, value)
    }

    /// Locked read-modify-write. The document is only written back when `f` succeeds.
    pub fn update<T, R, F>(&self, relative: &str, f: F) -> Result<R, AppError>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnOnce(&mut T) -> Result<R, AppError>,
    {
        let _guard = self.guard()?;
        let mut document: T = self.read_unlocked(relative)?;
        let result = f(&mut document)?;
        self.write_unlocked(relative, &document)?;
        Ok(result)
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>, AppError> {
        self.lock
            .lock()
            .map_err(|_| AppError::internal("store lock poisoned"))
    }

    fn read_unlocked<T: DeserializeOwned + Default>(&self, relative: &str) -> Result<T, AppError> {
        let path = self.root.join(relative);
        if !path.exists() {
            return Ok(T::default());
        }

        let contents = fs::read_to_string(&path)?;
        if contents.trim().is_empty() {
            return Ok(T::default());
        }

        Ok(serde_json::from_str(&contents)?)
    }

    fn write_unlocked<T: Serialize>(&self, relative: &str, value: &T) -> Result<(), AppError> {
        let path = self.root.join(relative);
        let parent = path.parent().unwrap_or(&self.root);
        create_dir_all(parent)?;

        let json = serde_json::to_string_pretty(value)?;
        let mut file = NamedTempFile::new_in(parent)?;
        file.write_all(json.as_bytes())?;
        file.persist(&path).map_err(|e| e.error)?;

        debug!("Wrote {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn missing_documents_read_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let users: HashMap<String, String> = store.read(USERS_FILE).unwrap();
        assert!(users.is_empty());

        let entries: Vec<u32> = store.read(&Store::user_file("alice", DIET_FILE)).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn update_persists_only_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        store
            .update(PRODUCTS_FILE, |items: &mut Vec<u32>| {
                items.push(7);
                Ok(())
            })
            .unwrap();

        let failed: Result<(), AppError> = store.update(PRODUCTS_FILE, |items: &mut Vec<u32>| {
            items.push(8);
            Err(AppError::bad_request("nope"))
        });
        assert!(failed.is_err());

        let items: Vec<u32> = store.read(PRODUCTS_FILE).unwrap();
        assert_eq!(items, vec![7]);
    }

    #[test]
    fn per_user_documents_live_in_their_own_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        store
            .write(&Store::user_file("bob", WATER_FILE), &vec![1, 2, 3])
            .unwrap();

        assert!(dir.path().join("bob").join(WATER_FILE).exists());
    }
}
