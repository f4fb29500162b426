//! Persisted app registry.
//!
//! The whole registry is one JSON document. Every mutation goes through a
//! single writer task fed by an unbounded FIFO channel, so each mutator sees
//! the result of every mutator queued before it. Within the writer, a write:
//!
//! 1. takes an exclusive advisory lock on `<doc>.lock` (shared with any other
//!    deckhand process pointed at the same root),
//! 2. re-reads the document from disk,
//! 3. applies the mutator; an error leaves the file untouched,
//! 4. writes `<doc>.tmp`, fsyncs it and renames it over the document.
//!
//! Reads go straight to the file and never observe a partial document.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use deckhand_common::{AppRecord, RegistryDocument, Runtime, Settings};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::errors::{RegistryError, SupervisorError, SupervisorResult};

type WriteJob = Box<dyn FnOnce() + Send + 'static>;

/// Partial update of the user-editable fields of an [`AppRecord`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppPatch {
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub install_command: Option<String>,
    pub build_command: Option<String>,
    pub start_command: Option<String>,
    pub mute_alerts: Option<bool>,
}

impl AppPatch {
    pub fn is_empty(&self) -> bool {
        *self == AppPatch::default()
    }

    pub fn apply(self, app: &mut AppRecord) {
        if let Some(repo) = self.repo {
            app.repo = repo;
        }
        if let Some(branch) = self.branch {
            app.branch = branch;
        }
        if let Some(cmd) = self.install_command {
            app.install_command = cmd;
        }
        if let Some(cmd) = self.build_command {
            app.build_command = cmd;
        }
        if let Some(cmd) = self.start_command {
            app.start_command = cmd;
        }
        if let Some(mute) = self.mute_alerts {
            app.mute_alerts = mute;
        }
    }
}

/// Handle to the registry. Cheap to clone; all clones share one writer.
#[derive(Clone)]
pub struct AppRegistry {
    path: PathBuf,
    tx: mpsc::UnboundedSender<WriteJob>,
}

impl AppRegistry {
    /// Open (and if needed initialize) the registry at `path`, then spawn the
    /// writer task. Must be called from within a tokio runtime.
    ///
    /// A missing or empty file becomes an empty document; a file that does not
    /// parse is reported as [`RegistryError::Corrupt`].
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| RegistryError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        {
            let _guard = lock_document(&path)?;
            if read_document(&path)?.is_none() {
                debug!(path = %path.display(), "initializing empty registry");
                write_document(&path, &RegistryDocument::empty(Utc::now()))?;
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<WriteJob>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(e) = tokio::task::spawn_blocking(job).await {
                    warn!(error = %e, "registry write job panicked");
                }
            }
        });

        Ok(Self { path, tx })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current document as stored on disk.
    pub async fn document(&self) -> Result<RegistryDocument, RegistryError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RegistryDocument::empty(Utc::now()));
            }
            Err(source) => {
                return Err(RegistryError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        parse_document(&self.path, &raw).map(|doc| doc.unwrap_or_else(|| RegistryDocument::empty(Utc::now())))
    }

    pub async fn get(&self, name: &str) -> Result<Option<AppRecord>, RegistryError> {
        Ok(self.document().await?.apps.remove(name))
    }

    pub async fn get_all(&self) -> Result<BTreeMap<String, AppRecord>, RegistryError> {
        Ok(self.document().await?.apps)
    }

    /// Like [`get`](Self::get) but `NotFound` for unknown apps.
    pub async fn require(&self, name: &str) -> SupervisorResult<AppRecord> {
        self.get(name)
            .await?
            .ok_or_else(|| SupervisorError::not_found(name))
    }

    pub async fn settings(&self) -> Result<Settings, RegistryError> {
        Ok(self.document().await?.settings)
    }

    /// Queue `mutator` on the writer and wait for its result.
    ///
    /// The document is only rewritten when the mutator succeeds and actually
    /// changed something.
    pub async fn mutate<T, F>(&self, mutator: F) -> SupervisorResult<T>
    where
        F: FnOnce(&mut RegistryDocument) -> SupervisorResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let path = self.path.clone();
        let job: WriteJob = Box::new(move || {
            let _ = reply_tx.send(apply_locked(&path, mutator));
        });
        self.tx.send(job).map_err(|_| RegistryError::WriterGone)?;
        reply_rx.await.map_err(|_| RegistryError::WriterGone)?
    }

    /// Insert or replace the record for `name`. The mutator receives the
    /// current record (if any) and returns the new one; `name` and
    /// `updatedAt` are stamped afterwards.
    pub async fn upsert<F>(&self, name: &str, mutator: F) -> SupervisorResult<AppRecord>
    where
        F: FnOnce(Option<AppRecord>) -> SupervisorResult<AppRecord> + Send + 'static,
    {
        let name = name.to_string();
        self.mutate(move |doc| {
            let current = doc.apps.get(&name).cloned();
            let mut next = mutator(current)?;
            next.name = name.clone();
            next.updated_at = Utc::now();
            doc.apps.insert(name, next.clone());
            Ok(next)
        })
        .await
    }

    /// Create a new record; `AlreadyExists` if the name is taken.
    pub async fn insert(&self, app: AppRecord) -> SupervisorResult<AppRecord> {
        self.mutate(move |doc| {
            if doc.apps.contains_key(&app.name) {
                return Err(SupervisorError::AlreadyExists { name: app.name });
            }
            doc.apps.insert(app.name.clone(), app.clone());
            Ok(app)
        })
        .await
    }

    /// Mutate an existing record in place; `NotFound` for unknown apps. A
    /// mutator error aborts the write.
    pub async fn update<T, F>(&self, name: &str, mutator: F) -> SupervisorResult<T>
    where
        F: FnOnce(&mut AppRecord) -> SupervisorResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let name = name.to_string();
        self.mutate(move |doc| {
            let app = doc
                .apps
                .get_mut(&name)
                .ok_or_else(|| SupervisorError::not_found(&name))?;
            let before = app.clone();
            let out = mutator(app)?;
            if *app != before {
                app.updated_at = Utc::now();
            }
            Ok(out)
        })
        .await
    }

    pub async fn patch(&self, name: &str, patch: AppPatch) -> SupervisorResult<AppRecord> {
        self.update(name, move |app| {
            patch.apply(app);
            Ok(app.clone())
        })
        .await
    }

    /// Mutate only the runtime block of an app.
    pub async fn update_runtime<F>(&self, name: &str, mutator: F) -> SupervisorResult<Runtime>
    where
        F: FnOnce(&mut Runtime) + Send + 'static,
    {
        let name = name.to_string();
        self.mutate(move |doc| {
            let app = doc
                .apps
                .get_mut(&name)
                .ok_or_else(|| SupervisorError::not_found(&name))?;
            mutator(&mut app.runtime);
            Ok(app.runtime.clone())
        })
        .await
    }

    /// Remove `name`, returning the removed record if it existed.
    pub async fn delete(&self, name: &str) -> SupervisorResult<Option<AppRecord>> {
        let name = name.to_string();
        self.mutate(move |doc| Ok(doc.apps.remove(&name))).await
    }

    pub async fn update_settings<F>(&self, mutator: F) -> SupervisorResult<Settings>
    where
        F: FnOnce(&mut Settings) + Send + 'static,
    {
        self.mutate(move |doc| {
            mutator(&mut doc.settings);
            Ok(doc.settings.clone())
        })
        .await
    }
}

/// Runs on a blocking thread, inside the writer task's FIFO order.
fn apply_locked<T, F>(path: &Path, mutator: F) -> SupervisorResult<T>
where
    F: FnOnce(&mut RegistryDocument) -> SupervisorResult<T>,
{
    let _guard = lock_document(path)?;
    let mut doc = read_document(path)?.unwrap_or_else(|| RegistryDocument::empty(Utc::now()));
    let before = doc.clone();
    let out = mutator(&mut doc)?;
    if doc != before {
        doc.meta.updated_at = Utc::now();
        write_document(path, &doc)?;
    }
    Ok(out)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

/// Exclusive advisory lock, released when the returned file is dropped.
fn lock_document(path: &Path) -> Result<File, RegistryError> {
    let lock_path = sibling(path, ".lock");
    let io_err = |source| RegistryError::Io {
        path: lock_path.clone(),
        source,
    };
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(io_err)?;
    FileExt::lock_exclusive(&file).map_err(io_err)?;
    Ok(file)
}

/// `Ok(None)` for a missing or blank file.
fn read_document(path: &Path) -> Result<Option<RegistryDocument>, RegistryError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => parse_document(path, &raw),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(RegistryError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn parse_document(path: &Path, raw: &str) -> Result<Option<RegistryDocument>, RegistryError> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(raw)
        .map(Some)
        .map_err(|source| RegistryError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

fn write_document(path: &Path, doc: &RegistryDocument) -> Result<(), RegistryError> {
    let json = serde_json::to_string_pretty(doc).map_err(RegistryError::Serialize)?;
    let tmp = sibling(path, ".tmp");
    let io_err = |p: &Path| {
        let p = p.to_path_buf();
        move |source| RegistryError::Io { path: p, source }
    };

    let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
    file.write_all(json.as_bytes()).map_err(io_err(&tmp))?;
    file.sync_all().map_err(io_err(&tmp))?;
    drop(file);
    std::fs::rename(&tmp, path).map_err(io_err(path))?;
    Ok(())
}
