use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use tracing::{debug, info, warn};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[default]
    #[serde(rename = "NOT STARTED")]
    NotStarted,
    #[serde(rename = "STARTED")]
    Started,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[serde(rename = "MOVED")]
    Moved,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let label = match self {
            Self::NotStarted => "NOT STARTED",
            Self::Started => "STARTED",
            Self::Done => "DONE",
            Self::Cancelled => "CANCELLED",
            Self::Moved => "MOVED",
        };

        write!(f, "{label}")
    }
}

impl Status {
    /// Whether the pair needs no further work.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Done | Self::Moved)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub status: Status,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default, rename = "commands")]
    pub filter: Option<String>,
}

/// Completion state for every distorted file and model scored against one reference, persisted
/// next to the reference as `<stem>_completions.json`.
#[derive(Clone, Debug)]
pub struct Ledger {
    path: PathBuf,
    files: BTreeMap<String, BTreeMap<String, Entry>>,
}

impl Ledger {
    pub fn path_for(reference: &Path) -> anyhow::Result<PathBuf> {
        let stem = reference
            .file_stem()
            .ok_or_else(|| anyhow!("Unable to determine file stem of {reference:?}"))?
            .to_string_lossy();

        Ok(reference.with_file_name(format!("{stem}_completions.json")))
    }

    /// Opens the ledger for a reference file. Unless `fresh` is set, the state of a prior run is
    /// loaded when present.
    pub fn open(reference: &Path, fresh: bool) -> anyhow::Result<Self> {
        let path = Self::path_for(reference)?;

        if !fresh && path.exists() {
            info!("Resuming from completions file {path:?}");
            return Self::load(&path);
        }

        Ok(Self {
            path,
            files: BTreeMap::new(),
        })
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file =
            File::open(path).with_context(|| format!("Unable to open completions file {path:?}"))?;

        let files = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Unable to deserialize completions file {path:?}"))?;

        Ok(Self {
            path: path.to_path_buf(),
            files,
        })
    }

    /// Writes the ledger to a temporary sibling and renames it into place so that an interrupted
    /// write never leaves a truncated file behind.
    pub fn save(&self) -> anyhow::Result<()> {
        let temporary_path = self.path.with_extension("tmp.json");

        {
            let file = File::create(&temporary_path).with_context(|| {
                format!("Unable to create temporary completions file {temporary_path:?}")
            })?;

            let mut writer = BufWriter::new(file);
            let mut serializer = serde_json::Serializer::with_formatter(
                &mut writer,
                PrettyFormatter::with_indent(b"    "),
            );

            self.files.serialize(&mut serializer).with_context(|| {
                format!("Unable to serialize completions to {temporary_path:?}")
            })?;

            writer
                .flush()
                .with_context(|| format!("Unable to flush completions to {temporary_path:?}"))?;
        }

        std::fs::rename(&temporary_path, &self.path)
            .with_context(|| format!("Unable to rename {temporary_path:?} to {:?}", self.path))?;

        debug!("Wrote completions file {:?}", self.path);

        Ok(())
    }

    #[must_use]
    pub const fn path(&self) -> &PathBuf {
        &self.path
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    #[must_use]
    pub const fn files(&self) -> &BTreeMap<String, BTreeMap<String, Entry>> {
        &self.files
    }

    #[must_use]
    pub fn entry(&self, file: &str, model: &str) -> Option<&Entry> {
        self.files.get(file).and_then(|models| models.get(model))
    }

    /// Adds a `NOT STARTED` entry for the pair unless one already exists.
    pub fn register(&mut self, file: &str, model: &str) {
        self.files
            .entry(file.to_owned())
            .or_default()
            .entry(model.to_owned())
            .or_default();
    }

    pub fn update<F>(&mut self, file: &str, model: &str, update: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut Entry),
    {
        let entry = self
            .files
            .get_mut(file)
            .and_then(|models| models.get_mut(model))
            .ok_or_else(|| anyhow!("No completions entry for {file} with model {model}"))?;

        update(entry);

        Ok(())
    }

    pub fn set_status(&mut self, file: &str, model: &str, status: Status) -> anyhow::Result<()> {
        self.update(file, model, |entry| entry.status = status)
    }

    /// Returns entries left `STARTED` or `CANCELLED` by an earlier run to `NOT STARTED` and
    /// deletes whatever partial logs they wrote. Returns the number of entries reset.
    pub fn reset_unfinished(&mut self) -> anyhow::Result<usize> {
        let mut count = 0;

        for (file, models) in &mut self.files {
            for (model, entry) in models.iter_mut() {
                if !matches!(entry.status, Status::Started | Status::Cancelled) {
                    continue;
                }

                if let Some(log_path) = entry.log_path.as_ref().filter(|path| path.exists()) {
                    std::fs::remove_file(log_path).with_context(|| {
                        format!("Unable to delete partial log file {log_path:?}")
                    })?;
                }

                warn!(
                    "Resetting {file} with model {model} from {} to {}",
                    entry.status,
                    Status::NotStarted
                );

                entry.status = Status::NotStarted;
                entry.score = None;
                count += 1;
            }
        }

        Ok(count)
    }

    /// Every `(file, model)` pair that still needs to be computed, in key order.
    #[must_use]
    pub fn pending(&self) -> Vec<(String, String)> {
        self.files
            .iter()
            .flat_map(|(file, models)| {
                models
                    .iter()
                    .filter(|(_, entry)| !entry.status.is_finished())
                    .map(move |(model, _)| (file.clone(), model.clone()))
            })
            .collect()
    }

    /// Whether every model recorded for the file is `DONE` (or already `MOVED`).
    #[must_use]
    pub fn is_file_complete(&self, file: &str) -> bool {
        self.files.get(file).is_some_and(|models| {
            !models.is_empty() && models.values().all(|entry| entry.status.is_finished())
        })
    }
}
