#![forbid(unsafe_code)]

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use pulse_kernel_contracts::grant::Grant;
use pulse_kernel_contracts::redemption::RedemptionRecord;
use pulse_kernel_contracts::{amount_string, Address, Amount, UnixTimeSec};
use serde::{Deserialize, Serialize};

use crate::store::StorageError;

pub const STORE_JOURNAL_SCHEMA_VERSION: u8 = 1;

/// Durable mutations of the store. In-flight period claims are process-local and never written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StoreJournalEvent {
    GrantUpserted {
        grant: Grant,
    },
    GrantDeactivated {
        user: Address,
        asset: Address,
        at: UnixTimeSec,
    },
    RedemptionAppended {
        record: RedemptionRecord,
        #[serde(with = "amount_string")]
        period_cap: Amount,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreJournalEntry {
    schema_version: u8,
    event: StoreJournalEvent,
}

/// Append-only JSONL journal, one event per line, replayed in order on open.
#[derive(Debug, Clone)]
pub struct StoreJournal {
    path: PathBuf,
}

impl StoreJournal {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    StorageError::Journal(format!(
                        "failed to create store directory '{}': {}",
                        parent.display(),
                        err
                    ))
                })?;
            }
        }
        if !path.exists() {
            File::create(&path).map_err(|err| {
                StorageError::Journal(format!(
                    "failed to create store journal '{}': {}",
                    path.display(),
                    err
                ))
            })?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_events(&self) -> Result<Vec<StoreJournalEvent>, StorageError> {
        let file = File::open(&self.path).map_err(|err| {
            StorageError::Journal(format!(
                "failed to open store journal '{}': {}",
                self.path.display(),
                err
            ))
        })?;
        let mut events = Vec::new();
        for (line_no, line_result) in BufReader::new(file).lines().enumerate() {
            let line = line_result.map_err(|err| {
                StorageError::Journal(format!(
                    "failed reading store journal '{}' at line {}: {}",
                    self.path.display(),
                    line_no + 1,
                    err
                ))
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: StoreJournalEntry = serde_json::from_str(&line).map_err(|err| {
                StorageError::Journal(format!(
                    "failed parsing store journal '{}' at line {}: {}",
                    self.path.display(),
                    line_no + 1,
                    err
                ))
            })?;
            if entry.schema_version != STORE_JOURNAL_SCHEMA_VERSION {
                return Err(StorageError::Journal(format!(
                    "unsupported store journal schema_version={} at line {}",
                    entry.schema_version,
                    line_no + 1
                )));
            }
            events.push(entry.event);
        }
        Ok(events)
    }

    pub fn append(&self, event: &StoreJournalEvent) -> Result<(), StorageError> {
        let entry = StoreJournalEntry {
            schema_version: STORE_JOURNAL_SCHEMA_VERSION,
            event: event.clone(),
        };
        let json = serde_json::to_string(&entry).map_err(|err| {
            StorageError::Journal(format!("failed to encode store journal entry: {err}"))
        })?;
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|err| {
                StorageError::Journal(format!(
                    "failed opening store journal '{}' for append: {}",
                    self.path.display(),
                    err
                ))
            })?;
        file.write_all(json.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .and_then(|_| file.sync_data())
            .map_err(|err| {
                StorageError::Journal(format!(
                    "failed writing store journal '{}': {}",
                    self.path.display(),
                    err
                ))
            })
    }
}
