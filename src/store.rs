//! JSON file persistence

use crate::core::{AuditLog, EngineError, ExchangeRateTable, Ledger, Settings};
use crate::engine::YearResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Source records. Everything else is derived from these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sources {
    pub ledger: Ledger,
    pub rates: ExchangeRateTable,
    pub settings: Settings,
    /// Bumped on every change to any of the above
    #[serde(default)]
    pub revision: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreDocument {
    pub sources: Sources,
    #[serde(default)]
    pub audit: AuditLog,
    /// Committed projections, kept so reads survive a restart
    #[serde(default)]
    pub results: Vec<YearResult>,
}

/// Whole-state JSON file, replaced atomically on every save
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Store {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty store
    pub fn load(&self) -> Result<StoreDocument, EngineError> {
        if !self.path.exists() {
            log::info!("No data file at {}, starting empty", self.path.display());
            return Ok(StoreDocument::default());
        }
        let file = File::open(&self.path).map_err(|e| self.error(e))?;
        let doc: StoreDocument =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| self.error(e))?;
        log::info!(
            "Loaded {} ledger entries, {} rates from {}",
            doc.sources.ledger.entries().len(),
            doc.sources.rates.len(),
            self.path.display()
        );
        Ok(doc)
    }

    pub fn save(&self, doc: &StoreDocument) -> Result<(), EngineError> {
        let _guard = self.write_lock.lock();
        let tmp = self.path.with_extension("json.tmp");
        {
            let file = File::create(&tmp).map_err(|e| self.error(e))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, doc).map_err(|e| self.error(e))?;
            writer.flush().map_err(|e| self.error(e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| self.error(e))?;
        log::debug!("Saved state to {}", self.path.display());
        Ok(())
    }

    fn error(&self, err: impl std::fmt::Display) -> EngineError {
        EngineError::Storage(format!("{}: {}", self.path.display(), err))
    }
}
