//! Persistence sink for values read from the pump.
//!
//! Reports are JSON objects. `add` walks `path` from the report root,
//! creating objects as needed, and inserts `entries` there. An existing key
//! is only replaced when `overwrite` is set.

use log::{debug, info};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::PumpError;

pub trait Reporter {
    fn add(
        &mut self,
        report: &str,
        path: &[&str],
        entries: Map<String, Value>,
        overwrite: bool,
    ) -> Result<(), PumpError>;
}

/// Reporter keeping every report in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryReporter {
    reports: HashMap<String, Value>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, name: &str) -> Option<&Value> {
        self.reports.get(name)
    }
}

impl Reporter for MemoryReporter {
    fn add(
        &mut self,
        report: &str,
        path: &[&str],
        entries: Map<String, Value>,
        overwrite: bool,
    ) -> Result<(), PumpError> {
        let root = self
            .reports
            .entry(report.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        merge(root, path, entries, overwrite)
    }
}

/// Reporter storing each report as a JSON file in a directory
#[derive(Debug, Clone)]
pub struct JsonReporter {
    dir: PathBuf,
}

impl JsonReporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, report: &str) -> PathBuf {
        self.dir.join(report)
    }

    pub fn load(&self, report: &str) -> Result<Value, PumpError> {
        let path = self.path(report);
        if !path.exists() {
            return Ok(Value::Object(Map::new()));
        }
        let text = std::fs::read_to_string(&path).map_err(|e| io_error(&path, e))?;
        serde_json::from_str(&text).map_err(|e| PumpError::Report(format!("{}: {}", path.display(), e)))
    }

    fn save(&self, report: &str, value: &Value) -> Result<(), PumpError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| io_error(&self.dir, e))?;
        let path = self.path(report);
        let text = serde_json::to_string_pretty(value)
            .map_err(|e| PumpError::Report(e.to_string()))?;
        std::fs::write(&path, text).map_err(|e| io_error(&path, e))
    }
}

impl Reporter for JsonReporter {
    fn add(
        &mut self,
        report: &str,
        path: &[&str],
        entries: Map<String, Value>,
        overwrite: bool,
    ) -> Result<(), PumpError> {
        let mut root = self.load(report)?;
        merge(&mut root, path, entries, overwrite)?;
        self.save(report, &root)?;
        info!("Updated report '{}'", report);
        Ok(())
    }
}

fn merge(
    root: &mut Value,
    path: &[&str],
    entries: Map<String, Value>,
    overwrite: bool,
) -> Result<(), PumpError> {
    let mut node = root;
    for &segment in path {
        let Value::Object(map) = node else {
            return Err(PumpError::Report(format!("'{}' is not an object", segment)));
        };
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    let Value::Object(map) = node else {
        return Err(PumpError::Report(format!(
            "path {:?} does not lead to an object",
            path
        )));
    };

    for (key, value) in entries {
        if map.contains_key(&key) && !overwrite {
            debug!("Keeping existing entry '{}'", key);
            continue;
        }
        map.insert(key, value);
    }
    Ok(())
}

fn io_error(path: &Path, e: std::io::Error) -> PumpError {
    PumpError::Report(format!("{}: {}", path.display(), e))
}
