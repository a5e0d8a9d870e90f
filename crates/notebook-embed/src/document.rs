//! The notebook document and its ipynb representation.
//!
//! Edits go through [`NotebookDocument::transact`], which stages them on a
//! copy of the cell list and swaps it in only if every step succeeded.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::{NotebookError, Result};
use crate::output::{multiline_value_to_string, OutputRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    Code,
    Markdown,
    Raw,
}

impl CellType {
    /// Cell types whose attachments survive a type change into them.
    pub fn keeps_attachments(&self) -> bool {
        matches!(self, CellType::Markdown | CellType::Raw)
    }
}

impl std::fmt::Display for CellType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellType::Code => write!(f, "code"),
            CellType::Markdown => write!(f, "markdown"),
            CellType::Raw => write!(f, "raw"),
        }
    }
}

impl FromStr for CellType {
    type Err = NotebookError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "code" => Ok(CellType::Code),
            "markdown" => Ok(CellType::Markdown),
            "raw" => Ok(CellType::Raw),
            other => Err(NotebookError::UnknownCellType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub id: String,
    pub cell_type: CellType,
    pub source: String,
    pub metadata: Map<String, Value>,
    /// Inline attachments of markdown/raw cells
    pub attachments: Option<Value>,
    pub execution_count: Option<u32>,
    pub outputs: Vec<OutputRecord>,
    /// Markdown display state; not persisted
    pub rendered: bool,
}

impl Cell {
    pub fn new(cell_type: CellType, source: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            cell_type,
            source: source.to_string(),
            metadata: Map::new(),
            attachments: None,
            execution_count: None,
            outputs: Vec::new(),
            rendered: false,
        }
    }

    pub fn code(source: &str) -> Self {
        Self::new(CellType::Code, source)
    }

    pub fn markdown(source: &str) -> Self {
        Self::new(CellType::Markdown, source)
    }

    pub fn raw(source: &str) -> Self {
        Self::new(CellType::Raw, source)
    }

    /// A fresh cell of `cell_type` carrying this cell's source and metadata.
    pub fn converted(&self, cell_type: CellType) -> Self {
        let mut cell = Cell::new(cell_type, &self.source);
        cell.metadata = self.metadata.clone();
        if cell_type.keeps_attachments() {
            cell.attachments = self.attachments.clone();
        }
        cell
    }

    fn to_json(&self) -> Value {
        let mut value = json!({
            "cell_type": self.cell_type.to_string(),
            "id": self.id,
            "metadata": self.metadata,
            "source": source_to_lines(&self.source),
        });
        match self.cell_type {
            CellType::Code => {
                value["execution_count"] = json!(self.execution_count);
                value["outputs"] =
                    Value::Array(self.outputs.iter().map(OutputRecord::to_nbformat).collect());
            }
            CellType::Markdown | CellType::Raw => {
                if let Some(attachments) = &self.attachments {
                    value["attachments"] = attachments.clone();
                }
            }
        }
        value
    }

    fn from_json(value: &Value) -> Result<Self> {
        let cell_type: CellType = value
            .get("cell_type")
            .and_then(Value::as_str)
            .ok_or_else(|| NotebookError::Format("cell without cell_type".into()))?
            .parse()?;

        let outputs = value
            .get("outputs")
            .and_then(Value::as_array)
            .map(|outputs| {
                outputs
                    .iter()
                    .filter_map(|o| match OutputRecord::from_nbformat(o.clone()) {
                        Ok(output) => Some(output),
                        Err(e) => {
                            warn!("[document] Skipping unreadable output: {}", e);
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            id: value
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            cell_type,
            source: value
                .get("source")
                .and_then(multiline_value_to_string)
                .unwrap_or_default(),
            metadata: value
                .get("metadata")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            attachments: value.get("attachments").filter(|a| !a.is_null()).cloned(),
            execution_count: value
                .get("execution_count")
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok()),
            outputs,
            rendered: cell_type == CellType::Markdown,
        })
    }
}

/// Convert source string to nbformat's list of lines (each keeps its newline).
fn source_to_lines(source: &str) -> Vec<String> {
    if source.is_empty() {
        return Vec::new();
    }
    source.split_inclusive('\n').map(|s| s.to_string()).collect()
}

/// Staged edits inside [`NotebookDocument::transact`].
pub struct Transaction {
    cells: Vec<Cell>,
    /// Any edit, view state included
    touched: bool,
    /// Edits that change what gets saved
    changed: bool,
}

impl Transaction {
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    fn conflict(&self, index: usize) -> NotebookError {
        NotebookError::MutationConflict {
            index,
            len: self.cells.len(),
        }
    }

    pub fn cell(&self, index: usize) -> Result<&Cell> {
        self.cells.get(index).ok_or_else(|| self.conflict(index))
    }

    pub fn cell_mut(&mut self, index: usize) -> Result<&mut Cell> {
        let len = self.cells.len();
        let cell = self
            .cells
            .get_mut(index)
            .ok_or(NotebookError::MutationConflict { index, len })?;
        self.touched = true;
        self.changed = true;
        Ok(cell)
    }

    /// Toggle markdown display state without dirtying the document.
    pub fn set_rendered(&mut self, index: usize, rendered: bool) -> Result<()> {
        let len = self.cells.len();
        let cell = self
            .cells
            .get_mut(index)
            .ok_or(NotebookError::MutationConflict { index, len })?;
        if cell.rendered != rendered {
            cell.rendered = rendered;
            self.touched = true;
        }
        Ok(())
    }

    pub fn position(&self, cell_id: &str) -> Option<usize> {
        self.cells.iter().position(|c| c.id == cell_id)
    }

    /// Insert at `index` (`index == len` appends).
    pub fn insert(&mut self, index: usize, cell: Cell) -> Result<()> {
        if index > self.cells.len() {
            return Err(self.conflict(index));
        }
        if self.position(&cell.id).is_some() {
            return Err(NotebookError::Format(format!("duplicate cell id {}", cell.id)));
        }
        self.cells.insert(index, cell);
        self.touched = true;
        self.changed = true;
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<Cell> {
        if index >= self.cells.len() {
            return Err(self.conflict(index));
        }
        self.touched = true;
        self.changed = true;
        Ok(self.cells.remove(index))
    }

    /// Swap the cell at `index` for `cell`, returning the old one.
    pub fn replace(&mut self, index: usize, cell: Cell) -> Result<Cell> {
        let slot = self.cell_mut(index)?;
        Ok(std::mem::replace(slot, cell))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotebookDocument {
    cells: Vec<Cell>,
    pub metadata: Map<String, Value>,
    pub nbformat: u32,
    pub nbformat_minor: u32,
    dirty: bool,
    save_requested_at: Option<DateTime<Utc>>,
}

impl Default for NotebookDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl NotebookDocument {
    /// A document with a single empty code cell.
    pub fn new() -> Self {
        Self::with_cells(vec![Cell::code("")])
    }

    pub fn with_cells(cells: Vec<Cell>) -> Self {
        Self {
            cells,
            metadata: Map::new(),
            nbformat: 4,
            nbformat_minor: 5,
            dirty: false,
            save_requested_at: None,
        }
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cell(&self, index: usize) -> Option<&Cell> {
        self.cells.get(index)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn find_cell_index(&self, cell_id: &str) -> Option<usize> {
        self.cells.iter().position(|c| c.id == cell_id)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn save_requested_at(&self) -> Option<DateTime<Utc>> {
        self.save_requested_at
    }

    /// The kernelspec name recorded in the notebook metadata.
    pub fn kernel_name(&self) -> Option<&str> {
        self.metadata
            .get("kernelspec")
            .and_then(|k| k.get("name"))
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
    }

    /// Record a save request; the document stays dirty until `mark_saved`.
    pub fn request_save(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        self.save_requested_at = Some(now);
        now
    }

    pub fn mark_saved(&mut self) {
        self.dirty = false;
    }

    /// Run `edit` against a staged copy of the cells. On `Ok` the staged
    /// cells replace the document's; on `Err` the document is untouched.
    pub fn transact<T, F>(&mut self, edit: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction) -> Result<T>,
    {
        let mut tx = Transaction {
            cells: self.cells.clone(),
            touched: false,
            changed: false,
        };
        let value = edit(&mut tx)?;
        if tx.touched {
            self.cells = tx.cells;
        }
        if tx.changed {
            self.dirty = true;
        }
        Ok(value)
    }

    /// The document as nbformat JSON.
    pub fn to_json(&self) -> Value {
        json!({
            "cells": self.cells.iter().map(Cell::to_json).collect::<Vec<_>>(),
            "metadata": self.metadata,
            "nbformat": self.nbformat,
            "nbformat_minor": self.nbformat_minor,
        })
    }

    /// Read nbformat JSON. Sources may be strings or lists of lines.
    pub fn from_json(value: &Value) -> Result<Self> {
        let cells = value
            .get("cells")
            .and_then(Value::as_array)
            .ok_or_else(|| NotebookError::Format("missing cells".into()))?
            .iter()
            .map(Cell::from_json)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            cells,
            metadata: value
                .get("metadata")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            nbformat: value.get("nbformat").and_then(Value::as_u64).unwrap_or(4) as u32,
            nbformat_minor: value
                .get("nbformat_minor")
                .and_then(Value::as_u64)
                .unwrap_or(5) as u32,
            dirty: false,
            save_requested_at: None,
        })
    }

    /// Serialize to ipynb text, outputs included.
    ///
    /// Written the way nbformat writes files: one-space indent and a
    /// trailing newline.
    pub fn to_ipynb(&self) -> Result<String> {
        let value = self.to_json();
        let notebook: nbformat::v4::Notebook = serde_json::from_value(value.clone())?;
        let mut normalized = serde_json::to_value(&notebook)?;
        restore_raw_attachments(&value, &mut normalized);

        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b" ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        normalized.serialize(&mut ser)?;
        buf.push(b'\n');
        String::from_utf8(buf).map_err(|e| NotebookError::Format(e.to_string()))
    }

    /// Parse ipynb text, upgrading legacy (v4.0-4.4) notebooks.
    pub fn from_ipynb(content: &str) -> Result<Self> {
        let notebook = nbformat::parse_notebook(content)
            .map_err(|e| NotebookError::Format(e.to_string()))?;
        let v4 = match notebook {
            nbformat::Notebook::V4(nb) => nb,
            nbformat::Notebook::Legacy(legacy) => nbformat::upgrade_legacy_notebook(legacy)
                .map_err(|e| NotebookError::Format(e.to_string()))?,
        };
        let mut value = serde_json::to_value(&v4)?;
        if let Ok(original) = serde_json::from_str::<Value>(content) {
            restore_raw_attachments(&original, &mut value);
        }
        Self::from_json(&value)
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_ipynb(&content)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_ipynb()?)?;
        Ok(())
    }
}

/// nbformat's raw cells have no `attachments` field; copy them from `source`
/// into `target`, matching cells by position.
fn restore_raw_attachments(source: &Value, target: &mut Value) {
    let Some(from) = source.get("cells").and_then(Value::as_array) else {
        return;
    };
    let Some(to) = target.get_mut("cells").and_then(Value::as_array_mut) else {
        return;
    };
    for (original, cell) in from.iter().zip(to.iter_mut()) {
        if cell.get("cell_type").and_then(Value::as_str) != Some("raw") {
            continue;
        }
        if let Some(attachments) = original.get("attachments").filter(|a| !a.is_null()) {
            cell["attachments"] = attachments.clone();
        }
    }
}
