//! Structural and execution-side edits to a [`NotebookDocument`].
//!
//! Every function here runs as one [`NotebookDocument::transact`] call, so
//! an error leaves the document exactly as it was.

use std::collections::BTreeSet;

use log::debug;

use crate::document::{Cell, CellType, NotebookDocument, Transaction};
use crate::error::{NotebookError, Result};
use crate::output::OutputRecord;

/// The active cell plus any additionally selected cells.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    active: usize,
    anchor: usize,
    selected: BTreeSet<String>,
}

impl Selection {
    pub fn new(active: usize) -> Self {
        Self {
            active,
            anchor: active,
            selected: BTreeSet::new(),
        }
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn selected_ids(&self) -> impl Iterator<Item = &str> {
        self.selected.iter().map(String::as_str)
    }

    pub fn is_selected(&self, cell_id: &str) -> bool {
        self.selected.contains(cell_id)
    }

    /// Move the active cell and drop the rest of the selection.
    pub fn set_active(&mut self, index: usize) {
        self.active = index;
        self.anchor = index;
        self.selected.clear();
    }

    /// Select every cell between the anchor and `index`, making `index` active.
    pub fn extend(&mut self, doc: &NotebookDocument, index: usize) {
        let (lo, hi) = if index < self.anchor {
            (index, self.anchor)
        } else {
            (self.anchor, index)
        };
        self.selected = doc
            .cells()
            .iter()
            .enumerate()
            .filter(|(i, _)| (lo..=hi).contains(i))
            .map(|(_, c)| c.id.clone())
            .collect();
        self.active = index.min(doc.len().saturating_sub(1));
    }

    pub fn collapse(&mut self) {
        self.anchor = self.active;
        self.selected.clear();
    }

    /// Keep the active index inside a document of `len` cells.
    pub fn clamp(&mut self, len: usize) {
        let max = len.saturating_sub(1);
        if self.active > max {
            self.set_active(max);
        }
    }

    /// Indices of the selected cells and the active cell, ascending.
    pub fn indices(&self, doc: &NotebookDocument) -> Vec<usize> {
        doc.cells()
            .iter()
            .enumerate()
            .filter(|(i, c)| *i == self.active || self.selected.contains(&c.id))
            .map(|(i, _)| i)
            .collect()
    }
}

fn convert(tx: &mut Transaction, index: usize, cell_type: CellType) -> Result<bool> {
    let cell = tx.cell(index)?;
    if cell.cell_type == cell_type {
        return Ok(false);
    }
    let replacement = cell.converted(cell_type);
    tx.replace(index, replacement)?;
    Ok(true)
}

fn index_of(tx: &Transaction, cell_id: &str) -> Result<usize> {
    tx.position(cell_id)
        .ok_or_else(|| NotebookError::CellNotFound(cell_id.to_string()))
}

/// Change the type of the cell at `index`. Returns whether it changed.
pub fn change_cell_type(
    doc: &mut NotebookDocument,
    index: usize,
    cell_type: CellType,
) -> Result<bool> {
    doc.transact(|tx| convert(tx, index, cell_type))
}

/// Change every selected cell to `cell_type`, lowest index first.
///
/// Markdown cells in the selection end up in edit mode. The selection
/// collapses to the active cell. Returns how many cells changed type.
pub fn change_selected_cell_type(
    doc: &mut NotebookDocument,
    selection: &mut Selection,
    cell_type: CellType,
) -> Result<usize> {
    let indices = selection.indices(doc);
    let changed = doc.transact(|tx| {
        let mut changed = 0;
        for &index in &indices {
            if convert(tx, index, cell_type)? {
                changed += 1;
            }
            if cell_type == CellType::Markdown {
                tx.set_rendered(index, false)?;
            }
        }
        Ok(changed)
    })?;
    debug!(
        "[transactor] Changed {} of {} selected cells to {}",
        changed,
        indices.len(),
        cell_type
    );
    selection.collapse();
    Ok(changed)
}

/// Insert a new cell at `index`, returning its id.
pub fn insert_cell(
    doc: &mut NotebookDocument,
    index: usize,
    cell_type: CellType,
    source: &str,
) -> Result<String> {
    let cell = Cell::new(cell_type, source);
    let id = cell.id.clone();
    doc.transact(|tx| tx.insert(index, cell))?;
    Ok(id)
}

fn remove_keeping_one(tx: &mut Transaction, index: usize) -> Result<Cell> {
    let removed = tx.remove(index)?;
    if tx.is_empty() {
        tx.insert(0, Cell::code(""))?;
    }
    Ok(removed)
}

/// Delete the cell at `index`. Deleting the last cell leaves an empty code
/// cell in its place.
pub fn delete_cell(doc: &mut NotebookDocument, index: usize) -> Result<Cell> {
    doc.transact(|tx| remove_keeping_one(tx, index))
}

/// Delete every selected cell. The active cell moves to the cell now at the
/// lowest deleted position.
pub fn delete_selected(doc: &mut NotebookDocument, selection: &mut Selection) -> Result<usize> {
    let indices = selection.indices(doc);
    let Some(&lowest) = indices.first() else {
        return Err(NotebookError::MutationConflict {
            index: selection.active(),
            len: doc.len(),
        });
    };
    doc.transact(|tx| {
        for &index in indices.iter().rev() {
            remove_keeping_one(tx, index)?;
        }
        Ok(())
    })?;
    selection.set_active(lowest.min(doc.len().saturating_sub(1)));
    Ok(indices.len())
}

pub fn set_source(doc: &mut NotebookDocument, cell_id: &str, source: &str) -> Result<()> {
    doc.transact(|tx| {
        let index = index_of(tx, cell_id)?;
        if tx.cell(index)?.source != source {
            tx.cell_mut(index)?.source = source.to_string();
        }
        Ok(())
    })
}

/// Drop a code cell's outputs and execution count.
pub fn clear_outputs(doc: &mut NotebookDocument, cell_id: &str) -> Result<()> {
    doc.transact(|tx| {
        let index = index_of(tx, cell_id)?;
        let cell = tx.cell(index)?;
        if cell.outputs.is_empty() && cell.execution_count.is_none() {
            return Ok(());
        }
        let cell = tx.cell_mut(index)?;
        cell.outputs.clear();
        cell.execution_count = None;
        Ok(())
    })
}

pub fn append_output(doc: &mut NotebookDocument, cell_id: &str, output: OutputRecord) -> Result<()> {
    doc.transact(|tx| {
        let index = index_of(tx, cell_id)?;
        let cell = tx.cell_mut(index)?;
        if cell.cell_type != CellType::Code {
            return Err(NotebookError::Format(format!(
                "{} cell {} cannot hold outputs",
                cell.cell_type, cell_id
            )));
        }
        cell.outputs.push(output);
        Ok(())
    })
}

pub fn set_execution_count(
    doc: &mut NotebookDocument,
    cell_id: &str,
    execution_count: Option<u32>,
) -> Result<()> {
    doc.transact(|tx| {
        let index = index_of(tx, cell_id)?;
        tx.cell_mut(index)?.execution_count = execution_count;
        Ok(())
    })
}

pub fn set_rendered(doc: &mut NotebookDocument, cell_id: &str, rendered: bool) -> Result<()> {
    doc.transact(|tx| {
        let index = index_of(tx, cell_id)?;
        tx.set_rendered(index, rendered)
    })
}
