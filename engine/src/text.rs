//! Collaborative text: a positional operation log with cursor tracking,
//! applied with operational-transform-style position shifting against
//! concurrent local edits.

use crate::{Error, NodeId, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Broadcast channel capacity for [`TextDocument::changes`]; sized like the
/// change feed's own subscriber channels.
const CHANGES_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum TextOp {
    Insert { position: usize, text: String },
    Delete { position: usize, length: usize },
    Replace { position: usize, length: usize, text: String },
}

/// One entry in a text document's append-only history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub op: TextOp,
    pub user_id: NodeId,
    pub ts: i64,
}

/// A collaborative text attribute: sequence of characters, remote cursor
/// positions, and a strictly-increasing version counter.
#[derive(Debug, Clone)]
pub struct TextDocument {
    pub document_id: String,
    pub user_id: NodeId,
    pub max_length: Option<usize>,
    sequence: Vec<char>,
    pub version: u64,
    history: Vec<HistoryEntry>,
    cursors: HashMap<NodeId, usize>,
    changes_tx: broadcast::Sender<HistoryEntry>,
}

impl TextDocument {
    pub fn open(
        document_id: impl Into<String>,
        user_id: impl Into<NodeId>,
        initial_text: Option<String>,
        max_length: Option<usize>,
    ) -> Self {
        let (changes_tx, _) = broadcast::channel(CHANGES_CHANNEL_CAPACITY);
        Self {
            document_id: document_id.into(),
            user_id: user_id.into(),
            max_length,
            sequence: initial_text.unwrap_or_default().chars().collect(),
            version: 0,
            history: Vec::new(),
            cursors: HashMap::new(),
            changes_tx,
        }
    }

    pub fn text(&self) -> String {
        self.sequence.iter().collect()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Subscribes to a live stream of edits applied to this document from
    /// this point on (a point-in-time snapshot is [`Self::history`]). Lagged
    /// receivers drop old events rather than blocking the writer, same as
    /// the collection change feed.
    pub fn changes(&self) -> broadcast::Receiver<HistoryEntry> {
        self.changes_tx.subscribe()
    }

    /// Broadcasts the most recently appended history entry to subscribers.
    /// A send with no active receivers is not an error.
    fn emit_last(&self) {
        if let Some(entry) = self.history.last() {
            let _ = self.changes_tx.send(entry.clone());
        }
    }

    fn check_bounds(&self, position: usize) -> Result<()> {
        if position > self.sequence.len() {
            Err(Error::OutOfBounds)
        } else {
            Ok(())
        }
    }

    /// Applies a local insert, appending to history and bumping `version`.
    pub fn insert(&mut self, position: usize, text: &str, ts: i64) -> Result<()> {
        self.check_bounds(position)?;
        if let Some(max) = self.max_length {
            if self.sequence.len() + text.chars().count() > max {
                return Err(Error::TextLengthExceeded { max });
            }
        }
        for (offset, ch) in text.chars().enumerate() {
            self.sequence.insert(position + offset, ch);
        }
        self.version += 1;
        self.history.push(HistoryEntry {
            op: TextOp::Insert {
                position,
                text: text.to_string(),
            },
            user_id: self.user_id.clone(),
            ts,
        });
        self.shift_cursors_for_insert(position, text.chars().count());
        self.emit_last();
        Ok(())
    }

    pub fn delete(&mut self, position: usize, length: usize, ts: i64) -> Result<()> {
        self.check_bounds(position)?;
        let end = (position + length).min(self.sequence.len());
        self.sequence.drain(position..end);
        self.version += 1;
        self.history.push(HistoryEntry {
            op: TextOp::Delete { position, length },
            user_id: self.user_id.clone(),
            ts,
        });
        self.shift_cursors_for_delete(position, length);
        self.emit_last();
        Ok(())
    }

    pub fn replace(&mut self, position: usize, length: usize, text: &str, ts: i64) -> Result<()> {
        self.delete(position, length, ts)?;
        self.insert(position, text, ts)?;
        // Collapse the two history entries the delete+insert pushed into a
        // single replace entry so history reads as one logical operation.
        // The delete/insert above each already emitted their own entry on
        // the change stream; subscribers see those plus this collapsed one.
        self.history.pop();
        self.history.pop();
        self.history.push(HistoryEntry {
            op: TextOp::Replace {
                position,
                length,
                text: text.to_string(),
            },
            user_id: self.user_id.clone(),
            ts,
        });
        self.emit_last();
        Ok(())
    }

    fn shift_cursors_for_insert(&mut self, position: usize, count: usize) {
        for cursor in self.cursors.values_mut() {
            if *cursor >= position {
                *cursor += count;
            }
        }
    }

    fn shift_cursors_for_delete(&mut self, position: usize, length: usize) {
        for cursor in self.cursors.values_mut() {
            if *cursor >= position + length {
                *cursor -= length;
            } else if *cursor > position {
                *cursor = position;
            }
        }
    }

    pub fn set_cursor(&mut self, position: usize) {
        self.cursors.insert(self.user_id.clone(), position);
    }

    pub fn set_remote_cursor(&mut self, user_id: NodeId, position: usize) {
        self.cursors.insert(user_id, position);
    }

    pub fn cursor_of(&self, user_id: &str) -> Option<usize> {
        self.cursors.get(user_id).copied()
    }

    /// Applies a remote operation, transforming its position against every
    /// earlier concurrent local operation (timestamp strictly earlier; ties
    /// broken by user_id lex order): each earlier local insert shifts the
    /// remote position forward by its length; each earlier local delete
    /// shifts it backward by its length.
    pub fn apply_remote(&mut self, remote: HistoryEntry) -> Result<()> {
        let mut position = remote_position(&remote.op);

        for local in &self.history {
            let local_is_earlier = match local.ts.cmp(&remote.ts) {
                Ordering::Less => true,
                Ordering::Equal => local.user_id < remote.user_id,
                Ordering::Greater => false,
            };
            if !local_is_earlier {
                continue;
            }
            match &local.op {
                TextOp::Insert { position: p, text } if *p <= position => {
                    position += text.chars().count();
                }
                TextOp::Delete { position: p, length } if *p <= position => {
                    position = position.saturating_sub(*length);
                }
                TextOp::Replace { position: p, length, text } if *p <= position => {
                    position = position.saturating_sub(*length) + text.chars().count();
                }
                _ => {}
            }
        }

        match remote.op {
            TextOp::Insert { text, .. } => self.insert(position.min(self.sequence.len()), &text, remote.ts),
            TextOp::Delete { length, .. } => self.delete(position.min(self.sequence.len()), length, remote.ts),
            TextOp::Replace { length, text, .. } => {
                self.replace(position.min(self.sequence.len()), length, &text, remote.ts)
            }
        }
    }

    /// Reverses the most recent local operation that is still valid after
    /// any subsequent remote operations have shifted positions. Returns
    /// `false` ("no-op") if there is no applicable local operation.
    pub fn undo(&mut self) -> Result<bool> {
        let Some(last_local_idx) = self
            .history
            .iter()
            .rposition(|e| e.user_id == self.user_id)
        else {
            return Ok(false);
        };
        let entry = self.history[last_local_idx].clone();

        match entry.op {
            TextOp::Insert { position, text } => {
                let len = text.chars().count();
                if position + len > self.sequence.len() {
                    return Ok(false);
                }
                self.sequence.drain(position..position + len);
                self.version += 1;
                self.history.remove(last_local_idx);
                Ok(true)
            }
            TextOp::Delete { .. } | TextOp::Replace { .. } => {
                // Reversing a delete/replace would require the deleted text,
                // which the history entry does not retain; undo is only
                // supported for the most recent insert.
                Ok(false)
            }
        }
    }
}

fn remote_position(op: &TextOp) -> usize {
    match op {
        TextOp::Insert { position, .. } => *position,
        TextOp::Delete { position, .. } => *position,
        TextOp::Replace { position, .. } => *position,
    }
}
