//! Action arena
//!
//! Every top-level action (OPEN_GROUP .. CLOSE_GROUP) lives in an arena
//! slot and is addressed by a generation-checked `ActionId`. An action
//! carries a context stack whose first entry is the operation and whose
//! remaining entries are the struct arrays entered so far.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::time_slice::SliceSelection;
use crate::storage::types::{AccessMode, AosKind, Dims, RangeMode, SliceQuery};

/// Separator replacing `/` in tensorized names
pub const PATH_MARKER: char = '&';

/// Suffix marking a struct-array segment in tensorized names
pub const AOS_MARKER: &str = "[]";

// Arena identifiers are minted process-wide so ids never cross stores
static NEXT_ARENA: AtomicU32 = AtomicU32::new(1);

/// Replace path separators with the reserved marker
pub fn tensorize(path: &str) -> String {
    path.trim_matches('/').replace('/', "&")
}

/// Join a tensorized parent and a relative path
pub fn join(parent: &str, path: &str) -> String {
    let tail = tensorize(path);
    if parent.is_empty() {
        tail
    } else {
        format!("{}{}{}", parent, PATH_MARKER, tail)
    }
}

/// Opaque handle to an in-flight action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionId {
    arena: u32,
    slot: u32,
    generation: u32,
}

/// The operation at the bottom of every context stack
#[derive(Debug, Clone, PartialEq)]
pub struct OperationContext {
    /// Record group the action works on
    pub group: String,
    pub access: AccessMode,
    pub range: RangeMode,
    /// Query time and policy for slice reads
    pub slice: Option<SliceQuery>,
}

/// One entered struct array
#[derive(Debug, Clone, PartialEq)]
pub struct AosFrame {
    /// Tensorized name of the struct array (ends in `[]`)
    pub tensorized: String,
    pub kind: AosKind,
    /// Number of elements visible to the caller
    pub size: usize,
    /// Element count used for storage extents
    pub extent: usize,
    /// Storage position of caller index 0
    pub base: usize,
    /// Caller index of the current element
    pub index: usize,
    /// Slices chosen for a time-resolved read of a dynamic array
    pub slice: Option<SliceSelection>,
}

impl AosFrame {
    /// Storage position of the current element
    pub fn position(&self) -> usize {
        self.base + self.index
    }

    /// Whether the caller is on the last element
    pub fn at_last(&self) -> bool {
        self.size == 0 || self.index + 1 >= self.size
    }
}

/// Closed set of context kinds
#[derive(Debug, Clone, PartialEq)]
pub enum Context {
    Operation(OperationContext),
    ArrayOfStructures(AosFrame),
}

/// State of one top-level action
#[derive(Debug)]
pub struct Action {
    contexts: Vec<Context>,
    /// Tensorized names known to be absent
    missing: HashSet<String>,
}

impl Action {
    pub fn new(operation: OperationContext) -> Self {
        Self {
            contexts: vec![Context::Operation(operation)],
            missing: HashSet::new(),
        }
    }

    pub fn operation(&self) -> StorageResult<&OperationContext> {
        match self.contexts.first() {
            Some(Context::Operation(op)) => Ok(op),
            Some(Context::ArrayOfStructures(_)) | None => Err(StorageError::InvariantViolation(
                "context stack does not start with an operation".into(),
            )),
        }
    }

    /// Struct arrays entered so far, outermost first
    pub fn frames(&self) -> impl Iterator<Item = &AosFrame> + '_ {
        self.contexts.iter().filter_map(|c| match c {
            Context::ArrayOfStructures(frame) => Some(frame),
            Context::Operation(_) => None,
        })
    }

    pub fn depth(&self) -> usize {
        self.frames().count()
    }

    pub fn innermost(&self) -> Option<&AosFrame> {
        match self.contexts.last() {
            Some(Context::ArrayOfStructures(frame)) => Some(frame),
            Some(Context::Operation(_)) | None => None,
        }
    }

    pub fn innermost_mut(&mut self) -> Option<&mut AosFrame> {
        match self.contexts.last_mut() {
            Some(Context::ArrayOfStructures(frame)) => Some(frame),
            Some(Context::Operation(_)) | None => None,
        }
    }

    pub fn push(&mut self, frame: AosFrame) {
        self.contexts.push(Context::ArrayOfStructures(frame));
    }

    pub fn pop(&mut self) -> StorageResult<AosFrame> {
        match self.contexts.last() {
            Some(Context::ArrayOfStructures(_)) => match self.contexts.pop() {
                Some(Context::ArrayOfStructures(frame)) => Ok(frame),
                _ => Err(StorageError::InvariantViolation("context stack changed during pop".into())),
            },
            Some(Context::Operation(_)) | None => Err(StorageError::InvalidRequest(
                "no struct array to leave".into(),
            )),
        }
    }

    /// Tensorized path of the innermost struct array ("" at the root)
    pub fn current_path(&self) -> &str {
        self.innermost().map(|f| f.tensorized.as_str()).unwrap_or("")
    }

    /// Storage positions of every entered struct array
    pub fn positions(&self) -> Dims {
        self.frames().map(|f| f.position()).collect()
    }

    /// Storage extents of every entered struct array
    pub fn extents(&self) -> Dims {
        self.frames().map(|f| f.extent).collect()
    }

    /// Depth of the outermost dynamic struct array, if any
    pub fn timed_level(&self) -> Option<usize> {
        self.frames().position(|f| f.kind == AosKind::Dynamic)
    }

    /// Whether every entered struct array sits on its last element
    pub fn all_at_last(&self) -> bool {
        self.frames().all(|f| f.at_last())
    }

    pub fn is_missing(&self, name: &str) -> bool {
        self.missing.contains(name)
    }

    pub fn mark_missing(&mut self, name: impl Into<String>) {
        self.missing.insert(name.into());
    }

    pub fn clear_missing(&mut self, name: &str) {
        self.missing.remove(name);
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    action: Option<Action>,
}

/// Slot arena of in-flight actions
#[derive(Debug)]
pub struct ActionArena {
    id: u32,
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Default for ActionArena {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionArena {
    pub fn new() -> Self {
        Self {
            id: NEXT_ARENA.fetch_add(1, Ordering::Relaxed),
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, action: Action) -> ActionId {
        let slot = match self.free.pop() {
            Some(slot) => {
                let entry = &mut self.slots[slot as usize];
                entry.generation = entry.generation.wrapping_add(1);
                entry.action = Some(action);
                slot
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    action: Some(action),
                });
                (self.slots.len() - 1) as u32
            }
        };
        ActionId {
            arena: self.id,
            slot,
            generation: self.slots[slot as usize].generation,
        }
    }

    fn slot(&self, id: ActionId) -> Option<&Slot> {
        if id.arena != self.id {
            return None;
        }
        self.slots
            .get(id.slot as usize)
            .filter(|s| s.generation == id.generation)
    }

    pub fn get(&self, id: ActionId) -> StorageResult<&Action> {
        self.slot(id)
            .and_then(|s| s.action.as_ref())
            .ok_or(StorageError::UnknownAction)
    }

    pub fn get_mut(&mut self, id: ActionId) -> StorageResult<&mut Action> {
        if self.slot(id).is_none() {
            return Err(StorageError::UnknownAction);
        }
        self.slots[id.slot as usize]
            .action
            .as_mut()
            .ok_or(StorageError::UnknownAction)
    }

    pub fn remove(&mut self, id: ActionId) -> StorageResult<Action> {
        if self.slot(id).is_none() {
            return Err(StorageError::UnknownAction);
        }
        let action = self.slots[id.slot as usize]
            .action
            .take()
            .ok_or(StorageError::UnknownAction)?;
        self.free.push(id.slot);
        Ok(action)
    }

    /// Number of in-flight actions
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.action.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
