use std::collections::VecDeque;

use serde::Serialize;
use thiserror::Error;

use crate::callins::ContextKind;

const MAX_SCRIPT_ERRORS: usize = 100;

#[derive(Serialize, Clone, Debug)]
pub struct ScriptError {
    pub handle: String,
    pub context: ContextKind,
    pub call_in: String,
    pub error_message: String,
    pub frame: u64,
}

#[derive(Default, Debug)]
pub struct ScriptErrors {
    pub entries: VecDeque<ScriptError>,
    pub total: u64,
}

impl ScriptErrors {
    pub fn push(&mut self, entry: ScriptError) {
        self.entries.push_back(entry);
        self.total = self.total.saturating_add(1);
        while self.entries.len() > MAX_SCRIPT_ERRORS {
            self.entries.pop_front();
        }
    }

    pub fn last(&self) -> Option<&ScriptError> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("could not load '{path}' (modes '{modes}'): {reason}")]
    MissingFile {
        path: String,
        modes: String,
        reason: String,
    },
    #[error("{context:?} context failed to set up its environment: {message}")]
    Environment { context: ContextKind, message: String },
    #[error("{context:?} chunk '{chunk}' failed: {message}")]
    Chunk {
        context: ContextKind,
        chunk: String,
        message: String,
    },
    #[error("{context:?} Initialize() failed: {message}")]
    Initialize { context: ContextKind, message: String },
    #[error("init is only valid on an uninitialized handle (current state {0:?})")]
    InvalidTransition(crate::coordinator::HandleState),
}
