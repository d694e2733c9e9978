//! Lifecycle states of a worker controller.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Uninitialized,
    Initializing,
    Ready,
    /// Loading or unloading a model.
    Loading,
    Loaded,
    Running,
    Error,
    Disposed,
}

impl WorkerState {
    /// Whether `self -> next` is an edge of the lifecycle graph.
    ///
    /// Every live state may fail into `Error`. Only `Ready`, `Loaded` and
    /// `Error` may be disposed directly; the rest go through `Error` first.
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        match (self, next) {
            (Disposed, _) => false,
            (Error, Error) => false,
            (_, Error) => true,
            (Ready | Loaded | Error, Disposed) => true,
            (Uninitialized, Initializing)
            | (Initializing, Ready)
            | (Ready, Loading)
            | (Loading, Ready)
            | (Loading, Loaded)
            | (Loaded, Loading)
            | (Loaded, Running)
            | (Running, Loaded) => true,
            _ => false,
        }
    }

    /// The subprocess has completed its handshake and has not been torn down.
    pub fn is_initialized(self) -> bool {
        matches!(
            self,
            Self::Ready | Self::Loading | Self::Loaded | Self::Running | Self::Error
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Running => "running",
            Self::Error => "error",
            Self::Disposed => "disposed",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
