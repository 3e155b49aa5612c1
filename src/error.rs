/// `error.rs` — failure taxonomy shared by the engine and its capabilities
///
/// Nothing here is fatal to the host: every variant ends up either logged or
/// folded into a `CallResult` for one reaction/script invocation.
use std::path::PathBuf;

use crate::scripting::kind::EventKind;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Parse or runtime failure inside the interpreter.
    #[error("{0}")]
    Script(String),

    /// A reaction file evaluated fine but returned an unusable table.
    #[error("invalid declaration in {file}: {reason}")]
    Declaration { file: String, reason: String },

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no reaction or script named '{0}'")]
    NameNotFound(String),

    #[error("reaction '{name}' is {actual:?}, caller asked for {expected:?}")]
    KindMismatch {
        name: String,
        expected: EventKind,
        actual: EventKind,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("startup failed: {0}")]
    Startup(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// A host service refused an operation requested by a script.
    #[error("{0}")]
    Capability(String),
}

impl From<mlua::Error> for HubError {
    fn from(err: mlua::Error) -> Self {
        HubError::Script(err.to_string())
    }
}

impl HubError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        HubError::Io {
            path: path.into(),
            source,
        }
    }

    /// Convert into an interpreter error so a host function can raise it
    /// inside the calling script.
    pub fn into_lua(self) -> mlua::Error {
        mlua::Error::RuntimeError(self.to_string())
    }
}

pub type HubResult<T> = Result<T, HubError>;
