//! Error types for synchronization and history operations.

use miette::Diagnostic;
use smol_str::SmolStr;
use tessera_editor_core::ModelError;
use thiserror::Error;

/// Errors that can occur while synchronizing with the shared document.
#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum SyncError {
    /// The shared document delivered a change this engine cannot interpret.
    #[error("sync protocol violation: {0}")]
    #[diagnostic(
        code(tessera::sync_protocol),
        help("peers may be running incompatible engine versions")
    )]
    SyncProtocol(String),

    /// A component name arrived that is not in the component registry.
    #[error("unknown component `{0}`")]
    #[diagnostic(
        code(tessera::unknown_component),
        help("register the component before joining the document")
    )]
    UnknownComponent(SmolStr),

    /// An async slot or component needs a sub-model loader and none is set.
    #[error("no sub-model loader configured for async {0}")]
    #[diagnostic(code(tessera::unsupported_sub_model))]
    UnsupportedSubModel(&'static str),

    /// Nesting went deeper than the configured limit.
    #[error("document nesting exceeds depth limit of {0}")]
    #[diagnostic(code(tessera::depth_exceeded))]
    DepthExceeded(usize),

    /// No sub-document is registered under this key.
    #[error("unknown sub-document `{0}`")]
    #[diagnostic(code(tessera::unknown_root))]
    UnknownRoot(SmolStr),

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    #[diagnostic(code(tessera::config))]
    Config(String),

    /// Local model rejected a mutation.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Failed to import CRDT data.
    #[error("failed to import CRDT data: {0}")]
    #[diagnostic(code(tessera::import))]
    Import(String),

    /// Failed to export CRDT data.
    #[error("failed to export CRDT data: {0}")]
    #[diagnostic(code(tessera::export))]
    Export(String),

    /// Loro CRDT error.
    #[error("loro error: {0}")]
    #[diagnostic(code(tessera::loro))]
    Loro(String),
}

impl From<loro::LoroError> for SyncError {
    fn from(e: loro::LoroError) -> Self {
        SyncError::Loro(e.to_string())
    }
}

impl SyncError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        SyncError::SyncProtocol(message.into())
    }
}
