//! Error types surfaced by the coverage and randomization engines.

use thiserror::Error;

/// Any error raised by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A coverage item with this name is already registered.
    #[error("coverage item `{0}` is already registered")]
    DuplicateItem(String),

    /// No coverage item with this name exists.
    #[error("unknown coverage item `{0}`")]
    UnknownItem(String),

    /// Invalid arguments at registration time (bad labels, bad weight,
    /// unknown cross reference, out-of-range threshold, ...).
    #[error("registration: {0}")]
    Registration(String),

    /// A sample or randomize call violated the declared contract.
    #[error("contract: {0}")]
    Contract(String),

    /// The constraint solver found no acceptable assignment.
    #[error("solver failed for group [{group}]: {detail}")]
    Solver {
        /// The random variables of the failing group.
        group: String,
        /// What went wrong.
        detail: String,
    },

    /// Exporting the coverage database failed.
    #[error("export: {0}")]
    Export(String),

    /// An imported coverage tree does not line up with the registered one.
    #[error("merge mismatch at `{path}`: {detail}")]
    Merge {
        /// First path at which the structures disagree.
        path: String,
        /// What disagrees.
        detail: String,
    },

    /// A user callback returned an error. The triggering update still ran to
    /// completion before this was raised.
    #[error("callback on `{item}` failed: {source}")]
    Callback {
        /// The coverage item whose callback failed.
        item: String,
        /// The callback's own error.
        source: Box<dyn std::error::Error>,
    },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("xml: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
