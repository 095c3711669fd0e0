//! Content filters that turn a raw upstream document into the artifact the
//! proxy publishes.
//!
//! Filters are pure: the same input always yields byte-identical output, and
//! they hold no state beyond their immutable configuration.

pub mod guide;
pub mod playlist;

pub use guide::GuideFilter;
pub use playlist::PlaylistFilter;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// The upstream body could not be turned into an artifact.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("malformed XML attribute: {0}")]
    Attribute(#[from] quick_xml::events::attributes::AttrError),
    #[error("document has no root element")]
    MissingRoot,
    #[error("unexpected {0}")]
    Unexpected(&'static str),
    #[error("document ended before <{0}> was closed")]
    Truncated(String),
    #[error("failed to render filtered document: {0}")]
    Render(String),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Transforms raw upstream bytes into the published subset.
pub trait ContentFilter: Send + Sync {
    fn apply(&self, raw: &[u8]) -> Result<Vec<u8>, FilterError>;
}
