//! GeoArc Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the GeoArc workspace.
//!
//! # Overview
//!
//! - **Error Handling**: Common error and result types
//! - **Checksums**: Digest helpers for staged archives
//! - **Logging**: Subscriber setup shared by every binary
//! - **Types**: The canonical feature model every ingestion front-end produces
//!
//! # Example
//!
//! ```no_run
//! use geoarc_common::types::{GeometryKind, CanonicalFeature, FeatureMetadata};
//!
//! let feature = CanonicalFeature {
//!     source_id: "s1".to_string(),
//!     name: Some("A".to_string()),
//!     description: None,
//!     geometry_kind: GeometryKind::Point,
//!     coordinates: "-1,2,0".to_string(),
//!     metadata: FeatureMetadata::new(GeometryKind::Point, chrono::Utc::now()),
//! };
//! assert_eq!(feature.geometry_kind.to_string(), "POINT");
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
pub use types::{CanonicalFeature, FeatureMetadata, GeometryKind};
