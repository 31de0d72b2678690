mod artifact_hash;
mod artifact_name;
mod constraint;
mod core_metadata;
mod extra;
mod headers;
pub mod marker;
mod package_name;
mod reqparse;
mod requirement;
mod specifier;
mod version;

// All this stuff is also re-exported from crate::prelude::*

pub use self::artifact_hash::{ArtifactHash, HashChecker};
pub use self::artifact_name::{ArtifactName, SdistFormat, SdistName, WheelName};
pub use self::constraint::VersionSpec;
pub use self::core_metadata::CoreMetadata;
pub use self::extra::Extra;
pub use self::headers::HeaderBlock;
pub use self::marker::{Marker, MarkerUniverse, Simplified};
pub use self::package_name::PackageName;
pub use self::requirement::{ParseExtra, Requirement};
pub use self::specifier::{CompareOp, Specifier, Specifiers};
pub use self::version::{Version, VERSION_INFINITY, VERSION_ZERO};

/// Parse a standalone marker expression (as stored in lock files).
pub fn parse_marker(input: &str) -> eyre::Result<Marker> {
    reqparse::marker(input, ParseExtra::Allowed)
        .map_err(|err| eyre::eyre!("failed to parse marker {:?}: {}", input, err))
}
