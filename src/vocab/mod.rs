mod constraint;
mod content_hash;
mod package_meta;
mod package_name;
mod package_spec;
mod platform;
mod reqparse;
mod requirement;
mod version;

// All this stuff is also re-exported from crate::prelude::*

pub use self::constraint::{CompareOp, Constraint, VersionConstraint};
pub use self::content_hash::{sha256_hex, ContentHash, HashChecker};
pub use self::package_meta::{PackageMeta, Revision};
pub use self::package_name::PackageName;
pub use self::package_spec::PackageSpec;
pub use self::platform::{Platform, ANY_PLATFORM};
pub use self::requirement::{Candidate, Requirement};
pub use self::version::Version;
