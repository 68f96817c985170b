pub use std::collections::{BTreeSet, HashMap, HashSet};
pub use std::convert::{TryFrom, TryInto};
pub use std::fmt::Display;
pub use std::io::{Read, Seek, Write};
pub use std::path::{Path, PathBuf};
pub use std::rc::Rc;
pub use std::str::FromStr;

pub use derivative::Derivative;
pub use eyre::{bail, ensure, eyre, ContextCompat, Result, WrapErr};
pub use indexmap::{IndexMap, IndexSet};
pub use once_cell::sync::Lazy;
pub use regex::Regex;
pub use serde::{Deserialize, Serialize};
pub use serde_with::{DeserializeFromStr, SerializeDisplay};
pub use tracing::{debug, info, trace, warn};
pub use url::Url;

pub use crate::context;
pub use crate::error::IpkgError;
pub use crate::try_from_str_boilerplate;
pub use crate::vocab::*;
