pub use std::collections::{BTreeMap, HashMap, HashSet};
pub use std::convert::{TryFrom, TryInto};
pub use std::fmt::Display;
pub use std::io::{Read, Seek, Write};
pub use std::str::FromStr;
pub use std::sync::Arc;

pub use eyre::{bail, ensure, eyre, Result, WrapErr};
pub use once_cell::sync::Lazy;
pub use regex::Regex;
pub use serde::{Deserialize, Serialize};
pub use serde_with::{DeserializeFromStr, SerializeDisplay};
pub use tracing::{debug, info, trace, warn};
pub use url::Url;

pub use crate::error::SprigError;
pub use crate::util::{slurp, ReadPlusSeek};
pub use crate::vocab::*;
pub use crate::{context, try_from_str_boilerplate};

use directories::ProjectDirs;
pub static PROJECT_DIRS: Lazy<ProjectDirs> = Lazy::new(|| {
    // ...Can this actually return None?
    ProjectDirs::from("", "", env!("CARGO_PKG_NAME")).unwrap()
});
