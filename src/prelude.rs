pub use std::collections::{HashMap, HashSet};
pub use std::convert::{TryFrom, TryInto};
pub use std::fmt::Display;
pub use std::str::FromStr;

pub use once_cell::sync::Lazy;
pub use regex::Regex;
pub use serde::{Deserialize, Serialize};
pub use serde_with::{DeserializeFromStr, SerializeDisplay};
pub use tracing::{debug, error, info, trace, warn};

pub use crate::error::{FsError, Result};
pub use crate::try_from_str_boilerplate;
pub use crate::util::ReadPlusSeek;
pub use crate::vocab::*;
