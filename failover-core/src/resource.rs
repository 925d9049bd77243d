//! Resource classes and the ownership merge rule
//!
//! A node's holdings are tracked as a two-bit class relative to that node:
//! `Local` are the groups configured for it, `Foreign` are the groups of its
//! peer. The same physical groups are therefore `Local` on one side and
//! `Foreign` on the other; [`ResourceClass::flip`] translates between frames.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::str::FromStr;
use tracing::error;

use crate::error::FailoverError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    #[default]
    None,
    Local,
    Foreign,
    All,
}

impl ResourceClass {
    const LOCAL_BIT: u8 = 0b01;
    const FOREIGN_BIT: u8 = 0b10;

    pub const fn bits(self) -> u8 {
        match self {
            ResourceClass::None => 0,
            ResourceClass::Local => Self::LOCAL_BIT,
            ResourceClass::Foreign => Self::FOREIGN_BIT,
            ResourceClass::All => Self::LOCAL_BIT | Self::FOREIGN_BIT,
        }
    }

    pub const fn from_bits(bits: u8) -> Self {
        match bits & (Self::LOCAL_BIT | Self::FOREIGN_BIT) {
            0 => ResourceClass::None,
            Self::LOCAL_BIT => ResourceClass::Local,
            Self::FOREIGN_BIT => ResourceClass::Foreign,
            _ => ResourceClass::All,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceClass::None => "none",
            ResourceClass::Local => "local",
            ResourceClass::Foreign => "foreign",
            ResourceClass::All => "all",
        }
    }

    /// Decode a wire string; anything unrecognized is logged and read as
    /// `None`
    pub fn decode(value: &str) -> Self {
        match value.parse() {
            Ok(class) => class,
            Err(e) => {
                error!(error = %e, "Bad resource class in cluster message");
                ResourceClass::None
            }
        }
    }

    pub fn contains(self, other: ResourceClass) -> bool {
        self.bits() & other.bits() == other.bits()
    }

    pub fn intersects(self, other: ResourceClass) -> bool {
        self.bits() & other.bits() != 0
    }

    pub fn is_empty(self) -> bool {
        self == ResourceClass::None
    }

    /// Same groups seen from the peer's side
    pub fn flip(self) -> Self {
        match self {
            ResourceClass::Local => ResourceClass::Foreign,
            ResourceClass::Foreign => ResourceClass::Local,
            other => other,
        }
    }

    /// Remove `other` from this class
    pub fn without(self, other: ResourceClass) -> Self {
        Self::from_bits(self.bits() & !other.bits())
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceClass {
    type Err = FailoverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ResourceClass::None),
            "local" => Ok(ResourceClass::Local),
            "foreign" => Ok(ResourceClass::Foreign),
            "all" => Ok(ResourceClass::All),
            other => Err(FailoverError::malformed(format!(
                "unknown resource class '{}'",
                other
            ))),
        }
    }
}

impl BitOr for ResourceClass {
    type Output = ResourceClass;

    fn bitor(self, rhs: Self) -> Self {
        Self::from_bits(self.bits() | rhs.bits())
    }
}

impl BitOrAssign for ResourceClass {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = *self | rhs;
    }
}

impl BitAnd for ResourceClass {
    type Output = ResourceClass;

    fn bitand(self, rhs: Self) -> Self {
        Self::from_bits(self.bits() & rhs.bits())
    }
}

impl Not for ResourceClass {
    type Output = ResourceClass;

    fn not(self) -> Self {
        Self::from_bits(!self.bits())
    }
}

/// Whether a resource report carries a complete snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportKind {
    Full,
    Incremental,
}

/// Fold a reported class into the current view
///
/// A full report replaces the current value. An incremental report of
/// `None` clears everything; any other incremental report only adds bits.
pub fn merge(current: ResourceClass, update: ResourceClass, kind: ReportKind) -> ResourceClass {
    match kind {
        ReportKind::Full => update,
        ReportKind::Incremental if update.is_empty() => ResourceClass::None,
        ReportKind::Incremental => current | update,
    }
}
