//! Exemption flags for namespaces and routes.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::LimiterError;

/// Which limit categories a namespace or route is exempt from, and how the
/// exemption propagates through the namespace tree.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ExemptionScope(u8);

impl ExemptionScope {
    pub const NONE: Self = Self(0);
    /// Application wide limits.
    pub const APPLICATION: Self = Self(1);
    /// Default limits and inherited namespace limits.
    pub const DEFAULT: Self = Self(1 << 1);
    /// Meta limits.
    pub const META: Self = Self(1 << 2);
    /// Propagate this exemption to every descendant namespace.
    pub const DESCENDANTS: Self = Self(1 << 3);
    /// Do not inherit limits from ancestor namespaces.
    pub const ANCESTORS: Self = Self(1 << 4);

    /// The limit categories, without the propagation flags.
    pub const CATEGORIES: Self = Self(Self::APPLICATION.0 | Self::DEFAULT.0 | Self::META.0);

    const NAMES: [(Self, &'static str); 5] = [
        (Self::APPLICATION, "application"),
        (Self::DEFAULT, "default"),
        (Self::META, "meta"),
        (Self::DESCENDANTS, "descendants"),
        (Self::ANCESTORS, "ancestors"),
    ];

    /// Flags applied by a plain `exempt()` without explicit flags.
    pub fn exempt_default() -> Self {
        Self::DEFAULT | Self::APPLICATION | Self::META
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Only the category flags of this scope.
    pub fn categories(&self) -> Self {
        *self & Self::CATEGORIES
    }

    /// Names of the flags that are set, in declaration order.
    pub fn names(&self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Combine a list of flag names, e.g. from configuration.
    pub fn from_names<I, S>(names: I) -> Result<Self, LimiterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .try_fold(Self::NONE, |acc, name| Ok(acc | name.as_ref().parse::<Self>()?))
    }
}

impl BitOr for ExemptionScope {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ExemptionScope {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ExemptionScope {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for ExemptionScope {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0 & 0b1_1111)
    }
}

impl FromStr for ExemptionScope {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        if name == "all" {
            return Ok(Self::exempt_default());
        }
        Self::NAMES
            .iter()
            .find(|(_, candidate)| *candidate == name)
            .map(|(flag, _)| *flag)
            .ok_or_else(|| LimiterError::Configuration(format!("unknown exemption flag '{}'", s)))
    }
}

impl fmt::Debug for ExemptionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("ExemptionScope(NONE)");
        }
        write!(f, "ExemptionScope({})", self.names().join(" | ").to_uppercase())
    }
}

impl fmt::Display for ExemptionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        f.write_str(&self.names().join(","))
    }
}

impl Serialize for ExemptionScope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.names())
    }
}

impl<'de> Deserialize<'de> for ExemptionScope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        Self::from_names(names).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_exemption() {
        let scope = ExemptionScope::exempt_default();
        assert!(scope.contains(ExemptionScope::DEFAULT));
        assert!(scope.contains(ExemptionScope::APPLICATION));
        assert!(scope.contains(ExemptionScope::META));
        assert!(!scope.intersects(ExemptionScope::DESCENDANTS | ExemptionScope::ANCESTORS));
    }

    #[test]
    fn test_categories_strip_propagation() {
        let scope = ExemptionScope::DEFAULT | ExemptionScope::DESCENDANTS;
        assert_eq!(scope.categories(), ExemptionScope::DEFAULT);
        assert_eq!((!ExemptionScope::ANCESTORS & scope), scope);
        assert!(ExemptionScope::NONE.is_empty());
    }

    #[test]
    fn test_parse_names() {
        let scope = ExemptionScope::from_names(["default", "Descendants"]).unwrap();
        assert_eq!(scope, ExemptionScope::DEFAULT | ExemptionScope::DESCENDANTS);
        assert_eq!("all".parse::<ExemptionScope>().unwrap(), ExemptionScope::exempt_default());
        assert!("everything".parse::<ExemptionScope>().is_err());
    }

    #[test]
    fn test_display_and_debug() {
        let scope = ExemptionScope::META | ExemptionScope::APPLICATION;
        assert_eq!(scope.to_string(), "application,meta");
        assert_eq!(format!("{:?}", scope), "ExemptionScope(APPLICATION | META)");
        assert_eq!(ExemptionScope::NONE.to_string(), "none");
    }

    #[test]
    fn test_serde_as_list() {
        let scope: ExemptionScope = serde_json::from_str(r#"["meta", "ancestors"]"#).unwrap();
        assert_eq!(scope, ExemptionScope::META | ExemptionScope::ANCESTORS);
        assert_eq!(serde_json::to_string(&scope).unwrap(), r#"["meta","ancestors"]"#);
    }
}
