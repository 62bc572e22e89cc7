// Referers - how clients point at stored entities

//! Entity lookups accept either a `{name, version}` pair (where `version` may
//! be the literal `"latest"`) or a prefix of an entity identifier. The two
//! shapes are mutually exclusive; a referer carrying both is rejected at
//! deserialization time.

use serde::{Deserialize, Serialize};

/// Version selector inside a name-based referer.
///
/// Accepts an integer, a numeric string, or the literal `"latest"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSelector {
    Latest,
    Number(u32),
}

impl Serialize for VersionSelector {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            VersionSelector::Latest => serializer.serialize_str("latest"),
            VersionSelector::Number(n) => serializer.serialize_u32(*n),
        }
    }
}

impl<'de> Deserialize<'de> for VersionSelector {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SelectorVisitor;

        impl serde::de::Visitor<'_> for SelectorVisitor {
            type Value = VersionSelector;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a version number or the string \"latest\"")
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
                u32::try_from(v)
                    .map(VersionSelector::Number)
                    .map_err(|_| E::custom("version out of range"))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u32::try_from(v)
                    .map(VersionSelector::Number)
                    .map_err(|_| E::custom("version out of range"))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                if v == "latest" {
                    Ok(VersionSelector::Latest)
                } else {
                    v.parse::<u32>()
                        .map(VersionSelector::Number)
                        .map_err(|_| E::custom(format!("invalid version: {v}")))
                }
            }
        }

        deserializer.deserialize_any(SelectorVisitor)
    }
}

impl std::fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionSelector::Latest => write!(f, "latest"),
            VersionSelector::Number(n) => write!(f, "{n}"),
        }
    }
}

/// Name-and-version lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NameVersionRef {
    pub name: String,
    pub version: VersionSelector,
}

/// Identifier-prefix lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HashRef {
    pub hash: String,
}

/// A lookup handle for any stored entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Referer {
    NameVersion(NameVersionRef),
    Hash(HashRef),
}

impl Referer {
    pub fn by_name<S: Into<String>>(name: S, version: VersionSelector) -> Self {
        Referer::NameVersion(NameVersionRef {
            name: name.into(),
            version,
        })
    }

    pub fn by_hash<S: Into<String>>(hash: S) -> Self {
        Referer::Hash(HashRef { hash: hash.into() })
    }

    pub fn latest<S: Into<String>>(name: S) -> Self {
        Referer::by_name(name, VersionSelector::Latest)
    }
}

impl std::fmt::Display for Referer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Referer::NameVersion(r) => write!(f, "{}:{}", r.name, r.version),
            Referer::Hash(r) => write!(f, "{}", r.hash),
        }
    }
}
