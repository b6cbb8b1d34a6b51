use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CoreError;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.0.to_string()[..8])
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| CoreError::InvalidId(format!("{}: {e}", stringify!($name))))
            }
        }
    };
}

/// Identifiers handed out by somebody else (the remote store, the auth
/// provider). Opaque non-empty strings.
macro_rules! string_id {
    ($name:ident) => {
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Result<Self, CoreError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(CoreError::InvalidId(format!(
                        "{} must not be empty",
                        stringify!($name)
                    )));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

uuid_id!(LocalId);

string_id!(RemoteId);
string_id!(UserId);

/// The logical container of an entity.
///
/// Farms live under their owner's account. Everything else points at another
/// entity, either through the cache (`Local`, resolved to a remote id when the
/// reconciler dispatches) or directly by the id the remote store assigned.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParentId {
    Owner(UserId),
    Local(LocalId),
    Remote(RemoteId),
}

impl ParentId {
    const OWNER_PREFIX: &'static str = "owner:";
    const LOCAL_PREFIX: &'static str = "local:";
    const REMOTE_PREFIX: &'static str = "remote:";

    pub fn as_local(&self) -> Option<LocalId> {
        match self {
            Self::Local(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Debug for ParentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParentId({self})")
    }
}

impl fmt::Display for ParentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owner(id) => write!(f, "{}{id}", Self::OWNER_PREFIX),
            Self::Local(id) => write!(f, "{}{id}", Self::LOCAL_PREFIX),
            Self::Remote(id) => write!(f, "{}{id}", Self::REMOTE_PREFIX),
        }
    }
}

impl FromStr for ParentId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix(Self::OWNER_PREFIX) {
            Ok(Self::Owner(rest.parse()?))
        } else if let Some(rest) = s.strip_prefix(Self::LOCAL_PREFIX) {
            Ok(Self::Local(rest.parse()?))
        } else if let Some(rest) = s.strip_prefix(Self::REMOTE_PREFIX) {
            Ok(Self::Remote(rest.parse()?))
        } else {
            Err(CoreError::InvalidId(format!("unrecognized parent reference: {s}")))
        }
    }
}
