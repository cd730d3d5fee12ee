use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One key slot on one key-custody store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyLocation {
    pub store_id: u8,
    pub key_index: u8,
}

impl KeyLocation {
    pub const fn new(store_id: u8, key_index: u8) -> Self {
        Self {
            store_id,
            key_index,
        }
    }

    /// Builds a location from wider integers, rejecting values that cannot travel in one byte.
    pub fn try_from_ints(store_id: i64, key_index: i64) -> Result<Self> {
        let store_id = u8::try_from(store_id).map_err(|_| Error::LocationOutOfRange {
            field: "store_id",
            value: store_id,
        })?;
        let key_index = u8::try_from(key_index).map_err(|_| Error::LocationOutOfRange {
            field: "key_index",
            value: key_index,
        })?;
        Ok(Self::new(store_id, key_index))
    }
}

impl fmt::Display for KeyLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store {} index {}", self.store_id, self.key_index)
    }
}

/// Operations understood by a key-custody store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    GetKey,
    WrapKey,
    UnwrapKey,
}

/// Wire code and exact successful response length for an [`Action`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionDescriptor {
    pub action: Action,
    pub name: &'static str,
    pub code: u8,
    pub response_size: usize,
}

const ACTIONS: [ActionDescriptor; 3] = [
    ActionDescriptor {
        action: Action::GetKey,
        name: "getKey",
        code: 0,
        response_size: 17,
    },
    ActionDescriptor {
        action: Action::WrapKey,
        name: "wrapKey",
        code: 3,
        response_size: 49,
    },
    ActionDescriptor {
        action: Action::UnwrapKey,
        name: "unwrapKey",
        code: 4,
        response_size: 33,
    },
];

// Names used by older deployments of the key-custody client.
const LEGACY_NAMES: [(&str, Action); 3] = [
    ("getK", Action::GetKey),
    ("CreateCk", Action::WrapKey),
    ("GetKFromCK", Action::UnwrapKey),
];

impl Action {
    pub const ALL: [Action; 3] = [Action::GetKey, Action::WrapKey, Action::UnwrapKey];

    pub fn descriptor(self) -> &'static ActionDescriptor {
        match self {
            Action::GetKey => &ACTIONS[0],
            Action::WrapKey => &ACTIONS[1],
            Action::UnwrapKey => &ACTIONS[2],
        }
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    pub fn code(self) -> u8 {
        self.descriptor().code
    }

    /// Total response length including the status byte.
    pub fn response_size(self) -> usize {
        self.descriptor().response_size
    }

    /// Length of the body carried by a successful response.
    pub fn body_size(self) -> usize {
        self.response_size() - 1
    }

    pub fn from_code(code: u8) -> Option<Self> {
        ACTIONS
            .iter()
            .find(|descriptor| descriptor.code == code)
            .map(|descriptor| descriptor.action)
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        ACTIONS
            .iter()
            .map(|descriptor| (descriptor.name, descriptor.action))
            .chain(LEGACY_NAMES)
            .find(|(name, _)| *name == value)
            .map(|(_, action)| action)
            .ok_or_else(|| Error::UnsupportedAction(value.to_string()))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A key-custody endpoint address paired with the slot to use on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeySource {
    pub address: String,
    pub location: KeyLocation,
}

impl KeySource {
    pub fn new(address: impl Into<String>, location: KeyLocation) -> Self {
        Self {
            address: address.into(),
            location,
        }
    }
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.location)
    }
}
