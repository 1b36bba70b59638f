// Resource coordinates: a (row key, column) pair in the key-column store

use std::fmt::{Display, Formatter};

use bytes::Bytes;

/// An immutable `(key, column)` pair identifying a single cell
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyColumn {
    key: Bytes,
    column: Bytes,
}

impl KeyColumn {
    pub fn new(key: impl Into<Bytes>, column: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            column: column.into(),
        }
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn column(&self) -> &Bytes {
        &self.column
    }
}

impl Display for KeyColumn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "KeyColumn [k=0x{}, c=0x{}]",
            const_hex::encode(&self.key),
            const_hex::encode(&self.column)
        )
    }
}
