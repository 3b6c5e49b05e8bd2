use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use siphasher::sip::SipHasher;

/// Caller supplied identifier of a resource.
///
/// The identifier is normalized to a 64 bit content hash used for every
/// lookup. The original string is retained for diagnostics. Two ids are equal
/// when their hashes are equal.
#[derive(Clone)]
pub struct ResourceId {
    hash: u64,
    name: Arc<str>,
}

impl ResourceId {
    /// Creates an id from its string representation.
    pub fn new(name: impl AsRef<str>) -> Self {
        let name = name.as_ref();
        Self {
            hash: hash_name(name),
            name: Arc::from(name),
        }
    }

    /// 64 bit content hash of the id.
    pub fn hash_value(&self) -> u64 {
        self.hash
    }

    /// Original string the id was created from.
    pub fn as_str(&self) -> &str {
        &self.name
    }
}

/// Stable hash of a resource name.
///
/// Uses fixed keys so the value is identical across runs and processes.
pub fn hash_name(name: &str) -> u64 {
    let mut hasher = SipHasher::new_with_keys(0, 0);
    hasher.write(name.as_bytes());
    hasher.finish()
}

impl PartialEq for ResourceId {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for ResourceId {}

impl Hash for ResourceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceId({:?}, {:016x})", self.name, self.hash)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<&str> for ResourceId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ResourceId {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<&String> for ResourceId {
    fn from(name: &String) -> Self {
        Self::new(name)
    }
}
