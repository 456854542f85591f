use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// A stable key for a memoized call.
///
/// Collaborators that memoize lookups (for example a provider and a query) describe the inputs
/// in human-readable form through a [`CallKeyBuilder`]. That description is hashed, and the
/// resulting key is what the [`Scheduler`](super::Scheduler) sees.
#[derive(Debug, Clone, Eq)]
pub struct CallKey {
    key: Arc<str>,
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl PartialEq for CallKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CallKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl AsRef<str> for CallKey {
    fn as_ref(&self) -> &str {
        &self.key
    }
}

impl CallKey {
    /// Creates a [`CallKeyBuilder`] for calls in the given namespace.
    ///
    /// The namespace is kept readable as the prefix of the key, which makes snapshots and logs
    /// easier to follow.
    pub fn builder(namespace: &str) -> CallKeyBuilder {
        CallKeyBuilder {
            namespace: safe_key_segment(namespace),
            metadata: format!("namespace: {namespace}\n\n"),
        }
    }

    /// Creates a key for a query against a provider.
    pub fn for_query(provider: &str, query: &str) -> Self {
        let mut builder = Self::builder(provider);
        builder.write_field("query", query).unwrap();
        builder.build()
    }

    /// Returns the human-readable metadata that forms the basis of the [`CallKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the key as passed to the [`Scheduler`](super::Scheduler).
    ///
    /// It is formatted as `$namespace/$sha256`.
    pub fn as_str(&self) -> &str {
        &self.key
    }
}

/// A builder for [`CallKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and the intention of it is to
/// accept human readable, but most importantly **stable**, input. Any change in how the inputs
/// are written changes the key, and makes previously persisted results unreachable.
#[derive(Debug)]
pub struct CallKeyBuilder {
    namespace: String,
    metadata: String,
}

impl CallKeyBuilder {
    /// Writes a `name: value` line into the key metadata.
    pub fn write_field(&mut self, name: &str, value: impl fmt::Display) -> fmt::Result {
        writeln!(self.metadata, "{name}: {value}")
    }

    /// Finalize the [`CallKey`].
    pub fn build(self) -> CallKey {
        let hash: [u8; 32] = Sha256::digest(&self.metadata).into();

        let mut key = self.namespace;
        key.push('/');
        for b in hash {
            key.write_fmt(format_args!("{b:02x}")).unwrap();
        }

        CallKey {
            key: key.into(),
            metadata: self.metadata.into(),
            hash,
        }
    }
}

impl Write for CallKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}

/// Protect against:
/// * ".."
/// * absolute paths
/// * ":" (not a threat on POSIX filesystems, but confuses OS X Finder)
/// * "/" which would make the namespace ambiguous
fn safe_key_segment(s: &str) -> String {
    s.replace(['.', '/', '\\', ':'], "_")
}
