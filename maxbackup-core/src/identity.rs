//! User identity resolution.
//!
//! The supervisor and IPC server only ever see the [`IdentityResolver`]
//! trait; the OS-backed implementation consults the system user database,
//! and tests substitute a map-backed resolver.

use std::collections::HashMap;
use std::path::PathBuf;

use nix::unistd::{Uid, User};

use crate::types::{Identity, Sid};

/// Maps an opaque user identifier to a display name and home directory.
///
/// Resolution is a pure function over current OS state; callers tolerate a
/// transient `None` (e.g. a home directory that is not mounted yet) and may
/// retry later.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, sid: &Sid) -> Option<Identity>;
}

/// Resolver backed by the OS user database.
///
/// A numeric identifier is looked up as a uid, anything else as a user name.
/// When the database has no record, the name-derived heuristic `/home/<sid>`
/// is tried. Either way the identity is only returned if its home directory
/// exists at resolution time.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsIdentityResolver;

impl IdentityResolver for OsIdentityResolver {
    fn resolve(&self, sid: &Sid) -> Option<Identity> {
        let record = sid
            .as_str()
            .parse::<u32>()
            .ok()
            .and_then(|uid| User::from_uid(Uid::from_raw(uid)).ok().flatten())
            .or_else(|| User::from_name(sid.as_str()).ok().flatten());

        let identity = match record {
            Some(user) => Identity {
                display_name: user.name,
                home_directory: user.dir,
            },
            None => Identity {
                display_name: sid.to_string(),
                home_directory: PathBuf::from("/home").join(sid.as_str()),
            },
        };

        if identity.home_directory.is_dir() {
            Some(identity)
        } else {
            None
        }
    }
}

/// Map-backed resolver for tests and fixtures.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    entries: HashMap<Sid, Identity>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sid: impl Into<Sid>, display_name: &str, home: impl Into<PathBuf>) -> Self {
        self.entries.insert(
            sid.into(),
            Identity {
                display_name: display_name.to_string(),
                home_directory: home.into(),
            },
        );
        self
    }
}

impl IdentityResolver for StaticResolver {
    fn resolve(&self, sid: &Sid) -> Option<Identity> {
        let identity = self.entries.get(sid)?.clone();
        if identity.home_directory.is_dir() {
            Some(identity)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
