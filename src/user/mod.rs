//! Room participants
//!
//! A [`User`] belongs to exactly one room. Its `version` invalidates issued
//! credentials: changing the password or permissions bumps it in the same
//! critical section as the field change, so a reader never sees new
//! permissions paired with an old version.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::auth;
use crate::error::{Error, Result};
use crate::storage::{Storage, UserRecord};

/// Set of actions a user may perform in their room
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(u32);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    pub const GET_MOVIE_LIST: Permissions = Permissions(1 << 0);
    pub const ADD_MOVIE: Permissions = Permissions(1 << 1);
    pub const DELETE_MOVIE: Permissions = Permissions(1 << 2);
    pub const EDIT_CURRENT: Permissions = Permissions(1 << 3);
    pub const SET_STATUS: Permissions = Permissions(1 << 4);
    pub const SEND_CHAT: Permissions = Permissions(1 << 5);
    /// Implies every other permission
    pub const ADMIN: Permissions = Permissions(1 << 31);

    /// What a newly joined member gets
    pub const MEMBER: Permissions = Permissions(
        Self::GET_MOVIE_LIST.0 | Self::ADD_MOVIE.0 | Self::SET_STATUS.0 | Self::SEND_CHAT.0,
    );

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Permissions(bits)
    }

    /// Whether every bit of `other` is set
    pub const fn contains(self, other: Permissions) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the holder may perform `action`
    pub const fn allows(self, action: Permissions) -> bool {
        self.contains(Self::ADMIN) || self.contains(action)
    }

    /// Clear every bit of `other`
    pub fn remove(&mut self, other: Permissions) {
        self.0 &= !other.0;
    }
}

impl BitOr for Permissions {
    type Output = Permissions;

    fn bitor(self, rhs: Permissions) -> Permissions {
        Permissions(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permissions {
    fn bitor_assign(&mut self, rhs: Permissions) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Permissions({:#x})", self.0)
    }
}

struct UserState {
    name: String,
    hashed_password: Option<String>,
    permissions: Permissions,
    version: u32,
}

/// A live room participant
pub struct User {
    id: String,
    room_id: String,
    state: RwLock<UserState>,
    /// Serializes writers across the storage await
    update_lock: Mutex<()>,
    storage: Arc<dyn Storage>,
}

impl User {
    /// Build a fresh record with a generated id
    pub fn new_record(
        room_id: &str,
        name: &str,
        password: Option<&str>,
        permissions: Permissions,
    ) -> Result<UserRecord> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidArgument("user name is empty".into()));
        }
        let id = uuid::Uuid::new_v4().simple().to_string();
        Ok(UserRecord {
            hashed_password: password.map(|pw| auth::hash_password(&id, pw)),
            id,
            room_id: room_id.to_string(),
            name: name.to_string(),
            permissions,
            version: 1,
        })
    }

    /// Wrap a loaded record
    pub fn from_record(record: UserRecord, storage: Arc<dyn Storage>) -> Self {
        Self {
            id: record.id,
            room_id: record.room_id,
            state: RwLock::new(UserState {
                name: record.name,
                hashed_password: record.hashed_password,
                permissions: record.permissions,
                version: record.version,
            }),
            update_lock: Mutex::new(()),
            storage,
        }
    }

    /// Get the user id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id of the room the user belongs to
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Get the display name
    pub fn name(&self) -> String {
        self.state.read().name.clone()
    }

    /// Credential version; bumped by password and permission changes
    pub fn version(&self) -> u32 {
        self.state.read().version
    }

    /// Get the granted permissions
    pub fn permissions(&self) -> Permissions {
        self.state.read().permissions
    }

    /// Whether the user may perform `action`
    pub fn has_permission(&self, action: Permissions) -> bool {
        self.permissions().allows(action)
    }

    /// Fail with [`Error::PermissionDenied`] unless the user may perform `action`
    pub fn require(&self, action: Permissions) -> Result<()> {
        if self.has_permission(action) {
            Ok(())
        } else {
            Err(Error::PermissionDenied)
        }
    }

    /// Fail with [`Error::StaleVersion`] unless `version` is current
    pub fn check_version(&self, version: u32) -> Result<()> {
        if self.version() == version {
            Ok(())
        } else {
            Err(Error::StaleVersion)
        }
    }

    /// Fail with [`Error::InvalidPassword`] unless `password` matches
    pub fn check_password(&self, password: &str) -> Result<()> {
        let state = self.state.read();
        if auth::verify_password(&self.id, state.hashed_password.as_deref(), password) {
            Ok(())
        } else {
            Err(Error::InvalidPassword)
        }
    }

    /// Snapshot as a storage row
    pub fn record(&self) -> UserRecord {
        let state = self.state.read();
        UserRecord {
            id: self.id.clone(),
            room_id: self.room_id.clone(),
            name: state.name.clone(),
            hashed_password: state.hashed_password.clone(),
            permissions: state.permissions,
            version: state.version,
        }
    }

    /// Set or remove the password; returns the new version
    pub async fn set_password(&self, password: Option<&str>) -> Result<u32> {
        let hashed = password.map(|pw| auth::hash_password(&self.id, pw));
        self.update(|state| state.hashed_password = hashed).await
    }

    /// Replace the permission set; returns the new version
    pub async fn set_permissions(&self, permissions: Permissions) -> Result<u32> {
        self.update(|state| state.permissions = permissions).await
    }

    /// Persist a changed copy, then commit it together with a version bump
    async fn update<F>(&self, change: F) -> Result<u32>
    where
        F: FnOnce(&mut UserState),
    {
        let _guard = self.update_lock.lock().await;

        let mut next = self.record();
        let mut staged = UserState {
            name: next.name.clone(),
            hashed_password: next.hashed_password.clone(),
            permissions: next.permissions,
            version: next.version.wrapping_add(1),
        };
        change(&mut staged);
        next.hashed_password = staged.hashed_password.clone();
        next.permissions = staged.permissions;
        next.version = staged.version;

        self.storage.save_user(&next).await?;

        let version = staged.version;
        *self.state.write() = staged;
        tracing::debug!(user = %self.id, room = %self.room_id, version, "User updated");
        Ok(version)
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("room_id", &self.room_id)
            .field("version", &self.version())
            .finish()
    }
}
