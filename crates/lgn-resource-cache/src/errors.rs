use std::sync::Arc;

use thiserror::Error;

use crate::ResourceId;

/// Identity of a resource that was still referenced when the cache shut down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakedResource {
    /// Name of the effective resource type.
    pub type_name: String,
    /// Outstanding handle count at the time of the final sweep.
    pub ref_count: u32,
    /// Identifier the resource was requested with.
    pub id: ResourceId,
}

impl std::fmt::Display for LeakedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} '{}' ({} outstanding handles)",
            self.type_name, self.id, self.ref_count
        )
    }
}

/// An error type for the resource cache crate.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The type allocator could not construct an instance.
    #[error("failed to create {type_name} '{id}': {reason}")]
    CreationFailed {
        /// Name of the effective type.
        type_name: String,
        /// Id of the requested resource.
        id: ResourceId,
        /// Message of the allocator.
        reason: String,
    },

    /// Data load or content update failed.
    #[error("failed to load '{id}': {reason}")]
    LoadFailed {
        /// Id of the resource.
        id: ResourceId,
        /// What went wrong.
        reason: String,
    },

    /// The resource is queued or in flight and cannot be deallocated yet.
    #[error("resource '{0}' is queued for loading")]
    Busy(ResourceId),

    /// The resource still has outstanding handles.
    #[error("resource '{id}' is still referenced ({ref_count} handles)")]
    StillReferenced {
        /// Id of the resource.
        id: ResourceId,
        /// Outstanding handle count.
        ref_count: u32,
    },

    /// A content update tried to acquire a type it was never allowed to.
    #[error("'{updating}' is not allowed to acquire '{requested}' while updating its content")]
    MisconfiguredPermission {
        /// Name of the type whose content was being updated.
        updating: String,
        /// Name of the effective type it tried to acquire.
        requested: String,
    },

    /// Resources were still referenced during the final shutdown sweep.
    #[error("{} resource(s) still referenced at shutdown", .0.len())]
    ShutdownLeak(Vec<LeakedResource>),

    /// The same override was registered twice.
    #[error("override '{derived}' is already registered for '{base}'")]
    DuplicateOverride {
        /// Name of the overridden type.
        base: String,
        /// Name of the overriding type.
        derived: String,
    },

    /// The derived type of an override does not derive from the base type.
    #[error("'{derived}' does not derive from '{base}'")]
    InvalidOverride {
        /// Name of the overridden type.
        base: String,
        /// Name of the overriding type.
        derived: String,
    },

    /// The resource type was never registered with the cache.
    #[error("resource type '{0}' is not registered")]
    UnknownResourceType(String),

    /// The cache no longer accepts requests.
    #[error("the resource cache is shutting down")]
    ShuttingDown,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(#[from] Box<figment::Error>),

    /// General IO error while reading a resource source.
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// A result type that can be used to indicate errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;
