use std::any::Any;

use bitflags::bitflags;
use serde::Deserialize;

/// Types implementing `Resource` are the objects stored in the
/// [`crate::ResourceCache`].
///
/// Instances are created empty by the type allocator and filled in by the
/// loader's content update stage.
pub trait Resource: Any + Send + Sync {
    /// Cast to &dyn Any type.
    fn as_any(&self) -> &dyn Any;

    /// Cast to &mut dyn Any type.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl dyn Resource {
    /// Returns `true` if the boxed type is the same as `T`.
    #[inline]
    pub fn is<T: Resource>(&self) -> bool {
        self.as_any().is::<T>()
    }

    /// Returns some reference to the boxed value if it is of type `T`.
    #[inline]
    pub fn downcast_ref<T: Resource>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Returns some mutable reference to the boxed value if it is of type `T`.
    #[inline]
    pub fn downcast_mut<T: Resource>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

/// Implements [`Resource`] for a type.
#[macro_export]
macro_rules! implement_resource {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::Resource for $ty {
                fn as_any(&self) -> &dyn ::std::any::Any {
                    self
                }

                fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
                    self
                }
            }
        )+
    };
}

/// Loading state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LoadingState {
    /// No data has been loaded.
    Unloaded = 0,
    /// A data load or content update is in progress.
    Loading = 1,
    /// The resource holds its final content.
    Loaded = 2,
    /// No data could be produced; the resource holds its fallback content.
    LoadedResourceMissing = 3,
}

impl LoadingState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Loading,
            2 => Self::Loaded,
            3 => Self::LoadedResourceMissing,
            _ => Self::Unloaded,
        }
    }

    /// Returns true once loading finished, successfully or not.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Loaded | Self::LoadedResourceMissing)
    }
}

/// Scheduling priority of a load request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Loaded after everything else.
    Low,
    /// Default priority of resource types.
    Medium,
    /// Loaded ahead of `Medium` and `Low` requests.
    High,
    /// Requests that block a caller.
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

bitflags! {
    /// Per-resource status flags.
    pub struct ResourceFlags: u8 {
        /// The resource type supports reloading.
        const RELOADABLE = 0b0000_0001;
        /// The resource fell back to its type's default content.
        const HAS_TYPE_FALLBACK = 0b0000_0010;
        /// Low-resolution data was applied ahead of the full load.
        const HAS_LOW_RESOLUTION_DATA = 0b0000_0100;
        /// Queued or in flight; the resource must not be deallocated.
        const QUEUED_FOR_LOADING = 0b0000_1000;
        /// Loaded through `force_load_now` on a caller thread.
        const CREATED_VIA_CUSTOM_LOADER = 0b0001_0000;
    }
}

/// Memory footprint estimate reported by a loader after a content update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Bytes held in system memory.
    pub cpu_bytes: u64,
    /// Bytes held in device memory.
    pub gpu_bytes: u64,
}

impl MemoryUsage {
    /// Creates an estimate.
    pub fn new(cpu_bytes: u64, gpu_bytes: u64) -> Self {
        Self {
            cpu_bytes,
            gpu_bytes,
        }
    }
}

impl std::ops::AddAssign for MemoryUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.cpu_bytes += rhs.cpu_bytes;
        self.gpu_bytes += rhs.gpu_bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_are_ordered() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn loading_state_round_trips_through_u8() {
        for state in [
            LoadingState::Unloaded,
            LoadingState::Loading,
            LoadingState::Loaded,
            LoadingState::LoadedResourceMissing,
        ] {
            assert_eq!(LoadingState::from_u8(state as u8), state);
        }
        assert!(LoadingState::LoadedResourceMissing.is_finished());
        assert!(!LoadingState::Loading.is_finished());
    }
}
