//! Typed resource cache and asynchronous loading manager.
//!
//! A [`ResourceCache`] turns a (type, id) pair into a long-lived,
//! reference-counted, lazily loaded resource:
//! - requests are first resolved through named redirects and type overrides,
//!   so that a more specific type can serve an id requested as its base type,
//! - new resources are created `Unloaded` and queued by priority for the
//!   loading threads,
//! - loads run in two stages: the data load runs without the cache lock, the
//!   content update may acquire other resources if the permission graph
//!   allows it,
//! - unreferenced resources are reclaimed by a full sweep, or amortized over
//!   time by the incremental sweep.
//!
//! ## Adding a resource type
//!
//! ```
//! use std::sync::Arc;
//!
//! use lgn_resource_cache::{
//!     implement_resource, LoadRequest, MemoryDevice, MemoryUsage, Priority, Resource,
//!     ResourceCacheConfig, ResourceCacheOptions, ResourceLoader, ResourceTypeDescriptor,
//!     Result, UpdateContext,
//! };
//!
//! #[derive(Default)]
//! struct Text(String);
//!
//! implement_resource!(Text);
//!
//! struct TextLoader;
//!
//! impl ResourceLoader for TextLoader {
//!     fn load_data(&self, request: &LoadRequest<'_>) -> Result<Vec<u8>> {
//!         request.read_source()
//!     }
//!
//!     fn update_content(
//!         &self,
//!         resource: &mut dyn Resource,
//!         data: &mut Vec<u8>,
//!         _context: &mut UpdateContext<'_>,
//!     ) -> Result<()> {
//!         if let Some(text) = resource.downcast_mut::<Text>() {
//!             text.0 = String::from_utf8_lossy(data).into_owned();
//!         }
//!         Ok(())
//!     }
//!
//!     fn estimate_memory_usage(&self, resource: &dyn Resource) -> Option<MemoryUsage> {
//!         let text = resource.downcast_ref::<Text>()?;
//!         Some(MemoryUsage::new(text.0.len() as u64, 0))
//!     }
//! }
//!
//! let device = Arc::new(MemoryDevice::new());
//! device.insert("greeting", "hello");
//!
//! let config = ResourceCacheConfig {
//!     worker_count: 0,
//!     ..ResourceCacheConfig::default()
//! };
//! let mut options = ResourceCacheOptions::with_config(config);
//! let text_type = options
//!     .add_resource_type(
//!         ResourceTypeDescriptor::new::<Text>("text").with_loader(Arc::new(TextLoader)),
//!     )
//!     .unwrap();
//! let cache = options.add_device(device).create().unwrap();
//!
//! let handle = cache
//!     .acquire_typed::<Text>(text_type, "greeting", Priority::High)
//!     .unwrap();
//! cache.force_load_now(handle.untyped());
//! assert_eq!(handle.get().unwrap().0, "hello");
//!
//! drop(handle);
//! cache.shutdown().unwrap();
//! ```

// crate-specific lint exceptions:
#![warn(missing_docs)]

mod config;
pub use config::*;

mod errors;
pub use errors::{Error, LeakedResource, Result};

pub mod events;

mod eviction;

mod handle;
pub use handle::*;

mod loading;
mod loading_queue;
mod permissions;
mod registry;

mod resource;
pub use resource::*;

mod resource_cache;
pub use resource_cache::{CacheStats, ResourceCache, ResourceCacheOptions};

mod resource_id;
pub use resource_id::*;

mod resource_loader;
pub use resource_loader::*;

mod resource_type;
pub use resource_type::{ResourceAllocator, ResourceType, ResourceTypeDescriptor};

mod type_resolution;
pub use type_resolution::OverridePredicate;

pub mod vfs;
pub use vfs::{DirDevice, MemoryDevice};

#[cfg(test)]
mod test_resource;
