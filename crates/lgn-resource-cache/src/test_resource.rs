//! This module defines a test resource.
//!
//! It is used by the unit tests of the cache internals.

use crate::{
    implement_resource, Error, LoadRequest, MemoryUsage, Resource, ResourceLoader, Result,
    UpdateContext,
};

/// Resource used for testing.
#[derive(Default)]
pub struct TestResource {
    /// Test content.
    pub content: String,
}

implement_resource!(TestResource);

/// [`TestResource`]'s loader. Reads the resource from the cache devices.
#[derive(Default)]
pub struct TestResourceLoader {
    skip_memory_estimate: bool,
}

impl TestResourceLoader {
    /// Loader that never reports the memory usage of what it loads.
    pub fn without_memory_estimate() -> Self {
        Self {
            skip_memory_estimate: true,
        }
    }
}

impl ResourceLoader for TestResourceLoader {
    fn load_data(&self, request: &LoadRequest<'_>) -> Result<Vec<u8>> {
        request.read_source()
    }

    fn update_content(
        &self,
        resource: &mut dyn Resource,
        data: &mut Vec<u8>,
        _context: &mut UpdateContext<'_>,
    ) -> Result<()> {
        let resource = resource
            .downcast_mut::<TestResource>()
            .ok_or_else(|| Error::UnknownResourceType("test_resource".to_owned()))?;
        resource.content = String::from_utf8(std::mem::take(data)).map_err(|err| {
            Error::LoadFailed {
                id: "test_resource".into(),
                reason: err.to_string(),
            }
        })?;
        Ok(())
    }

    fn estimate_memory_usage(&self, resource: &dyn Resource) -> Option<MemoryUsage> {
        if self.skip_memory_estimate {
            return None;
        }
        resource
            .downcast_ref::<TestResource>()
            .map(|resource| MemoryUsage::new(resource.content.len() as u64, 0))
    }
}
