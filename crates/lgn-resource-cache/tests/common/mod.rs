#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use lgn_resource_cache::{
    implement_resource, DataQuality, Error, HandleUntyped, LoadRequest, MemoryDevice,
    MemoryUsage, Resource, ResourceCache, ResourceCacheConfig, ResourceCacheOptions,
    ResourceLoader, ResourceType, ResourceTypeDescriptor, Result, UpdateContext,
};
use parking_lot::Mutex;

pub const MISSING: &str = "<missing>";

/// Text resource, used for textures, render targets and meshes.
#[derive(Default)]
pub struct Text {
    pub content: String,
}

implement_resource!(Text);

/// Loads [`Text`] from the cache devices and records the order of its loads.
#[derive(Default)]
pub struct TextLoader {
    loads: Mutex<Vec<String>>,
    started: AtomicUsize,
    blocked: AtomicBool,
    low_resolution_updates: AtomicUsize,
    low_resolution_held: AtomicBool,
}

impl TextLoader {
    /// Data loads wait until [`Self::unblock`] or cancellation.
    pub fn blocking() -> Self {
        Self {
            blocked: AtomicBool::new(true),
            ..Self::default()
        }
    }

    pub fn unblock(&self) {
        self.blocked.store(false, Ordering::Release);
    }

    /// Low-resolution content updates wait until [`Self::release_low_resolution`].
    pub fn hold_low_resolution(&self) {
        self.low_resolution_held.store(true, Ordering::Release);
    }

    pub fn release_low_resolution(&self) {
        self.low_resolution_held.store(false, Ordering::Release);
    }

    pub fn low_resolution_updates(&self) -> usize {
        self.low_resolution_updates.load(Ordering::Acquire)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::Acquire)
    }

    pub fn loads(&self) -> Vec<String> {
        self.loads.lock().clone()
    }
}

impl ResourceLoader for TextLoader {
    fn load_data(&self, request: &LoadRequest<'_>) -> Result<Vec<u8>> {
        self.started.fetch_add(1, Ordering::AcqRel);
        self.loads.lock().push(request.id().to_string());
        while self.blocked.load(Ordering::Acquire) {
            if request.is_cancelled() {
                return Err(Error::LoadFailed {
                    id: request.id().clone(),
                    reason: "cancelled".to_owned(),
                });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        request.read_source()
    }

    fn update_content(
        &self,
        resource: &mut dyn Resource,
        data: &mut Vec<u8>,
        context: &mut UpdateContext<'_>,
    ) -> Result<()> {
        if context.quality() == DataQuality::LowResolution {
            self.low_resolution_updates.fetch_add(1, Ordering::AcqRel);
            while self.low_resolution_held.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        if let Some(text) = resource.downcast_mut::<Text>() {
            text.content = String::from_utf8_lossy(data).into_owned();
        }
        Ok(())
    }

    fn estimate_memory_usage(&self, resource: &dyn Resource) -> Option<MemoryUsage> {
        let text = resource.downcast_ref::<Text>()?;
        Some(MemoryUsage::new(text.content.len() as u64, 16))
    }

    fn apply_fallback(&self, resource: &mut dyn Resource) -> bool {
        match resource.downcast_mut::<Text>() {
            Some(text) => {
                text.content = MISSING.to_owned();
                true
            }
            None => false,
        }
    }
}

/// Material referencing a texture by id. Its data is the id of the texture.
#[derive(Default)]
pub struct Material {
    pub texture: Option<HandleUntyped>,
}

implement_resource!(Material);

pub struct MaterialLoader {
    pub texture_type: ResourceType,
}

impl ResourceLoader for MaterialLoader {
    fn load_data(&self, request: &LoadRequest<'_>) -> Result<Vec<u8>> {
        request.read_source()
    }

    fn update_content(
        &self,
        resource: &mut dyn Resource,
        data: &mut Vec<u8>,
        context: &mut UpdateContext<'_>,
    ) -> Result<()> {
        let texture_id = String::from_utf8_lossy(data).into_owned();
        let texture = context.acquire_loaded(self.texture_type, texture_id)?;
        if let Some(material) = resource.downcast_mut::<Material>() {
            material.texture = Some(texture);
        }
        Ok(())
    }

    fn estimate_memory_usage(&self, _resource: &dyn Resource) -> Option<MemoryUsage> {
        Some(MemoryUsage::new(64, 0))
    }
}

pub struct Fixture {
    pub cache: ResourceCache,
    pub device: Arc<MemoryDevice>,
    pub loader: Arc<TextLoader>,
    pub texture: ResourceType,
    pub render_target: ResourceType,
    pub mesh: ResourceType,
    pub material: ResourceType,
}

pub fn setup(worker_count: usize) -> Fixture {
    setup_with_loader(worker_count, TextLoader::default())
}

pub fn setup_with_loader(worker_count: usize, loader: TextLoader) -> Fixture {
    let config = ResourceCacheConfig {
        worker_count,
        ..ResourceCacheConfig::default()
    };
    let loader = Arc::new(loader);
    let device = Arc::new(MemoryDevice::new());

    let mut options = ResourceCacheOptions::with_config(config);
    let texture = options
        .add_resource_type(
            ResourceTypeDescriptor::new::<Text>("texture").with_loader(loader.clone()),
        )
        .unwrap();
    let render_target = options
        .add_resource_type(
            ResourceTypeDescriptor::new::<Text>("render_target").with_parent(texture),
        )
        .unwrap();
    let mesh = options
        .add_resource_type(
            ResourceTypeDescriptor::new::<Text>("mesh")
                .with_loader(loader.clone())
                .with_incremental_unload(true),
        )
        .unwrap();
    let material = options
        .add_resource_type(
            ResourceTypeDescriptor::new::<Material>("material").with_loader(Arc::new(
                MaterialLoader {
                    texture_type: texture,
                },
            )),
        )
        .unwrap();

    let cache = options.add_device(device.clone()).create().unwrap();
    Fixture {
        cache,
        device,
        loader,
        texture,
        render_target,
        mesh,
        material,
    }
}

/// Polls `condition` until it holds or `timeout` expires.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while !condition() {
        if start.elapsed() > timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}
