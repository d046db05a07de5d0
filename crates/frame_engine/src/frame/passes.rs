//! Swapchain-dependent render passes and their ordered reconstruction
//!
//! Anything whose attachments are sized from the swapchain registers with the
//! [`RenderPassCache`] under a sort key. After every swapchain rebuild the cache
//! reconstructs the passes in ascending key order (registration order breaks
//! ties), so a pass that samples another pass's output always sees the freshly
//! rebuilt attachment. The cache is an ordinary value owned by the renderer's
//! [`RenderContext`](super::context::RenderContext).

use std::collections::HashMap;

use slotmap::{new_key_type, SlotMap};

use super::swapchain::{RenderTarget, SwapChain};
use super::trash::{BufferTrash, TrashEntry};
use crate::gpu::{
    ClearValue, CommandBufferHandle, Extent2D, FramebufferHandle, GpuDevice, GpuError, GpuFormat,
    GpuResult, ImageDesc, ImageUsage, ImageViewHandle, RenderPassDesc, RenderPassHandle,
};
use crate::painter::PaintStage;

new_key_type! {
    /// Key of a registered pass
    pub struct PassKey;
}

/// What a pass sees while it is being reconstructed
pub struct RebuildContext<'a> {
    /// Device to create the new attachments with
    pub device: &'a dyn GpuDevice,
    /// The freshly built swapchain
    pub swapchain: &'a SwapChain,
    /// Queue for the pass's old attachments
    pub trash: &'a mut BufferTrash,
    outputs: &'a HashMap<PassKey, Vec<ImageViewHandle>>,
}

impl RebuildContext<'_> {
    /// Outputs of a pass that has already been rebuilt in this round
    #[must_use]
    pub fn outputs_of(&self, key: PassKey) -> Option<&[ImageViewHandle]> {
        self.outputs.get(&key).map(Vec::as_slice)
    }
}

/// A render pass whose attachments follow the swapchain
pub trait SwapchainDependent {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Painter stage the pass records into
    fn stage(&self) -> PaintStage {
        PaintStage::MainPass
    }

    /// Recreate attachments for the new swapchain, queueing the old ones for
    /// deferred destruction
    ///
    /// # Errors
    ///
    /// Creation failure, or an input pass that has not been rebuilt yet.
    fn reconstruct(&mut self, ctx: &mut RebuildContext<'_>) -> GpuResult<()>;

    /// Views other passes may sample
    fn outputs(&self) -> Vec<ImageViewHandle> {
        Vec::new()
    }

    /// Record the pass into a command buffer of its stage
    fn record(&self, _device: &dyn GpuDevice, _command_buffer: CommandBufferHandle) {}

    /// Release everything immediately; the device must be idle
    fn destroy(&mut self, device: &dyn GpuDevice);
}

struct RegisteredPass {
    sort_key: i32,
    pass: Box<dyn SwapchainDependent>,
}

/// Registry of swapchain-dependent passes
#[derive(Default)]
pub struct RenderPassCache {
    passes: SlotMap<PassKey, RegisteredPass>,
    order: Vec<PassKey>,
}

impl std::fmt::Debug for RenderPassCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.order.iter().filter_map(|&key| {
                self.passes.get(key).map(|entry| (entry.sort_key, entry.pass.name().to_owned()))
            }))
            .finish()
    }
}

impl RenderPassCache {
    /// Empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pass; lower keys are reconstructed first
    pub fn register(&mut self, sort_key: i32, pass: Box<dyn SwapchainDependent>) -> PassKey {
        log::debug!("Registered render pass '{}' with sort key {sort_key}", pass.name());
        let key = self.passes.insert(RegisteredPass { sort_key, pass });
        self.order.push(key);
        let passes = &self.passes;
        self.order.sort_by_key(|key| passes[*key].sort_key);
        key
    }

    /// Remove a pass, handing it back so the caller can destroy it
    pub fn remove(&mut self, key: PassKey) -> Option<Box<dyn SwapchainDependent>> {
        self.order.retain(|&k| k != key);
        self.passes.remove(key).map(|entry| entry.pass)
    }

    /// Look a pass up
    #[must_use]
    pub fn get(&self, key: PassKey) -> Option<&dyn SwapchainDependent> {
        self.passes.get(key).map(|entry| entry.pass.as_ref())
    }

    /// Number of registered passes
    #[must_use]
    pub fn len(&self) -> usize {
        self.passes.len()
    }

    /// Whether no pass is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Passes in reconstruction order
    pub fn ordered(&self) -> impl Iterator<Item = (PassKey, &dyn SwapchainDependent)> + '_ {
        self.order
            .iter()
            .filter_map(|&key| self.passes.get(key).map(|entry| (key, entry.pass.as_ref())))
    }

    /// Reconstruct every pass against a new swapchain, in sort-key order
    ///
    /// # Errors
    ///
    /// The first pass that fails aborts the round; later passes are left untouched.
    pub fn rebuild_all(
        &mut self,
        device: &dyn GpuDevice,
        swapchain: &SwapChain,
        trash: &mut BufferTrash,
    ) -> GpuResult<()> {
        let mut outputs = HashMap::with_capacity(self.order.len());
        for &key in &self.order {
            let Some(entry) = self.passes.get_mut(key) else {
                continue;
            };
            log::trace!("Reconstructing render pass '{}' (key {})", entry.pass.name(), entry.sort_key);
            let mut ctx = RebuildContext {
                device,
                swapchain,
                trash: &mut *trash,
                outputs: &outputs,
            };
            if let Err(err) = entry.pass.reconstruct(&mut ctx) {
                log::error!("Failed to reconstruct render pass '{}': {err}", entry.pass.name());
                return Err(err);
            }
            outputs.insert(key, entry.pass.outputs());
        }
        Ok(())
    }

    /// Record every pass of `stage`, returning how many were recorded
    pub fn record_stage(&self, device: &dyn GpuDevice, command_buffer: CommandBufferHandle, stage: PaintStage) -> usize {
        let mut recorded = 0;
        for (_, pass) in self.ordered().filter(|(_, pass)| pass.stage() == stage) {
            pass.record(device, command_buffer);
            recorded += 1;
        }
        recorded
    }

    /// Whether any pass records into `stage`
    #[must_use]
    pub fn has_stage(&self, stage: PaintStage) -> bool {
        self.ordered().any(|(_, pass)| pass.stage() == stage)
    }

    /// Destroy and drop every pass; the device must be idle
    pub fn destroy_all(&mut self, device: &dyn GpuDevice) {
        for key in self.order.drain(..) {
            if let Some(mut entry) = self.passes.remove(key) {
                entry.pass.destroy(device);
            }
        }
    }
}

/// A single-attachment pass rendered off screen and sampled later
///
/// Shadow maps and G-buffer layers are the usual examples. The attachment is
/// sized from the swapchain extent times `scale`. Passes listed as inputs must
/// have a lower sort key; their outputs are captured at reconstruction time.
#[derive(Debug)]
pub struct OffscreenPass {
    name: String,
    format: GpuFormat,
    scale: f32,
    stage: PaintStage,
    inputs: Vec<PassKey>,
    clear: [f32; 4],
    target: Option<RenderTarget>,
    render_pass: RenderPassHandle,
    framebuffer: FramebufferHandle,
    bound_inputs: Vec<ImageViewHandle>,
}

impl OffscreenPass {
    /// Pass rendering into a `format` attachment during `stage`
    pub fn new(name: impl Into<String>, format: GpuFormat, stage: PaintStage) -> Self {
        Self {
            name: name.into(),
            format,
            scale: 1.0,
            stage,
            inputs: Vec::new(),
            clear: [0.0, 0.0, 0.0, 1.0],
            target: None,
            render_pass: RenderPassHandle::NULL,
            framebuffer: FramebufferHandle::NULL,
            bound_inputs: Vec::new(),
        }
    }

    /// Size the attachment relative to the swapchain
    #[must_use]
    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    /// Passes whose outputs this pass samples
    #[must_use]
    pub fn with_inputs(mut self, inputs: Vec<PassKey>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Colour clear value
    #[must_use]
    pub const fn with_clear(mut self, clear: [f32; 4]) -> Self {
        self.clear = clear;
        self
    }

    /// Views of the input passes captured at the last reconstruction
    #[must_use]
    pub fn bound_inputs(&self) -> &[ImageViewHandle] {
        &self.bound_inputs
    }

    /// Current attachment, if built
    #[must_use]
    pub const fn target(&self) -> Option<&RenderTarget> {
        self.target.as_ref()
    }

    fn scaled_extent(&self, extent: Extent2D) -> Extent2D {
        let scale = |v: u32| ((v as f32 * self.scale).round() as u32).max(1);
        Extent2D::new(scale(extent.width), scale(extent.height))
    }
}

impl SwapchainDependent for OffscreenPass {
    fn name(&self) -> &str {
        &self.name
    }

    fn stage(&self) -> PaintStage {
        self.stage
    }

    fn reconstruct(&mut self, ctx: &mut RebuildContext<'_>) -> GpuResult<()> {
        let mut bound = Vec::new();
        for &input in &self.inputs {
            let views = ctx.outputs_of(input).ok_or_else(|| GpuError::InvalidOperation {
                reason: format!("pass '{}' samples {input:?} before it was rebuilt", self.name),
            })?;
            bound.extend_from_slice(views);
        }

        let mut retired = TrashEntry::new();
        if self.framebuffer.is_valid() {
            retired = retired.framebuffer(self.framebuffer.take());
        }
        if let Some(target) = self.target.take() {
            retired = target.retire(retired);
        }
        ctx.trash.add(retired);

        let depth = self.format.is_depth();
        if !self.render_pass.is_valid() {
            self.render_pass = ctx.device.create_render_pass(&RenderPassDesc {
                color_formats: if depth { Vec::new() } else { vec![self.format] },
                depth_format: depth.then_some(self.format),
                samples: 1,
                resolve: false,
                present: false,
            })?;
        }

        let attachment_usage = if depth {
            ImageUsage::DEPTH_STENCIL_ATTACHMENT
        } else {
            ImageUsage::COLOR_ATTACHMENT
        };
        let target = RenderTarget::new(
            ctx.device,
            &ImageDesc {
                extent: self.scaled_extent(ctx.swapchain.extent()),
                format: self.format,
                usage: attachment_usage | ImageUsage::SAMPLED,
                samples: 1,
            },
        )?;
        self.framebuffer = ctx
            .device
            .create_framebuffer(self.render_pass, &[target.view], target.extent)?;
        self.target = Some(target);
        self.bound_inputs = bound;
        Ok(())
    }

    fn outputs(&self) -> Vec<ImageViewHandle> {
        self.target.iter().map(|target| target.view).collect()
    }

    fn record(&self, device: &dyn GpuDevice, command_buffer: CommandBufferHandle) {
        let Some(target) = &self.target else {
            return;
        };
        let clear = if self.format.is_depth() {
            ClearValue::DepthStencil { depth: 1.0, stencil: 0 }
        } else {
            ClearValue::Color(self.clear)
        };
        device.cmd_begin_render_pass(command_buffer, self.render_pass, self.framebuffer, target.extent, &[clear]);
        device.cmd_end_render_pass(command_buffer);
    }

    fn destroy(&mut self, device: &dyn GpuDevice) {
        let framebuffer = self.framebuffer.take();
        if framebuffer.is_valid() {
            device.destroy_framebuffer(framebuffer);
        }
        if let Some(target) = self.target.take() {
            target.destroy(device);
        }
        let render_pass = self.render_pass.take();
        if render_pass.is_valid() {
            device.destroy_render_pass(render_pass);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::frame::descriptors::DescriptorAllocator;
    use crate::frame::swapchain::SwapchainSettings;
    use crate::gpu::ResourceKind;
    use crate::testing::{MockDevice, MockSurface};

    struct Probe {
        name: &'static str,
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl SwapchainDependent for Probe {
        fn name(&self) -> &str {
            self.name
        }

        fn reconstruct(&mut self, _ctx: &mut RebuildContext<'_>) -> GpuResult<()> {
            self.log.borrow_mut().push(self.name);
            Ok(())
        }

        fn destroy(&mut self, _device: &dyn GpuDevice) {}
    }

    fn swapchain(device: &MockDevice, surface: &mut MockSurface) -> SwapChain {
        SwapChain::new(
            device,
            surface,
            &SwapchainSettings {
                preferred_surface_formats: vec![GpuFormat::B8G8R8A8Unorm],
                preferred_depth_formats: vec![GpuFormat::D32Sfloat],
                msaa_samples: 1,
                vsync: false,
            },
        )
        .unwrap()
    }

    #[test]
    fn producer_is_rebuilt_before_consumer() {
        let device = MockDevice::new();
        let mut surface = MockSurface::new(320, 240);
        let swapchain = swapchain(&device, &mut surface);
        let mut trash = BufferTrash::new(2);
        let log = Rc::new(RefCell::new(Vec::new()));

        let mut cache = RenderPassCache::new();
        // Register the consumer first so registration order alone would be wrong
        cache.register(1, Box::new(Probe { name: "combine", log: Rc::clone(&log) }));
        cache.register(0, Box::new(Probe { name: "gbuffer", log: Rc::clone(&log) }));

        cache.rebuild_all(&device, &swapchain, &mut trash).unwrap();
        assert_eq!(*log.borrow(), vec!["gbuffer", "combine"]);
    }

    #[test]
    fn equal_keys_keep_registration_order() {
        let device = MockDevice::new();
        let mut surface = MockSurface::new(320, 240);
        let swapchain = swapchain(&device, &mut surface);
        let mut trash = BufferTrash::new(2);
        let log = Rc::new(RefCell::new(Vec::new()));

        let mut cache = RenderPassCache::new();
        for name in ["a", "b", "c"] {
            cache.register(5, Box::new(Probe { name, log: Rc::clone(&log) }));
        }
        cache.rebuild_all(&device, &swapchain, &mut trash).unwrap();
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn consumer_binds_the_fresh_producer_output() {
        let device = MockDevice::new();
        let mut surface = MockSurface::new(320, 240);
        let swapchain = swapchain(&device, &mut surface);
        let mut trash = BufferTrash::new(2);
        let mut descriptors = DescriptorAllocator::new(2, 4);

        let mut cache = RenderPassCache::new();
        let shadow = cache.register(0, Box::new(OffscreenPass::new("shadow", GpuFormat::D32Sfloat, PaintStage::PrePass)));
        let combine = cache.register(
            1,
            Box::new(OffscreenPass::new("combine", GpuFormat::R16G16B16A16Sfloat, PaintStage::MainPass).with_inputs(vec![shadow])),
        );

        cache.rebuild_all(&device, &swapchain, &mut trash).unwrap();
        let first_output = cache.get(shadow).unwrap().outputs();
        assert_eq!(first_output.len(), 1);

        cache.rebuild_all(&device, &swapchain, &mut trash).unwrap();
        let second_output = cache.get(shadow).unwrap().outputs();
        assert_ne!(first_output, second_output);
        // The old attachments wait in the trash instead of being destroyed in place
        assert_eq!(trash.len(), 2);
        assert!(device.is_live(first_output[0].raw()));

        trash.purge(&device, &mut descriptors);
        assert!(!device.is_live(first_output[0].raw()));
        assert!(cache.get(combine).is_some());
        assert!(cache.has_stage(PaintStage::PrePass));

        cache.destroy_all(&device);
        assert_eq!(device.live_count(ResourceKind::RenderPass), 1, "only the swapchain pass remains");
    }

    #[test]
    fn consumer_ordered_before_producer_is_rejected() {
        let device = MockDevice::new();
        let mut surface = MockSurface::new(320, 240);
        let swapchain = swapchain(&device, &mut surface);
        let mut trash = BufferTrash::new(2);

        let mut cache = RenderPassCache::new();
        let producer = cache.register(3, Box::new(OffscreenPass::new("gbuffer", GpuFormat::R8G8B8A8Unorm, PaintStage::PrePass)));
        cache.register(
            1,
            Box::new(OffscreenPass::new("combine", GpuFormat::R8G8B8A8Unorm, PaintStage::MainPass).with_inputs(vec![producer])),
        );

        let err = cache.rebuild_all(&device, &swapchain, &mut trash).unwrap_err();
        assert!(matches!(err, GpuError::InvalidOperation { .. }));
    }
}
