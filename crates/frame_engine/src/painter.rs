//! Frame command orchestration
//!
//! The painter owns one command buffer per stage per frame slot and hands them
//! to the synchroniser grouped by stage, so pre-pass work (shadow maps and
//! other offscreen producers) is submitted ahead of the main pass. Compute
//! tasks queued during the frame run once through a single-use submission,
//! closed by a barrier that makes their writes visible to vertex input and
//! shader reads.

use crate::gpu::{
    submit_single_use, BindPoint, CommandBufferHandle, DescriptorSetHandle, GpuDevice, GpuResult,
    MemoryBarrier, PipelineHandle, PipelineLayoutHandle, Workgroups,
};

/// Submission stage, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(usize)]
pub enum PaintStage {
    /// Producers sampled later in the frame, e.g. shadow maps
    PrePass = 0,
    /// Everything that ends in the swapchain image
    MainPass = 1,
}

impl PaintStage {
    /// Number of stages
    pub const COUNT: usize = 2;
    /// Stages in execution order
    pub const ALL: [Self; Self::COUNT] = [Self::PrePass, Self::MainPass];
}

/// One compute dispatch queued for the next frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeTask {
    /// Compute pipeline
    pub pipeline: PipelineHandle,
    /// Its layout
    pub layout: PipelineLayoutHandle,
    /// Sets bound from set 0
    pub descriptor_sets: Vec<DescriptorSetHandle>,
    /// Dispatch size
    pub workgroups: Workgroups,
}

/// Command buffers of one frame, grouped by stage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedCommands {
    /// Pre-pass buffers; empty when nothing was recorded into the stage
    pub pre_pass: Vec<CommandBufferHandle>,
    /// Main-pass buffers
    pub main_pass: Vec<CommandBufferHandle>,
}

/// Per-slot, per-stage command buffers and the compute queue
#[derive(Debug)]
pub struct Painter {
    command_buffers: Vec<[CommandBufferHandle; PaintStage::COUNT]>,
    used: [bool; PaintStage::COUNT],
    recording: Option<usize>,
    compute: Vec<ComputeTask>,
}

impl Painter {
    /// Allocate command buffers for every stage of `frames_in_flight` slots
    ///
    /// # Errors
    ///
    /// Command buffer allocation failure; buffers allocated so far are freed.
    pub fn new(device: &dyn GpuDevice, frames_in_flight: usize) -> GpuResult<Self> {
        let mut painter = Self {
            command_buffers: Vec::with_capacity(frames_in_flight),
            used: [false; PaintStage::COUNT],
            recording: None,
            compute: Vec::new(),
        };
        for _ in 0..frames_in_flight {
            let mut stages = [CommandBufferHandle::NULL; PaintStage::COUNT];
            for stage in PaintStage::ALL {
                match device.allocate_command_buffer() {
                    Ok(cmd) => stages[stage as usize] = cmd,
                    Err(err) => {
                        stages.iter().filter(|cmd| cmd.is_valid()).for_each(|&cmd| device.free_command_buffer(cmd));
                        painter.destroy(device);
                        return Err(err);
                    }
                }
            }
            painter.command_buffers.push(stages);
        }
        Ok(painter)
    }

    /// Start recording every stage of frame slot `slot`
    ///
    /// # Errors
    ///
    /// Driver failure beginning a command buffer.
    ///
    /// # Panics
    ///
    /// Panics if a frame is already being recorded.
    pub fn begin(&mut self, device: &dyn GpuDevice, slot: usize) -> GpuResult<()> {
        assert!(self.recording.is_none(), "painter is already recording a frame");
        for &cmd in &self.command_buffers[slot] {
            device.begin_commands(cmd, true)?;
        }
        self.used = [false; PaintStage::COUNT];
        self.recording = Some(slot);
        Ok(())
    }

    /// Command buffer of `stage` for the frame being recorded
    ///
    /// # Panics
    ///
    /// Panics outside of [`Self::begin`] / [`Self::finish`].
    pub fn command_buffer(&mut self, stage: PaintStage) -> CommandBufferHandle {
        let slot = self.recording.unwrap_or_else(|| panic!("no frame is being recorded"));
        self.used[stage as usize] = true;
        self.command_buffers[slot][stage as usize]
    }

    /// End recording and group the buffers by stage
    ///
    /// The main pass is always submitted, even empty, because it signals the
    /// frame's fence; an untouched pre-pass is left out.
    ///
    /// # Errors
    ///
    /// Driver failure ending a command buffer.
    pub fn finish(&mut self, device: &dyn GpuDevice) -> GpuResult<StagedCommands> {
        let slot = self.recording.take().unwrap_or_else(|| panic!("no frame is being recorded"));
        let stages = self.command_buffers[slot];
        for cmd in stages {
            device.end_commands(cmd)?;
        }
        let mut staged = StagedCommands::default();
        if self.used[PaintStage::PrePass as usize] {
            staged.pre_pass.push(stages[PaintStage::PrePass as usize]);
        }
        staged.main_pass.push(stages[PaintStage::MainPass as usize]);
        Ok(staged)
    }

    /// Queue a dispatch for the next frame
    pub fn queue_compute(&mut self, task: ComputeTask) {
        self.compute.push(task);
    }

    /// Tasks waiting for dispatch
    #[must_use]
    pub fn pending_compute(&self) -> usize {
        self.compute.len()
    }

    /// Run every queued compute task in one blocking single-use submission
    ///
    /// Returns the number of dispatches.
    ///
    /// # Errors
    ///
    /// Submission failure; the queue is cleared either way.
    pub fn dispatch_compute(&mut self, device: &dyn GpuDevice) -> GpuResult<usize> {
        if self.compute.is_empty() {
            return Ok(0);
        }
        let tasks = std::mem::take(&mut self.compute);
        submit_single_use(device, |device, cmd| {
            for task in &tasks {
                device.cmd_bind_pipeline(cmd, BindPoint::Compute, task.pipeline);
                if !task.descriptor_sets.is_empty() {
                    device.cmd_bind_descriptor_sets(cmd, BindPoint::Compute, task.layout, 0, &task.descriptor_sets);
                }
                device.cmd_dispatch(cmd, task.workgroups);
            }
            device.cmd_memory_barrier(cmd, MemoryBarrier::ComputeWriteToGraphicsRead);
        })?;
        log::trace!("Dispatched {} compute tasks", tasks.len());
        Ok(tasks.len())
    }

    /// Drop the frame being recorded without submitting it
    ///
    /// Open command buffers are ended so the next [`Self::begin`] can reuse them.
    pub fn cancel(&mut self, device: &dyn GpuDevice) {
        let Some(slot) = self.recording.take() else {
            return;
        };
        for &cmd in &self.command_buffers[slot] {
            if let Err(err) = device.end_commands(cmd) {
                log::debug!("Ending cancelled command buffer failed: {err}");
            }
        }
    }

    /// Free every command buffer; the device must be idle
    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        for stages in self.command_buffers.drain(..) {
            for cmd in stages {
                device.free_command_buffer(cmd);
            }
        }
        self.recording = None;
    }
}
