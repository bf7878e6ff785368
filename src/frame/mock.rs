// Simulated device and surface for exercising the frame logic without a GPU
//
// The GPU executes submissions strictly in order and only makes progress
// when the host waits (fence wait or device idle). Every ordering rule the
// frame logic must respect is checked with an assertion, so a violating
// test panics inside the mock.

use ash::vk::{self, Handle};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use crate::backend::context::{
    Acquire, DeviceContext, PresentRing, QueueRole, Submission, SurfaceStatus, SwapRingRequest,
};
use crate::backend::render_pass::RenderPassLayout;
use crate::backend::surface::SurfaceProvider;
use crate::backend::swapchain::SurfaceSupport;
use crate::error::FrameResult;
use crate::frame::renderer::RecreateListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuEvent {
    RingCreated { generation: u32, extent: vk::Extent2D },
    Acquire { image_index: u32 },
    AcquireOutOfDate,
    RenderPassBegun { image_index: u32 },
    Submit { id: u64, image_index: u32 },
    Retired { id: u64 },
    Present { image_index: u32 },
    WaitIdle,
}

#[derive(Debug)]
pub struct MockRing {
    pub generation: u32,
    extent: vk::Extent2D,
    image_count: usize,
    layout: RenderPassLayout,
    render_pass: vk::RenderPass,
}

impl PresentRing for MockRing {
    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn image_count(&self) -> usize {
        self.image_count
    }

    fn layout(&self) -> RenderPassLayout {
        self.layout
    }

    fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }
}

struct Pending {
    id: u64,
    fence: vk::Fence,
}

struct MockState {
    next_handle: u64,
    support: SurfaceSupport,
    depth_format: vk::Format,
    generation: u32,
    live_rings: usize,
    requests: Vec<SwapRingRequest>,

    fences: HashMap<vk::Fence, bool>,
    semaphores: HashSet<vk::Semaphore>,
    command_buffers: HashSet<vk::CommandBuffer>,
    recording: HashSet<vk::CommandBuffer>,

    pending: VecDeque<Pending>,
    next_submission: u64,
    last_retired: u64,
    max_outstanding: usize,

    // image acquired through a semaphore, until a submit consumes it
    acquired_via: HashMap<vk::Semaphore, u32>,
    image_writer: HashMap<u32, u64>,
    buffer_submission: HashMap<vk::CommandBuffer, u64>,
    acquire_counter: u32,

    acquire_script: VecDeque<SurfaceStatus>,
    present_script: VecDeque<SurfaceStatus>,
    acquire_failure: Option<vk::Result>,
    present_failure: Option<vk::Result>,
    events: Vec<GpuEvent>,
}

impl MockState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn retire_front(&mut self) -> bool {
        match self.pending.pop_front() {
            Some(done) => {
                self.fences.insert(done.fence, true);
                self.last_retired = done.id;
                self.events.push(GpuEvent::Retired { id: done.id });
                true
            }
            None => false,
        }
    }

    fn is_retired(&self, id: u64) -> bool {
        id <= self.last_retired
    }
}

pub struct MockDevice {
    state: RefCell<MockState>,
}

impl MockDevice {
    /// A surface whose swap rings hold `image_count` images.
    pub fn with_image_count(image_count: u32) -> Self {
        let support = SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: image_count - 1,
                max_image_count: image_count,
                current_extent: vk::Extent2D {
                    width: u32::MAX,
                    height: u32::MAX,
                },
                min_image_extent: vk::Extent2D { width: 1, height: 1 },
                max_image_extent: vk::Extent2D {
                    width: 4096,
                    height: 4096,
                },
                ..Default::default()
            },
            formats: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        };

        Self {
            state: RefCell::new(MockState {
                next_handle: 0,
                support,
                depth_format: vk::Format::D32_SFLOAT,
                generation: 0,
                live_rings: 0,
                requests: Vec::new(),
                fences: HashMap::new(),
                semaphores: HashSet::new(),
                command_buffers: HashSet::new(),
                recording: HashSet::new(),
                pending: VecDeque::new(),
                next_submission: 0,
                last_retired: 0,
                max_outstanding: 0,
                acquired_via: HashMap::new(),
                image_writer: HashMap::new(),
                buffer_submission: HashMap::new(),
                acquire_counter: 0,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                acquire_failure: None,
                present_failure: None,
                events: Vec::new(),
            }),
        }
    }

    pub fn set_surface_formats(&self, formats: Vec<vk::SurfaceFormatKHR>) {
        self.state.borrow_mut().support.formats = formats;
    }

    /// Next acquire reports `status` (`OutOfDate` acquires nothing).
    pub fn script_acquire(&self, status: SurfaceStatus) {
        self.state.borrow_mut().acquire_script.push_back(status);
    }

    pub fn script_present(&self, status: SurfaceStatus) {
        self.state.borrow_mut().present_script.push_back(status);
    }

    /// Next acquire fails with `result`.
    pub fn script_acquire_error(&self, result: vk::Result) {
        self.state.borrow_mut().acquire_failure = Some(result);
    }

    /// Next present fails with `result`. The submission before it still runs.
    pub fn script_present_error(&self, result: vk::Result) {
        self.state.borrow_mut().present_failure = Some(result);
    }

    pub fn events(&self) -> Vec<GpuEvent> {
        self.state.borrow().events.clone()
    }

    pub fn position(&self, event: GpuEvent) -> Option<usize> {
        self.state.borrow().events.iter().position(|e| *e == event)
    }

    /// Position of the n-th (1-based) event matching `pred`.
    pub fn nth_position(&self, n: usize, pred: impl Fn(&GpuEvent) -> bool) -> Option<usize> {
        self.state
            .borrow()
            .events
            .iter()
            .enumerate()
            .filter(|(_, e)| pred(e))
            .nth(n - 1)
            .map(|(i, _)| i)
    }

    pub fn max_outstanding(&self) -> usize {
        self.state.borrow().max_outstanding
    }

    pub fn requests(&self) -> Vec<SwapRingRequest> {
        self.state.borrow().requests.clone()
    }

    pub fn generation(&self) -> u32 {
        self.state.borrow().generation
    }

    /// (rings, fences, semaphores, command buffers) still alive.
    pub fn live_objects(&self) -> (usize, usize, usize, usize) {
        let state = self.state.borrow();
        (
            state.live_rings,
            state.fences.len(),
            state.semaphores.len(),
            state.command_buffers.len(),
        )
    }
}

impl DeviceContext for MockDevice {
    type Ring = MockRing;

    fn create_swap_ring(
        &self,
        request: &SwapRingRequest,
        previous: Option<MockRing>,
    ) -> FrameResult<MockRing> {
        let mut state = self.state.borrow_mut();
        assert!(
            state.pending.is_empty(),
            "swap ring rebuilt while GPU work is in flight"
        );

        let config = state.support.configure(request)?;
        if let Some(previous) = previous {
            assert_eq!(previous.generation, state.generation, "stale ring handed back");
            state.live_rings -= 1;
        }

        state.generation += 1;
        state.live_rings += 1;
        state.requests.push(*request);
        state.acquire_counter = 0;
        state.acquired_via.clear();
        state.image_writer.clear();

        let render_pass = vk::RenderPass::from_raw(state.handle());
        let generation = state.generation;
        state.events.push(GpuEvent::RingCreated {
            generation,
            extent: config.extent,
        });

        Ok(MockRing {
            generation,
            extent: config.extent,
            image_count: config.image_count as usize,
            layout: RenderPassLayout {
                color_format: config.surface_format.format,
                depth_format: state.depth_format,
                samples: request.samples,
            },
            render_pass,
        })
    }

    fn destroy_swap_ring(&self, ring: MockRing) {
        let mut state = self.state.borrow_mut();
        assert_eq!(ring.generation, state.generation);
        state.live_rings -= 1;
    }

    fn acquire_next_image(&self, ring: &MockRing, signal: vk::Semaphore) -> FrameResult<Acquire> {
        let mut state = self.state.borrow_mut();
        assert_eq!(ring.generation, state.generation, "acquire on a retired ring");
        assert!(state.semaphores.contains(&signal));
        if let Some(failure) = state.acquire_failure.take() {
            return Err(failure.into());
        }

        let status = state
            .acquire_script
            .pop_front()
            .unwrap_or(SurfaceStatus::Optimal);
        if status == SurfaceStatus::OutOfDate {
            state.events.push(GpuEvent::AcquireOutOfDate);
            return Ok(Acquire::OutOfDate);
        }

        let image_index = state.acquire_counter % ring.image_count as u32;
        state.acquire_counter += 1;
        state.acquired_via.insert(signal, image_index);
        state.events.push(GpuEvent::Acquire { image_index });
        Ok(Acquire::Ready {
            image_index,
            status,
        })
    }

    fn present(
        &self,
        ring: &MockRing,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> FrameResult<SurfaceStatus> {
        let mut state = self.state.borrow_mut();
        assert_eq!(ring.generation, state.generation, "present on a retired ring");
        assert!(state.semaphores.contains(&wait));
        if let Some(failure) = state.present_failure.take() {
            return Err(failure.into());
        }
        state.events.push(GpuEvent::Present { image_index });
        Ok(state
            .present_script
            .pop_front()
            .unwrap_or(SurfaceStatus::Optimal))
    }

    fn create_fence(&self, signaled: bool) -> FrameResult<vk::Fence> {
        let mut state = self.state.borrow_mut();
        let fence = vk::Fence::from_raw(state.handle());
        state.fences.insert(fence, signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.borrow_mut();
        assert!(
            !state.pending.iter().any(|p| p.fence == fence),
            "fence destroyed while GPU work is in flight"
        );
        assert!(state.fences.remove(&fence).is_some(), "double destroy");
    }

    fn create_semaphore(&self) -> FrameResult<vk::Semaphore> {
        let mut state = self.state.borrow_mut();
        let semaphore = vk::Semaphore::from_raw(state.handle());
        state.semaphores.insert(semaphore);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.borrow_mut();
        assert!(state.semaphores.remove(&semaphore), "double destroy");
    }

    fn wait_for_fence(&self, fence: vk::Fence) -> FrameResult<()> {
        let mut state = self.state.borrow_mut();
        while !state.fences.get(&fence).copied().unwrap_or(false) {
            assert!(
                state.retire_front(),
                "waiting on a fence no submission will signal"
            );
        }
        Ok(())
    }

    fn is_fence_signaled(&self, fence: vk::Fence) -> FrameResult<bool> {
        Ok(self.state.borrow().fences.get(&fence).copied().unwrap_or(false))
    }

    fn reset_fence(&self, fence: vk::Fence) -> FrameResult<()> {
        let mut state = self.state.borrow_mut();
        assert!(
            !state.pending.iter().any(|p| p.fence == fence),
            "fence reset while its submission is in flight"
        );
        state.fences.insert(fence, false);
        Ok(())
    }

    fn submit(&self, role: QueueRole, submission: &Submission) -> FrameResult<()> {
        let mut state = self.state.borrow_mut();
        assert_eq!(role, QueueRole::Graphics);
        assert_eq!(
            submission.wait_stage,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(
            state.fences.get(&submission.fence),
            Some(&false),
            "submitting with a fence that was not reset"
        );
        assert!(!state.recording.contains(&submission.command_buffer));

        let image_index = state
            .acquired_via
            .remove(&submission.wait_semaphore)
            .expect("submission waits on a semaphore no acquire signaled");
        if let Some(&previous) = state.image_writer.get(&image_index) {
            assert!(
                state.is_retired(previous),
                "image {} written while submission {} is in flight",
                image_index,
                previous
            );
        }

        state.next_submission += 1;
        let id = state.next_submission;
        state.pending.push_back(Pending {
            id,
            fence: submission.fence,
        });
        state.image_writer.insert(image_index, id);
        state
            .buffer_submission
            .insert(submission.command_buffer, id);
        state.max_outstanding = state.max_outstanding.max(state.pending.len());
        state.events.push(GpuEvent::Submit { id, image_index });
        Ok(())
    }

    fn wait_idle(&self) -> FrameResult<()> {
        let mut state = self.state.borrow_mut();
        while state.retire_front() {}
        state.events.push(GpuEvent::WaitIdle);
        Ok(())
    }

    fn allocate_command_buffers(&self, count: u32) -> FrameResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.borrow_mut();
        let buffers: Vec<_> = (0..count)
            .map(|_| vk::CommandBuffer::from_raw(state.handle()))
            .collect();
        state.command_buffers.extend(buffers.iter().copied());
        Ok(buffers)
    }

    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.borrow_mut();
        for buffer in command_buffers {
            assert!(state.command_buffers.remove(buffer), "double free");
        }
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> FrameResult<()> {
        let mut state = self.state.borrow_mut();
        if let Some(&id) = state.buffer_submission.get(&command_buffer) {
            assert!(
                state.is_retired(id),
                "command buffer re-recorded while submission {} is in flight",
                id
            );
        }
        assert!(state.recording.insert(command_buffer), "already recording");
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> FrameResult<()> {
        let mut state = self.state.borrow_mut();
        assert!(state.recording.remove(&command_buffer), "not recording");
        Ok(())
    }

    fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        ring: &MockRing,
        image_index: u32,
        _clear_color: [f32; 4],
    ) {
        let mut state = self.state.borrow_mut();
        assert_eq!(ring.generation, state.generation);
        assert!(state.recording.contains(&command_buffer));
        if let Some(&previous) = state.image_writer.get(&image_index) {
            assert!(
                state.is_retired(previous),
                "recording into image {} while submission {} is in flight",
                image_index,
                previous
            );
        }
        state.events.push(GpuEvent::RenderPassBegun { image_index });
    }

    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        assert!(self.state.borrow().recording.contains(&command_buffer));
    }
}

/// Surface whose size changes only when a test says so.
pub struct MockSurface {
    extent: vk::Extent2D,
    resized: bool,
    /// Extents reported after each successive `wait_events`
    after_wait: VecDeque<vk::Extent2D>,
    pub waits: usize,
}

impl MockSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            extent: vk::Extent2D { width, height },
            resized: false,
            after_wait: VecDeque::new(),
            waits: 0,
        }
    }

    /// Simulate a window resize event.
    pub fn resize_to(&mut self, width: u32, height: u32) {
        self.extent = vk::Extent2D { width, height };
        self.resized = true;
    }

    pub fn queue_after_wait(&mut self, width: u32, height: u32) {
        self.after_wait.push_back(vk::Extent2D { width, height });
    }
}

impl SurfaceProvider for MockSurface {
    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn was_resized(&self) -> bool {
        self.resized
    }

    fn reset_resized(&mut self) {
        self.resized = false;
    }

    fn wait_events(&mut self) {
        self.waits += 1;
        self.extent = self
            .after_wait
            .pop_front()
            .expect("wait_events would block forever");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    Resize(vk::Extent2D),
    RenderPassChanged(vk::RenderPass),
}

pub type NotificationLog = Rc<RefCell<Vec<Notification>>>;

pub struct RecordingListener {
    log: NotificationLog,
}

impl RecordingListener {
    pub fn new() -> (Self, NotificationLog) {
        let log = NotificationLog::default();
        (Self { log: log.clone() }, log)
    }
}

impl RecreateListener for RecordingListener {
    fn on_resize(&mut self, extent: vk::Extent2D) -> FrameResult<()> {
        self.log.borrow_mut().push(Notification::Resize(extent));
        Ok(())
    }

    fn on_render_pass_changed(&mut self, render_pass: vk::RenderPass) -> FrameResult<()> {
        self.log
            .borrow_mut()
            .push(Notification::RenderPassChanged(render_pass));
        Ok(())
    }
}
