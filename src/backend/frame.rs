// Per-frame submission protocol
//
// The scheduler decides *when* to wait, acquire, record, submit, present and
// recreate; `FrameOps` does the GPU work. The split keeps the ordering rules
// in one place and lets them run against a recording mock in tests.
//
// FRAME TIMELINE (one slot):
// ┌──────────────────────────────────────────────────────────────────────┐
// │ [resize?] -> wait fence -> acquire -> reset+record -> submit -> present │
// │                               │                                  │     │
// │                          out of date                       stale/subopt │
// │                               └──────────> recreate <────────────┘     │
// └──────────────────────────────────────────────────────────────────────┘

use crate::error::Result;

/// How many frames the CPU may prepare ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Outcome of asking the chain for an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquire {
    Image { index: u32, suboptimal: bool },
    /// The chain no longer matches the surface; nothing was acquired.
    OutOfDate,
}

/// Outcome of presenting an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Present {
    Done,
    /// Out of date or suboptimal; the chain should be rebuilt.
    Stale,
}

/// Outcome of a recreation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recreate {
    Rebuilt,
    /// The surface has no area right now; nothing was touched.
    Deferred,
}

/// What happened to one `draw_frame` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    /// Acquisition found a stale chain; it was rebuilt and the frame dropped.
    Dropped,
    /// Nothing to present to (minimized window or zero surface extent); no
    /// work was submitted.
    Skipped,
}

/// GPU side of the frame protocol.
pub trait FrameOps {
    /// Block until the previous submission from `slot` has retired.
    fn wait_slot(&mut self, slot: usize) -> Result<()>;

    /// Acquire the next image, signalling the slot's "image available" semaphore.
    fn acquire(&mut self, slot: usize) -> Result<Acquire>;

    /// Reset the slot's fence and command buffer, then record the frame.
    fn record(&mut self, slot: usize, image_index: u32) -> Result<()>;

    /// Submit the slot's command buffer to the graphics queue.
    fn submit(&mut self, slot: usize) -> Result<()>;

    /// Queue the image for presentation after rendering finishes.
    fn present(&mut self, slot: usize, image_index: u32) -> Result<Present>;

    /// Rebuild the chain and everything that depends on its format or extent.
    /// `Deferred` leaves the current resources as they were.
    fn recreate(&mut self, width: u32, height: u32) -> Result<Recreate>;
}

/// Slot rotation plus the deferred-resize flag.
#[derive(Debug)]
pub struct FrameScheduler {
    current_slot: usize,
    frames_in_flight: usize,
    surface_size: (u32, u32),
    resize_pending: bool,
    frames_presented: u64,
}

impl FrameScheduler {
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_frames_in_flight(width, height, MAX_FRAMES_IN_FLIGHT)
    }

    pub fn with_frames_in_flight(width: u32, height: u32, frames_in_flight: usize) -> Self {
        Self {
            current_slot: 0,
            frames_in_flight: frames_in_flight.max(1),
            surface_size: (width, height),
            resize_pending: false,
            frames_presented: 0,
        }
    }

    /// Record a new window size. Nothing is rebuilt until the next frame starts.
    pub fn on_window_resized(&mut self, width: u32, height: u32) {
        log::debug!("Window resized to {}x{}", width, height);
        self.surface_size = (width, height);
        self.resize_pending = true;
    }

    pub fn is_minimized(&self) -> bool {
        self.surface_size.0 == 0 || self.surface_size.1 == 0
    }

    pub fn resize_pending(&self) -> bool {
        self.resize_pending
    }

    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn surface_size(&self) -> (u32, u32) {
        self.surface_size
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    /// Run one frame against `ops`.
    pub fn draw_frame<O: FrameOps>(&mut self, ops: &mut O) -> Result<FrameStatus> {
        if self.is_minimized() {
            return Ok(FrameStatus::Skipped);
        }

        // Deferred resize: the only point where a flagged resize is acted on
        if self.resize_pending {
            self.resize_pending = false;
            if !self.rebuild(ops)? {
                return Ok(FrameStatus::Skipped);
            }
        }

        let slot = self.current_slot;

        // Backpressure: slot's previous GPU work must be done
        ops.wait_slot(slot)?;

        let (image_index, acquired_suboptimal) = match ops.acquire(slot)? {
            Acquire::Image { index, suboptimal } => (index, suboptimal),
            Acquire::OutOfDate => {
                log::debug!("Swapchain out of date at acquire, recreating");
                return Ok(if self.rebuild(ops)? {
                    FrameStatus::Dropped
                } else {
                    FrameStatus::Skipped
                });
            }
        };

        ops.record(slot, image_index)?;
        ops.submit(slot)?;

        let presented = ops.present(slot, image_index)?;
        if presented == Present::Stale || acquired_suboptimal {
            log::debug!("Swapchain stale after present, recreating");
            self.rebuild(ops)?;
        }

        self.current_slot = (slot + 1) % self.frames_in_flight;
        self.frames_presented += 1;
        Ok(FrameStatus::Presented)
    }

    /// Recreate for the last known size. A deferred rebuild re-arms the resize
    /// flag so the next frame tries again before touching the chain.
    fn rebuild<O: FrameOps>(&mut self, ops: &mut O) -> Result<bool> {
        let (width, height) = self.surface_size;
        match ops.recreate(width, height)? {
            Recreate::Rebuilt => Ok(true),
            Recreate::Deferred => {
                log::debug!("Surface has no area, deferring recreation");
                self.resize_pending = true;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RenderError;
    use ash::vk;
    use std::collections::VecDeque;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Event {
        Wait(usize),
        Acquire(usize),
        Record(usize, u32),
        Submit(usize),
        Present(usize, u32),
        Recreate(u32, u32),
    }

    /// Models the GPU timeline: a submitted slot stays busy (fence unsignaled)
    /// until the CPU waits on it.
    #[derive(Default)]
    struct MockGpu {
        events: Vec<Event>,
        busy: [bool; MAX_FRAMES_IN_FLIGHT],
        acquires: VecDeque<Acquire>,
        presents: VecDeque<Present>,
        next_image: u32,
        image_count: u32,
        fail_submit: bool,
        recreates: VecDeque<Recreate>,
    }

    impl MockGpu {
        fn new() -> Self {
            Self {
                image_count: 3,
                ..Default::default()
            }
        }

        fn recreations(&self) -> usize {
            self.events
                .iter()
                .filter(|e| matches!(e, Event::Recreate(..)))
                .count()
        }
    }

    impl FrameOps for MockGpu {
        fn wait_slot(&mut self, slot: usize) -> Result<()> {
            self.events.push(Event::Wait(slot));
            self.busy[slot] = false;
            Ok(())
        }

        fn acquire(&mut self, slot: usize) -> Result<Acquire> {
            self.events.push(Event::Acquire(slot));
            Ok(self.acquires.pop_front().unwrap_or_else(|| {
                let index = self.next_image;
                self.next_image = (self.next_image + 1) % self.image_count;
                Acquire::Image { index, suboptimal: false }
            }))
        }

        fn record(&mut self, slot: usize, image_index: u32) -> Result<()> {
            assert!(!self.busy[slot], "slot {} reset while GPU still owns it", slot);
            self.events.push(Event::Record(slot, image_index));
            Ok(())
        }

        fn submit(&mut self, slot: usize) -> Result<()> {
            if self.fail_submit {
                return Err(RenderError::Call {
                    what: "Submit draw command buffer",
                    result: vk::Result::ERROR_DEVICE_LOST,
                });
            }
            self.events.push(Event::Submit(slot));
            self.busy[slot] = true;
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> Result<Present> {
            self.events.push(Event::Present(slot, image_index));
            Ok(self.presents.pop_front().unwrap_or(Present::Done))
        }

        fn recreate(&mut self, width: u32, height: u32) -> Result<Recreate> {
            self.events.push(Event::Recreate(width, height));
            Ok(self.recreates.pop_front().unwrap_or(Recreate::Rebuilt))
        }
    }

    #[test]
    fn steady_state_frame_order() {
        let mut gpu = MockGpu::new();
        let mut scheduler = FrameScheduler::new(800, 600);

        assert_eq!(scheduler.draw_frame(&mut gpu).unwrap(), FrameStatus::Presented);
        assert_eq!(
            gpu.events,
            vec![
                Event::Wait(0),
                Event::Acquire(0),
                Event::Record(0, 0),
                Event::Submit(0),
                Event::Present(0, 0),
            ]
        );
        assert_eq!(scheduler.current_slot(), 1);
    }

    #[test]
    fn slots_rotate_modulo_frames_in_flight() {
        let mut gpu = MockGpu::new();
        let mut scheduler = FrameScheduler::new(800, 600);

        let slots: Vec<usize> = (0..5)
            .map(|_| {
                let slot = scheduler.current_slot();
                scheduler.draw_frame(&mut gpu).unwrap();
                slot
            })
            .collect();

        assert_eq!(slots, vec![0, 1, 0, 1, 0]);
        assert_eq!(scheduler.frames_presented(), 5);
    }

    #[test]
    fn fence_wait_precedes_every_reset() {
        let mut gpu = MockGpu::new();
        let mut scheduler = FrameScheduler::new(800, 600);

        // MockGpu::record asserts the slot is idle
        for _ in 0..8 {
            scheduler.draw_frame(&mut gpu).unwrap();
        }

        for (i, event) in gpu.events.iter().enumerate() {
            if let Event::Record(slot, _) = event {
                let last_wait = gpu.events[..i]
                    .iter()
                    .rposition(|e| *e == Event::Wait(*slot));
                let last_submit = gpu.events[..i]
                    .iter()
                    .rposition(|e| *e == Event::Submit(*slot));
                assert!(last_wait.is_some());
                assert!(last_submit.map_or(true, |s| s < last_wait.unwrap()));
            }
        }
    }

    #[test]
    fn out_of_date_acquire_drops_frame_and_recreates() {
        let mut gpu = MockGpu::new();
        gpu.acquires.push_back(Acquire::OutOfDate);
        let mut scheduler = FrameScheduler::new(800, 600);

        assert_eq!(scheduler.draw_frame(&mut gpu).unwrap(), FrameStatus::Dropped);
        assert_eq!(
            gpu.events,
            vec![Event::Wait(0), Event::Acquire(0), Event::Recreate(800, 600)]
        );
        // No submit or present, and the slot is reused
        assert_eq!(scheduler.current_slot(), 0);
        assert_eq!(scheduler.frames_presented(), 0);

        gpu.events.clear();
        assert_eq!(scheduler.draw_frame(&mut gpu).unwrap(), FrameStatus::Presented);
        assert_eq!(gpu.events[0], Event::Wait(0));
        assert_eq!(gpu.recreations(), 0);
    }

    #[test]
    fn stale_present_recreates_after_presenting() {
        let mut gpu = MockGpu::new();
        gpu.presents.push_back(Present::Stale);
        let mut scheduler = FrameScheduler::new(640, 480);

        assert_eq!(scheduler.draw_frame(&mut gpu).unwrap(), FrameStatus::Presented);
        assert_eq!(gpu.events.last(), Some(&Event::Recreate(640, 480)));
        assert_eq!(gpu.events[gpu.events.len() - 2], Event::Present(0, 0));
        assert_eq!(scheduler.current_slot(), 1);
    }

    #[test]
    fn suboptimal_acquire_still_presents_then_recreates() {
        let mut gpu = MockGpu::new();
        gpu.acquires.push_back(Acquire::Image { index: 2, suboptimal: true });
        let mut scheduler = FrameScheduler::new(640, 480);

        scheduler.draw_frame(&mut gpu).unwrap();
        assert_eq!(
            gpu.events,
            vec![
                Event::Wait(0),
                Event::Acquire(0),
                Event::Record(0, 2),
                Event::Submit(0),
                Event::Present(0, 2),
                Event::Recreate(640, 480),
            ]
        );
    }

    #[test]
    fn resize_waits_for_next_frame() {
        let mut gpu = MockGpu::new();
        let mut scheduler = FrameScheduler::new(800, 600);

        scheduler.draw_frame(&mut gpu).unwrap();
        scheduler.on_window_resized(1024, 768);
        assert!(scheduler.resize_pending());
        assert_eq!(gpu.recreations(), 0);

        gpu.events.clear();
        scheduler.draw_frame(&mut gpu).unwrap();
        assert_eq!(
            gpu.events,
            vec![
                Event::Recreate(1024, 768),
                Event::Wait(1),
                Event::Acquire(1),
                Event::Record(1, 1),
                Event::Submit(1),
                Event::Present(1, 1),
            ]
        );
        assert!(!scheduler.resize_pending());
    }

    #[test]
    fn repeated_resizes_collapse_into_one_recreation() {
        let mut gpu = MockGpu::new();
        let mut scheduler = FrameScheduler::new(800, 600);

        scheduler.on_window_resized(900, 700);
        scheduler.on_window_resized(1000, 800);
        scheduler.draw_frame(&mut gpu).unwrap();

        assert_eq!(gpu.recreations(), 1);
        assert_eq!(gpu.events[0], Event::Recreate(1000, 800));
    }

    #[test]
    fn minimized_window_skips_gpu_entirely() {
        let mut gpu = MockGpu::new();
        let mut scheduler = FrameScheduler::new(800, 600);

        scheduler.on_window_resized(0, 0);
        assert!(scheduler.is_minimized());
        assert_eq!(scheduler.draw_frame(&mut gpu).unwrap(), FrameStatus::Skipped);
        assert_eq!(scheduler.draw_frame(&mut gpu).unwrap(), FrameStatus::Skipped);
        assert!(gpu.events.is_empty());

        scheduler.on_window_resized(800, 600);
        assert_eq!(scheduler.draw_frame(&mut gpu).unwrap(), FrameStatus::Presented);
        assert_eq!(gpu.events[0], Event::Recreate(800, 600));
    }

    #[test]
    fn submit_failure_is_fatal_and_keeps_slot() {
        let mut gpu = MockGpu::new();
        gpu.fail_submit = true;
        let mut scheduler = FrameScheduler::new(800, 600);

        let err = scheduler.draw_frame(&mut gpu).unwrap_err();
        assert!(matches!(
            err,
            RenderError::Call { result: vk::Result::ERROR_DEVICE_LOST, .. }
        ));
        assert!(!gpu.events.iter().any(|e| matches!(e, Event::Present(..))));
        assert_eq!(scheduler.current_slot(), 0);
    }

    #[test]
    fn frames_in_flight_never_zero() {
        let scheduler = FrameScheduler::with_frames_in_flight(1, 1, 0);
        assert_eq!(scheduler.frames_in_flight(), 1);
    }

    #[test]
    fn zero_surface_at_acquire_skips_and_retries_next_frame() {
        let mut gpu = MockGpu::new();
        gpu.acquires.push_back(Acquire::OutOfDate);
        gpu.recreates.push_back(Recreate::Deferred);
        let mut scheduler = FrameScheduler::new(800, 600);

        assert_eq!(scheduler.draw_frame(&mut gpu).unwrap(), FrameStatus::Skipped);
        assert!(scheduler.resize_pending());
        assert!(!gpu.events.iter().any(|e| matches!(e, Event::Submit(_))));
        assert_eq!(scheduler.current_slot(), 0);

        // Still zero: nothing past the recreate attempt
        gpu.events.clear();
        gpu.recreates.push_back(Recreate::Deferred);
        assert_eq!(scheduler.draw_frame(&mut gpu).unwrap(), FrameStatus::Skipped);
        assert_eq!(gpu.events, vec![Event::Recreate(800, 600)]);

        // Surface back: rebuilt at the top, then a normal frame
        gpu.events.clear();
        assert_eq!(scheduler.draw_frame(&mut gpu).unwrap(), FrameStatus::Presented);
        assert_eq!(gpu.events[0], Event::Recreate(800, 600));
        assert_eq!(gpu.events[1], Event::Wait(0));
        assert!(!scheduler.resize_pending());
    }

    #[test]
    fn deferred_rebuild_after_present_rearms_resize() {
        let mut gpu = MockGpu::new();
        gpu.presents.push_back(Present::Stale);
        gpu.recreates.push_back(Recreate::Deferred);
        let mut scheduler = FrameScheduler::new(640, 480);

        assert_eq!(scheduler.draw_frame(&mut gpu).unwrap(), FrameStatus::Presented);
        assert!(scheduler.resize_pending());
        assert_eq!(scheduler.current_slot(), 1);
    }
}
