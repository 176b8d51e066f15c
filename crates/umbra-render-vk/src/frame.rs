// SPDX-License-Identifier: CEPL-1.0
//! Frame-in-flight bookkeeping: the slot ring, its fences and the main
//! pass state machine.

use crate::device::DeviceContext;
use crate::error::VkError;
use crate::handles::{OwnedFence, OwnedSemaphore};
use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

/// Host-side view of a per-slot fence.
pub trait SlotFence {
    /// Block until the GPU work last submitted with this fence completes.
    fn wait(&self) -> Result<()>;
    fn reset(&self) -> Result<()>;
}

/// `N` slots used round-robin. The CPU may only touch slot `i` resources
/// after `wait_current` returned for `i`.
pub struct FrameRing<F> {
    fences: Vec<F>,
    current: usize,
}

impl<F: SlotFence> FrameRing<F> {
    pub fn new(fences: Vec<F>) -> Self {
        assert!(!fences.is_empty(), "frame ring needs at least one slot");
        Self { fences, current: 0 }
    }

    pub fn slots(&self) -> usize {
        self.fences.len()
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn fence(&self) -> &F {
        &self.fences[self.current]
    }

    pub fn wait_current(&self) -> Result<()> {
        self.fences[self.current].wait()
    }

    pub fn reset_current(&self) -> Result<()> {
        self.fences[self.current].reset()
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.fences.len();
    }

    pub fn wait_all(&self) -> Result<()> {
        self.fences.iter().try_for_each(|f| f.wait())
    }
}

pub struct VkFence(OwnedFence);

impl VkFence {
    /// Created signaled so the first wait on each slot returns at once.
    pub fn new(ctx: &Arc<DeviceContext>) -> Result<Self> {
        let ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        let fence = unsafe { ctx.device().create_fence(&ci, None) }.context("create_fence")?;
        Ok(Self(OwnedFence::new(ctx, fence)))
    }

    pub fn raw(&self) -> vk::Fence {
        self.0.raw()
    }
}

impl SlotFence for VkFence {
    fn wait(&self) -> Result<()> {
        unsafe {
            self.0
                .ctx()
                .device()
                .wait_for_fences(&[self.0.raw()], true, u64::MAX)
        }
        .map_err(VkError::from)
        .context("wait_for_fences")?;
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        unsafe { self.0.ctx().device().reset_fences(&[self.0.raw()]) }
            .map_err(VkError::from)
            .context("reset_fences")?;
        Ok(())
    }
}

/// Per-slot objects besides the fence.
pub struct FrameSlot {
    pub image_available: OwnedSemaphore,
    pub cmd: vk::CommandBuffer,
}

impl FrameSlot {
    pub fn create_all(ctx: &Arc<DeviceContext>, count: usize) -> Result<Vec<Self>> {
        let cmds = ctx.allocate_command_buffers(count as u32)?;
        cmds.into_iter()
            .map(|cmd| {
                Ok(Self {
                    image_available: create_semaphore(ctx)?,
                    cmd,
                })
            })
            .collect()
    }
}

pub fn create_semaphore(ctx: &Arc<DeviceContext>) -> Result<OwnedSemaphore> {
    let ci = vk::SemaphoreCreateInfo {
        s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
        ..Default::default()
    };
    let sem = unsafe { ctx.device().create_semaphore(&ci, None) }.context("create_semaphore")?;
    Ok(OwnedSemaphore::new(ctx, sem))
}

/// Main pass state. `Submitted` and `Presented` are transient inside
/// `end_render`; a finished frame is back at `Idle`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    FrameAcquired,
    RenderPassActive,
    Submitted,
    Presented,
}

impl FramePhase {
    pub fn name(self) -> &'static str {
        match self {
            FramePhase::Idle => "idle",
            FramePhase::FrameAcquired => "frame acquired",
            FramePhase::RenderPassActive => "render pass active",
            FramePhase::Submitted => "submitted",
            FramePhase::Presented => "presented",
        }
    }

    pub fn require(self, op: &'static str, allowed: &[FramePhase]) -> Result<(), VkError> {
        if allowed.contains(&self) {
            Ok(())
        } else {
            Err(VkError::InvalidPhase {
                op,
                phase: self.name(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Condvar, Mutex};
    use std::thread;
    use std::time::Duration;

    /// Host fence: a flag plus a condvar.
    #[derive(Default)]
    struct HostFence {
        signaled: Mutex<bool>,
        cv: Condvar,
        resets: AtomicUsize,
    }

    impl HostFence {
        fn signaled() -> Self {
            Self {
                signaled: Mutex::new(true),
                ..Default::default()
            }
        }

        fn signal(&self) {
            *self.signaled.lock().unwrap() = true;
            self.cv.notify_all();
        }
    }

    impl SlotFence for Arc<HostFence> {
        fn wait(&self) -> Result<()> {
            let mut done = self.signaled.lock().unwrap();
            while !*done {
                done = self.cv.wait(done).unwrap();
            }
            Ok(())
        }

        fn reset(&self) -> Result<()> {
            *self.signaled.lock().unwrap() = false;
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn ring(n: usize) -> (FrameRing<Arc<HostFence>>, Vec<Arc<HostFence>>) {
        let fences: Vec<_> = (0..n).map(|_| Arc::new(HostFence::signaled())).collect();
        (FrameRing::new(fences.clone()), fences)
    }

    #[test]
    fn ring_wraps_modulo_len() {
        let (mut ring, _) = ring(3);
        let seen: Vec<_> = (0..7)
            .map(|_| {
                let s = ring.current();
                ring.advance();
                s
            })
            .collect();
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn fresh_slots_do_not_block() {
        let (ring, _) = ring(2);
        ring.wait_all().unwrap();
    }

    #[test]
    fn wait_blocks_until_slot_is_signaled() {
        let (mut ring, fences) = ring(2);
        ring.wait_current().unwrap();
        ring.reset_current().unwrap();
        // "submit" slot 0, move on to slot 1
        ring.advance();
        ring.wait_current().unwrap();
        ring.advance();
        assert_eq!(ring.current(), 0);

        let gpu = Arc::clone(&fences[0]);
        let released = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&released);
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            flag.store(1, Ordering::SeqCst);
            gpu.signal();
        });

        ring.wait_current().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        worker.join().unwrap();
        assert_eq!(fences[0].resets.load(Ordering::SeqCst), 1);
        assert_eq!(fences[1].resets.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn phase_guard_names_the_offender() {
        let err = FramePhase::Idle
            .require("draw_model", &[FramePhase::FrameAcquired, FramePhase::RenderPassActive])
            .unwrap_err();
        assert_eq!(err.to_string(), "draw_model is not valid while idle");
        assert!(FramePhase::RenderPassActive
            .require("end_render", &[FramePhase::FrameAcquired, FramePhase::RenderPassActive])
            .is_ok());
    }
}
