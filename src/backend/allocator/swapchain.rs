use std::ops::Deref;
use std::sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Arc,
};

use tracing::{debug, trace};

use crate::backend::allocator::{Allocator, Buffer, Fourcc, Modifier};

/// Maximum number of buffers a [`Swapchain`] keeps around
pub const SLOT_CAP: usize = 4;

/// Swapchain handling a fixed set of re-usable buffers e.g. for scan-out.
///
/// ## How am I supposed to use this?
///
/// To do proper buffer management, most compositors do so called double-buffering.
/// Which means you use two buffers, one that is currently presented (the front buffer)
/// and one that is currently rendered to (the back buffer). After each rendering operation
/// you swap the buffers around, the old front buffer becomes the new back buffer, while
/// the new front buffer is displayed to the user.
///
/// `Swapchain` allocates buffers for you and transparently re-creates them, e.g. when resizing.
/// All you tell the swapchain is: *"Give me the next free buffer"* (by calling
/// [`acquire`](Swapchain::acquire)). You then hold on to the returned buffer during rendering and
/// swapping and free it once it is displayed.
///
/// Every time a buffer is handed to the display, report it with [`submitted`](Swapchain::submitted).
/// The swapchain then tracks the [age](Slot::age) of each buffer: how many frames behind the
/// current contents of the output it is. Renderers use the age to only repaint what changed.
#[derive(Debug)]
pub struct Swapchain<A: Allocator> {
    /// Allocator used by the swapchain
    pub allocator: A,

    width: u32,
    height: u32,
    fourcc: Fourcc,
    modifiers: Vec<Modifier>,

    slots: Vec<Arc<InternalSlot<A::Buffer>>>,
}

/// Slot of a swapchain containing an allocated buffer.
///
/// The buffer is marked for re-use once all copies are dropped.
/// Holding on to this struct will block the buffer in the swapchain.
#[derive(Debug)]
pub struct Slot<B: Buffer>(Arc<InternalSlot<B>>);

#[derive(Debug)]
struct InternalSlot<B: Buffer> {
    buffer: B,
    acquired: AtomicBool,
    age: AtomicU8,
}

impl<B: Buffer> Slot<B> {
    /// Age of the contents of this buffer
    ///
    /// `0` means the contents are undefined, `1` that the buffer holds the last submitted frame,
    /// `2` the frame before that, and so on.
    pub fn age(&self) -> u8 {
        self.0.age.load(Ordering::SeqCst)
    }
}

impl<B: Buffer> Deref for Slot<B> {
    type Target = B;
    fn deref(&self) -> &B {
        &self.0.buffer
    }
}

impl<B: Buffer> Drop for Slot<B> {
    fn drop(&mut self) {
        self.0.acquired.store(false, Ordering::SeqCst);
    }
}

impl<A> Swapchain<A>
where
    A: Allocator,
{
    /// Create a new swapchain with the desired allocator, dimensions and pixel format of its buffers
    pub fn new(
        allocator: A,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: Vec<Modifier>,
    ) -> Swapchain<A> {
        Swapchain {
            allocator,
            width,
            height,
            fourcc,
            modifiers,
            slots: Vec::with_capacity(SLOT_CAP),
        }
    }

    /// Acquire a new slot from the swapchain, if one is still free.
    ///
    /// The swapchain has an internal maximum of four re-usable buffers.
    /// Already allocated free buffers are returned first, a new buffer is only
    /// allocated if all of them are in use.
    pub fn acquire(&mut self) -> Result<Option<Slot<A::Buffer>>, A::Error> {
        if let Some(free_slot) = self
            .slots
            .iter()
            .find(|s| !s.acquired.swap(true, Ordering::SeqCst))
        {
            return Ok(Some(Slot(free_slot.clone())));
        }

        if self.slots.len() < SLOT_CAP {
            let buffer = self
                .allocator
                .create_buffer(self.width, self.height, self.fourcc, &self.modifiers)?;
            debug!(
                width = self.width,
                height = self.height,
                format = ?self.fourcc,
                "Allocated new swapchain buffer"
            );
            let slot = Arc::new(InternalSlot {
                buffer,
                acquired: AtomicBool::new(true),
                age: AtomicU8::new(0),
            });
            self.slots.push(slot.clone());
            return Ok(Some(Slot(slot)));
        }

        // no free slots
        Ok(None)
    }

    /// Mark a slot as submitted to the display
    ///
    /// Its age becomes `1` and every other buffer with defined contents gets one frame older.
    pub fn submitted(&self, slot: &Slot<A::Buffer>) {
        // slots of a previous size are not tracked anymore
        if !self.slots.iter().any(|other| Arc::ptr_eq(&slot.0, other)) {
            trace!("Ignoring submission of a buffer from before the last reset");
            return;
        }
        slot.0.age.store(1, Ordering::SeqCst);
        for other_slot in &self.slots {
            if !Arc::ptr_eq(other_slot, &slot.0) {
                let age = other_slot.age.load(Ordering::SeqCst);
                if age > 0 {
                    other_slot.age.store(age.saturating_add(1), Ordering::SeqCst);
                }
            }
        }
    }

    /// Change the dimensions of newly returned buffers.
    ///
    /// Already obtained buffers are unaffected and will be cleaned up on drop.
    pub fn resize(&mut self, width: u32, height: u32) {
        if self.width == width && self.height == height {
            return;
        }

        self.width = width;
        self.height = height;
        self.slots.clear();
    }

    /// Mark the contents of all buffers as undefined
    pub fn reset_buffer_ages(&mut self) {
        for slot in &self.slots {
            slot.age.store(0, Ordering::SeqCst);
        }
    }

    /// Dimensions of the buffers of this swapchain
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Format of the buffers of this swapchain
    pub fn format(&self) -> Fourcc {
        self.fourcc
    }

    /// Modifiers the buffers of this swapchain are allocated with
    pub fn modifiers(&self) -> &[Modifier] {
        &self.modifiers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::allocator::Format;
    use crate::utils::{Buffer as BufferCoords, Size};

    #[derive(Debug)]
    struct TestBuffer(Size<i32, BufferCoords>);

    impl Buffer for TestBuffer {
        fn size(&self) -> Size<i32, BufferCoords> {
            self.0
        }
        fn format(&self) -> Format {
            Format {
                code: Fourcc::Xrgb8888,
                modifier: Modifier::Linear,
            }
        }
    }

    #[derive(Debug, Default)]
    struct CountingAllocator(usize);

    impl Allocator for CountingAllocator {
        type Buffer = TestBuffer;
        type Error = std::convert::Infallible;

        fn create_buffer(
            &mut self,
            width: u32,
            height: u32,
            _fourcc: Fourcc,
            _modifiers: &[Modifier],
        ) -> Result<TestBuffer, Self::Error> {
            self.0 += 1;
            Ok(TestBuffer((width as i32, height as i32).into()))
        }
    }

    fn swapchain() -> Swapchain<CountingAllocator> {
        Swapchain::new(
            CountingAllocator::default(),
            64,
            32,
            Fourcc::Xrgb8888,
            vec![Modifier::Linear],
        )
    }

    #[test]
    fn reuses_released_buffers() {
        let mut swapchain = swapchain();
        let slot = swapchain.acquire().unwrap().unwrap();
        assert_eq!(slot.size(), (64, 32).into());
        drop(slot);
        let _slot = swapchain.acquire().unwrap().unwrap();
        assert_eq!(swapchain.allocator.0, 1);
    }

    #[test]
    fn runs_out_of_slots() {
        let mut swapchain = swapchain();
        let slots = (0..SLOT_CAP)
            .map(|_| swapchain.acquire().unwrap().unwrap())
            .collect::<Vec<_>>();
        assert!(swapchain.acquire().unwrap().is_none());
        drop(slots);
        assert!(swapchain.acquire().unwrap().is_some());
    }

    #[test]
    fn buffer_ages() {
        let mut swapchain = swapchain();
        let first = swapchain.acquire().unwrap().unwrap();
        assert_eq!(first.age(), 0);
        swapchain.submitted(&first);

        let second = swapchain.acquire().unwrap().unwrap();
        assert_eq!(second.age(), 0);
        swapchain.submitted(&second);
        assert_eq!(first.age(), 2);
        assert_eq!(second.age(), 1);
        drop(first);

        let reused = swapchain.acquire().unwrap().unwrap();
        assert_eq!(reused.age(), 2);

        swapchain.reset_buffer_ages();
        assert_eq!(reused.age(), 0);
    }

    #[test]
    fn resize_drops_buffers() {
        let mut swapchain = swapchain();
        let old = swapchain.acquire().unwrap().unwrap();
        swapchain.resize(128, 128);
        swapchain.submitted(&old);
        assert_eq!(old.age(), 0);

        let new = swapchain.acquire().unwrap().unwrap();
        assert_eq!(new.size(), (128, 128).into());
        assert_eq!(swapchain.allocator.0, 2);
    }
}
