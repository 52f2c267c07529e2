use std::any::{Any, TypeId};
use std::mem::{self, ManuallyDrop, MaybeUninit};
use std::ptr;

/// Bytes of task data stored inline in the task slot.
///
/// Values that are larger, or aligned to more than [`PAYLOAD_ALIGN`], are moved
/// to the heap instead.
pub const PAYLOAD_CAPACITY: usize = 64;

/// Strictest alignment an inline value may require.
pub const PAYLOAD_ALIGN: usize = 16;

#[repr(C, align(16))]
struct InlineBuf([MaybeUninit<u8>; PAYLOAD_CAPACITY]);

const _: () = assert!(mem::align_of::<InlineBuf>() == PAYLOAD_ALIGN);

/// A type-erased value living in an [`InlineBuf`].
pub(crate) struct InlineValue {
    buf: InlineBuf,
    type_id: TypeId,
    drop_fn: unsafe fn(*mut u8),
}

// Safety: only constructed from `T: Send` values.
unsafe impl Send for InlineValue {}

unsafe fn drop_erased<T>(ptr: *mut u8) {
    // Safety: `ptr` points to a valid, initialized `T` owned by the caller.
    unsafe { ptr::drop_in_place(ptr.cast::<T>()) }
}

impl InlineValue {
    const fn fits<T>() -> bool {
        mem::size_of::<T>() <= PAYLOAD_CAPACITY && mem::align_of::<T>() <= PAYLOAD_ALIGN
    }

    fn new<T: Send + 'static>(value: T) -> Self {
        debug_assert!(Self::fits::<T>());

        let mut buf = InlineBuf([MaybeUninit::uninit(); PAYLOAD_CAPACITY]);

        // Safety: `fits::<T>()` guarantees the buffer is large enough and
        // sufficiently aligned for a `T`.
        unsafe { buf.0.as_mut_ptr().cast::<T>().write(value) };

        Self {
            buf,
            type_id: TypeId::of::<T>(),
            drop_fn: drop_erased::<T>,
        }
    }

    fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        // Safety: the buffer holds an initialized `T` when the type ids match.
        self.is::<T>()
            .then(|| unsafe { &*self.buf.0.as_ptr().cast::<T>() })
    }

    fn downcast_mut<T: 'static>(&mut self) -> Option<&mut T> {
        // Safety: see `downcast_ref`.
        self.is::<T>()
            .then(|| unsafe { &mut *self.buf.0.as_mut_ptr().cast::<T>() })
    }

    fn into_inner<T: 'static>(self) -> Result<T, Self> {
        if !self.is::<T>() {
            return Err(self);
        }

        // Ownership of the value moves out, the erased drop must not run.
        let this = ManuallyDrop::new(self);

        // Safety: type ids match and the value is read exactly once.
        Ok(unsafe { this.buf.0.as_ptr().cast::<T>().read() })
    }
}

impl Drop for InlineValue {
    fn drop(&mut self) {
        // Safety: the buffer holds an initialized value of the erased type.
        unsafe { (self.drop_fn)(self.buf.0.as_mut_ptr().cast::<u8>()) }
    }
}

/// Data attached to a task: nothing, an inline value, or a boxed value when it
/// doesn't fit inline.
#[derive(Default)]
pub(crate) enum Payload {
    #[default]
    Empty,
    Inline(InlineValue),
    Boxed(Box<dyn Any + Send>),
}

impl Payload {
    pub(crate) fn set<T: Send + 'static>(&mut self, value: T) {
        *self = if InlineValue::fits::<T>() {
            Payload::Inline(InlineValue::new(value))
        } else {
            Payload::Boxed(Box::new(value))
        };
    }

    #[cfg(test)]
    pub(crate) fn clear(&mut self) {
        *self = Payload::Empty;
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }

    #[cfg(test)]
    pub(crate) fn is_inline(&self) -> bool {
        matches!(self, Payload::Inline(_))
    }

    pub(crate) fn get<T: 'static>(&self) -> Option<&T> {
        match self {
            Payload::Empty => None,
            Payload::Inline(v) => v.downcast_ref(),
            Payload::Boxed(b) => b.downcast_ref(),
        }
    }

    pub(crate) fn get_mut<T: 'static>(&mut self) -> Option<&mut T> {
        match self {
            Payload::Empty => None,
            Payload::Inline(v) => v.downcast_mut(),
            Payload::Boxed(b) => b.downcast_mut(),
        }
    }

    /// Moves the value out if it is a `T`, leaving the payload empty. A value of
    /// another type is left in place.
    pub(crate) fn take<T: 'static>(&mut self) -> Option<T> {
        match mem::take(self) {
            Payload::Empty => None,
            Payload::Inline(v) => v.into_inner().map_err(|v| *self = Payload::Inline(v)).ok(),
            Payload::Boxed(b) => match b.downcast::<T>() {
                Ok(value) => Some(*value),
                Err(b) => {
                    *self = Payload::Boxed(b);
                    None
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::{assert_impl_all, const_assert};
    use std::sync::Arc;

    assert_impl_all!(Payload: Send);
    const_assert!(mem::size_of::<InlineBuf>() == PAYLOAD_CAPACITY);

    #[derive(Debug, PartialEq)]
    struct Node {
        depth: u32,
        breadth: u32,
        path: [u64; 4],
    }

    #[repr(align(32))]
    struct OverAligned(#[allow(dead_code)] u8);

    #[rstest]
    #[case::small(mem::size_of::<u64>(), true)]
    #[case::exact(PAYLOAD_CAPACITY, true)]
    #[case::too_big(PAYLOAD_CAPACITY + 1, false)]
    fn test_fits_by_size(#[case] size: usize, #[case] inline: bool) {
        let mut payload = Payload::default();

        match size {
            8 => payload.set(7u64),
            PAYLOAD_CAPACITY => payload.set([1u8; PAYLOAD_CAPACITY]),
            _ => payload.set([1u8; PAYLOAD_CAPACITY + 1]),
        }

        assert_eq!(payload.is_inline(), inline);
        assert!(!payload.is_empty());
    }

    #[test]
    fn test_over_aligned_goes_to_heap() {
        let mut payload = Payload::default();
        payload.set(OverAligned(1));

        assert!(!payload.is_inline());
        assert!(payload.get::<OverAligned>().is_some());
    }

    #[test]
    fn test_typed_access() {
        let mut payload = Payload::default();
        payload.set(Node {
            depth: 1,
            breadth: 3,
            path: [0, 1, 2, 3],
        });

        assert!(payload.is_inline());
        assert!(payload.get::<u32>().is_none());

        if let Some(node) = payload.get_mut::<Node>() {
            node.depth += 1;
        }
        assert_eq!(payload.get::<Node>().map(|n| n.depth), Some(2));

        // Wrong type leaves the value in place.
        assert!(payload.take::<u64>().is_none());
        assert!(!payload.is_empty());

        let node = payload.take::<Node>();
        assert_eq!(
            node,
            Some(Node {
                depth: 2,
                breadth: 3,
                path: [0, 1, 2, 3],
            })
        );
        assert!(payload.is_empty());
        assert!(payload.take::<Node>().is_none());
    }

    #[test]
    fn test_boxed_take_wrong_type_keeps_value() {
        let mut payload = Payload::default();
        payload.set(vec![0u8; 16]);
        payload.set([7u64; 16]);

        assert!(!payload.is_inline());
        assert!(payload.take::<Vec<u8>>().is_none());
        assert_eq!(payload.take::<[u64; 16]>(), Some([7u64; 16]));
    }

    #[rstest]
    #[case::inline(false)]
    #[case::boxed(true)]
    fn test_drop_runs_exactly_once(#[case] boxed: bool) {
        let tracker = Arc::new(());

        {
            let mut payload = Payload::default();
            if boxed {
                payload.set((Arc::clone(&tracker), [0u8; PAYLOAD_CAPACITY]));
            } else {
                payload.set(Arc::clone(&tracker));
            }
            assert_eq!(payload.is_inline(), !boxed);
            assert_eq!(Arc::strong_count(&tracker), 2);

            // Overwriting drops the previous value.
            payload.set(Arc::clone(&tracker));
            assert_eq!(Arc::strong_count(&tracker), 2);

            payload.clear();
            assert_eq!(Arc::strong_count(&tracker), 1);

            payload.set(Arc::clone(&tracker));
        }

        assert_eq!(Arc::strong_count(&tracker), 1);
    }

    #[test]
    fn test_take_does_not_double_drop() {
        let tracker = Arc::new(());
        let mut payload = Payload::default();
        payload.set(Arc::clone(&tracker));

        let taken = payload.take::<Arc<()>>();
        assert_eq!(Arc::strong_count(&tracker), 2);

        drop(payload);
        assert_eq!(Arc::strong_count(&tracker), 2);

        drop(taken);
        assert_eq!(Arc::strong_count(&tracker), 1);
    }
}
