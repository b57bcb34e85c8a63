use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::Error;

pub struct HostAllocation {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HostAllocation {
    /// Allocates at least `size` bytes. Panics if `alignment` is not a power of two.
    pub fn new(size: u64, alignment: u64) -> Result<Self, Error> {
        assert!(
            alignment.is_power_of_two(),
            "host import alignment {} is not a power of two",
            alignment
        );
        let rounded = size
            .max(1)
            .checked_next_multiple_of(alignment)
            .and_then(|s| usize::try_from(s).ok())
            .ok_or(Error::Allocation {
                what: "host import".into(),
                requested: size,
                limit: usize::MAX as u64,
            })?;
        let align = usize::try_from(alignment).map_err(|_| {
            Error::InvalidConfig(format!("alignment {} does not fit usize", alignment))
        })?;
        let layout = Layout::from_size_align(rounded, align).map_err(|e| Error::Allocation {
            what: format!("host import layout: {}", e),
            requested: size,
            limit: isize::MAX as u64,
        })?;

        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(Error::Allocation {
            what: "host import (out of host memory)".into(),
            requested: rounded as u64,
            limit: rounded as u64,
        })?;

        Ok(Self { ptr, layout })
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> u64 {
        self.layout.size() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn alignment(&self) -> u64 {
        self.layout.align() as u64
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for HostAllocation {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}
