//! Simulated physical memory, frame allocator, CPU, and user memory for
//! driving the subsystem end to end, plus a software MMU standing in for
//! hardware loads and stores.

#![allow(dead_code)]

use std::cell::UnsafeCell;
use tlmm::{
    CurrentCpu, FrameAlloc, Pd, PhysMapper, TlmmProcess, TlmmThread, UserAccess, UserCopyFault,
};
use tlmm_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

pub const PAGE: u64 = Size4K::SIZE;

/// A 4 KiB-aligned frame of simulated RAM.
#[repr(align(4096))]
struct Frame(UnsafeCell<[u8; 4096]>);

/// Simulated physical memory: frame `i` lives at physical address
/// `i * 4096`. Threads hand out disjoint frames and disjoint byte ranges,
/// which is what makes the shared mutable access below sound.
pub struct SimPhys {
    frames: Box<[Frame]>,
}

unsafe impl Sync for SimPhys {}

impl SimPhys {
    pub fn with_frames(n: usize) -> Self {
        let frames = (0..n)
            .map(|_| Frame(UnsafeCell::new([0; 4096])))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { frames }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn byte_ptr(&self, pa: u64) -> *mut u8 {
        let idx = (pa >> 12) as usize;
        let off = (pa & 0xFFF) as usize;
        assert!(idx < self.frames.len(), "physical address out of the pool");
        unsafe { self.frames[idx].0.get().cast::<u8>().add(off) }
    }

    pub fn zero_frame(&self, page: PhysicalPage<Size4K>) {
        unsafe { std::ptr::write_bytes(self.byte_ptr(page.base().as_u64()), 0, 4096) };
    }

    pub fn read_u64(&self, pa: PhysicalAddress) -> u64 {
        unsafe { self.byte_ptr(pa.as_u64()).cast::<u64>().read() }
    }

    pub fn write_u64(&self, pa: PhysicalAddress, val: u64) {
        unsafe { self.byte_ptr(pa.as_u64()).cast::<u64>().write(val) };
    }
}

impl PhysMapper for SimPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.byte_ptr(pa.as_u64()).cast::<T>() }
    }
}

/// Allocator over the low `limit_frames` frames of a [`SimPhys`] pool.
///
/// Bumps upward, recycles freed frames, and zeroes every frame it hands out,
/// as the allocation contract requires. Frames at or above `limit_frames`
/// are left for tests to use by hand.
pub struct SimAlloc<'a> {
    pool: &'a SimPhys,
    next: u64,
    limit: u64,
    free: Vec<u64>,
    pub freed_total: usize,
}

impl<'a> SimAlloc<'a> {
    pub fn new(pool: &'a SimPhys) -> Self {
        let frames = pool.frame_count();
        Self::bounded(pool, frames)
    }

    pub fn bounded(pool: &'a SimPhys, limit_frames: usize) -> Self {
        assert!(limit_frames <= pool.frame_count());
        Self {
            pool,
            next: 0,
            limit: (limit_frames as u64) << 12,
            free: Vec::new(),
            freed_total: 0,
        }
    }
}

impl FrameAlloc for SimAlloc<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        let pa = if let Some(pa) = self.free.pop() {
            pa
        } else {
            if self.next + 4096 > self.limit {
                return None;
            }
            let pa = self.next;
            self.next += 4096;
            pa
        };
        let page = PhysicalPage::from_addr(PhysicalAddress::new(pa));
        self.pool.zero_frame(page);
        Some(page)
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        self.freed_total += 1;
        self.free.push(page.base().as_u64());
    }
}

/// Records every translation-root install; the stand-in for CR3.
#[derive(Default)]
pub struct CpuLog {
    pub loads: Vec<u64>,
}

impl CpuLog {
    pub fn current_root(&self) -> Option<u64> {
        self.loads.last().copied()
    }
}

impl CurrentCpu for CpuLog {
    fn install_root(&mut self, root: PhysicalPage<Size4K>) {
        self.loads.push(root.base().as_u64());
    }
}

/// User memory holding one descriptor array at a fixed address.
pub struct SimUser {
    base: u64,
    pds: Vec<Pd>,
}

impl SimUser {
    pub fn new(base: u64, pds: Vec<Pd>) -> Self {
        Self { base, pds }
    }
}

impl UserAccess for SimUser {
    fn read_pds(&self, src: VirtualAddress, dst: &mut [Pd]) -> Result<(), UserCopyFault> {
        if src.as_u64() != self.base || dst.len() > self.pds.len() {
            return Err(UserCopyFault);
        }
        dst.copy_from_slice(&self.pds[..dst.len()]);
        Ok(())
    }
}

/// Convenient aliases for the fully simulated stack.
pub type Process<'m> = TlmmProcess<'m, SimPhys, SimAlloc<'m>>;
pub type Thread<'p, 'm> = TlmmThread<'p, 'm, SimPhys, SimAlloc<'m>, CpuLog>;

/// Why a simulated access faulted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Fault {
    NotPresent,
    Protection,
}

/// Simulated user-mode load of a `u64`.
pub fn load_u64(phys: &SimPhys, thread: &Thread<'_, '_>, va: VirtualAddress) -> Result<u64, Fault> {
    let (frame, ent) = thread.translate(va).ok_or(Fault::NotPresent)?;
    if !ent.user() {
        return Err(Fault::Protection);
    }
    Ok(phys.read_u64(frame.join(va.offset::<Size4K>())))
}

/// Simulated user-mode store of a `u64`.
pub fn store_u64(
    phys: &SimPhys,
    thread: &Thread<'_, '_>,
    va: VirtualAddress,
    val: u64,
) -> Result<(), Fault> {
    let (frame, ent) = thread.translate(va).ok_or(Fault::NotPresent)?;
    if !ent.user() || !ent.writable() {
        return Err(Fault::Protection);
    }
    phys.write_u64(frame.join(va.offset::<Size4K>()), val);
    Ok(())
}
