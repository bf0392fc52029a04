//! Inventory and teardown of the threads and memory mappings left behind by
//! a previously installed runtime.
//!
//! Everything lives in one owned context object guarded by a single lock;
//! the bootstrap sequencer calls [`RuntimeReset::kill_threads`] and then
//! [`RuntimeReset::unmap_memory`] exactly once, between runtimes. Mapped
//! ranges are not kept as a list: a page's bit in the arena bitmap is its
//! only record, and teardown rederives the ranges by scanning for runs of
//! set bits.

use crate::bitset;
use crate::error::{bail, Error};
use crate::utils::{align_to_next_page_usize, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};

/// Cooperative cancellation flag handed to every tracked thread.
///
/// Tracked threads are expected to poll [`ResetToken::is_cancelled`] at
/// their blocking points and unwind on their own; nothing here force-cancels
/// a thread.
#[derive(Clone, Default)]
pub struct ResetToken(Arc<AtomicBool>);

impl ResetToken {
    pub fn new() -> Self {
        ResetToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// A thread owned by the current runtime: its cancellation token plus the
/// handle teardown will join on.
pub struct TrackedThread {
    token: ResetToken,
    join: JoinHandle<()>,
}

impl TrackedThread {
    pub fn new(token: ResetToken, join: JoinHandle<()>) -> Self {
        TrackedThread { token, join }
    }

    fn id(&self) -> ThreadId {
        self.join.thread().id()
    }
}

/// The externally supplied platform primitives the tracker drives.
pub trait ResetHost {
    /// Releases any thread blocked in a shared I/O readiness wait so it can
    /// observe a pending cancellation.
    fn wake_pollers(&self) -> Result<(), Error>;

    /// Maps `length` bytes of zeroed memory exactly at `address`.
    ///
    /// # Safety
    ///
    /// `address..address + length` must lie within the arena the tracker
    /// was initialized with and must not overlap a live mapping.
    unsafe fn map_fixed(&self, address: u64, length: usize) -> Result<(), Error>;

    /// Unmaps `length` bytes at `address`.
    ///
    /// # Safety
    ///
    /// No thread may touch the range afterwards; the bootstrap sequencer
    /// guarantees this by stopping every tracked thread first.
    unsafe fn unmap(&self, address: u64, length: usize) -> Result<(), Error>;
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Phase {
    Active,
    TearingDown,
    Quiesced,
}

struct ResetState {
    phase: Phase,
    threads: Vec<TrackedThread>,
    bitset: Vec<u8>,
}

/// Process-wide inventory of the running runtime's threads and mappings.
pub struct RuntimeReset {
    base: u64,
    page_size: usize,
    bitmap_bits: usize,
    mutable: Mutex<ResetState>,
}

impl RuntimeReset {
    /// Creates the tracker for an arena of `arena_size` bytes at `base`.
    pub fn new(base: u64, arena_size: usize, page_size: usize) -> Result<Self, Error> {
        if page_size == 0 || !page_size.is_power_of_two() {
            bail!("invalid page size: {}", page_size);
        }

        if base & (page_size as u64 - 1) != 0 {
            bail!("arena base 0x{:x} is not page-aligned", base);
        }

        let bitmap_bits = arena_size / page_size;

        // The bitmap is padded out to whole pages so it can be carved out of
        // the same allocator that backs the arena itself.
        let storage_size = align_to_next_page_usize(page_size, (bitmap_bits + 7) / 8)
            .ok_or_else(|| Error::from_static_str("arena too large for a page bitmap"))?;

        log::debug!(
            "tracking an arena of {} page(s) at 0x{:x} ({} KiB of bitmap)",
            bitmap_bits,
            base,
            storage_size / 1024,
        );

        Ok(RuntimeReset {
            base,
            page_size,
            bitmap_bits,
            mutable: Mutex::new(ResetState {
                phase: Phase::Active,
                threads: Vec::new(),
                bitset: vec![0; storage_size],
            }),
        })
    }

    pub fn arena_base(&self) -> u64 {
        self.base
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_range(&self, address: u64, length: usize) -> Result<(usize, usize), Error> {
        if address < self.base || address & (self.page_size as u64 - 1) != 0 {
            bail!("mapping address 0x{:x} is unaligned or outside the arena", address);
        }

        if length % self.page_size != 0 {
            bail!("mapping length 0x{:x} is not a whole number of pages", length);
        }

        let pos = ((address - self.base) / self.page_size as u64) as usize;
        let pages = length / self.page_size;
        if pos.checked_add(pages).map_or(true, |end| end > self.bitmap_bits) {
            bail!("mapping of 0x{:x} byte(s) at 0x{:x} runs past the arena", length, address);
        }

        Ok((pos, pages))
    }

    /// Starts tracking a thread. Tracking the same thread twice is a no-op.
    ///
    /// Once teardown has begun no new thread can be tracked; a rejected
    /// thread has its token cancelled before the error is returned.
    pub fn add_thread(&self, thread: TrackedThread) -> Result<(), Error> {
        {
            let mut state = self.mutable.lock();
            if state.phase == Phase::Active {
                if state.threads.iter().any(|existing| existing.id() == thread.id()) {
                    return Ok(());
                }

                state.threads.push(thread);
                return Ok(());
            }
        }

        log::warn!("refusing to track a thread spawned during runtime teardown");
        thread.token.cancel();
        Err(Error::from_static_str("cannot track a new thread: the runtime is being reset"))
    }

    /// Records `length` bytes mapped at `address`. Both must be page-aligned.
    pub fn add_memory(&self, address: u64, length: usize) -> Result<(), Error> {
        let (pos, pages) = self.page_range(address, length)?;
        let mut state = self.mutable.lock();
        if state.phase != Phase::Active {
            bail!("cannot track a new mapping: the runtime is being reset");
        }

        bitset::set_range(&mut state.bitset, pos, pages);
        Ok(())
    }

    /// Forgets a previously recorded mapping. Unlike [`Self::add_memory`]
    /// this stays legal during teardown: exiting threads release their
    /// mappings while being joined.
    pub fn remove_memory(&self, address: u64, length: usize) -> Result<(), Error> {
        let (pos, pages) = self.page_range(address, length)?;
        let mut state = self.mutable.lock();
        bitset::reset_range(&mut state.bitset, pos, pages);
        Ok(())
    }

    /// Maps `length` bytes at the lowest free spot in the arena and records
    /// them; this is the integration point through which all new mappings
    /// must come.
    pub fn map_pages(&self, host: &impl ResetHost, length: usize) -> Result<u64, Error> {
        if length == 0 || length % self.page_size != 0 {
            bail!("mapping length 0x{:x} is not a whole number of pages", length);
        }

        let pages = length / self.page_size;
        let mut state = self.mutable.lock();
        if state.phase != Phase::Active {
            bail!("cannot map new pages: the runtime is being reset");
        }

        let Some(pos) = bitset::find_unset_range(&state.bitset, self.bitmap_bits, pages) else {
            bail!("arena exhausted: no free run of {} page(s)", pages);
        };

        let address = self.base + pos as u64 * self.page_size as u64;

        // SAFETY: the range is within the arena and its bits are clear, so
        // nothing else has it mapped.
        unsafe { host.map_fixed(address, length)? };

        bitset::set_range(&mut state.bitset, pos, pages);
        Ok(address)
    }

    /// Stops every tracked thread: all cancellation tokens are signalled
    /// first, one wake-up call flushes threads out of readiness waits, and
    /// only then is each thread joined. The tracked set is empty afterwards.
    ///
    /// A failed wake-up or join aborts the teardown; the caller must treat
    /// that as fatal rather than start the next runtime anyway.
    pub fn kill_threads(&self, host: &impl ResetHost) -> Result<(), Error> {
        let threads = {
            let mut state = self.mutable.lock();
            if state.phase == Phase::Active {
                state.phase = Phase::TearingDown;
            }

            core::mem::take(&mut state.threads)
        };

        if threads.is_empty() {
            return Ok(());
        }

        log::debug!("stopping {} tracked thread(s)...", threads.len());
        for thread in &threads {
            thread.token.cancel();
        }

        host.wake_pollers()
            .map_err(|error| error.context("failed to wake threads blocked in a readiness wait"))?;

        for thread in threads {
            let name = thread.join.thread().name().unwrap_or("<unnamed>").to_owned();
            log::trace!("  joining '{}'...", name);
            if thread.join.join().is_err() {
                bail!("tracked thread '{}' panicked while shutting down", name);
            }
        }

        log::debug!("all tracked threads stopped");
        Ok(())
    }

    /// Unmaps every page still recorded in the bitmap and leaves the tracker
    /// permanently quiesced. Idempotent; a no-op on an empty bitmap.
    ///
    /// Must only run after [`Self::kill_threads`] has returned successfully;
    /// the tracker itself does not enforce the ordering.
    pub fn unmap_memory(&self, host: &impl ResetHost) -> Result<(), Error> {
        let mut state = self.mutable.lock();

        let mut pos = 0;
        let mut total_pages = 0;
        while let Some((start, pages)) = bitset::find_set_range(&state.bitset, self.bitmap_bits, pos) {
            let address = self.base + start as u64 * self.page_size as u64;
            let length = pages * self.page_size;

            // SAFETY: the range was recorded as a live mapping and every
            // thread that could touch it has already been stopped.
            unsafe { host.unmap(address, length) }.map_err(|error| error.context("failed to unmap a tracked mapping"))?;

            bitset::reset_range(&mut state.bitset, start, pages);
            pos = start + pages;
            total_pages += pages;
        }

        if total_pages > 0 {
            log::debug!("unmapped {} page(s) left behind by the previous runtime", total_pages);
        }

        state.phase = Phase::Quiesced;
        Ok(())
    }

    pub fn tracked_thread_count(&self) -> usize {
        self.mutable.lock().threads.len()
    }

    pub fn mapped_page_count(&self) -> usize {
        let state = self.mutable.lock();
        let mut total = 0;
        let mut pos = 0;
        while let Some((start, pages)) = bitset::find_set_range(&state.bitset, self.bitmap_bits, pos) {
            total += pages;
            pos = start + pages;
        }

        total
    }
}

/// Spawns an OS thread under the tracker. The body receives the thread's
/// [`ResetToken`] and must honor it at its blocking points.
pub fn spawn_tracked<F>(reset: &RuntimeReset, name: &str, body: F) -> Result<(), Error>
where
    F: FnOnce(ResetToken) + Send + 'static,
{
    let token = ResetToken::new();
    let thread_token = token.clone();
    let join = std::thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || body(thread_token))
        .map_err(|error| Error::from_display(format_args!("failed to spawn the '{}' thread: {}", name, error)))?;

    reset.add_thread(TrackedThread::new(token, join))
}
