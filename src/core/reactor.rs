//! The single-threaded, per-core event loop (spec.md §4.1 `AsyncTool`).
//!
//! Modeled on the teacher's own `core::reactor::Reactor`
//! (`io-engine/src/core/reactor.rs`): one reactor owns one thread (or is
//! driven externally, `poll_once`/`poll_times` style), futures/callbacks
//! cross cores over an unbounded `crossbeam::channel`, and the reactor
//! polls its queues to completion rather than being preempted. Where the
//! teacher hands raw SPDK thread pointers between cores, this reactor hands
//! cookie-validated [`Handle`]s, because there is no SPDK runtime backing
//! memory safety here.
use std::{
    cell::{Cell, RefCell},
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, VecDeque},
    fmt,
    thread::ThreadId,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use snafu::ResultExt;
use std::sync::Arc;

use crate::core::{
    cross_thread::{marshal, TaskQueue},
    handle::{Cookie, CookieGen, Handle},
    mempool::MemPool,
};

/// Bound on how many immediate/deferred entries one dispatch burst drains,
/// so deferred (timeout) work is never starved by a flood of immediates.
pub const BURST_COUNT: usize = 100;

/// `deferred` exists for timeouts, not short sleeps; anything under this is
/// a programming error and is fatal (spec.md §4.1).
pub const MIN_DEFERRED_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorState {
    Init,
    Running,
    Shutdown,
}

impl fmt::Display for ReactorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReactorState::Init => "Init",
            ReactorState::Running => "Running",
            ReactorState::Shutdown => "Shutdown",
        };
        write!(f, "{s}")
    }
}

/// Result of one [`Reactor::iterate`] tick, for externally-driven reactors.
#[derive(Debug, Clone, Copy)]
pub struct CycleResult {
    pub have_work: bool,
    pub next_delay: Option<Duration>,
}

enum SlotEntry {
    Empty,
    Immediate(Box<dyn FnOnce() + 'static>),
    Deferred(Box<dyn FnOnce() + 'static>),
}

struct Slot {
    entry: SlotEntry,
}

/// `(when, sequence, slot)`; `Reverse` turns `BinaryHeap`'s max-heap into a
/// min-heap over `when`, and `sequence` keeps ties FIFO (spec.md's "ties are
/// FIFO" ordering guarantee).
#[derive(PartialEq, Eq)]
struct DeferredKey(Reverse<(Instant, u64, u32)>);

impl PartialOrd for DeferredKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DeferredKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

struct WakeGate {
    mutex: Mutex<bool>,
    cond: Condvar,
}

impl WakeGate {
    fn new() -> Self {
        WakeGate {
            mutex: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn poke(&self) {
        let mut woken = self.mutex.lock();
        *woken = true;
        self.cond.notify_one();
    }

    fn wait(&self, timeout: Option<Duration>) {
        let mut woken = self.mutex.lock();
        if *woken {
            *woken = false;
            return;
        }
        match timeout {
            Some(d) => {
                self.cond.wait_for(&mut woken, d);
            }
            None => self.cond.wait(&mut woken),
        }
        *woken = false;
    }
}

/// The reactor: owns the slot heap, the immediate FIFO and the deferred
/// priority queue described in spec.md §4.1.
pub struct Reactor {
    slots: RefCell<Vec<Slot>>,
    free_slots: RefCell<Vec<u32>>,
    cookies: Arc<Mutex<Vec<Cookie>>>,
    cookie_gen: RefCell<CookieGen>,
    immediate_fifo: RefCell<VecDeque<u32>>,
    deferred_heap: RefCell<BinaryHeap<DeferredKey>>,
    deferred_seq: Cell<u64>,
    deferred_tombstones: Cell<usize>,
    state: Cell<ReactorState>,
    tasks: TaskQueue,
    wake: Arc<WakeGate>,
    thread_id: Cell<Option<ThreadId>>,
    pools: RefCell<HashMap<&'static str, Box<dyn std::any::Any>>>,
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("state", &self.state.get())
            .field("slots", &self.slots.borrow().len())
            .finish()
    }
}

/// Cross-thread-safe, cheaply cloneable capability to cancel/query handles
/// and to request shutdown, without access to the reactor's (non-`Send`)
/// callback storage.
#[derive(Clone)]
pub struct ReactorRemote {
    cookies: Arc<Mutex<Vec<Cookie>>>,
    tasks_tx: crossbeam::channel::Sender<crate::core::cross_thread::MarshalledTask>,
    wake: Arc<WakeGate>,
}

impl ReactorRemote {
    /// Thread-safe validity check; does not need to run on the reactor
    /// thread because the cookie table is already synchronized.
    pub fn is_valid(&self, h: Handle) -> bool {
        if h.is_null() {
            return false;
        }
        self.cookies
            .lock()
            .get(h.slot as usize)
            .map(|c| *c == h.cookie)
            .unwrap_or(false)
    }

    /// Cancel `h` from any thread; marshals onto the reactor thread so the
    /// stored callback is dropped there (spec.md I7).
    pub fn cancel(&self, h: Handle) {
        if !self.is_valid(h) {
            return;
        }
        let task: crate::core::cross_thread::MarshalledTask = Box::new(move || {
            REACTOR_TLS.with(|r| {
                if let Some(reactor) = r.borrow().as_ref() {
                    // Safety: reactor pointer is only set while its thread
                    // is alive and only ever dereferenced from that thread.
                    let reactor = unsafe { &**reactor };
                    reactor.cancel_local(h);
                }
            });
        });
        if self.tasks_tx.try_send(task).is_ok() {
            self.wake.poke();
        }
    }

    /// Marshal an arbitrary `'static` task onto the reactor thread, firing
    /// and forgetting it. Used by [`crate::engine::engine::AsyncStepsRemote`]
    /// to run `cancel_onthread` without needing a `Send` handle into engine
    /// state (I7: off-thread mutation is always marshalled).
    pub(crate) fn marshal_raw(&self, task: crate::core::cross_thread::MarshalledTask) {
        if self.tasks_tx.try_send(task).is_ok() {
            self.wake.poke();
        }
    }

    /// Request shutdown of the reactor this handle points at, from any
    /// thread. Needed for [`Reactor::spawn`]'s thread: nothing else outside
    /// it can reach the `Reactor` itself to call [`Reactor::shutdown`]
    /// directly.
    pub fn shutdown(&self) {
        let task: crate::core::cross_thread::MarshalledTask = Box::new(|| {
            REACTOR_TLS.with(|r| {
                if let Some(reactor) = r.borrow().as_ref() {
                    // Safety: same invariant as `cancel`'s use above.
                    let reactor = unsafe { &**reactor };
                    reactor.shutdown();
                }
            });
        });
        if self.tasks_tx.try_send(task).is_ok() {
            self.wake.poke();
        }
    }
}

thread_local! {
    static REACTOR_TLS: RefCell<Option<*const Reactor>> = RefCell::new(None);
}

impl Reactor {
    /// Build a reactor meant to be driven by a caller-owned thread/loop via
    /// [`Reactor::iterate`] (SPEC_FULL.md §B.5).
    pub fn new_external() -> Reactor {
        Reactor {
            slots: RefCell::new(Vec::new()),
            free_slots: RefCell::new(Vec::new()),
            cookies: Arc::new(Mutex::new(Vec::new())),
            cookie_gen: RefCell::new(CookieGen::default()),
            immediate_fifo: RefCell::new(VecDeque::new()),
            deferred_heap: RefCell::new(BinaryHeap::new()),
            deferred_seq: Cell::new(0),
            deferred_tombstones: Cell::new(0),
            state: Cell::new(ReactorState::Init),
            tasks: TaskQueue::new(),
            wake: Arc::new(WakeGate::new()),
            thread_id: Cell::new(None),
            pools: RefCell::new(HashMap::new()),
        }
    }

    /// Bind this reactor to the calling thread; required before
    /// `is_same_thread`/dispatch make sense. [`Reactor::spawn`] calls this
    /// automatically on the thread it starts.
    pub fn bind_current_thread(&self) {
        self.thread_id.set(Some(std::thread::current().id()));
        REACTOR_TLS.with(|r| *r.borrow_mut() = Some(self as *const Reactor));
        self.state.set(ReactorState::Running);
        debug!("reactor bound to thread {:?}", std::thread::current().id());
    }

    pub fn remote(&self) -> ReactorRemote {
        ReactorRemote {
            cookies: self.cookies.clone(),
            tasks_tx: self.tasks.sender(),
            wake: self.wake.clone(),
        }
    }

    pub fn is_same_thread(&self) -> bool {
        self.thread_id.get() == Some(std::thread::current().id())
    }

    pub fn state(&self) -> ReactorState {
        self.state.get()
    }

    pub fn shutdown(&self) {
        info!("reactor shutdown requested");
        self.state.set(ReactorState::Shutdown);
        self.wake.poke();
    }

    fn alloc_slot(&self, entry: SlotEntry) -> (u32, Cookie) {
        let cookie = self.cookie_gen.borrow_mut().next();
        let idx = match self.free_slots.borrow_mut().pop() {
            Some(i) => {
                self.slots.borrow_mut()[i as usize] = Slot { entry };
                i
            }
            None => {
                let mut slots = self.slots.borrow_mut();
                slots.push(Slot { entry });
                (slots.len() - 1) as u32
            }
        };
        {
            let mut cookies = self.cookies.lock();
            if cookies.len() <= idx as usize {
                cookies.resize(idx as usize + 1, 0);
            }
            cookies[idx as usize] = cookie;
        }
        (idx, cookie)
    }

    fn free_slot(&self, idx: u32) {
        self.cookies.lock()[idx as usize] = 0;
        self.slots.borrow_mut()[idx as usize] = Slot {
            entry: SlotEntry::Empty,
        };
        self.free_slots.borrow_mut().push(idx);
    }

    fn slot_cookie(&self, idx: u32) -> Cookie {
        self.cookies.lock()[idx as usize]
    }

    /// Schedule `cb` to run in FIFO order during the next dispatch burst.
    pub fn immediate<F>(&self, cb: F) -> Handle
    where
        F: FnOnce() + 'static,
    {
        let (idx, cookie) = self.alloc_slot(SlotEntry::Immediate(Box::new(cb)));
        self.immediate_fifo.borrow_mut().push_back(idx);
        self.wake.poke();
        Handle::new(idx, cookie)
    }

    /// Schedule `cb` to fire no earlier than `now + delay`. Fatal if `delay`
    /// is under [`MIN_DEFERRED_DELAY`]: `deferred` is for timeouts, not
    /// short sleeps.
    pub fn deferred<F>(&self, delay: Duration, cb: F) -> Handle
    where
        F: FnOnce() + 'static,
    {
        assert!(
            delay >= MIN_DEFERRED_DELAY,
            "deferred() delay {delay:?} is below the {MIN_DEFERRED_DELAY:?} \
             floor; use immediate() or set_timeout() semantics instead"
        );
        trace!(?delay, "arming deferred callback");
        let when = Instant::now() + delay;
        let (idx, cookie) = self.alloc_slot(SlotEntry::Deferred(Box::new(cb)));
        let seq = self.deferred_seq.get();
        self.deferred_seq.set(seq + 1);
        self.deferred_heap
            .borrow_mut()
            .push(DeferredKey(Reverse((when, seq, idx))));
        Handle::new(idx, cookie)
    }

    /// Rearm a deferred callback under a fresh delay without the caller
    /// having to juggle two handles: cancels `old` (if still live) and
    /// schedules `cb` as a new deferred entry, on-thread only. Ports the
    /// reference `AsyncTool::move`'s use (SPEC_FULL.md §B.4) for rearming a
    /// step's timeout; here it's simpler than the reference's in-place slot
    /// transfer because slots are already cheap to allocate/free.
    pub fn rearm_deferred<F>(&self, old: Handle, delay: Duration, cb: F) -> Handle
    where
        F: FnOnce() + 'static,
    {
        debug_assert!(self.is_same_thread(), "rearm_deferred must run on the reactor thread");
        if !old.is_null() {
            self.cancel_local(old);
        }
        self.deferred(delay, cb)
    }

    /// On-thread cancellation: tombstone the slot (cookie -> 0). The queued
    /// entry itself is reclaimed lazily when it is drained (spec.md §4.1
    /// step 1/3).
    fn cancel_local(&self, h: Handle) {
        if self.slot_cookie(h.slot) != h.cookie || h.is_null() {
            return;
        }
        self.cookies.lock()[h.slot as usize] = 0;
        self.slots.borrow_mut()[h.slot as usize] = Slot {
            entry: SlotEntry::Empty,
        };
        self.deferred_tombstones
            .set(self.deferred_tombstones.get() + 1);
    }

    /// Tombstone `h`; the slot itself is reclaimed once the tombstoned
    /// entry is popped out of whichever queue still references it (so a
    /// freshly reused slot index is never aliased by a stale queue entry).
    pub fn cancel(&self, h: Handle) {
        if self.is_same_thread() {
            self.cancel_local(h);
        } else {
            self.remote().cancel(h);
        }
    }

    pub fn is_valid(&self, h: Handle) -> bool {
        !h.is_null() && self.slot_cookie(h.slot) == h.cookie
    }

    /// Typed pool facade: get-or-create a [`MemPool`] keyed by `name`.
    pub fn pool<T: 'static>(&self, name: &'static str) -> MemPool<T> {
        let mut pools = self.pools.borrow_mut();
        pools
            .entry(name)
            .or_insert_with(|| Box::new(MemPool::<T>::new(name)))
            .downcast_ref::<MemPool<T>>()
            .expect("pool name reused with a different element type")
            .clone()
    }

    /// Drain idle pool slots; on-thread only (callers off-thread should
    /// marshal through [`ReactorRemote`], matching spec.md §4.1).
    pub fn release_memory(&self) {
        self.free_slots.borrow_mut().shrink_to_fit();
    }

    /// Drain up to `BURST_COUNT` ready immediate entries.
    fn drain_immediate(&self) -> bool {
        let mut did_work = false;
        for _ in 0..BURST_COUNT {
            let idx = match self.immediate_fifo.borrow_mut().pop_front() {
                Some(i) => i,
                None => break,
            };
            did_work = true;
            let cookie = self.slot_cookie(idx);
            if cookie == 0 {
                // tombstone: counted but skipped. The slot was already
                // emptied by cancel_local(); just return its index.
                self.free_slots.borrow_mut().push(idx);
                continue;
            }
            let entry = std::mem::replace(
                &mut self.slots.borrow_mut()[idx as usize].entry,
                SlotEntry::Empty,
            );
            self.free_slot(idx);
            if let SlotEntry::Immediate(cb) = entry {
                cb();
            }
        }
        did_work
    }

    /// Drain up to `BURST_COUNT` deferred entries whose `when <= now`.
    fn drain_deferred(&self) -> bool {
        let now = Instant::now();
        let mut did_work = false;
        for _ in 0..BURST_COUNT {
            let ready = matches!(
                self.deferred_heap.borrow().peek(),
                Some(DeferredKey(Reverse((when, _, _)))) if *when <= now
            );
            if !ready {
                break;
            }
            let DeferredKey(Reverse((_when, _seq, idx))) =
                self.deferred_heap.borrow_mut().pop().unwrap();
            did_work = true;
            let cookie = self.slot_cookie(idx);
            if cookie == 0 {
                self.deferred_tombstones
                    .set(self.deferred_tombstones.get().saturating_sub(1));
                self.free_slots.borrow_mut().push(idx);
                continue;
            }
            let entry = std::mem::replace(
                &mut self.slots.borrow_mut()[idx as usize].entry,
                SlotEntry::Empty,
            );
            self.free_slot(idx);
            if let SlotEntry::Deferred(cb) = entry {
                cb();
            }
        }

        // Step 3: rebuild the heap if more than half of it is tombstoned,
        // to reclaim memory that would otherwise sit there forever.
        let heap_len = self.deferred_heap.borrow().len();
        if heap_len > 0 && self.deferred_tombstones.get() * 2 > heap_len {
            trace!(heap_len, tombstones = self.deferred_tombstones.get(), "rebuilding deferred heap");
            let mut heap = self.deferred_heap.borrow_mut();
            let drained: Vec<_> = heap.drain().collect();
            let mut free_slots = self.free_slots.borrow_mut();
            let live: Vec<_> = drained
                .into_iter()
                .filter(|DeferredKey(Reverse((_, _, idx)))| {
                    if self.slot_cookie(*idx) == 0 {
                        free_slots.push(*idx);
                        false
                    } else {
                        true
                    }
                })
                .collect();
            *heap = live.into_iter().collect();
            self.deferred_tombstones.set(0);
        }

        did_work
    }

    /// One full dispatch tick (spec.md §4.1 steps 1-5, minus the final
    /// condvar wait which callers choose to perform or not).
    pub fn iterate(&self) -> CycleResult {
        let had_immediate = self.drain_immediate();
        let had_deferred = self.drain_deferred();
        self.tasks.drain();

        let next_delay = self
            .deferred_heap
            .borrow()
            .peek()
            .map(|DeferredKey(Reverse((when, _, _)))| {
                when.saturating_duration_since(Instant::now())
            });

        CycleResult {
            have_work: had_immediate || had_deferred || !self.tasks.is_empty(),
            next_delay,
        }
    }

    /// Poll once and, if there was nothing to do, block until poked or the
    /// next deferred entry is due. Used by the internally-owned thread
    /// loop.
    pub fn run_until_shutdown(&self) {
        loop {
            match self.state.get() {
                ReactorState::Shutdown => break,
                _ => {
                    let result = self.iterate();
                    if !result.have_work && self.immediate_fifo.borrow().is_empty() {
                        self.wake.wait(result.next_delay);
                    }
                }
            }
        }
    }

    /// Run `f` on the reactor thread, blocking the caller until it
    /// completes. Used by operations that must mutate on-thread state but
    /// are callable from anywhere (e.g. engine cancellation).
    pub fn run_marshalled<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_same_thread() {
            return f();
        }
        marshal(&self.tasks.sender(), &|| self.wake.poke(), f)
            .expect("reactor thread is gone")
    }
}

impl Reactor {
    /// Build a reactor that owns a dedicated OS thread (SPEC_FULL.md §A:
    /// "both modes are implemented"), as opposed to [`Reactor::new_external`]'s
    /// caller-pumped loop. `init` runs on the new thread once the reactor is
    /// bound and before the dispatch loop starts, so it can build whatever
    /// [`crate::engine::engine::AsyncSteps`] trees this reactor should run
    /// (it receives the same `Rc<Reactor>` that [`crate::engine::engine::AsyncSteps::new`]
    /// takes); after `init` returns, the thread calls
    /// [`Reactor::run_until_shutdown`] and exits once [`Reactor::shutdown`]
    /// (or the matching [`ReactorRemote`]) asks it to.
    ///
    /// Only a [`ReactorRemote`] crosses back to the caller -- the `Reactor`
    /// itself, like the engines built on it, never leaves the thread it was
    /// created on.
    pub fn spawn<F>(
        init: F,
    ) -> Result<(std::thread::JoinHandle<()>, ReactorRemote), crate::core::error::ReactorError>
    where
        F: FnOnce(&std::rc::Rc<Reactor>) + Send + 'static,
    {
        use crate::core::error::SpawnFailedSnafu;

        let (remote_tx, remote_rx) = std::sync::mpsc::channel();
        let join = std::thread::Builder::new()
            .name("asyncsteps-reactor".into())
            .spawn(move || {
                let reactor = std::rc::Rc::new(Reactor::new_external());
                reactor.bind_current_thread();
                let _ = remote_tx.send(reactor.remote());
                init(&reactor);
                reactor.run_until_shutdown();
            })
            .context(SpawnFailedSnafu)?;

        let remote = remote_rx
            .recv()
            .expect("reactor thread dropped its remote sender before sending");
        Ok((join, remote))
    }
}
