//! [`Array`]: the cycle engine that multiplexes many [`Channel`]s over one
//! kernel event queue (§3, §4.3).
//!
//! The cycle (`enter` → wait → harvest → perform → exit) is the heart of
//! the design; everything else in this crate exists to be driven by it.
//! Concretely:
//!
//! 1. **enter**: under the Array's lock, the kernel descriptor is recreated
//!    first if fork recovery is pending; each channel's `delta` (written by
//!    `acquire`/`force`/`terminate` from any thread) is folded into `state`;
//!    a caller-requested terminate is completed immediately rather than
//!    waiting for the kernel to confirm it; freshly-attached (or
//!    freshly-reset) channels are registered with the backend; and the
//!    "about-to-wait" flag is published before the lock is released, all
//!    under the same lock acquire/terminate/force take, so a concurrent
//!    caller on another thread can never land in the gap between "delta
//!    drained" and "flag visible".
//! 2. **wait**: the lock is released and the calling thread blocks in the
//!    backend's `wait` -- with a zero timeout if any channel already has
//!    force/transfer/terminate work pending, so that work is never delayed
//!    behind the caller's wait deadline.
//! 3. **harvest**: events are translated into `EXTERNAL_TRANSFER` /
//!    `EXTERNAL_TERMINATE` qualifications.
//! 4. **perform**: every channel qualified on both internal and external
//!    transfer attempts one I/O op via [`typology::perform`].
//! 5. **exit**: channels that fully terminated and drained are deregistered
//!    (unless requeue is set) and removed from the arena; the harvested
//!    per-channel event summary is handed back as a
//!    [`Cycle`](crate::cycle::Cycle).
//!
//! Nested cycles (`enter` called again from inside a callback while a cycle
//! is already running on this Array) are rejected (§4.3, §8).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{debug, trace};
use slab::Slab;

use crate::channel::state::{self, Bits};
use crate::channel::typology::{self, OpOutcome};
use crate::channel::{freight_for, latch_counts, Channel, ChannelSlot, Polarity, Typology, Window};
use crate::cycle::{ChannelEvent, Cycle};
use crate::error::{CoreError, Result};
use crate::port::Port;
use crate::sys::{Backend, KernelEventBackend};

/// Ceiling on how many raw kernel events a single `wait` call harvests
/// (§3 "event array's capacity"). Chosen to match the teacher's `Events`
/// default capacity.
const EVENT_BATCH: usize = 1024;

pub(crate) struct ArrayShared {
    /// Behind an `RwLock` rather than a plain field so fork recovery (§4.3
    /// step 2) can swap in a freshly created kernel descriptor: every
    /// ordinary cycle takes only a read lock, so this costs nothing on the
    /// hot path.
    pub(crate) backend: RwLock<Backend>,
    /// The Array's own kernel descriptor, modeled as a pseudo-Port so fork
    /// recovery can tell "still latched" (normal) from "unlatched"
    /// (`note_fork` was called, or would be after a real `fork()`) the same
    /// way a Channel's Port tells it (§3 "Array is itself latch-tracked").
    pub(crate) event_port: Mutex<Port>,
    pub(crate) channels: Mutex<Slab<ChannelSlot>>,
    about_to_wait: AtomicBool,
    cycling: AtomicBool,
}

impl ArrayShared {
    /// Wake the backend iff a cycle is currently blocked in `wait` (§9 "the
    /// about-to-wait flag"): an `acquire`/`force`/`terminate` that lands
    /// while no cycle is waiting doesn't need to pay for a `poke` syscall,
    /// since the next `enter` will see the delta anyway.
    pub(crate) fn wake_if_waiting(&self) {
        if self.about_to_wait.load(Ordering::Acquire) {
            let _ = self.backend.read().unwrap().poke();
        }
    }
}

/// A cycle-engine multiplexer holding many channels (§3 "Array").
#[derive(Clone)]
pub struct Array {
    pub(crate) shared: Arc<ArrayShared>,
}

impl Array {
    pub fn new() -> Result<Array> {
        let backend = Backend::new().map_err(CoreError::from)?;
        backend.arm_waker(0).map_err(CoreError::from)?;
        let event_port = Port::for_event_queue(backend.as_raw_fd());
        Ok(Array {
            shared: Arc::new(ArrayShared {
                backend: RwLock::new(backend),
                event_port: Mutex::new(event_port),
                channels: Mutex::new(Slab::new()),
                about_to_wait: AtomicBool::new(false),
                cycling: AtomicBool::new(false),
            }),
        })
    }

    /// Mark the Array's own kernel descriptor unlatched, as if this process
    /// had just `fork()`ed and the child's copy of the kqueue/epoll
    /// descriptor were no longer usable (§4.3 step 2, §8 scenario 6). The
    /// next `enter` recreates the backend and re-registers every attached
    /// channel's filter before waiting.
    ///
    /// A real `fork()` wrapper would call this automatically in the child;
    /// this crate does not provide one (out of scope per §1), so a caller
    /// that forks must call it directly.
    pub fn note_fork(&self) {
        self.shared.event_port.lock().unwrap().shatter();
    }

    /// A channel is inserted connect-pending rather than registered
    /// eagerly: registration itself happens inside the next cycle's enter
    /// phase (§4.3 step 5), so that fork recovery can re-run exactly the
    /// same path for every already-attached channel.
    fn insert(&self, port: Port, polarity: Polarity, typology: Typology) -> Result<Channel> {
        let shared = self.shared.clone();
        let mut channels = shared.channels.lock().unwrap();
        let mut slot = ChannelSlot::new(Arc::new(Mutex::new(port)), polarity, typology);
        slot.state.set(state::CONNECT_PENDING);
        let id = channels.insert(slot);
        drop(channels);
        Ok(Channel { array: shared, id })
    }

    /// A single input-polarity Octets channel over an already-open,
    /// already-nonblocking descriptor (SPEC_FULL §B allocator: wraps a
    /// caller-owned fd, e.g. one leg of a pipe or an already-`accept`ed
    /// socket).
    pub fn octets_input(&self, fd: std::os::unix::io::RawFd) -> Result<Channel> {
        let (r, w) = latch_counts(Polarity::Input);
        let port = Port::new(fd, freight_for(Typology::Octets), r, w);
        self.insert(port, Polarity::Input, Typology::Octets)
    }

    pub fn octets_output(&self, fd: std::os::unix::io::RawFd) -> Result<Channel> {
        let (r, w) = latch_counts(Polarity::Output);
        let port = Port::new(fd, freight_for(Typology::Octets), r, w);
        self.insert(port, Polarity::Output, Typology::Octets)
    }

    /// A bidirectional pair of Octets channels sharing one socket Port
    /// (SPEC_FULL §B: a connected stream socket used for both directions),
    /// `(input, output)`.
    pub fn octets_pair(&self, fd: std::os::unix::io::RawFd) -> Result<(Channel, Channel)> {
        let port = Arc::new(Mutex::new(Port::new(fd, freight_for(Typology::Octets), 1, 1)));
        let input = self.insert_shared(port.clone(), Polarity::Input, Typology::Octets)?;
        let output = self.insert_shared(port, Polarity::Output, Typology::Octets)?;
        Ok((input, output))
    }

    fn insert_shared(&self, port: Arc<Mutex<Port>>, polarity: Polarity, typology: Typology) -> Result<Channel> {
        let shared = self.shared.clone();
        let mut channels = shared.channels.lock().unwrap();
        let mut slot = ChannelSlot::new(port, polarity, typology);
        slot.state.set(state::CONNECT_PENDING);
        let id = channels.insert(slot);
        drop(channels);
        Ok(Channel { array: shared, id })
    }

    /// A listening-socket channel that yields accepted connections as raw
    /// fds into the caller's `Resource::Fds` buffer (§4.2 Sockets typology;
    /// always input-only per §3 "a listening descriptor has no write side").
    pub fn sockets_input(&self, fd: std::os::unix::io::RawFd) -> Result<Channel> {
        let (r, w) = latch_counts(Polarity::Input);
        let port = Port::new(fd, freight_for(Typology::Sockets), r, w);
        self.insert(port, Polarity::Input, Typology::Sockets)
    }

    /// A bidirectional pair of Ports channels (fd-passing over
    /// `SCM_RIGHTS`) sharing one `AF_UNIX` socketpair Port, `(input,
    /// output)`.
    pub fn ports_pair(&self, fd: std::os::unix::io::RawFd) -> Result<(Channel, Channel)> {
        let port = Arc::new(Mutex::new(Port::new(fd, freight_for(Typology::Ports), 1, 1)));
        let input = self.insert_shared(port.clone(), Polarity::Input, Typology::Ports)?;
        let output = self.insert_shared(port, Polarity::Output, Typology::Ports)?;
        Ok((input, output))
    }

    /// A bidirectional pair of Datagrams channels sharing one `SOCK_DGRAM`
    /// Port, `(input, output)`.
    pub fn datagrams_pair(&self, fd: std::os::unix::io::RawFd) -> Result<(Channel, Channel)> {
        let port = Arc::new(Mutex::new(Port::new(fd, freight_for(Typology::Datagrams), 1, 1)));
        let input = self.insert_shared(port.clone(), Polarity::Input, Typology::Datagrams)?;
        let output = self.insert_shared(port, Polarity::Output, Typology::Datagrams)?;
        Ok((input, output))
    }

    /// A single input-polarity Datagrams channel over an unconnected
    /// `SOCK_DGRAM` socket (e.g. a bound UDP socket receiving from many
    /// peers, §8 scenario 4) -- unlike [`Array::datagrams_pair`], the
    /// other direction is not assumed to share the same descriptor.
    pub fn datagrams_input(&self, fd: std::os::unix::io::RawFd) -> Result<Channel> {
        let (r, w) = latch_counts(Polarity::Input);
        let port = Port::new(fd, freight_for(Typology::Datagrams), r, w);
        self.insert(port, Polarity::Input, Typology::Datagrams)
    }

    pub fn datagrams_output(&self, fd: std::os::unix::io::RawFd) -> Result<Channel> {
        let (r, w) = latch_counts(Polarity::Output);
        let port = Port::new(fd, freight_for(Typology::Datagrams), r, w);
        self.insert(port, Polarity::Output, Typology::Datagrams)
    }

    /// The number of channels currently attached to this Array (§3 Array
    /// "attached-channel count"; SPEC_FULL §B debug introspection).
    pub fn len(&self) -> usize {
        self.shared.channels.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a cycle is currently running on this Array, i.e. whether a
    /// re-entrant `enter` would be rejected (SPEC_FULL §B debug
    /// introspection, mirroring the teacher's cheap read-only accessors).
    pub fn is_in_cycle(&self) -> bool {
        self.shared.cycling.load(Ordering::Acquire)
    }

    /// Run one cycle (§4.3). Blocks for up to `timeout` (or indefinitely if
    /// `None`) if no channel is currently transfer-qualified.
    ///
    /// Returns [`CoreError::TransitionViolation`] if called re-entrantly
    /// from within a callback still inside a previous `enter` on this same
    /// Array (§4.3, §8: nested cycles are rejected, not queued).
    pub fn enter(&self, timeout: Option<Duration>) -> Result<Cycle> {
        if self.shared.cycling.swap(true, Ordering::AcqRel) {
            return Err(CoreError::transition("nested Array::enter"));
        }
        let result = self.run_cycle(timeout);
        self.shared.cycling.store(false, Ordering::Release);
        result
    }

    fn run_cycle(&self, timeout: Option<Duration>) -> Result<Cycle> {
        let shared = &self.shared;

        // --- enter ---
        let had_immediate_work;
        // Snapshot which channels were already `terminated()` before this
        // cycle touches anything, so the perform phase below can tell "just
        // became terminated, must fire the event once" apart from "has been
        // terminated for a while, still draining, already fired" (§3
        // "a termination event is produced exactly once").
        let already_terminated: HashSet<usize>;
        {
            let mut channels = shared.channels.lock().unwrap();
            already_terminated = channels
                .iter()
                .filter(|(_, slot)| slot.state.terminated())
                .map(|(id, _)| id)
                .collect();

            // §4.3 step 2: fork recovery. If the Array's own descriptor was
            // unlatched (`note_fork`), recreate the backend and mark every
            // already-attached channel connect-pending so it gets
            // re-registered below, against the new descriptor, instead of
            // silently going deaf.
            {
                let mut event_port = shared.event_port.lock().unwrap();
                if !event_port.is_latched() {
                    let fresh = Backend::new().map_err(CoreError::from)?;
                    fresh.arm_waker(0).map_err(CoreError::from)?;
                    *event_port = Port::for_event_queue(fresh.as_raw_fd());
                    *shared.backend.write().unwrap() = fresh;
                    debug!("array kernel descriptor recreated (fork recovery)");
                    for (_, slot) in channels.iter_mut() {
                        slot.state.set(state::CONNECT_PENDING);
                        slot.registered = false;
                    }
                }
            }

            // §4.3 step 3: drain the delta queue.
            for (_, slot) in channels.iter_mut() {
                let delta = Bits::drain_into(&mut slot.delta);
                if delta.is_empty() {
                    continue;
                }
                slot.state.set(delta.0);
                if delta.any(state::INTERNAL_TERMINATE) {
                    trace!("channel internal-terminate requested");
                }
            }

            // §4.2 `terminate` (attached path): a caller-requested
            // internal-terminate is authoritative on its own -- unlike a
            // peer-detected EOF, it does not need the kernel to confirm
            // anything before the channel stops transferring. Complete the
            // pair immediately so the perform/exit phases below see a
            // channel that is fully `terminated()` this same cycle (§4.3
            // step 10, §8 scenario 2), instead of leaving it stuck with
            // only half the pair set forever.
            for (_, slot) in channels.iter_mut() {
                if slot.state.any(state::INTERNAL_TERMINATE) && !slot.state.terminated() {
                    slot.state.set(state::EXTERNAL_TERMINATE);
                }
            }

            // §4.3 step 5: register channels newly marked connect-pending
            // (freshly attached via `insert`/`insert_shared`, or reset by
            // fork recovery above). A port already in error skips straight
            // to external-terminate instead of attempting to register.
            let backend = shared.backend.read().unwrap();
            let pending: Vec<usize> = channels
                .iter()
                .filter(|(_, slot)| slot.state.any(state::CONNECT_PENDING))
                .map(|(id, _)| id)
                .collect();
            for id in pending {
                let (fd, already_errored) = {
                    let port = channels[id].port.lock().unwrap();
                    (port.fd(), port.error().is_some())
                };
                channels[id].state.clear(state::CONNECT_PENDING);
                if already_errored {
                    // A port already carrying a recorded failure has no
                    // path forward; force full termination rather than
                    // leaving it stuck with only external-terminate set and
                    // no internal-transfer/terminate qualifier that could
                    // ever move it into the terminated state on its own.
                    channels[id].state.set(state::INTERNAL_TERMINATE | state::EXTERNAL_TERMINATE);
                    continue;
                }
                let readable = channels[id].polarity.is_input();
                match backend.register(fd, id, readable) {
                    Ok(()) => channels[id].registered = true,
                    Err(e) => {
                        channels[id].port.lock().unwrap().record_error("register", &e);
                        channels[id].state.set(state::INTERNAL_TERMINATE | state::EXTERNAL_TERMINATE);
                    }
                }
            }
            drop(backend);

            // §4.3 step 7: a force tick, a pending termination, or a
            // channel that already qualifies to transfer must not be
            // delayed behind a full kernel wait -- otherwise `force()` (§8
            // scenario 3) with `timeout: None` would block forever waiting
            // for a kernel event that was never going to arrive.
            had_immediate_work = channels.iter().any(|(_, slot)| {
                slot.state.any(state::FORCE)
                    || (slot.state.any(state::INTERNAL_TERMINATE) && !slot.state.terminated())
                    || slot.state.should_transfer()
            });

            // §9 "about-to-wait flag": published while still holding the
            // same lock `acquire`/`force`/`terminate` take, so a concurrent
            // caller either lands before this point (and its delta was
            // already folded in above) or sees the flag already set and
            // pokes the backend -- there is no gap in which it could see
            // neither.
            shared.about_to_wait.store(true, Ordering::Release);
        }

        // --- wait ---
        let wait_timeout = if had_immediate_work { Some(Duration::from_secs(0)) } else { timeout };
        let mut raw = Vec::with_capacity(EVENT_BATCH);
        let wait_result = shared.backend.read().unwrap().wait(&mut raw, EVENT_BATCH, wait_timeout);
        shared.about_to_wait.store(false, Ordering::Release);
        wait_result.map_err(CoreError::from)?;

        // --- harvest ---
        let mut channels = shared.channels.lock().unwrap();
        for ev in &raw {
            let id = match ev.id {
                Some(id) => id,
                None => continue, // wake/self event, discarded (§4.3 step 8)
            };
            if let Some(slot) = channels.get_mut(id) {
                if ev.ready {
                    slot.state.set(state::EXTERNAL_TRANSFER);
                }
                if ev.closed {
                    slot.state.set(state::EXTERNAL_TERMINATE);
                }
            }
        }

        // --- perform ---
        let mut fired = Vec::new();
        let ids: Vec<usize> = channels.iter().map(|(id, _)| id).collect();
        for id in ids {
            channels[id].last_transfer = None;
            let forced = channels[id].state.any(state::FORCE);
            if forced {
                channels[id].state.clear(state::FORCE);
            }

            // §4.3 step 10: termination is checked before transfer. A
            // channel that reached `terminated()` via the delta-drain
            // synthesis above, a registration failure, or a prior cycle's
            // kernel/op-discovered EOF never attempts an I/O op; it fires
            // the terminate event exactly once, on the cycle it first
            // became terminated (a channel still waiting to drain a
            // partially consumed resource across several cycles must not
            // re-fire every cycle it sits there).
            if channels[id].state.terminated() {
                if !already_terminated.contains(&id) {
                    fired.push((id, OpOutcome::Terminate(0)));
                }
                continue;
            }

            let should_run = channels[id].state.should_transfer() || forced;
            if !should_run {
                continue;
            }
            if channels[id].resource.is_none() {
                // §4.2 `force`: a synthetic zero-length transfer tick with
                // nothing acquired yet -- no buffer to run an I/O op
                // against, so this just surfaces the event (§8 scenario 3).
                channels[id].last_transfer = Some(Window { start: 0, stop: 0 });
                fired.push((id, OpOutcome::Flow(0)));
                continue;
            }
            let outcome = {
                let slot = &mut channels[id];
                let start = slot.window.start;
                let mut resource = slot.resource.take().expect("checked above");
                let mut port = slot.port.lock().unwrap();
                let outcome = typology::perform(slot.typology, slot.polarity, &mut port, &mut resource, start);
                drop(port);
                slot.resource = Some(resource);
                outcome
            };
            let before = channels[id].window.start;
            apply_outcome(&mut channels[id], outcome);
            let after = channels[id].window.start;
            channels[id].last_transfer = Some(Window { start: before, stop: after });
            fired.push((id, outcome));
        }

        // --- exit: collect per-channel events, detach terminated ---
        let mut events = Vec::with_capacity(fired.len());
        let mut detached = Vec::new();
        for (id, _) in &fired {
            if let Some(slot) = channels.get(*id) {
                events.push(ChannelEvent {
                    id: *id,
                    terminated: slot.state.terminated(),
                    transferred: slot.resource.as_ref().map(|_| slot.window.start).unwrap_or(0),
                });
            }
        }
        let ids: Vec<usize> = channels.iter().map(|(id, _)| id).collect();
        for id in ids {
            let slot = &channels[id];
            let drained = slot.resource.as_ref().map(|_| slot.window.is_empty()).unwrap_or(true);
            if slot.state.terminated() && drained {
                detached.push(id);
            }
        }
        for id in detached {
            let slot = channels.remove(id);
            // §9 requeue semantics: a channel terminated with the requeue
            // control bit set keeps its kernel filter registered rather
            // than having it torn down here, so a caller handing the same
            // descriptor to a fresh channel doesn't pay for re-registration.
            if slot.registered && !slot.state.any(state::REQUEUE) {
                let fd = slot.port.lock().unwrap().fd();
                let readable = slot.polarity.is_input();
                let _ = shared.backend.read().unwrap().deregister(fd, readable);
            }
            let reading = slot.polarity.is_input();
            slot.port.lock().unwrap().unlatch(reading);
            debug!("channel {} detached", id);
        }

        Ok(Cycle::new(events))
    }
}

fn apply_outcome(slot: &mut ChannelSlot, outcome: OpOutcome) {
    match outcome {
        OpOutcome::Flow(n) => {
            slot.window.start += n;
            if slot.window.is_empty() {
                slot.state.clear(state::INTERNAL_TRANSFER);
            }
        }
        OpOutcome::Stop(n) => {
            slot.window.start += n;
            slot.state.clear(state::EXTERNAL_TRANSFER);
        }
        OpOutcome::Terminate(n) => {
            slot.window.start += n;
            slot.state.set(state::INTERNAL_TERMINATE | state::EXTERNAL_TERMINATE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_array_starts_empty() {
        let arr = Array::new().expect("array");
        assert_eq!(arr.shared.channels.lock().unwrap().len(), 0);
    }

    #[test]
    fn rejects_nested_enter() {
        let arr = Array::new().expect("array");
        arr.shared.cycling.store(true, Ordering::Release);
        let err = arr.enter(Some(Duration::from_millis(0)));
        assert!(err.is_err());
        arr.shared.cycling.store(false, Ordering::Release);
    }

    #[test]
    fn note_fork_recreates_backend_and_reregisters() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe {
            let flags = libc::fcntl(fds[0], libc::F_GETFL);
            libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        let arr = Array::new().expect("array");
        let chan = arr.octets_input(fds[0]).expect("octets_input");
        arr.enter(Some(Duration::from_millis(0))).expect("enter");
        assert!(arr.shared.channels.lock().unwrap()[chan.id].registered);

        arr.note_fork();
        assert!(!arr.shared.event_port.lock().unwrap().is_latched());

        arr.enter(Some(Duration::from_millis(0))).expect("enter after fork recovery");
        assert!(arr.shared.event_port.lock().unwrap().is_latched());
        assert!(arr.shared.channels.lock().unwrap()[chan.id].registered);

        unsafe { libc::close(fds[1]) };
    }
}
