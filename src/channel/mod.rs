//! [`Channel`]: a polarized transfer endpoint multiplexed by an [`Array`](crate::array::Array)
//! (§3, §4.2).

pub mod state;
pub mod typology;

use std::sync::{Arc, Mutex};

use crate::array::ArrayShared;
use crate::endpoint::Endpoint;
use crate::error::{CoreError, Result};
use crate::port::{Freight, Port};

pub use state::Polarity;
pub use typology::{Resource, Typology};

/// The unconsumed byte range of a Channel's currently acquired resource
/// (§4.2 `slice`). `start == stop` means the resource is fully consumed;
/// the Array detaches it from the transfer list once that happens (§4.3
/// step 11 "window collapse").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: u32,
    pub stop: u32,
}

impl Window {
    pub fn remaining(self) -> u32 {
        self.stop - self.start
    }

    pub fn is_empty(self) -> bool {
        self.start >= self.stop
    }
}

/// Internal per-channel state, owned by the Array's arena (§3 "Array holds
/// many channels"). Never exposed directly; [`Channel`] is the public
/// handle.
pub(crate) struct ChannelSlot {
    pub port: Arc<Mutex<Port>>,
    pub polarity: Polarity,
    pub typology: Typology,
    pub state: state::Bits,
    pub delta: state::Bits,
    pub resource: Option<Resource>,
    pub window: Window,
    /// The sub-range of the resource transferred during the most recently
    /// completed cycle, or `None` if no transfer event fired that cycle
    /// (§4.2 `transfer`). Reset at the start of every cycle's perform phase.
    pub last_transfer: Option<Window>,
    /// Whether this slot's fd is currently registered with the backend in
    /// its polarity's direction. Cleared on deregistration during detach.
    pub registered: bool,
}

impl ChannelSlot {
    pub(crate) fn new(port: Arc<Mutex<Port>>, polarity: Polarity, typology: Typology) -> ChannelSlot {
        ChannelSlot {
            port,
            polarity,
            typology,
            state: state::Bits::EMPTY,
            delta: state::Bits::EMPTY,
            resource: None,
            window: Window { start: 0, stop: 0 },
            last_transfer: None,
            registered: false,
        }
    }
}

/// A public handle to one Channel living inside an [`Array`](crate::array::Array)'s
/// arena. Cheap to clone (it is just an index plus a reference to the
/// Array), but every method call takes the Array's lock (§4.1).
#[derive(Clone)]
pub struct Channel {
    pub(crate) array: Arc<ArrayShared>,
    pub(crate) id: usize,
}

impl Channel {
    /// Hand the Channel a resource to transfer and mark it
    /// internal-transfer-qualified (§4.2 `acquire`).
    ///
    /// Fails with [`CoreError::TransitionViolation`] if a resource is still
    /// outstanding from a previous `acquire` that has not fully drained, or
    /// if the channel has already terminated.
    pub fn acquire(&self, resource: Resource) -> Result<()> {
        let mut channels = self.array.channels.lock().unwrap();
        let slot = channels
            .get_mut(self.id)
            .ok_or_else(|| CoreError::transition("channel detached"))?;
        if slot.state.terminated() || slot.delta.contains(state::INTERNAL_TERMINATE) {
            return Err(CoreError::transition("acquire on terminated channel"));
        }
        if slot.resource.is_some() && !slot.window.is_empty() {
            return Err(CoreError::transition("acquire while a resource is outstanding"));
        }
        let len = resource.byte_len() as u32;
        slot.window = Window { start: 0, stop: len };
        slot.resource = Some(resource);
        slot.delta.set(state::INTERNAL_TRANSFER);
        drop(channels);
        self.array.wake_if_waiting();
        Ok(())
    }

    /// Force one idle tick for this channel even without a resource or
    /// kernel event (§4.2 `force`, §9 "force-transfer" control bit) -- used
    /// to make a channel with edge-triggered state that was missed (e.g.
    /// after a `connect()` completed out of band) re-check itself.
    pub fn force(&self) -> Result<()> {
        let mut channels = self.array.channels.lock().unwrap();
        let slot = channels
            .get_mut(self.id)
            .ok_or_else(|| CoreError::transition("channel detached"))?;
        slot.delta.set(state::FORCE);
        drop(channels);
        self.array.wake_if_waiting();
        Ok(())
    }

    /// Request termination (§4.2 `terminate`). Idempotent: calling this
    /// again on an already-terminating channel is a no-op, not an error
    /// (§8 "Idempotence").
    pub fn terminate(&self) {
        let mut channels = self.array.channels.lock().unwrap();
        if let Some(slot) = channels.get_mut(self.id) {
            slot.delta.set(state::INTERNAL_TERMINATE);
        }
        drop(channels);
        self.array.wake_if_waiting();
    }

    /// Set or clear the requeue control bit (§3 "control bits", §9
    /// requeue semantics): a channel terminated while requeue is set keeps
    /// its kernel filter registered across the terminate event instead of
    /// having it torn down, for a caller that wants to hand the same
    /// descriptor to a fresh channel without paying for re-registration.
    pub fn set_requeue(&self, requeue: bool) -> Result<()> {
        let mut channels = self.array.channels.lock().unwrap();
        let slot = channels
            .get_mut(self.id)
            .ok_or_else(|| CoreError::transition("channel detached"))?;
        if requeue {
            slot.state.set(state::REQUEUE);
        } else {
            slot.state.clear(state::REQUEUE);
        }
        Ok(())
    }

    /// The unconsumed portion of the currently acquired resource (§4.2
    /// `slice`). `None` if nothing is currently acquired.
    pub fn slice(&self) -> Option<Window> {
        let channels = self.array.channels.lock().unwrap();
        let slot = channels.get(self.id)?;
        if slot.resource.is_some() {
            Some(slot.window)
        } else {
            None
        }
    }

    /// The sub-slice (as a byte-offset [`Window`]) of the resource that was
    /// transferred during the most recently completed cycle, or `None` if
    /// that cycle produced no transfer event for this channel (§4.2
    /// `transfer`, §8 scenario 3 "force tick").
    pub fn transfer(&self) -> Option<Window> {
        let channels = self.array.channels.lock().unwrap();
        channels.get(self.id)?.last_transfer
    }

    /// Bytes moved so far out of the acquired resource's total size (§4.2
    /// `sizeof_transfer`): `total - remaining`.
    pub fn sizeof_transfer(&self) -> u32 {
        let channels = self.array.channels.lock().unwrap();
        match channels.get(self.id) {
            Some(slot) => match &slot.resource {
                Some(r) => r.byte_len() as u32 - slot.window.remaining(),
                None => 0,
            },
            None => 0,
        }
    }

    pub fn polarity(&self) -> Polarity {
        let channels = self.array.channels.lock().unwrap();
        channels[self.id].polarity
    }

    pub fn typology(&self) -> Typology {
        let channels = self.array.channels.lock().unwrap();
        channels[self.id].typology
    }

    pub fn is_terminated(&self) -> bool {
        let channels = self.array.channels.lock().unwrap();
        channels
            .get(self.id)
            .map(|s| s.state.terminated())
            .unwrap_or(true)
    }

    /// The last syscall error recorded on this channel's underlying Port,
    /// if any (§7 "Port failures ... surface as a terminate event").
    pub fn port_error(&self) -> Option<crate::error::PortError> {
        let channels = self.array.channels.lock().unwrap();
        let slot = channels.get(self.id)?;
        slot.port.lock().unwrap().error()
    }

    /// The peer address for an output channel, the local address for an
    /// input channel, or `None` if the underlying Port is not latched
    /// (§4.2 `endpoint`).
    pub fn endpoint(&self) -> Option<Endpoint> {
        let channels = self.array.channels.lock().unwrap();
        let slot = channels.get(self.id)?;
        let polarity = slot.polarity;
        let port = slot.port.lock().unwrap();
        if !port.is_latched() {
            return None;
        }
        let fd = port.fd();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = if polarity.is_input() {
            unsafe { libc::getsockname(fd, (&mut storage as *mut libc::sockaddr_storage).cast(), &mut len) }
        } else {
            unsafe { libc::getpeername(fd, (&mut storage as *mut libc::sockaddr_storage).cast(), &mut len) }
        };
        if rc != 0 {
            return None;
        }
        Some(unsafe { Endpoint::from_sockaddr((&storage as *const libc::sockaddr_storage).cast(), len as usize) })
    }
}

/// Build the `(read, write)` half-latch counts and [`Freight`] for a given
/// typology/polarity pair (§4.1 `Port::new`).
pub(crate) fn latch_counts(polarity: Polarity) -> (u8, u8) {
    match polarity {
        Polarity::Input => (1, 0),
        Polarity::Output => (0, 1),
    }
}

pub(crate) fn freight_for(typology: Typology) -> Freight {
    match typology {
        Typology::Octets => Freight::Octets,
        Typology::Sockets => Freight::Sockets,
        Typology::Ports => Freight::Ports,
        Typology::Datagrams => Freight::Datagrams,
    }
}
