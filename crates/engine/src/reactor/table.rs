//! Generational slot table of the live sockets of one loop.
//!
//! Ids are `(index, generation)` pairs. Removing a socket bumps the slot's
//! generation, so an id kept by a topic or a token can never resolve to the
//! connection that reuses the slot.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::response::HttpSocket;
use crate::websocket::WsCore;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId {
    index: u32,
    generation: u32,
}

impl SocketId {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SocketId({}v{})", self.index, self.generation)
    }
}

#[derive(Clone)]
pub(crate) enum SocketEntry {
    Http(Rc<RefCell<HttpSocket>>),
    WebSocket(Rc<RefCell<WsCore>>),
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<SocketEntry>,
}

#[derive(Default)]
pub(crate) struct SocketTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl fmt::Debug for SocketTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketTable").field("len", &self.len).field("capacity", &self.slots.len()).finish()
    }
}

impl SocketTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reserves a slot and fills it with the entry built for the new id.
    pub(crate) fn insert_with<T>(&mut self, make: impl FnOnce(SocketId) -> (SocketEntry, T)) -> (SocketId, T) {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                u32::try_from(self.slots.len() - 1).unwrap_or(u32::MAX)
            }
        };

        let slot = &mut self.slots[index as usize];
        let id = SocketId { index, generation: slot.generation };
        let (entry, value) = make(id);
        slot.entry = Some(entry);
        self.len += 1;
        (id, value)
    }

    pub(crate) fn get(&self, id: SocketId) -> Option<&SocketEntry> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub(crate) fn http(&self, id: SocketId) -> Option<Rc<RefCell<HttpSocket>>> {
        match self.get(id)? {
            SocketEntry::Http(socket) => Some(Rc::clone(socket)),
            SocketEntry::WebSocket(_) => None,
        }
    }

    pub(crate) fn websocket(&self, id: SocketId) -> Option<Rc<RefCell<WsCore>>> {
        match self.get(id)? {
            SocketEntry::WebSocket(core) => Some(Rc::clone(core)),
            SocketEntry::Http(_) => None,
        }
    }

    pub(crate) fn remove(&mut self, id: SocketId) -> Option<SocketEntry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Some(entry)
    }

    pub(crate) fn websockets(&self) -> Vec<Rc<RefCell<WsCore>>> {
        self.slots
            .iter()
            .filter_map(|slot| match &slot.entry {
                Some(SocketEntry::WebSocket(core)) => Some(Rc::clone(core)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}
