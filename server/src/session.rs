//! Session registry: the fixed table of connected clients
//!
//! Slot index is the session id. A slot is *occupied* from registration until it is
//! unregistered, and *participating* once onboarding has finished and the session
//! is included in broadcasts. Ids come from the owned [`IdPool`], so an id can only
//! be reused after [`SessionRegistry::unregister`] has released it.
//!
//! The registry is owned by the dispatcher and mutated nowhere else.

use crate::error::PoolError;
use crate::id_pool::IdPool;
use crate::transport::{Connection, ConnectionToken};
use log::info;
use shared::{SessionId, MAX_PLAYERS};
use std::net::SocketAddr;

/// One entry of the registry
#[derive(Debug, Default)]
pub struct SessionSlot {
    /// Stream connection; `None` while the slot is free
    pub connection: Option<Connection>,
    /// Where datagrams for this session go, once a resolve request succeeded
    pub peer_address: Option<SocketAddr>,
    pub participating: bool,
    /// Latest keepalive round trip, in milliseconds
    pub round_trip_ms: Option<u64>,
}

impl SessionSlot {
    pub fn is_occupied(&self) -> bool {
        self.connection.is_some()
    }

    fn clear(&mut self) -> Option<Connection> {
        self.peer_address = None;
        self.participating = false;
        self.round_trip_ms = None;
        self.connection.take()
    }
}

pub struct SessionRegistry {
    slots: [SessionSlot; MAX_PLAYERS],
    pool: IdPool,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| SessionSlot::default()),
            pool: IdPool::new(MAX_PLAYERS),
        }
    }

    /// Allocates an id for a connection about to be registered
    pub fn reserve(&mut self) -> Result<SessionId, PoolError> {
        self.pool.allocate()
    }

    /// Stores a connection under an id previously returned by [`Self::reserve`]
    pub fn register(&mut self, id: SessionId, connection: Connection) -> Result<(), PoolError> {
        if !self.pool.is_allocated(id) {
            return Err(PoolError::NotAllocated(id));
        }

        let slot = &mut self.slots[id as usize];
        debug_assert!(!slot.is_occupied(), "allocated id {} already occupied", id);

        info!(
            "Session {} registered (connection {}, peer {:?})",
            id,
            connection.token(),
            connection.peer()
        );
        slot.connection = Some(connection);
        Ok(())
    }

    /// Records the datagram address for an occupied slot; false if the slot is free
    pub fn set_peer_address(&mut self, id: SessionId, address: SocketAddr) -> bool {
        match self.slot_mut(id) {
            Some(slot) if slot.is_occupied() => {
                slot.peer_address = Some(address);
                true
            }
            _ => false,
        }
    }

    pub fn mark_participating(&mut self, id: SessionId) -> bool {
        match self.slot_mut(id) {
            Some(slot) if slot.is_occupied() => {
                slot.participating = true;
                true
            }
            _ => false,
        }
    }

    pub fn record_round_trip(&mut self, id: SessionId, round_trip_ms: u64) -> bool {
        match self.slot_mut(id) {
            Some(slot) if slot.is_occupied() => {
                slot.round_trip_ms = Some(round_trip_ms);
                true
            }
            _ => false,
        }
    }

    /// Closes the connection, clears the slot and releases the id
    ///
    /// Returns false if the slot was not occupied.
    pub fn unregister(&mut self, id: SessionId) -> bool {
        let Some(connection) = self.slot_mut(id).and_then(SessionSlot::clear) else {
            return false;
        };

        connection.close();
        if let Err(e) = self.pool.release(id) {
            // Occupied slots always hold an allocated id.
            log::error!("Session {} released inconsistently: {}", id, e);
        }
        info!("Session {} unregistered", id);
        true
    }

    pub fn for_each_occupied(&self, mut f: impl FnMut(SessionId, &SessionSlot)) {
        for (id, slot) in self.slots.iter().enumerate() {
            if slot.is_occupied() {
                f(id as SessionId, slot);
            }
        }
    }

    pub fn for_each_participating(&self, mut f: impl FnMut(SessionId, &SessionSlot)) {
        self.for_each_occupied(|id, slot| {
            if slot.participating {
                f(id, slot);
            }
        });
    }

    /// Session currently holding the connection with this token
    pub fn find_by_token(&self, token: ConnectionToken) -> Option<SessionId> {
        self.slots
            .iter()
            .position(|slot| {
                slot.connection
                    .as_ref()
                    .is_some_and(|connection| connection.token() == token)
            })
            .map(|index| index as SessionId)
    }

    pub fn slot(&self, id: SessionId) -> Option<&SessionSlot> {
        self.slots.get(id as usize)
    }

    fn slot_mut(&mut self, id: SessionId) -> Option<&mut SessionSlot> {
        self.slots.get_mut(id as usize)
    }

    pub fn is_participating(&self, id: SessionId) -> bool {
        self.slot(id).is_some_and(|slot| slot.participating)
    }

    pub fn occupied_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_occupied()).count()
    }

    pub fn participating_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.participating).count()
    }

    pub fn available(&self) -> usize {
        self.pool.available()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
