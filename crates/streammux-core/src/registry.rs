use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::warn;

use crate::error::{MuxError, Result};
use crate::ids::IdAllocator;
use crate::server::Backlog;
use crate::stream::Stream;

/// Live streams by local id.
pub(crate) struct StreamRegistry {
    ids: IdAllocator,
    streams: DashMap<u8, Arc<Stream>>,
}

impl StreamRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            ids: IdAllocator::new(capacity),
            streams: DashMap::new(),
        }
    }

    pub(crate) fn register(&self, stream: Arc<Stream>) -> Result<u8> {
        let id = self.ids.allocate()?;
        if let Err(err) = stream.assign_id(id) {
            self.release_id(id);
            return Err(err);
        }
        self.streams.insert(id, stream);
        Ok(id)
    }

    /// Remove a stream and free its id.
    pub(crate) fn remove(&self, id: u8) -> Option<Arc<Stream>> {
        let (_, stream) = self.streams.remove(&id)?;
        self.release_id(id);
        Some(stream)
    }

    pub(crate) fn get(&self, id: u8) -> Option<Arc<Stream>> {
        self.streams.get(&id).map(|entry| entry.value().clone())
    }

    pub(crate) fn ids(&self) -> Vec<u8> {
        self.streams.iter().map(|entry| *entry.key()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.streams.len()
    }

    fn release_id(&self, id: u8) {
        if let Err(err) = self.ids.free(id) {
            warn!(stream_id = id, error = %err, "stream id was not allocated");
        }
    }
}

/// Stream servers by stream port.
pub(crate) struct ListenerRegistry {
    ports: DashMap<u16, Arc<Backlog>>,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            ports: DashMap::new(),
        }
    }

    /// Claim `port` (or, for port 0, the lowest free port) and install the
    /// backlog built for it.
    pub(crate) fn register_with(
        &self,
        port: u16,
        make: impl Fn(u16) -> Arc<Backlog>,
    ) -> Result<Arc<Backlog>> {
        if port != 0 {
            return match self.ports.entry(port) {
                Entry::Occupied(_) => Err(MuxError::PortInUse(port)),
                Entry::Vacant(slot) => {
                    let backlog = make(port);
                    slot.insert(backlog.clone());
                    Ok(backlog)
                }
            };
        }

        for candidate in 1..=u16::MAX {
            if let Entry::Vacant(slot) = self.ports.entry(candidate) {
                let backlog = make(candidate);
                slot.insert(backlog.clone());
                return Ok(backlog);
            }
        }
        Err(MuxError::ResourceExhausted(
            "no free stream port".to_string(),
        ))
    }

    pub(crate) fn remove(&self, port: u16) -> Option<Arc<Backlog>> {
        self.ports.remove(&port).map(|(_, backlog)| backlog)
    }

    pub(crate) fn get(&self, port: u16) -> Option<Arc<Backlog>> {
        self.ports.get(&port).map(|entry| entry.value().clone())
    }

    pub(crate) fn ports(&self) -> Vec<u16> {
        self.ports.iter().map(|entry| *entry.key()).collect()
    }
}
