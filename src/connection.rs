use std::collections::HashMap;

use crate::transport::{CallHandle, CallId, PeerId, RemoteTrack};

/// Lifecycle of one remote participant's call. Absent and closed
/// participants have no table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Connecting,
    Connected,
}

/// Which side placed the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outbound,
    Inbound,
}

pub struct PeerEntry {
    pub handle: Box<dyn CallHandle>,
    pub state: CallState,
    pub direction: CallDirection,
    pub tracks: Vec<RemoteTrack>,
    connected_seq: u64,
}

impl PeerEntry {
    pub fn call_id(&self) -> CallId {
        self.handle.id()
    }
}

/// Remote participant id -> active call. One entry per participant.
#[derive(Default)]
pub struct PeerTable {
    entries: HashMap<PeerId, PeerEntry>,
    next_seq: u64,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, remote: &str) -> bool {
        self.entries.contains_key(remote)
    }

    pub fn state(&self, remote: &str) -> Option<CallState> {
        self.entries.get(remote).map(|e| e.state)
    }

    pub fn get(&self, remote: &str) -> Option<&PeerEntry> {
        self.entries.get(remote)
    }

    /// Whether `call_id` is the call currently tracked for `remote`.
    pub fn is_current(&self, remote: &str, call_id: CallId) -> bool {
        self.entries
            .get(remote)
            .map_or(false, |e| e.call_id() == call_id)
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Starts tracking a call in the connecting state. Returns the entry it
    /// replaced, whose handle the caller must close.
    pub fn insert(
        &mut self,
        handle: Box<dyn CallHandle>,
        direction: CallDirection,
    ) -> Option<PeerEntry> {
        let remote = handle.remote().to_string();
        self.entries.insert(
            remote,
            PeerEntry {
                handle,
                state: CallState::Connecting,
                direction,
                tracks: Vec::new(),
                connected_seq: 0,
            },
        )
    }

    /// Records a delivered remote track; the first one moves the call to
    /// connected. A track of a kind already present replaces it. Returns
    /// false when the call is not the current one for that remote.
    pub fn add_track(&mut self, remote: &str, call_id: CallId, track: RemoteTrack) -> bool {
        let Some(entry) = self.entries.get_mut(remote) else {
            return false;
        };
        if entry.call_id() != call_id {
            return false;
        }
        if entry.state == CallState::Connecting {
            entry.state = CallState::Connected;
            self.next_seq += 1;
            entry.connected_seq = self.next_seq;
        }
        entry.tracks.retain(|t| t.kind != track.kind);
        entry.tracks.push(track);
        true
    }

    pub fn remove(&mut self, remote: &str) -> Option<PeerEntry> {
        self.entries.remove(remote)
    }

    /// Removes the entry only if it still belongs to `call_id`.
    pub fn remove_call(&mut self, remote: &str, call_id: CallId) -> Option<PeerEntry> {
        if self.is_current(remote, call_id) {
            self.entries.remove(remote)
        } else {
            None
        }
    }

    /// Connected participants in the order they connected.
    pub fn connected(&self) -> Vec<(&str, &PeerEntry)> {
        let mut connected: Vec<(&str, &PeerEntry)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == CallState::Connected)
            .map(|(id, e)| (id.as_str(), e))
            .collect();
        connected.sort_by_key(|(_, e)| e.connected_seq);
        connected
    }

    pub fn drain(&mut self) -> Vec<PeerEntry> {
        self.entries.drain().map(|(_, e)| e).collect()
    }
}
