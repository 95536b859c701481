use hashbrown::HashSet;
use tracing::debug;

use super::{
    error::{EngineError, Result},
    ClientId,
};

/// Hands out client ids from a fixed pool of 256. An id is only handed out
/// again after it has been released.
pub struct ClientRegistry {
    /// Free ids, lowest on top.
    free: Vec<ClientId>,
    leased: HashSet<ClientId>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            free: (0..=ClientId::MAX).rev().collect(),
            leased: HashSet::new(),
        }
    }

    pub fn connect(&mut self) -> Result<ClientId> {
        let id = self.free.pop().ok_or_else(|| {
            EngineError::ResourceExhausted("all 256 client ids are in use".into())
        })?;
        self.leased.insert(id);
        debug!(client = id, "leased client id");
        Ok(id)
    }

    pub fn disconnect(&mut self, id: ClientId) -> Result<()> {
        if !self.leased.remove(&id) {
            return Err(EngineError::UnknownClient(id));
        }
        self.free.push(id);
        debug!(client = id, "released client id");
        Ok(())
    }

    pub fn is_leased(&self, id: ClientId) -> bool {
        self.leased.contains(&id)
    }

    pub fn connected(&self) -> usize {
        self.leased.len()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
