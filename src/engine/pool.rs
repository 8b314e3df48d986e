use std::sync::Arc;

use anyhow::{Context as _, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use tokio::runtime::Handle;

use crate::engine::http_client::HttpClient;
use crate::engine::vu::VirtualUser;

/// Fixed-capacity pool of pre-initialised virtual users. Building a
/// scripting context dwarfs the cost of a single request, so the population
/// is created once and recycled across stages.
#[derive(Debug)]
pub struct UserPool {
    slots: Sender<VirtualUser>,
    ready: Receiver<VirtualUser>,
    capacity: usize,
}

impl UserPool {
    /// Create `capacity` virtual users up front. Any construction failure
    /// aborts the whole run.
    pub fn build(
        capacity: usize,
        script: &str,
        client: Arc<HttpClient>,
        handle: Handle,
    ) -> Result<Self> {
        let (slots, ready) = bounded(capacity);
        for i in 0..capacity {
            let user = VirtualUser::new(script, client.clone(), handle.clone())
                .with_context(|| format!("failed to create virtual user {}", i + 1))?;
            slots
                .try_send(user)
                .expect("user pool sized to hold every virtual user");
        }
        Ok(Self {
            slots,
            ready,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocking checkout of a ready user.
    pub fn fetch(&self) -> VirtualUser {
        self.ready.recv().expect("user pool channel closed")
    }

    /// Return a user. Never blocks: the returner holds the slot it vacates.
    pub fn release(&self, user: VirtualUser) {
        self.slots
            .try_send(user)
            .expect("user pool received more users than its capacity");
    }
}
