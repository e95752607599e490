//! Client channel: a transport plus the settings calls on it share.

use std::fmt;
use std::sync::Arc;

use rpcmux_core::{CallError, CompletionQueue, Side, Transport};
use rpcmux_runtime::{ConfigError, MuxConfig, Pollset, WakeupFdPool};

use crate::call::{Call, ClientContext};

/// Cheap to clone; clones share the transport and the wakeup fd pool.
#[derive(Clone)]
pub struct Channel {
    transport: Arc<dyn Transport>,
    config: MuxConfig,
    wakeup_pool: Arc<WakeupFdPool>,
}

impl Channel {
    /// Channel over `transport`, configured from the environment.
    pub fn new(transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        Self::with_config(transport, MuxConfig::from_env())
    }

    pub fn with_config(
        transport: Arc<dyn Transport>,
        config: MuxConfig,
    ) -> Result<Self, ConfigError> {
        let wakeup_pool = Arc::new(WakeupFdPool::from_config(&config)?);
        log::debug!("channel configured: {config:?}");
        Ok(Self {
            transport,
            config,
            wakeup_pool,
        })
    }

    /// Open a stream for `method` and bind it to `cq`.
    pub fn create_call(
        &self,
        method: &str,
        ctx: &ClientContext,
        cq: &CompletionQueue,
    ) -> Result<Call, CallError> {
        let stream = self.transport.open_stream(method, ctx.deadline())?;
        log::debug!("opened stream {} for {method}", stream.id());
        Ok(Call::new(stream, Side::Client, cq.clone(), method))
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// Completion queue sized for this channel's calls.
    pub fn new_completion_queue(&self) -> CompletionQueue {
        CompletionQueue::with_max_pluckers(self.config.max_pluckers)
    }

    /// Pollset drawing kick fds from this channel's pool.
    pub fn new_pollset(&self) -> Result<Pollset, ConfigError> {
        Pollset::with_config(Arc::clone(&self.wakeup_pool), &self.config)
    }

    pub fn wakeup_pool(&self) -> &Arc<WakeupFdPool> {
        &self.wakeup_pool
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("config", &self.config)
            .field("wakeup_pool", &self.wakeup_pool)
            .finish()
    }
}
