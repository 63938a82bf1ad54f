//! Virtual network interfaces.

use crate::filter::FilterProgram;
use pktdma_core::NetifConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// One virtual interface and the program attached to it
#[derive(Debug)]
pub struct Netif {
    config: NetifConfig,
    program: RwLock<Option<Arc<dyn FilterProgram>>>,
    xsk_zc: AtomicBool,
}

impl Netif {
    /// Create an interface with no program
    pub fn new(config: NetifConfig) -> Self {
        Self {
            config,
            program: RwLock::new(None),
            xsk_zc: AtomicBool::new(false),
        }
    }

    /// Interface id
    pub fn id(&self) -> u32 {
        self.config.id
    }

    /// Interface configuration
    pub fn config(&self) -> &NetifConfig {
        &self.config
    }

    /// Attached program
    pub fn program(&self) -> Option<Arc<dyn FilterProgram>> {
        self.program
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Swap the attached program, returning the previous one
    pub(crate) fn replace_program(
        &self,
        program: Option<Arc<dyn FilterProgram>>,
    ) -> Option<Arc<dyn FilterProgram>> {
        let mut slot = self.program.write().unwrap_or_else(|p| p.into_inner());
        std::mem::replace(&mut *slot, program)
    }

    /// Whether a zero-copy pool is bound through this interface
    pub fn is_xsk_zc(&self) -> bool {
        self.xsk_zc.load(Ordering::Acquire)
    }

    pub(crate) fn set_xsk_zc(&self, on: bool) {
        self.xsk_zc.store(on, Ordering::Release);
    }
}
