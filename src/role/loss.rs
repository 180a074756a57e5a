use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::RawConfig;

/// Simulated receive loss for datagram connections.
///
/// Each datagram draws a 16-bit value `v`; it is dropped when
/// `v * 100 / 0xffff <= percent`. A percent of 0 disables the simulation
/// entirely, so no datagram is ever dropped.
pub struct LossSimulator {
    percent: u8,
    rng: Mutex<StdRng>,
}

impl LossSimulator {
    pub fn new(percent: u8, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            percent: percent.min(100),
            rng: Mutex::new(rng),
        }
    }

    pub fn from_config(config: &RawConfig) -> Self {
        Self::new(config.udp_loss_sim_rx_percent, config.rng_seed)
    }

    pub fn is_enabled(&self) -> bool {
        self.percent > 0
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn should_drop(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let draw: u16 = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen();
        Self::drops(draw, self.percent)
    }

    fn drops(draw: u16, percent: u8) -> bool {
        (u32::from(draw) * 100) / 0xffff <= u32::from(percent)
    }
}

impl std::fmt::Debug for LossSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LossSimulator")
            .field("percent", &self.percent)
            .finish()
    }
}
