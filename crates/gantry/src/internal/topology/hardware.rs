use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::internal::common::error::GantryError;
use crate::internal::common::ids::StepKey;
use crate::internal::common::sync::lock;
use crate::internal::common::{Map, Set};
use crate::internal::topology::ConnectionType;
use crate::internal::topology::wiring::Wiring;

/// Everything the interconnect needs to dedicate a block to a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareReservation {
    pub block_name: String,
    pub owner: StepKey,
    pub midplanes: Vec<String>,
    /// Ionode range expression for sub-midplane blocks.
    pub ionodes: Option<String>,
    pub connection: SmallVec<[ConnectionType; 5]>,
    pub wiring: Wiring,
}

/// Adapter to the interconnect management system.
///
/// Calls may block; the block engine never holds its lock while calling them.
pub trait BlockHardware: Send + Sync {
    /// Dedicates the block and returns an opaque reservation id.
    fn reserve(&self, reservation: &HardwareReservation) -> crate::Result<String>;

    /// Starts tearing the reservation down. Unknown ids are accepted.
    fn release(&self, reservation_id: &str) -> crate::Result<()>;

    /// Returns `true` once the hardware reports the block as free.
    fn confirm_free(&self, reservation_id: &str) -> crate::Result<bool>;

    /// Registers reservations that survived a controller restart. Ids issued
    /// afterwards never collide with them.
    fn recover(&self, reservation_ids: &[&str]);
}

impl<T: BlockHardware + ?Sized> BlockHardware for std::sync::Arc<T> {
    fn reserve(&self, reservation: &HardwareReservation) -> crate::Result<String> {
        (**self).reserve(reservation)
    }

    fn release(&self, reservation_id: &str) -> crate::Result<()> {
        (**self).release(reservation_id)
    }

    fn confirm_free(&self, reservation_id: &str) -> crate::Result<bool> {
        (**self).confirm_free(reservation_id)
    }

    fn recover(&self, reservation_ids: &[&str]) {
        (**self).recover(reservation_ids)
    }
}

#[derive(Default)]
struct HardwareState {
    next_id: u64,
    live: Set<String>,
    // Reservations being torn down, with the number of polls left until free
    releasing: Map<String, u32>,
}

/// Interconnect emulation issuing `resv_N` reservation ids.
#[derive(Default)]
pub struct InMemoryHardware {
    state: Mutex<HardwareState>,
    confirm_delay: u32,
    failing: AtomicBool,
}

pub const RESERVATION_PREFIX: &str = "resv_";

impl InMemoryHardware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Teardowns are confirmed only after `polls` unsuccessful polls.
    pub fn with_confirm_delay(polls: u32) -> Self {
        InMemoryHardware {
            confirm_delay: polls,
            ..Default::default()
        }
    }

    /// Makes every following `reserve` call fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn live_reservations(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.state).live.iter().cloned().collect();
        ids.sort();
        ids
    }
}

impl BlockHardware for InMemoryHardware {
    fn reserve(&self, reservation: &HardwareReservation) -> crate::Result<String> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GantryError::InterconnectError(format!(
                "cannot boot block {}",
                reservation.block_name
            )));
        }
        let mut state = lock(&self.state);
        let id = format!("{RESERVATION_PREFIX}{}", state.next_id);
        state.next_id += 1;
        state.live.insert(id.clone());
        log::debug!(
            "Reserved block {} as {id} ({} switches wired)",
            reservation.block_name,
            reservation.wiring.switch_count()
        );
        Ok(id)
    }

    fn release(&self, reservation_id: &str) -> crate::Result<()> {
        let mut state = lock(&self.state);
        if state.live.remove(reservation_id) {
            let delay = self.confirm_delay;
            state.releasing.insert(reservation_id.to_string(), delay);
        }
        Ok(())
    }

    fn confirm_free(&self, reservation_id: &str) -> crate::Result<bool> {
        let mut state = lock(&self.state);
        match state.releasing.get_mut(reservation_id) {
            Some(0) => {
                state.releasing.remove(reservation_id);
                Ok(true)
            }
            Some(polls) => {
                *polls -= 1;
                Ok(false)
            }
            None => Ok(!state.live.contains(reservation_id)),
        }
    }

    /// New ids continue after the highest recovered `resv_N`.
    fn recover(&self, reservation_ids: &[&str]) {
        let mut state = lock(&self.state);
        for id in reservation_ids {
            if let Some(number) = id
                .strip_prefix(RESERVATION_PREFIX)
                .and_then(|n| n.parse::<u64>().ok())
            {
                state.next_id = state.next_id.max(number.saturating_add(1));
            }
            state.live.insert(id.to_string());
        }
    }
}
