//! Local capacity ledger.
//!
//! Every accepted container holds a reservation keyed by its work key
//! until it is torn down. The cell's advertised availability is the total
//! minus all reservations.

use std::collections::HashMap;

use cellgrid_state::{Capacity, ResourceRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Reserved,
    /// The key already holds a reservation.
    AlreadyHeld,
    Insufficient,
}

#[derive(Debug)]
pub struct CapacityLedger {
    total: Capacity,
    reservations: HashMap<String, ResourceRequest>,
}

impl CapacityLedger {
    pub fn new(total: Capacity) -> Self {
        Self {
            total,
            reservations: HashMap::new(),
        }
    }

    pub fn total(&self) -> Capacity {
        self.total
    }

    pub fn available(&self) -> Capacity {
        self.reservations
            .values()
            .fold(self.total, |left, req| left.minus(req))
    }

    pub fn try_reserve(&mut self, key: &str, req: &ResourceRequest) -> Reservation {
        if self.reservations.contains_key(key) {
            return Reservation::AlreadyHeld;
        }
        if !self.available().fits(req) {
            return Reservation::Insufficient;
        }
        self.reservations.insert(key.to_string(), *req);
        Reservation::Reserved
    }

    /// Returns false if nothing was reserved under `key`.
    pub fn release(&mut self, key: &str) -> bool {
        self.reservations.remove(key).is_some()
    }

    pub fn reserved(&self) -> usize {
        self.reservations.len()
    }
}
