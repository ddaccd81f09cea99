// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! Per-call UDP port leases for the framed gateway.
//!
//! The orchestrator draws the port, the gateway binds it; the lease lives
//! until cleanup. Ports are drawn randomly from the configured inclusive
//! range to avoid immediately reusing a just-freed port.

use parking_lot::Mutex;
use rand::prelude::IteratorRandom;
use std::collections::BTreeSet;

pub struct PortAllocator {
    start: u16,
    end: u16,
    used: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        assert!(start <= end, "invalid port range {start}..{end}");

        Self {
            start,
            end,
            used: Mutex::new(BTreeSet::new()),
        }
    }

    /// Lease a random free port, `None` when the range is exhausted
    pub fn allocate(&self) -> Option<u16> {
        let mut rng = rand::thread_rng();
        let mut used = self.used.lock();

        let port = (self.start..=self.end)
            .filter(|port| !used.contains(port))
            .choose(&mut rng)?;

        used.insert(port);

        Some(port)
    }

    /// Return a leased port to the pool
    pub fn free(&self, port: u16) {
        self.used.lock().remove(&port);
    }

    pub fn leased(&self) -> usize {
        self.used.lock().len()
    }
}
