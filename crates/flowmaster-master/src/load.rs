// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host load sampling for intake back-pressure.

use std::sync::{Mutex, PoisonError};

use sysinfo::System;

/// CPU and memory usage as fractions in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
    /// Global CPU usage.
    pub cpu_usage: f32,
    /// Used memory over total memory.
    pub memory_usage: f32,
}

/// Source of host load samples.
pub trait LoadMonitor: Send + Sync {
    /// Take a sample now.
    fn sample(&self) -> LoadSample;

    /// Whether either usage exceeds its threshold.
    fn is_overloaded(&self, max_cpu_usage: f32, max_memory_usage: f32) -> bool {
        let sample = self.sample();
        sample.cpu_usage > max_cpu_usage || sample.memory_usage > max_memory_usage
    }
}

/// Samples the local host through `sysinfo`.
pub struct SystemLoadMonitor {
    system: Mutex<System>,
}

impl Default for SystemLoadMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemLoadMonitor {
    /// Create a monitor. CPU usage needs two refreshes to be meaningful, so
    /// the first sample may read as idle.
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl LoadMonitor for SystemLoadMonitor {
    fn sample(&self) -> LoadSample {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_cpu_usage();
        system.refresh_memory();

        let total = system.total_memory();
        let memory_usage = if total == 0 {
            0.0
        } else {
            1.0 - system.available_memory() as f32 / total as f32
        };
        LoadSample {
            cpu_usage: (system.global_cpu_usage() / 100.0).clamp(0.0, 1.0),
            memory_usage: memory_usage.clamp(0.0, 1.0),
        }
    }
}
