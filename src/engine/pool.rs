// src/engine/pool.rs

//! Resource vectors and the fixed-capacity pool they are allocated from.

use std::fmt;

use serde::Deserialize;
use tracing::warn;

/// Weight of one CPU core, in megabytes, when ranking models by intensity.
pub const CPU_CORE_WEIGHT_MB: u64 = 1024;

/// A requirement or capacity across every resource dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub struct ResourceVector {
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub cpu_cores: u32,
    #[serde(default)]
    pub gpu_count: u32,
}

impl ResourceVector {
    pub const ZERO: ResourceVector = ResourceVector {
        memory_mb: 0,
        cpu_cores: 0,
        gpu_count: 0,
    };

    pub fn new(memory_mb: u64, cpu_cores: u32, gpu_count: u32) -> Self {
        Self {
            memory_mb,
            cpu_cores,
            gpu_count,
        }
    }

    /// Convenience constructor for memory expressed in whole gigabytes.
    pub fn gb(memory_gb: u64, cpu_cores: u32, gpu_count: u32) -> Self {
        Self::new(memory_gb * 1024, cpu_cores, gpu_count)
    }

    /// True if every dimension of `self` is within `capacity`.
    pub fn fits_within(&self, capacity: &ResourceVector) -> bool {
        self.memory_mb <= capacity.memory_mb
            && self.cpu_cores <= capacity.cpu_cores
            && self.gpu_count <= capacity.gpu_count
    }

    /// Names of the dimensions in which `self` exceeds `capacity`.
    pub fn exceeded_dimensions(&self, capacity: &ResourceVector) -> Vec<&'static str> {
        let mut dims = Vec::new();
        if self.memory_mb > capacity.memory_mb {
            dims.push("memory");
        }
        if self.cpu_cores > capacity.cpu_cores {
            dims.push("cpu");
        }
        if self.gpu_count > capacity.gpu_count {
            dims.push("gpu");
        }
        dims
    }

    pub fn saturating_add(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            memory_mb: self.memory_mb.saturating_add(other.memory_mb),
            cpu_cores: self.cpu_cores.saturating_add(other.cpu_cores),
            gpu_count: self.gpu_count.saturating_add(other.gpu_count),
        }
    }

    pub fn saturating_sub(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            cpu_cores: self.cpu_cores.saturating_sub(other.cpu_cores),
            gpu_count: self.gpu_count.saturating_sub(other.gpu_count),
        }
    }

    /// Component-wise maximum.
    pub fn max(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            memory_mb: self.memory_mb.max(other.memory_mb),
            cpu_cores: self.cpu_cores.max(other.cpu_cores),
            gpu_count: self.gpu_count.max(other.gpu_count),
        }
    }

    /// Scalar used to sort models for first-fit-decreasing packing
    /// (memory plus weighted cpu; gpus do not contribute).
    pub fn intensity(&self) -> u64 {
        self.memory_mb
            .saturating_add(CPU_CORE_WEIGHT_MB.saturating_mul(u64::from(self.cpu_cores)))
    }

    pub fn is_zero(&self) -> bool {
        *self == ResourceVector::ZERO
    }
}

impl fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}MB/{}cpu/{}gpu",
            self.memory_mb, self.cpu_cores, self.gpu_count
        )
    }
}

/// Fixed total capacity plus the current allocation.
///
/// Not synchronised on its own; the scheduler owns the only instance and
/// serialises every access.
#[derive(Debug, Clone)]
pub struct ResourcePool {
    capacity: ResourceVector,
    allocated: ResourceVector,
}

impl ResourcePool {
    pub fn new(capacity: ResourceVector) -> Self {
        Self {
            capacity,
            allocated: ResourceVector::ZERO,
        }
    }

    pub fn capacity(&self) -> ResourceVector {
        self.capacity
    }

    pub fn allocated(&self) -> ResourceVector {
        self.allocated
    }

    pub fn free(&self) -> ResourceVector {
        self.capacity.saturating_sub(&self.allocated)
    }

    /// Whether `requirement` could be satisfied by an otherwise empty pool.
    pub fn can_ever_fit(&self, requirement: &ResourceVector) -> bool {
        requirement.fits_within(&self.capacity)
    }

    /// Whether `requirement` fits in the currently free capacity.
    pub fn can_fit_now(&self, requirement: &ResourceVector) -> bool {
        requirement.fits_within(&self.free())
    }

    /// Allocate `requirement` if it fits; returns whether it did.
    pub fn try_allocate(&mut self, requirement: &ResourceVector) -> bool {
        if !self.can_fit_now(requirement) {
            return false;
        }
        self.allocated = self.allocated.saturating_add(requirement);
        true
    }

    pub fn release(&mut self, requirement: &ResourceVector) {
        if !requirement.fits_within(&self.allocated) {
            warn!(
                %requirement,
                allocated = %self.allocated,
                "releasing more than is allocated; clamping to zero"
            );
        }
        self.allocated = self.allocated.saturating_sub(requirement);
    }
}
