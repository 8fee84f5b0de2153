//! Device-side mirror of the register bank using wgpu.
//!
//! The host array stays authoritative. Rows written since the last tick are
//! uploaded into one storage buffer laid out exactly like the host bank, so
//! compute passes can read node state without a per-frame full copy.
//!
//! Enable with the `gpu` feature flag.

use std::sync::atomic::{AtomicU32, Ordering};

use bytemuck::{Pod, Zeroable};
use tracing::debug;

use crate::error::LoomError;
use crate::register::{NodeId, REGISTER_WIDTH};

const ROW_BYTES: u64 = (REGISTER_WIDTH * std::mem::size_of::<f32>()) as u64;

/// Companion uniform describing the mirrored bank (aligned to 16 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct MirrorMeta {
    pub capacity: u32,
    pub row_width: u32,
    /// Highest row id uploaded so far, plus one.
    pub rows_seen: u32,
    pub _pad: u32,
}

pub struct RegisterMirror {
    device: wgpu::Device,
    queue: wgpu::Queue,
    registers: wgpu::Buffer,
    meta: wgpu::Buffer,
    capacity: usize,
    rows_seen: AtomicU32,
}

impl RegisterMirror {
    /// Open a device and allocate a zeroed mirror of `capacity` rows.
    pub fn new(capacity: usize) -> Result<Self, LoomError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| LoomError::BackendUnavailable("no GPU adapter".to_string()))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("Loom register mirror"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| LoomError::BackendUnavailable(e.to_string()))?;

        let size = (capacity as u64).saturating_mul(ROW_BYTES).max(ROW_BYTES);
        let limits = device.limits();
        if size > limits.max_buffer_size
            || size > u64::from(limits.max_storage_buffer_binding_size)
        {
            return Err(LoomError::BackendUnavailable(format!(
                "register bank of {size} bytes exceeds device limits"
            )));
        }

        let registers = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Register bank"),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let meta = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Register bank meta"),
            size: std::mem::size_of::<MirrorMeta>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        debug!(capacity, bytes = size, "register mirror allocated");
        Ok(Self {
            device,
            queue,
            registers,
            meta,
            capacity,
            rows_seen: AtomicU32::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// The storage buffer holding `capacity * REGISTER_WIDTH` f32 values.
    pub fn registers(&self) -> &wgpu::Buffer {
        &self.registers
    }

    /// Stage one row for upload. Rows outside the mirror are ignored.
    pub fn upload_row(&self, id: NodeId, row: &[f32]) {
        if id >= self.capacity {
            return;
        }
        let n = row.len().min(REGISTER_WIDTH);
        self.queue.write_buffer(
            &self.registers,
            id as u64 * ROW_BYTES,
            bytemuck::cast_slice(&row[..n]),
        );
        self.rows_seen
            .fetch_max((id as u32).saturating_add(1), Ordering::Relaxed);
    }

    /// Flush staged uploads to the device.
    pub fn submit(&self) {
        let meta = MirrorMeta {
            capacity: self.capacity as u32,
            row_width: REGISTER_WIDTH as u32,
            rows_seen: self.rows_seen.load(Ordering::Relaxed),
            _pad: 0,
        };
        self.queue
            .write_buffer(&self.meta, 0, bytemuck::bytes_of(&meta));
        self.queue.submit(std::iter::empty());
    }
}

/// Returns true if a device can be opened for a mirror of `capacity` rows.
///
/// Note: this creates and drops a device, which can be expensive.
pub fn gpu_available(capacity: usize) -> bool {
    RegisterMirror::new(capacity).is_ok()
}
