//! Row-major numeric matrices backed by RAM or a memory-mapped temp file.
//!
//! Feature matrices can outgrow physical memory for large rasters. The
//! backend is chosen once at allocation from a [`MemoryPolicy`] and a byte
//! budget; algorithms only ever see row and slice views, so they do not care
//! where the data lives.


use std::fs::File;

use bytemuck::Pod;
use memmap2::MmapMut;
use serde::{Deserialize, Serialize};

use crate::error::MatrixError;

/// Where matrix storage is allocated.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
pub enum MemoryPolicy {
    /// Always in memory.
    Ram,
    /// Always in a memory-mapped temporary file.
    Disk,
    /// In memory when the matrix fits the budget, on disk otherwise.
    #[default]
    Auto,
}

/// Available system memory in bytes.
pub fn available_memory() -> u64 {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_memory();
    sys.available_memory()
}

/// `percent` of `available` bytes.
pub fn memory_budget(available: u64, percent: f64) -> u64 {
    (available as f64 * percent.clamp(0.0, 100.0) / 100.0) as u64
}

enum Storage<T> {
    Ram(Vec<T>),
    Disk {
        map: MmapMut,
        // Anonymous temp file; removed by the OS once closed.
        _file: File,
    },
}

/// A `lines x columns` matrix of plain-old-data values, zero-initialised.
pub struct Matrix<T: Pod> {
    lines: usize,
    columns: usize,
    storage: Storage<T>,
}

impl<T: Pod> std::fmt::Debug for Matrix<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matrix")
            .field("lines", &self.lines)
            .field("columns", &self.columns)
            .field("in_memory", &self.is_in_memory())
            .finish()
    }
}

impl<T: Pod> Matrix<T> {
    /// Allocates a zeroed matrix.
    ///
    /// `budget_bytes` only matters for [`MemoryPolicy::Auto`].
    pub fn new(
        lines: usize,
        columns: usize,
        policy: MemoryPolicy,
        budget_bytes: u64,
    ) -> Result<Self, MatrixError> {
        let element_size = size_of::<T>();
        let bytes = lines
            .checked_mul(columns)
            .and_then(|n| n.checked_mul(element_size))
            .ok_or(MatrixError::SizeOverflow {
                lines,
                columns,
                element_size,
            })?;

        let in_memory = bytes == 0
            || match policy {
                MemoryPolicy::Ram => true,
                MemoryPolicy::Disk => false,
                MemoryPolicy::Auto => (bytes as u64) <= budget_bytes,
            };

        let storage = if in_memory {
            Storage::Ram(vec![T::zeroed(); lines * columns])
        } else {
            let file = tempfile::tempfile().map_err(MatrixError::CreateTempFile)?;
            file.set_len(bytes as u64)
                .map_err(|source| MatrixError::ResizeTempFile {
                    bytes: bytes as u64,
                    source,
                })?;
            // SAFETY: the file is private to this matrix and never resized
            // while mapped.
            let map = unsafe { MmapMut::map_mut(&file) }.map_err(MatrixError::MapTempFile)?;
            Storage::Disk { map, _file: file }
        };

        tracing::debug!(
            lines,
            columns,
            bytes,
            in_memory,
            %policy,
            "Matrix allocated"
        );

        Ok(Self {
            lines,
            columns,
            storage,
        })
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self.storage, Storage::Ram(_))
    }

    pub fn as_slice(&self) -> &[T] {
        match &self.storage {
            Storage::Ram(data) => data,
            Storage::Disk { map, .. } => bytemuck::cast_slice(&map[..]),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        match &mut self.storage {
            Storage::Ram(data) => data,
            Storage::Disk { map, .. } => bytemuck::cast_slice_mut(&mut map[..]),
        }
    }

    #[inline]
    pub fn row(&self, line: usize) -> &[T] {
        let start = line * self.columns;
        &self.as_slice()[start..start + self.columns]
    }

    #[inline]
    pub fn row_mut(&mut self, line: usize) -> &mut [T] {
        let columns = self.columns;
        let start = line * columns;
        &mut self.as_mut_slice()[start..start + columns]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[T]> {
        // chunks_exact panics on 0.
        self.as_slice().chunks_exact(self.columns.max(1)).take(self.lines)
    }

    pub fn fill(&mut self, value: T) {
        self.as_mut_slice().fill(value);
    }
}
