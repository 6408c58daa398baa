// SPDX-License-Identifier: GPL-3.0-only

use storage_types::Format;

use crate::FormatError;

/// Driver contract for one format kind.
///
/// The engine never inspects how these are implemented; it only
/// observes success or failure. All methods are synchronous because
/// the commit loop serializes every operation (no action ever runs
/// concurrently with another).
pub trait FormatOps: Send + Sync {
    /// Write the format to its bound device.
    fn create(&self, format: &Format) -> Result<(), FormatError>;

    /// Remove the format from disk.
    fn destroy(&self, format: &Format) -> Result<(), FormatError>;

    /// Activate the format (open a LUKS mapping, re-read a label, ...).
    fn setup(&self, format: &Format) -> Result<(), FormatError>;

    /// Deactivate the format.
    fn teardown(&self, format: &Format) -> Result<(), FormatError>;

    /// Resize to `target_size` bytes.
    fn resize(&self, format: &Format, target_size: u64) -> Result<(), FormatError>;

    /// Probe whether the format is really present on disk.
    fn exists(&self, format: &Format) -> bool;

    /// Size the on-disk format currently occupies.
    fn current_size(&self, format: &Format) -> Result<u64, FormatError>;

    /// Whether this driver can resize the given format instance.
    fn resizable(&self, format: &Format) -> bool;
}
