//! Built-in plugins and their registration.

mod compression;
mod file_writer;
mod live_view;
mod passthrough;

pub use compression::{
    decompress, max_compressed_size, Compression, CompressionSettings, CONTAINER_HEADER_SIZE,
};
pub use file_writer::{AcquisitionFiles, FileWriter, IndexEntry};
pub use live_view::{LiveFrame, LiveView};
pub use passthrough::Passthrough;

use crate::registry::PluginRegistry;
use daq_core::Result;
use daq_pool::DataBlockPool;

/// Register every built-in plugin type.
///
/// Call once at process start. Compression stages draw output blocks from
/// `block_pool`.
pub fn register_builtin_plugins(registry: &mut PluginRegistry, block_pool: &DataBlockPool) -> Result<()> {
    registry.register_fn(
        Passthrough::TYPE,
        "Counts frames and forwards them unchanged",
        |name| Ok(Box::new(Passthrough::new(name))),
    )?;
    let pool = block_pool.clone();
    registry.register_fn(
        Compression::TYPE,
        "LZ4 compression with byte shuffle and block splitting",
        move |name| Ok(Box::new(Compression::new(name, pool.clone()))),
    )?;
    registry.register_fn(
        FileWriter::TYPE,
        "Writes raw frames, a JSON-lines index and a dataset sidecar",
        |name| Ok(Box::new(FileWriter::new(name))),
    )?;
    registry.register_fn(
        LiveView::TYPE,
        "Forwards frames and taps every Nth to live view subscribers",
        |name| Ok(Box::new(LiveView::new(name))),
    )?;
    Ok(())
}
