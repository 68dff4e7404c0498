//! ターゲットの状態のキャッシュ

pub mod hash_store;
pub mod memory;
pub mod module_image;
pub mod regs;

pub use hash_store::{BlobHash, BlobStore, HashStore, StoreKey};
pub use memory::{MemorySlice, ProcessMemoryCache};
pub use module_image::{ModuleImageCache, ModuleImageInfo, PdataArm64, PdataX64};
pub use regs::RegisterCache;
