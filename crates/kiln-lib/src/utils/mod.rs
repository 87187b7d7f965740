pub mod process;
pub mod version;

pub use process::{KilnCommandExt, Liveness, ProcessIdentity};
pub use version::{compare_versions, is_newer, Version};
