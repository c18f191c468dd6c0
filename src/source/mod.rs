pub mod ignore;
pub mod walker;

pub use ignore::IgnoreRules;
pub use walker::{walk_dir, SourceFile, SourceKind};
