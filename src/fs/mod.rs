pub mod directory;
pub mod path;
pub mod tree;
pub mod watcher;
