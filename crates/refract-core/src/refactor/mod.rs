pub mod apply;
pub mod backup;
pub mod diff;
pub mod fs;
pub mod locks;
pub mod plan;
