pub mod dependencies;
pub mod guards;
pub mod patterns;
pub mod quality;
pub mod references;
pub mod suggest;
pub mod usages;
