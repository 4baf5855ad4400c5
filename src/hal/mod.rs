pub mod host;

pub use host::HostCompiler;
