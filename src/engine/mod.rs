// Module Definition
pub mod circuit; // Gate descriptors, named gates, lookahead analysis
pub mod config;
pub mod controller; // Gate scheduler and engine
pub mod error;
#[cfg(feature = "io-uring")]
pub mod io;
pub mod kernels; // Computation kernels with parallel execution
pub mod memory; // Chunk store and backing media
pub mod observable;
pub mod partition;
pub mod pool;
pub mod reorder;
pub mod results;
