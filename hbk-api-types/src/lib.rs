//! Types shared between the repository core, the configuration layer and
//! API clients.

mod ids;
pub use ids::*;

mod crypto;
pub use crypto::*;

mod maintenance;
pub use maintenance::*;

mod stats;
pub use stats::*;

mod cache;
pub use cache::*;
