pub mod batch;
pub mod cfs;
pub mod component;
pub mod liveness;
pub mod manager;

pub use batch::{Batch, SessionStatus};
pub use cfs::options::{OptionsCache, OptionsSnapshot};
pub use cfs::{Cfs, CfsClient, CfsError};
pub use component::Component;
pub use manager::BatchManager;
