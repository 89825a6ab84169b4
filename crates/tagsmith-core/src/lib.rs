mod error;
mod identifier;
mod pipeline;
mod publish;
mod render;
mod store;
#[cfg(any(test, feature = "testing"))]
mod testing;
mod transcode;
mod types;

pub use crate::error::*;
pub use crate::identifier::*;
pub use crate::pipeline::*;
pub use crate::publish::*;
pub use crate::render::*;
pub use crate::store::*;
#[cfg(any(test, feature = "testing"))]
pub use crate::testing::*;
pub use crate::transcode::*;
pub use crate::types::*;
