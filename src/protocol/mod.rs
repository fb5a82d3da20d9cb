pub mod events;
pub mod info;
pub mod models;
pub mod opcodes;
pub mod session;
pub mod stats;
pub mod tracks;

pub use events::*;
pub use info::*;
pub use models::*;
pub use opcodes::*;
pub use session::*;
pub use stats::*;
pub use tracks::*;
