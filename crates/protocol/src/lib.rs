pub mod error;
pub mod messages;
pub mod session;

pub use error::*;
pub use messages::*;
pub use session::*;
