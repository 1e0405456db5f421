pub mod channel;
pub mod refresh;
pub mod session;

pub use channel::*;
pub use refresh::*;
pub use session::*;
