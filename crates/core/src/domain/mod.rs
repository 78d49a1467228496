pub mod intent;
pub mod sender;

pub use intent::{IntentSource, PurchaseIntent};
pub use sender::SenderId;
