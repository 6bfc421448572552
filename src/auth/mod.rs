//! Authentication: SAS signing and the background token refresh loop.

pub mod refresher;
pub mod sas;

pub use refresher::TokenRefresher;
pub use sas::{SasToken, SasTokenSource, SharedAccessKeySigner, StaticSasSource};
