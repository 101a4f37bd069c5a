#[cfg(feature = "client")]
pub mod client;
pub mod client_types;
pub mod parser;
#[cfg(feature = "client")]
pub mod tls;
#[cfg(feature = "client")]
pub mod traits;

#[cfg(feature = "client")]
pub use client::*;
pub use client_types::*;
pub use parser::*;
#[cfg(feature = "client")]
pub use tls::*;
#[cfg(feature = "client")]
pub use traits::*;
