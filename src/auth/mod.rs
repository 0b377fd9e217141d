//! Registry authentication: `WWW-Authenticate` challenge parsing and bearer
//! token acquisition with a TTL cache.

pub mod challenge;
pub mod token;

pub use challenge::Challenge;
pub use token::TokenCache;
