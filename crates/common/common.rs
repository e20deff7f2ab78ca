pub use ethereum_types::*;
pub mod constants;
pub mod rlp;
pub mod types;
pub mod utils;
pub use bytes::Bytes;
