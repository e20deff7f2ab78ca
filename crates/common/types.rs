mod block;
mod fork_id;
mod genesis;
mod receipt;

pub use block::*;
pub use fork_id::*;
pub use genesis::*;
pub use receipt::*;
