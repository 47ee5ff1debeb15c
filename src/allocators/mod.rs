//! The three allocators exported by this crate.

pub use self::arena::Arena;
pub use self::pool::Pool;
pub use self::slab::Slab;

pub mod arena;
pub mod pool;
pub mod slab;
