//! Executive support: primitives layered on top of the dispatcher.

pub mod rwlock;

pub use self::rwlock::RwLock;
