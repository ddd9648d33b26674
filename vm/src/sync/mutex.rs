pub mod ticket;

pub use self::ticket::{TicketMutex, TicketMutexGuard};

/// The lock used for every piece of shared virtual memory state.
///
/// Fair FIFO spinning: with one processor and preemption, a waiter spins until
/// the timer hands the processor back to the holder.
pub type Mutex<T> = TicketMutex<T>;
pub type MutexGuard<'a, T> = TicketMutexGuard<'a, T>;
