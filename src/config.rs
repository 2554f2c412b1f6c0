//! Compile-time capacities.
//!
//! Every table in the kernel is a fixed-size array sized by one of these
//! constants; nothing is allocated at runtime.

/// Maximum number of machines (plain state machines and protothreads) a
/// kernel can hold at once.
pub const MAX_MACHINES: usize = 16;

/// Depth of each machine's pending event ring. Must be a power of two.
pub const EVENT_QUEUE_DEPTH: usize = 8;

/// Number of sync objects (semaphores, critical sections) a kernel owns.
pub const MAX_SYNC_OBJECTS: usize = 8;

/// Machines that may wait on one sync object at the same time.
pub const MAX_SYNC_WAITERS: usize = 8;

/// Timers a `TimerService` can hold.
pub const MAX_TIMERS: usize = 8;

/// Longest parent chain followed when an event is delegated upwards. A
/// longer chain means the hierarchy contains a cycle.
pub const MAX_STATE_DEPTH: usize = 16;

const _: () = assert!(EVENT_QUEUE_DEPTH.is_power_of_two());
const _: () = assert!(MAX_MACHINES <= u8::MAX as usize);
